//! Client-side polling synchronizer.
//!
//! A single timer-driven loop fetches `{history, document, activeUsers}` for
//! the joined project at a fixed interval (500 ms by default) and reconciles
//! the result into local state:
//!
//! - new (content, role) message keys → replace the whole local message list
//!   with the server's (the server is authoritative), updating document and
//!   active users along the way
//! - document changed only → update the document, keep local messages
//! - active-user set changed only (compared by full serialization) → update
//!   the active-user list
//! - otherwise → no state change, so no redraw
//!
//! There is no backoff and no circuit breaker: a failed poll is logged and
//! the loop continues at the fixed interval. A nudge channel triggers one
//! extra poll ~100 ms after a local send to shorten perceived latency.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::client::ApiClient;
use crate::error::Result;
use crate::registry::{ActiveUser, HistorySnapshot};
use crate::store::MessageRow;

/// Dedup key for a message: (content, role). An approximation — two distinct
/// messages with identical text and role collide, and that is accepted.
pub fn message_key(msg: &MessageRow) -> (String, String) {
    (msg.content.clone(), msg.role.clone())
}

/// What a reconciliation pass changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// New message keys arrived; the local list was replaced wholesale.
    Replaced { new_messages: usize },
    /// Only the document changed.
    DocumentChanged,
    /// Only the active-user set changed.
    ActiveUsersChanged,
    /// Snapshot matches local state.
    Unchanged,
}

impl SyncOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, SyncOutcome::Unchanged)
    }
}

// ---------------------------------------------------------------------------
// ClientState
// ---------------------------------------------------------------------------

/// Local mirror of the server's project state, owned by the sync loop.
#[derive(Debug, Default)]
pub struct ClientState {
    pub messages: Vec<MessageRow>,
    pub document: String,
    pub active_users: Vec<ActiveUser>,
    keys: HashSet<(String, String)>,
}

impl ClientState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a server snapshot into local state. See the module docs for the
    /// decision ladder.
    pub fn reconcile(&mut self, snapshot: &HistorySnapshot) -> SyncOutcome {
        let new_messages = snapshot
            .history
            .iter()
            .filter(|m| !self.keys.contains(&message_key(m)))
            .count();

        if new_messages > 0 {
            self.messages = snapshot.history.clone();
            self.keys = self.messages.iter().map(message_key).collect();
            self.document = snapshot.document.clone();
            self.active_users = snapshot.active_users.clone();
            return SyncOutcome::Replaced { new_messages };
        }

        if snapshot.document != self.document {
            self.document = snapshot.document.clone();
            return SyncOutcome::DocumentChanged;
        }

        if serialized(&snapshot.active_users) != serialized(&self.active_users) {
            self.active_users = snapshot.active_users.clone();
            return SyncOutcome::ActiveUsersChanged;
        }

        SyncOutcome::Unchanged
    }
}

fn serialized(users: &[ActiveUser]) -> String {
    serde_json::to_string(users).unwrap_or_default()
}

/// Shared handle the UI reads while the sync loop writes.
pub type SharedClientState = Arc<Mutex<ClientState>>;

pub fn new_shared_state() -> SharedClientState {
    Arc::new(Mutex::new(ClientState::new()))
}

// ---------------------------------------------------------------------------
// Synchronizer
// ---------------------------------------------------------------------------

/// Timing knobs for the polling loop.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Fixed polling interval.
    pub poll_interval: Duration,
    /// Delay before the extra poll that follows a local send.
    pub post_send_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            poll_interval: Duration::from_millis(500),
            post_send_delay: Duration::from_millis(100),
        }
    }
}

/// The polling loop runner. Build with [`Synchronizer::builder`].
pub struct Synchronizer {
    config: SyncConfig,
    client: Arc<ApiClient>,
    project_id: String,
}

impl Synchronizer {
    pub fn builder(client: Arc<ApiClient>, project_id: impl Into<String>) -> SynchronizerBuilder {
        SynchronizerBuilder {
            config: SyncConfig::default(),
            client,
            project_id: project_id.into(),
        }
    }

    /// One fetch + reconcile pass.
    pub async fn poll_once(&self, state: &SharedClientState) -> Result<SyncOutcome> {
        let snapshot = self.client.history(&self.project_id).await?;
        let outcome = state
            .lock()
            .map(|mut s| s.reconcile(&snapshot))
            .unwrap_or(SyncOutcome::Unchanged);
        Ok(outcome)
    }

    /// Run the polling loop; stops once the outcome receiver is dropped.
    /// Poll failures are soft errors: the loop logs and keeps its cadence.
    /// A nudge schedules one extra poll after `post_send_delay`.
    pub async fn run(
        self,
        state: SharedClientState,
        outcomes: mpsc::UnboundedSender<SyncOutcome>,
        mut nudges: mpsc::UnboundedReceiver<()>,
    ) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut consecutive_failures: u32 = 0;
        let mut nudges_open = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                nudge = nudges.recv(), if nudges_open => {
                    match nudge {
                        Some(()) => tokio::time::sleep(self.config.post_send_delay).await,
                        None => {
                            // All nudge senders dropped; keep ticking.
                            nudges_open = false;
                            continue;
                        }
                    }
                }
            }

            match self.poll_once(&state).await {
                Ok(outcome) => {
                    consecutive_failures = 0;
                    if outcome.changed() {
                        debug!(project = %self.project_id, ?outcome, "state reconciled");
                        if outcomes.send(outcome).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    if consecutive_failures >= 5 {
                        error!(
                            error = %e,
                            project = %self.project_id,
                            consecutive_failures,
                            "poll failed repeatedly, will retry next tick"
                        );
                    } else {
                        warn!(
                            error = %e,
                            project = %self.project_id,
                            "poll failed, will retry next tick"
                        );
                    }
                }
            }
        }
    }
}

/// Builder for [`Synchronizer`].
pub struct SynchronizerBuilder {
    config: SyncConfig,
    client: Arc<ApiClient>,
    project_id: String,
}

impl SynchronizerBuilder {
    /// Override the polling interval (default 500 ms).
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Override the post-send extra-poll delay (default 100 ms).
    pub fn post_send_delay(mut self, delay: Duration) -> Self {
        self.config.post_send_delay = delay;
        self
    }

    pub fn build(self) -> Synchronizer {
        Synchronizer {
            config: self.config,
            client: self.client,
            project_id: self.project_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: &str, content: &str) -> MessageRow {
        MessageRow {
            role: role.to_string(),
            content: content.to_string(),
            timestamp: 100,
            user_name: None,
            session_id: None,
        }
    }

    fn user(session_id: &str) -> ActiveUser {
        ActiveUser {
            session_id: session_id.to_string(),
            user_name: None,
            joined_at: 1,
        }
    }

    fn snapshot(
        history: Vec<MessageRow>,
        document: &str,
        active_users: Vec<ActiveUser>,
    ) -> HistorySnapshot {
        HistorySnapshot {
            history,
            document: document.to_string(),
            active_users,
        }
    }

    // -- message_key ----------------------------------------------------------

    #[test]
    fn test_message_key_is_content_role_pair() {
        let m = msg("user", "hello");
        assert_eq!(message_key(&m), ("hello".to_string(), "user".to_string()));
    }

    #[test]
    fn test_same_text_different_role_distinct_keys() {
        assert_ne!(message_key(&msg("user", "hi")), message_key(&msg("assistant", "hi")));
    }

    // -- reconcile ------------------------------------------------------------

    #[test]
    fn test_first_reconcile_adopts_server_list() {
        let mut state = ClientState::new();
        let snap = snapshot(vec![msg("user", "a"), msg("assistant", "b")], "# doc", vec![]);
        let outcome = state.reconcile(&snap);
        assert_eq!(outcome, SyncOutcome::Replaced { new_messages: 2 });
        assert_eq!(state.messages, snap.history);
        assert_eq!(state.document, "# doc");
    }

    #[test]
    fn test_empty_snapshot_on_empty_state_unchanged() {
        let mut state = ClientState::new();
        let outcome = state.reconcile(&snapshot(vec![], "", vec![]));
        assert_eq!(outcome, SyncOutcome::Unchanged);
    }

    #[test]
    fn test_new_message_replaces_wholesale() {
        let mut state = ClientState::new();
        state.reconcile(&snapshot(vec![msg("user", "a")], "d", vec![]));
        let snap = snapshot(vec![msg("user", "a"), msg("assistant", "b")], "d", vec![]);
        let outcome = state.reconcile(&snap);
        assert_eq!(outcome, SyncOutcome::Replaced { new_messages: 1 });
        assert_eq!(state.messages.len(), 2);
    }

    #[test]
    fn test_new_message_pass_also_updates_document_and_users() {
        let mut state = ClientState::new();
        state.reconcile(&snapshot(vec![msg("user", "a")], "v1", vec![]));
        let snap = snapshot(
            vec![msg("user", "a"), msg("assistant", "b")],
            "v2",
            vec![user("s1")],
        );
        state.reconcile(&snap);
        assert_eq!(state.document, "v2");
        assert_eq!(state.active_users.len(), 1);
    }

    #[test]
    fn test_document_only_change_keeps_messages() {
        let mut state = ClientState::new();
        state.reconcile(&snapshot(vec![msg("user", "a")], "v1", vec![]));
        let outcome = state.reconcile(&snapshot(vec![msg("user", "a")], "v2", vec![]));
        assert_eq!(outcome, SyncOutcome::DocumentChanged);
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.document, "v2");
    }

    #[test]
    fn test_active_users_only_change() {
        let mut state = ClientState::new();
        state.reconcile(&snapshot(vec![msg("user", "a")], "d", vec![user("s1")]));
        let outcome = state.reconcile(&snapshot(vec![msg("user", "a")], "d", vec![user("s1"), user("s2")]));
        assert_eq!(outcome, SyncOutcome::ActiveUsersChanged);
        assert_eq!(state.active_users.len(), 2);
    }

    #[test]
    fn test_user_field_change_detected_by_serialization() {
        let mut state = ClientState::new();
        state.reconcile(&snapshot(vec![], "", vec![user("s1")]));
        let mut renamed = user("s1");
        renamed.user_name = Some("Alice".to_string());
        let outcome = state.reconcile(&snapshot(vec![], "", vec![renamed]));
        assert_eq!(outcome, SyncOutcome::ActiveUsersChanged);
    }

    #[test]
    fn test_idempotent_reconcile_is_unchanged() {
        let mut state = ClientState::new();
        let snap = snapshot(
            vec![msg("user", "a"), msg("assistant", "b")],
            "# doc",
            vec![user("s1")],
        );
        state.reconcile(&snap);
        assert_eq!(state.reconcile(&snap), SyncOutcome::Unchanged);
        assert_eq!(state.reconcile(&snap), SyncOutcome::Unchanged);
    }

    #[test]
    fn test_duplicate_content_role_not_treated_as_new() {
        // The (content, role) key is an approximation: a genuinely new message
        // with identical text and role is misclassified as already known.
        let mut state = ClientState::new();
        state.reconcile(&snapshot(vec![msg("user", "same")], "d", vec![]));
        let outcome = state.reconcile(&snapshot(
            vec![msg("user", "same"), msg("user", "same")],
            "d",
            vec![],
        ));
        assert_eq!(outcome, SyncOutcome::Unchanged);
        assert_eq!(state.messages.len(), 1);
    }

    #[test]
    fn test_server_truncation_without_new_keys_keeps_local_messages() {
        // No new keys → no wholesale replace, local list stays.
        let mut state = ClientState::new();
        state.reconcile(&snapshot(vec![msg("user", "a"), msg("assistant", "b")], "d", vec![]));
        let outcome = state.reconcile(&snapshot(vec![msg("user", "a")], "d", vec![]));
        assert_eq!(outcome, SyncOutcome::Unchanged);
        assert_eq!(state.messages.len(), 2);
    }

    // -- config / builder ------------------------------------------------------

    #[test]
    fn test_sync_config_defaults() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.poll_interval, Duration::from_millis(500));
        assert_eq!(cfg.post_send_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_builder_overrides() {
        let client = Arc::new(ApiClient::new("http://localhost:1"));
        let sync = Synchronizer::builder(client, "demo")
            .poll_interval(Duration::from_millis(250))
            .post_send_delay(Duration::from_millis(50))
            .build();
        assert_eq!(sync.config.poll_interval, Duration::from_millis(250));
        assert_eq!(sync.config.post_send_delay, Duration::from_millis(50));
        assert_eq!(sync.project_id, "demo");
    }

    #[tokio::test]
    async fn test_poll_once_unreachable_server_is_err() {
        let client = Arc::new(ApiClient::new("http://127.0.0.1:1"));
        let sync = Synchronizer::builder(client, "demo").build();
        let state = new_shared_state();
        assert!(sync.poll_once(&state).await.is_err());
    }
}
