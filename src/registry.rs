//! Project registry: join/leave protocol, history snapshots, uploads, and
//! invitations over the shared store.
//!
//! ## Design
//! - SharedStore: Arc<Mutex<Store>> — shared across all connection tasks
//! - Projects are created implicitly on first join
//! - Identity is the self-asserted session id from the X-Session-Id header;
//!   nothing here verifies it
//! - "leave" is best-effort: unload signals are unreliable, so ghost sessions
//!   accumulate until cleanup_project_sessions or the idle sweeper clears them
//!
//! ## Session lifecycle
//! 1. Client calls POST /join → session registered active in the project
//! 2. Chat turns bump the session's last-activity timestamp
//! 3. POST /leave marks it inactive (may never arrive)
//! 4. cleanup-sessions / the periodic sweeper purge what leave missed

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{PlanroomError, Result};
use crate::store::{
    now_ts, InvitationRow, MessageRow, ProjectRow, SessionRow, SharedStore, Store, UploadRow,
};

/// Invitation tokens: 32 random alphanumerics, URL-safe without escaping.
pub const INVITE_TOKEN_LEN: usize = 32;

/// Generate a random alphanumeric invitation token.
pub fn generate_invite_token() -> String {
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..INVITE_TOKEN_LEN)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

fn lock(store: &SharedStore) -> Result<std::sync::MutexGuard<'_, Store>> {
    store
        .lock()
        .map_err(|_| PlanroomError::Internal("store lock poisoned".to_string()))
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One active session as shown to other participants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveUser {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    pub joined_at: i64,
}

impl From<SessionRow> for ActiveUser {
    fn from(row: SessionRow) -> Self {
        ActiveUser {
            session_id: row.session_id,
            user_name: row.user_name,
            joined_at: row.joined_at,
        }
    }
}

/// Result of a join or invitation-accept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinOutcome {
    pub session_id: String,
    pub project_id: String,
    pub message: String,
}

/// Full project state as fetched by the polling synchronizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySnapshot {
    pub history: Vec<MessageRow>,
    pub document: String,
    pub active_users: Vec<ActiveUser>,
}

/// Listing entry for GET /projects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSummary {
    pub project_id: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub active_users: usize,
    pub message_count: usize,
}

/// Status view for GET /projects/{id}/status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    pub project_id: String,
    pub active_users: Vec<ActiveUser>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<i64>,
    pub document_length: usize,
}

/// Validation result for GET /invitations/{token}/validate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationCheck {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Join / leave protocol
// ---------------------------------------------------------------------------

/// Register `session_id` as active in `project_id`, creating the project on
/// first join. `project_id` must be non-empty; `user_name` is optional and
/// self-asserted.
pub fn join_project(
    store: &SharedStore,
    project_id: &str,
    session_id: &str,
    user_name: Option<&str>,
) -> Result<JoinOutcome> {
    if project_id.trim().is_empty() {
        return Err(PlanroomError::Validation(
            "projectId must not be empty".to_string(),
        ));
    }
    let guard = lock(store)?;
    guard.create_project_if_absent(project_id)?;
    guard.upsert_session(session_id, project_id, user_name)?;
    Ok(JoinOutcome {
        session_id: session_id.to_string(),
        project_id: project_id.to_string(),
        message: format!("Successfully joined project {}", project_id),
    })
}

/// Mark the caller's session inactive. Returns false when no such session
/// exists — callers treat that as "nothing to do", not an error.
pub fn leave_project(store: &SharedStore, session_id: &str) -> Result<bool> {
    let guard = lock(store)?;
    guard.deactivate_session(session_id)
}

/// Administrative purge of ghost sessions for one project.
pub fn cleanup_project_sessions(store: &SharedStore, project_id: &str) -> Result<usize> {
    let guard = lock(store)?;
    if !guard.project_exists(project_id)? {
        return Err(PlanroomError::NotFound(format!("project {}", project_id)));
    }
    guard.deactivate_project_sessions(project_id)
}

/// Sweep sessions idle longer than `idle_secs` across all projects.
pub fn sweep_idle_sessions(store: &SharedStore, idle_secs: i64) -> Result<usize> {
    let guard = lock(store)?;
    guard.sweep_idle_sessions(now_ts() - idle_secs)
}

pub fn active_users(store: &SharedStore, project_id: &str) -> Result<Vec<ActiveUser>> {
    let guard = lock(store)?;
    if !guard.project_exists(project_id)? {
        return Err(PlanroomError::NotFound(format!("project {}", project_id)));
    }
    Ok(guard
        .active_sessions(project_id)?
        .into_iter()
        .map(ActiveUser::from)
        .collect())
}

// ---------------------------------------------------------------------------
// History, documents, chat turns
// ---------------------------------------------------------------------------

/// The full `{history, document, activeUsers}` snapshot the synchronizer
/// polls for.
pub fn project_snapshot(store: &SharedStore, project_id: &str) -> Result<HistorySnapshot> {
    let guard = lock(store)?;
    if !guard.project_exists(project_id)? {
        return Err(PlanroomError::NotFound(format!("project {}", project_id)));
    }
    Ok(HistorySnapshot {
        history: guard.project_messages(project_id)?,
        document: guard.get_document(project_id)?,
        active_users: guard
            .active_sessions(project_id)?
            .into_iter()
            .map(ActiveUser::from)
            .collect(),
    })
}

pub fn project_document(store: &SharedStore, project_id: &str) -> Result<String> {
    let guard = lock(store)?;
    if !guard.project_exists(project_id)? {
        return Err(PlanroomError::NotFound(format!("project {}", project_id)));
    }
    guard.get_document(project_id)
}

/// Append the user's message and bump session activity. Called before the
/// agent pipeline runs; the store lock is not held across the provider call.
pub fn record_user_message(
    store: &SharedStore,
    project_id: &str,
    session_id: &str,
    user_name: Option<&str>,
    content: &str,
) -> Result<String> {
    if project_id.trim().is_empty() {
        return Err(PlanroomError::Validation(
            "projectId must not be empty".to_string(),
        ));
    }
    let guard = lock(store)?;
    guard.create_project_if_absent(project_id)?;
    guard.touch_session(session_id)?;
    guard.append_message(project_id, Some(session_id), "user", content, user_name)?;
    guard.touch_project(project_id)?;
    guard.get_document(project_id)
}

/// Append the assistant's reply and, when the pipeline produced one, the
/// replacement document. Returns the active-user snapshot for the response.
pub fn record_assistant_reply(
    store: &SharedStore,
    project_id: &str,
    reply: &str,
    new_document: Option<&str>,
) -> Result<Vec<ActiveUser>> {
    let guard = lock(store)?;
    guard.append_message(project_id, None, "assistant", reply, None)?;
    if let Some(doc) = new_document {
        guard.save_document(project_id, doc)?;
    }
    guard.touch_project(project_id)?;
    Ok(guard
        .active_sessions(project_id)?
        .into_iter()
        .map(ActiveUser::from)
        .collect())
}

// ---------------------------------------------------------------------------
// Project listing / status / deletion
// ---------------------------------------------------------------------------

pub fn list_projects(store: &SharedStore) -> Result<Vec<ProjectSummary>> {
    let guard = lock(store)?;
    let projects: Vec<ProjectRow> = guard.list_projects()?;
    let mut out = Vec::with_capacity(projects.len());
    for p in projects {
        let active = guard.active_sessions(&p.project_id)?.len();
        let messages = guard.project_messages(&p.project_id)?.len();
        out.push(ProjectSummary {
            project_id: p.project_id,
            created_at: p.created_at,
            updated_at: p.updated_at,
            active_users: active,
            message_count: messages,
        });
    }
    Ok(out)
}

pub fn project_status(store: &SharedStore, project_id: &str) -> Result<ProjectStatus> {
    let guard = lock(store)?;
    let project = guard
        .get_project(project_id)?
        .ok_or_else(|| PlanroomError::NotFound(format!("project {}", project_id)))?;
    let document = guard.get_document(project_id)?;
    Ok(ProjectStatus {
        project_id: project.project_id,
        active_users: guard
            .active_sessions(project_id)?
            .into_iter()
            .map(ActiveUser::from)
            .collect(),
        last_activity: Some(project.updated_at),
        document_length: document.len(),
    })
}

pub fn delete_project(store: &SharedStore, project_id: &str) -> Result<()> {
    let mut guard = lock(store)?;
    if !guard.delete_project(project_id)? {
        return Err(PlanroomError::NotFound(format!("project {}", project_id)));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Uploads
// ---------------------------------------------------------------------------

/// Attach an uploaded file to a project.
pub fn attach_upload(
    store: &SharedStore,
    project_id: &str,
    filename: &str,
    file_type: &str,
    uploaded_by: Option<&str>,
    content: &[u8],
) -> Result<UploadRow> {
    if filename.trim().is_empty() {
        return Err(PlanroomError::Validation(
            "filename must not be empty".to_string(),
        ));
    }
    let guard = lock(store)?;
    if !guard.project_exists(project_id)? {
        return Err(PlanroomError::NotFound(format!("project {}", project_id)));
    }
    let meta = UploadRow {
        upload_id: uuid::Uuid::new_v4().to_string(),
        project_id: project_id.to_string(),
        filename: filename.to_string(),
        file_type: file_type.to_string(),
        file_size: content.len() as i64,
        uploaded_by: uploaded_by.map(str::to_string),
        uploaded_at: now_ts(),
    };
    guard.insert_upload(&meta, content)?;
    guard.touch_project(project_id)?;
    Ok(meta)
}

pub fn list_uploads(store: &SharedStore, project_id: &str) -> Result<Vec<UploadRow>> {
    let guard = lock(store)?;
    if !guard.project_exists(project_id)? {
        return Err(PlanroomError::NotFound(format!("project {}", project_id)));
    }
    guard.project_uploads(project_id)
}

pub fn fetch_upload(store: &SharedStore, upload_id: &str) -> Result<(UploadRow, Vec<u8>)> {
    let guard = lock(store)?;
    guard
        .get_upload(upload_id)?
        .ok_or_else(|| PlanroomError::NotFound(format!("upload {}", upload_id)))
}

pub fn remove_upload(store: &SharedStore, upload_id: &str) -> Result<()> {
    let guard = lock(store)?;
    if !guard.delete_upload(upload_id)? {
        return Err(PlanroomError::NotFound(format!("upload {}", upload_id)));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Invitations
// ---------------------------------------------------------------------------

/// Create an invitation to a project. Delivery of the invite e-mail is the
/// concern of an external service; this only records the token.
pub fn create_invitation(
    store: &SharedStore,
    project_id: &str,
    email: &str,
    inviter_name: Option<&str>,
) -> Result<InvitationRow> {
    if email.trim().is_empty() || !email.contains('@') {
        return Err(PlanroomError::Validation(
            "a valid invite email is required".to_string(),
        ));
    }
    let guard = lock(store)?;
    if !guard.project_exists(project_id)? {
        return Err(PlanroomError::NotFound(format!("project {}", project_id)));
    }
    let invitation = InvitationRow {
        token: generate_invite_token(),
        project_id: project_id.to_string(),
        email: email.trim().to_string(),
        inviter_name: inviter_name.map(str::to_string),
        created_at: now_ts(),
        accepted: false,
    };
    guard.insert_invitation(&invitation)?;
    Ok(invitation)
}

/// Check whether a token refers to a live project. Unknown tokens and tokens
/// whose project has been deleted both come back invalid rather than erroring.
pub fn validate_invitation(store: &SharedStore, token: &str) -> Result<InvitationCheck> {
    let guard = lock(store)?;
    match guard.get_invitation(token)? {
        Some(inv) if guard.project_exists(&inv.project_id)? => Ok(InvitationCheck {
            valid: true,
            project_id: Some(inv.project_id),
            message: "Invitation is valid".to_string(),
        }),
        Some(_) => Ok(InvitationCheck {
            valid: false,
            project_id: None,
            message: "The invited project no longer exists".to_string(),
        }),
        None => Ok(InvitationCheck {
            valid: false,
            project_id: None,
            message: "Invitation is invalid or expired".to_string(),
        }),
    }
}

/// Accept an invitation: joins the associated project like `join_project`.
pub fn accept_invitation(
    store: &SharedStore,
    token: &str,
    session_id: &str,
    user_name: Option<&str>,
) -> Result<JoinOutcome> {
    let project_id = {
        let guard = lock(store)?;
        let inv = guard
            .get_invitation(token)?
            .ok_or_else(|| PlanroomError::NotFound("invitation".to_string()))?;
        if !guard.project_exists(&inv.project_id)? {
            return Err(PlanroomError::NotFound(format!("project {}", inv.project_id)));
        }
        guard.mark_invitation_accepted(token)?;
        inv.project_id
    };
    join_project(store, &project_id, session_id, user_name)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
