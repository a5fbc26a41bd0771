//! SQLite storage layer.
//!
//! One database shared by the HTTP service and the CLI. Handles schema
//! creation and CRUD for all entity types: projects, documents, sessions,
//! messages, uploads, and invitations. The connection is wrapped in
//! `Arc<Mutex<..>>` and shared across request handler tasks; SQLite's own
//! transactional guarantees are the only write coordination (last write wins
//! on the document, append order on messages).

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Shared store handle: cloned into every connection handler task.
pub type SharedStore = Arc<Mutex<Store>>;

/// Placeholder document for a project with no generated plan yet.
pub const DEFAULT_DOCUMENT: &str = "# Project Plan\n\nWaiting for project details...";

/// Current Unix epoch in seconds.
pub fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRow {
    pub project_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRow {
    pub session_id: String,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    pub joined_at: i64,
    pub last_activity: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRow {
    pub role: String,
    pub content: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Upload metadata; file bytes are fetched separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRow {
    pub upload_id: String,
    pub project_id: String,
    pub filename: String,
    pub file_type: String,
    pub file_size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploaded_by: Option<String>,
    pub uploaded_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationRow {
    pub token: String,
    pub project_id: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inviter_name: Option<String>,
    pub created_at: i64,
    pub accepted: bool,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if missing) the database at `path` and ensure the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Store { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Store { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                project_id    TEXT PRIMARY KEY,
                created_at_ts INTEGER NOT NULL,
                updated_at_ts INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS documents (
                project_id    TEXT PRIMARY KEY REFERENCES projects(project_id) ON DELETE CASCADE,
                content       TEXT NOT NULL,
                updated_at_ts INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sessions (
                session_id       TEXT PRIMARY KEY,
                project_id       TEXT NOT NULL,
                user_name        TEXT,
                joined_at_ts     INTEGER NOT NULL,
                last_activity_ts INTEGER NOT NULL,
                is_active        INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS messages (
                seq        INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL UNIQUE,
                project_id TEXT NOT NULL REFERENCES projects(project_id) ON DELETE CASCADE,
                session_id TEXT,
                role       TEXT NOT NULL,
                content    TEXT NOT NULL,
                user_name  TEXT,
                timestamp_ts INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_project_seq
                ON messages(project_id, seq);
            CREATE TABLE IF NOT EXISTS uploads (
                upload_id      TEXT PRIMARY KEY,
                project_id     TEXT NOT NULL REFERENCES projects(project_id) ON DELETE CASCADE,
                filename       TEXT NOT NULL,
                file_type      TEXT NOT NULL,
                file_size      INTEGER NOT NULL,
                uploaded_by    TEXT,
                uploaded_at_ts INTEGER NOT NULL,
                content        BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS invitations (
                token         TEXT PRIMARY KEY,
                project_id    TEXT NOT NULL,
                email         TEXT NOT NULL,
                inviter_name  TEXT,
                created_at_ts INTEGER NOT NULL,
                accepted      INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )?;
        Ok(())
    }

    // -- projects -----------------------------------------------------------

    /// Create the project if it does not exist. Returns true when a new row
    /// was inserted.
    pub fn create_project_if_absent(&self, project_id: &str) -> Result<bool> {
        let now = now_ts();
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO projects (project_id, created_at_ts, updated_at_ts)
             VALUES (?1, ?2, ?2)",
            params![project_id, now],
        )?;
        Ok(inserted > 0)
    }

    pub fn project_exists(&self, project_id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM projects WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get_project(&self, project_id: &str) -> Result<Option<ProjectRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT project_id, created_at_ts, updated_at_ts
                 FROM projects WHERE project_id = ?1",
                params![project_id],
                |row| {
                    Ok(ProjectRow {
                        project_id: row.get(0)?,
                        created_at: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Bump the project's updated timestamp.
    pub fn touch_project(&self, project_id: &str) -> Result<bool> {
        let n = self.conn.execute(
            "UPDATE projects SET updated_at_ts = ?2 WHERE project_id = ?1",
            params![project_id, now_ts()],
        )?;
        Ok(n > 0)
    }

    pub fn list_projects(&self) -> Result<Vec<ProjectRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT project_id, created_at_ts, updated_at_ts
             FROM projects ORDER BY updated_at_ts DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ProjectRow {
                    project_id: row.get(0)?,
                    created_at: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete a project and everything attached to it. Sessions are marked
    /// inactive rather than deleted so a stale client's leave still resolves.
    pub fn delete_project(&mut self, project_id: &str) -> Result<bool> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM documents WHERE project_id = ?1", params![project_id])?;
        tx.execute("DELETE FROM messages WHERE project_id = ?1", params![project_id])?;
        tx.execute("DELETE FROM uploads WHERE project_id = ?1", params![project_id])?;
        tx.execute("DELETE FROM invitations WHERE project_id = ?1", params![project_id])?;
        tx.execute(
            "UPDATE sessions SET is_active = 0 WHERE project_id = ?1",
            params![project_id],
        )?;
        let n = tx.execute("DELETE FROM projects WHERE project_id = ?1", params![project_id])?;
        tx.commit()?;
        Ok(n > 0)
    }

    // -- documents ----------------------------------------------------------

    /// Document content for the project, or the placeholder if none was
    /// generated yet.
    pub fn get_document(&self, project_id: &str) -> Result<String> {
        let content: Option<String> = self
            .conn
            .query_row(
                "SELECT content FROM documents WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(content.unwrap_or_else(|| DEFAULT_DOCUMENT.to_string()))
    }

    /// Replace the project document wholesale.
    pub fn save_document(&self, project_id: &str, content: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO documents (project_id, content, updated_at_ts)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(project_id) DO UPDATE SET
                 content = excluded.content,
                 updated_at_ts = excluded.updated_at_ts",
            params![project_id, content, now_ts()],
        )?;
        Ok(())
    }

    // -- sessions -----------------------------------------------------------

    /// Register a session as active in a project. Re-joining with an existing
    /// session id moves it to the new project and reactivates it.
    pub fn upsert_session(
        &self,
        session_id: &str,
        project_id: &str,
        user_name: Option<&str>,
    ) -> Result<()> {
        let now = now_ts();
        self.conn.execute(
            "INSERT INTO sessions (session_id, project_id, user_name, joined_at_ts, last_activity_ts, is_active)
             VALUES (?1, ?2, ?3, ?4, ?4, 1)
             ON CONFLICT(session_id) DO UPDATE SET
                 project_id = excluded.project_id,
                 user_name = excluded.user_name,
                 last_activity_ts = excluded.last_activity_ts,
                 is_active = 1",
            params![session_id, project_id, user_name, now],
        )?;
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT session_id, project_id, user_name, joined_at_ts, last_activity_ts, is_active
                 FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok(SessionRow {
                        session_id: row.get(0)?,
                        project_id: row.get(1)?,
                        user_name: row.get(2)?,
                        joined_at: row.get(3)?,
                        last_activity: row.get(4)?,
                        is_active: row.get::<_, i64>(5)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn touch_session(&self, session_id: &str) -> Result<bool> {
        let n = self.conn.execute(
            "UPDATE sessions SET last_activity_ts = ?2 WHERE session_id = ?1",
            params![session_id, now_ts()],
        )?;
        Ok(n > 0)
    }

    pub fn deactivate_session(&self, session_id: &str) -> Result<bool> {
        let n = self.conn.execute(
            "UPDATE sessions SET is_active = 0 WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(n > 0)
    }

    pub fn active_sessions(&self, project_id: &str) -> Result<Vec<SessionRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, project_id, user_name, joined_at_ts, last_activity_ts, is_active
             FROM sessions
             WHERE project_id = ?1 AND is_active = 1
             ORDER BY joined_at_ts",
        )?;
        let rows = stmt
            .query_map(params![project_id], |row| {
                Ok(SessionRow {
                    session_id: row.get(0)?,
                    project_id: row.get(1)?,
                    user_name: row.get(2)?,
                    joined_at: row.get(3)?,
                    last_activity: row.get(4)?,
                    is_active: row.get::<_, i64>(5)? != 0,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Purge ghost sessions for one project. Returns how many were cleared.
    pub fn deactivate_project_sessions(&self, project_id: &str) -> Result<usize> {
        let n = self.conn.execute(
            "UPDATE sessions SET is_active = 0 WHERE project_id = ?1 AND is_active = 1",
            params![project_id],
        )?;
        Ok(n)
    }

    /// Mark every session idle since before `cutoff_ts` inactive.
    pub fn sweep_idle_sessions(&self, cutoff_ts: i64) -> Result<usize> {
        let n = self.conn.execute(
            "UPDATE sessions SET is_active = 0 WHERE is_active = 1 AND last_activity_ts < ?1",
            params![cutoff_ts],
        )?;
        Ok(n)
    }

    // -- messages -----------------------------------------------------------

    /// Append a message to the project history. Ordering is the insertion
    /// order of this call.
    pub fn append_message(
        &self,
        project_id: &str,
        session_id: Option<&str>,
        role: &str,
        content: &str,
        user_name: Option<&str>,
    ) -> Result<MessageRow> {
        let now = now_ts();
        let message_id = uuid::Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO messages (message_id, project_id, session_id, role, content, user_name, timestamp_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![message_id, project_id, session_id, role, content, user_name, now],
        )?;
        Ok(MessageRow {
            role: role.to_string(),
            content: content.to_string(),
            timestamp: now,
            user_name: user_name.map(str::to_string),
            session_id: session_id.map(str::to_string),
        })
    }

    pub fn project_messages(&self, project_id: &str) -> Result<Vec<MessageRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT role, content, timestamp_ts, user_name, session_id
             FROM messages WHERE project_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![project_id], |row| {
                Ok(MessageRow {
                    role: row.get(0)?,
                    content: row.get(1)?,
                    timestamp: row.get(2)?,
                    user_name: row.get(3)?,
                    session_id: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- uploads ------------------------------------------------------------

    pub fn insert_upload(&self, meta: &UploadRow, content: &[u8]) -> Result<()> {
        self.conn.execute(
            "INSERT INTO uploads (upload_id, project_id, filename, file_type, file_size, uploaded_by, uploaded_at_ts, content)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                meta.upload_id,
                meta.project_id,
                meta.filename,
                meta.file_type,
                meta.file_size,
                meta.uploaded_by,
                meta.uploaded_at,
                content
            ],
        )?;
        Ok(())
    }

    /// Upload metadata for a project, newest first. Content bytes stay in the
    /// database until an individual fetch asks for them.
    pub fn project_uploads(&self, project_id: &str) -> Result<Vec<UploadRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT upload_id, project_id, filename, file_type, file_size, uploaded_by, uploaded_at_ts
             FROM uploads WHERE project_id = ?1 ORDER BY uploaded_at_ts DESC",
        )?;
        let rows = stmt
            .query_map(params![project_id], |row| {
                Ok(UploadRow {
                    upload_id: row.get(0)?,
                    project_id: row.get(1)?,
                    filename: row.get(2)?,
                    file_type: row.get(3)?,
                    file_size: row.get(4)?,
                    uploaded_by: row.get(5)?,
                    uploaded_at: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_upload(&self, upload_id: &str) -> Result<Option<(UploadRow, Vec<u8>)>> {
        let row = self
            .conn
            .query_row(
                "SELECT upload_id, project_id, filename, file_type, file_size, uploaded_by, uploaded_at_ts, content
                 FROM uploads WHERE upload_id = ?1",
                params![upload_id],
                |row| {
                    Ok((
                        UploadRow {
                            upload_id: row.get(0)?,
                            project_id: row.get(1)?,
                            filename: row.get(2)?,
                            file_type: row.get(3)?,
                            file_size: row.get(4)?,
                            uploaded_by: row.get(5)?,
                            uploaded_at: row.get(6)?,
                        },
                        row.get::<_, Vec<u8>>(7)?,
                    ))
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn delete_upload(&self, upload_id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM uploads WHERE upload_id = ?1", params![upload_id])?;
        Ok(n > 0)
    }

    // -- invitations --------------------------------------------------------

    pub fn insert_invitation(&self, invitation: &InvitationRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO invitations (token, project_id, email, inviter_name, created_at_ts, accepted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                invitation.token,
                invitation.project_id,
                invitation.email,
                invitation.inviter_name,
                invitation.created_at,
                invitation.accepted as i64
            ],
        )?;
        Ok(())
    }

    pub fn get_invitation(&self, token: &str) -> Result<Option<InvitationRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT token, project_id, email, inviter_name, created_at_ts, accepted
                 FROM invitations WHERE token = ?1",
                params![token],
                |row| {
                    Ok(InvitationRow {
                        token: row.get(0)?,
                        project_id: row.get(1)?,
                        email: row.get(2)?,
                        inviter_name: row.get(3)?,
                        created_at: row.get(4)?,
                        accepted: row.get::<_, i64>(5)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn mark_invitation_accepted(&self, token: &str) -> Result<bool> {
        let n = self.conn.execute(
            "UPDATE invitations SET accepted = 1 WHERE token = ?1",
            params![token],
        )?;
        Ok(n > 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    // -- schema / open -------------------------------------------------------

    #[test]
    fn test_open_in_memory_creates_schema() {
        let s = store();
        assert!(s.list_projects().unwrap().is_empty());
    }

    #[test]
    fn test_open_file_backed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("planroom.sqlite");
        let s = Store::open(&path).unwrap();
        s.create_project_if_absent("demo").unwrap();
        drop(s);
        // Reopen and verify persistence
        let s2 = Store::open(&path).unwrap();
        assert!(s2.project_exists("demo").unwrap());
    }

    // -- projects ------------------------------------------------------------

    #[test]
    fn test_create_project_if_absent_inserts_once() {
        let s = store();
        assert!(s.create_project_if_absent("demo").unwrap());
        assert!(!s.create_project_if_absent("demo").unwrap());
        assert_eq!(s.list_projects().unwrap().len(), 1);
    }

    #[test]
    fn test_project_exists() {
        let s = store();
        assert!(!s.project_exists("demo").unwrap());
        s.create_project_if_absent("demo").unwrap();
        assert!(s.project_exists("demo").unwrap());
    }

    #[test]
    fn test_get_project_returns_timestamps() {
        let s = store();
        s.create_project_if_absent("demo").unwrap();
        let p = s.get_project("demo").unwrap().unwrap();
        assert_eq!(p.project_id, "demo");
        assert!(p.created_at > 1_700_000_000);
        assert_eq!(p.created_at, p.updated_at);
    }

    #[test]
    fn test_touch_project_missing_returns_false() {
        let s = store();
        assert!(!s.touch_project("nope").unwrap());
    }

    #[test]
    fn test_delete_project_removes_everything() {
        let mut s = store();
        s.create_project_if_absent("demo").unwrap();
        s.save_document("demo", "# Plan").unwrap();
        s.append_message("demo", None, "user", "hello", None).unwrap();
        s.upsert_session("sess-1", "demo", Some("Alice")).unwrap();
        assert!(s.delete_project("demo").unwrap());
        assert!(!s.project_exists("demo").unwrap());
        assert!(s.project_messages("demo").unwrap().is_empty());
        assert_eq!(s.get_document("demo").unwrap(), DEFAULT_DOCUMENT);
        assert!(s.active_sessions("demo").unwrap().is_empty());
    }

    #[test]
    fn test_delete_missing_project_returns_false() {
        let mut s = store();
        assert!(!s.delete_project("ghost").unwrap());
    }

    // -- documents -----------------------------------------------------------

    #[test]
    fn test_get_document_defaults_to_placeholder() {
        let s = store();
        s.create_project_if_absent("demo").unwrap();
        assert_eq!(s.get_document("demo").unwrap(), DEFAULT_DOCUMENT);
    }

    #[test]
    fn test_save_document_replaces_wholesale() {
        let s = store();
        s.create_project_if_absent("demo").unwrap();
        s.save_document("demo", "# v1").unwrap();
        s.save_document("demo", "# v2").unwrap();
        assert_eq!(s.get_document("demo").unwrap(), "# v2");
    }

    // -- sessions ------------------------------------------------------------

    #[test]
    fn test_upsert_session_registers_active() {
        let s = store();
        s.create_project_if_absent("demo").unwrap();
        s.upsert_session("sess-1", "demo", Some("Alice")).unwrap();
        let active = s.active_sessions("demo").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id, "sess-1");
        assert_eq!(active[0].user_name.as_deref(), Some("Alice"));
        assert!(active[0].is_active);
    }

    #[test]
    fn test_upsert_session_rejoin_moves_project() {
        let s = store();
        s.create_project_if_absent("alpha").unwrap();
        s.create_project_if_absent("beta").unwrap();
        s.upsert_session("sess-1", "alpha", None).unwrap();
        s.upsert_session("sess-1", "beta", None).unwrap();
        assert!(s.active_sessions("alpha").unwrap().is_empty());
        assert_eq!(s.active_sessions("beta").unwrap().len(), 1);
    }

    #[test]
    fn test_deactivate_session_removes_from_active() {
        let s = store();
        s.create_project_if_absent("demo").unwrap();
        s.upsert_session("sess-1", "demo", None).unwrap();
        assert!(s.deactivate_session("sess-1").unwrap());
        assert!(s.active_sessions("demo").unwrap().is_empty());
    }

    #[test]
    fn test_deactivate_unknown_session_returns_false() {
        let s = store();
        assert!(!s.deactivate_session("ghost").unwrap());
    }

    #[test]
    fn test_deactivate_project_sessions_counts() {
        let s = store();
        s.create_project_if_absent("demo").unwrap();
        s.upsert_session("s1", "demo", None).unwrap();
        s.upsert_session("s2", "demo", None).unwrap();
        s.upsert_session("s3", "demo", None).unwrap();
        s.deactivate_session("s3").unwrap();
        assert_eq!(s.deactivate_project_sessions("demo").unwrap(), 2);
        assert!(s.active_sessions("demo").unwrap().is_empty());
    }

    #[test]
    fn test_sweep_idle_sessions_cutoff() {
        let s = store();
        s.create_project_if_absent("demo").unwrap();
        s.upsert_session("fresh", "demo", None).unwrap();
        s.upsert_session("stale", "demo", None).unwrap();
        // Backdate the stale session.
        s.conn
            .execute(
                "UPDATE sessions SET last_activity_ts = ?1 WHERE session_id = 'stale'",
                params![now_ts() - 10_000],
            )
            .unwrap();
        let swept = s.sweep_idle_sessions(now_ts() - 1_800).unwrap();
        assert_eq!(swept, 1);
        let active = s.active_sessions("demo").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id, "fresh");
    }

    // -- messages ------------------------------------------------------------

    #[test]
    fn test_append_message_preserves_order() {
        let s = store();
        s.create_project_if_absent("demo").unwrap();
        s.append_message("demo", Some("s1"), "user", "first", Some("Alice")).unwrap();
        s.append_message("demo", None, "assistant", "second", None).unwrap();
        s.append_message("demo", Some("s2"), "user", "third", Some("Bob")).unwrap();
        let msgs = s.project_messages("demo").unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].content, "first");
        assert_eq!(msgs[1].content, "second");
        assert_eq!(msgs[2].content, "third");
        assert_eq!(msgs[0].role, "user");
        assert_eq!(msgs[1].role, "assistant");
    }

    #[test]
    fn test_messages_carry_user_and_session() {
        let s = store();
        s.create_project_if_absent("demo").unwrap();
        s.append_message("demo", Some("s1"), "user", "hi", Some("Alice")).unwrap();
        let msgs = s.project_messages("demo").unwrap();
        assert_eq!(msgs[0].user_name.as_deref(), Some("Alice"));
        assert_eq!(msgs[0].session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_messages_isolated_per_project() {
        let s = store();
        s.create_project_if_absent("a").unwrap();
        s.create_project_if_absent("b").unwrap();
        s.append_message("a", None, "user", "in a", None).unwrap();
        assert!(s.project_messages("b").unwrap().is_empty());
    }

    // -- uploads -------------------------------------------------------------

    fn sample_upload(project_id: &str) -> UploadRow {
        UploadRow {
            upload_id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            filename: "specs.md".to_string(),
            file_type: "text/markdown".to_string(),
            file_size: 11,
            uploaded_by: Some("Alice".to_string()),
            uploaded_at: now_ts(),
        }
    }

    #[test]
    fn test_insert_and_get_upload_roundtrip() {
        let s = store();
        s.create_project_if_absent("demo").unwrap();
        let meta = sample_upload("demo");
        s.insert_upload(&meta, b"hello bytes").unwrap();
        let (got, content) = s.get_upload(&meta.upload_id).unwrap().unwrap();
        assert_eq!(got.filename, "specs.md");
        assert_eq!(content, b"hello bytes");
    }

    #[test]
    fn test_project_uploads_lists_metadata() {
        let s = store();
        s.create_project_if_absent("demo").unwrap();
        s.insert_upload(&sample_upload("demo"), b"one").unwrap();
        s.insert_upload(&sample_upload("demo"), b"two").unwrap();
        assert_eq!(s.project_uploads("demo").unwrap().len(), 2);
    }

    #[test]
    fn test_delete_upload() {
        let s = store();
        s.create_project_if_absent("demo").unwrap();
        let meta = sample_upload("demo");
        s.insert_upload(&meta, b"x").unwrap();
        assert!(s.delete_upload(&meta.upload_id).unwrap());
        assert!(s.get_upload(&meta.upload_id).unwrap().is_none());
        assert!(!s.delete_upload(&meta.upload_id).unwrap());
    }

    // -- invitations ---------------------------------------------------------

    #[test]
    fn test_invitation_roundtrip() {
        let s = store();
        s.create_project_if_absent("demo").unwrap();
        let inv = InvitationRow {
            token: "tok-abc".to_string(),
            project_id: "demo".to_string(),
            email: "alice@example.com".to_string(),
            inviter_name: Some("Bob".to_string()),
            created_at: now_ts(),
            accepted: false,
        };
        s.insert_invitation(&inv).unwrap();
        let got = s.get_invitation("tok-abc").unwrap().unwrap();
        assert_eq!(got.project_id, "demo");
        assert_eq!(got.email, "alice@example.com");
        assert!(!got.accepted);
    }

    #[test]
    fn test_mark_invitation_accepted() {
        let s = store();
        s.create_project_if_absent("demo").unwrap();
        let inv = InvitationRow {
            token: "tok-xyz".to_string(),
            project_id: "demo".to_string(),
            email: "a@b.c".to_string(),
            inviter_name: None,
            created_at: now_ts(),
            accepted: false,
        };
        s.insert_invitation(&inv).unwrap();
        assert!(s.mark_invitation_accepted("tok-xyz").unwrap());
        assert!(s.get_invitation("tok-xyz").unwrap().unwrap().accepted);
    }

    #[test]
    fn test_get_unknown_invitation_is_none() {
        let s = store();
        assert!(s.get_invitation("ghost").unwrap().is_none());
    }
}
