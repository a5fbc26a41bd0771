//! REST client wrappers.
//!
//! Every call takes an explicit [`SessionContext`] instead of caching a
//! session id in module scope; the context travels with the caller and is
//! attached as the `X-Session-Id` header. Transport failures surface as
//! `Connect`, non-2xx statuses as `Http` (except 404, which becomes the
//! domain-level `NotFound`), and nothing is retried here — retry policy
//! belongs to the synchronizer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;

use crate::api::*;
use crate::error::{PlanroomError, Result};
use crate::registry::{HistorySnapshot, InvitationCheck, JoinOutcome, ProjectStatus, ProjectSummary};
use crate::store::UploadRow;

/// Header carrying the caller's self-asserted session identity.
pub const SESSION_HEADER: &str = "X-Session-Id";

/// Explicit session state for one joined client.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub project_id: String,
    pub user_name: Option<String>,
}

impl SessionContext {
    /// Fresh context with a newly allocated session id.
    pub fn new(project_id: impl Into<String>, user_name: Option<String>) -> Self {
        SessionContext {
            session_id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            user_name,
        }
    }

    /// Context resuming a previously issued session id.
    pub fn resume(
        session_id: impl Into<String>,
        project_id: impl Into<String>,
        user_name: Option<String>,
    ) -> Self {
        SessionContext {
            session_id: session_id.into(),
            project_id: project_id.into(),
            user_name,
        }
    }
}

/// Thin wrappers over the HTTP surface.
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    /// Client with the bridge's default timeouts: 3 s connect, 10 s request.
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        ApiClient { base_url, client }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn session_headers(ctx: &SessionContext) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = ctx.session_id.parse() {
            headers.insert(SESSION_HEADER, value);
        }
        headers
    }

    /// Map a response into `T`, translating non-2xx statuses into typed
    /// errors (404 carries the server's error text as a domain failure).
    async fn expect_json<T: DeserializeOwned>(url: String, resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if status.is_success() {
            return resp.json::<T>().await.map_err(|e| PlanroomError::Json {
                context: url,
                detail: e.to_string(),
            });
        }
        Err(Self::status_error(url, status.as_u16(), resp).await)
    }

    async fn expect_ok(url: String, resp: reqwest::Response) -> Result<()> {
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        Err(Self::status_error(url, status.as_u16(), resp).await)
    }

    async fn status_error(url: String, status: u16, resp: reqwest::Response) -> PlanroomError {
        let detail = resp
            .json::<ErrorResponse>()
            .await
            .map(|e| e.error)
            .unwrap_or_default();
        match status {
            404 => PlanroomError::NotFound(if detail.is_empty() { url } else { detail }),
            400 => PlanroomError::Validation(if detail.is_empty() { url } else { detail }),
            _ => PlanroomError::Http { status, url },
        }
    }

    fn connect_err(url: &str, e: reqwest::Error) -> PlanroomError {
        PlanroomError::Connect {
            url: url.to_string(),
            detail: e.to_string(),
        }
    }

    // -- session protocol ---------------------------------------------------

    pub async fn join(&self, ctx: &SessionContext) -> Result<JoinOutcome> {
        let url = self.url("/join");
        let body = JoinRequest {
            project_id: ctx.project_id.clone(),
            user_name: ctx.user_name.clone(),
        };
        let resp = self
            .client
            .post(&url)
            .headers(Self::session_headers(ctx))
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::connect_err(&url, e))?;
        Self::expect_json(url, resp).await
    }

    /// Best-effort: callers on the sign-out path log and swallow the error.
    pub async fn leave(&self, ctx: &SessionContext) -> Result<()> {
        let url = self.url("/leave");
        let resp = self
            .client
            .post(&url)
            .headers(Self::session_headers(ctx))
            .send()
            .await
            .map_err(|e| Self::connect_err(&url, e))?;
        Self::expect_ok(url, resp).await
    }

    pub async fn chat(&self, ctx: &SessionContext, message: &str) -> Result<ChatResponse> {
        let url = self.url("/chat");
        let body = ChatRequest {
            message: message.to_string(),
            project_id: ctx.project_id.clone(),
            user_name: ctx.user_name.clone(),
        };
        let resp = self
            .client
            .post(&url)
            .headers(Self::session_headers(ctx))
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::connect_err(&url, e))?;
        Self::expect_json(url, resp).await
    }

    // -- reads --------------------------------------------------------------

    pub async fn document(&self, project_id: &str) -> Result<String> {
        let url = self.url(&format!("/document/{}", project_id));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::connect_err(&url, e))?;
        let body: DocumentResponse = Self::expect_json(url, resp).await?;
        Ok(body.document)
    }

    pub async fn history(&self, project_id: &str) -> Result<HistorySnapshot> {
        let url = self.url(&format!("/history/{}", project_id));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::connect_err(&url, e))?;
        Self::expect_json(url, resp).await
    }

    pub async fn projects(&self) -> Result<Vec<ProjectSummary>> {
        let url = self.url("/projects");
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::connect_err(&url, e))?;
        let body: ProjectsResponse = Self::expect_json(url, resp).await?;
        Ok(body.projects)
    }

    pub async fn project_status(&self, project_id: &str) -> Result<ProjectStatus> {
        let url = self.url(&format!("/projects/{}/status", project_id));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::connect_err(&url, e))?;
        Self::expect_json(url, resp).await
    }

    // -- project administration ---------------------------------------------

    pub async fn delete_project(&self, project_id: &str) -> Result<()> {
        let url = self.url(&format!("/projects/{}", project_id));
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| Self::connect_err(&url, e))?;
        Self::expect_ok(url, resp).await
    }

    pub async fn cleanup_sessions(&self, project_id: &str) -> Result<()> {
        let url = self.url(&format!("/projects/{}/cleanup-sessions", project_id));
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| Self::connect_err(&url, e))?;
        Self::expect_ok(url, resp).await
    }

    // -- uploads ------------------------------------------------------------

    pub async fn upload(
        &self,
        ctx: &SessionContext,
        filename: &str,
        file_type: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadReceipt> {
        let url = self.url(&format!("/projects/{}/upload", ctx.project_id));
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(file_type)
            .map_err(|e| PlanroomError::Validation(format!("invalid file type: {}", e)))?;
        let form = reqwest::multipart::Form::new().part("file", part);
        let resp = self
            .client
            .post(&url)
            .headers(Self::session_headers(ctx))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Self::connect_err(&url, e))?;
        Self::expect_json(url, resp).await
    }

    pub async fn uploads(&self, project_id: &str) -> Result<Vec<UploadRow>> {
        let url = self.url(&format!("/projects/{}/uploads", project_id));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::connect_err(&url, e))?;
        let body: UploadsResponse = Self::expect_json(url, resp).await?;
        Ok(body.documents)
    }

    pub async fn fetch_upload(&self, upload_id: &str) -> Result<UploadContent> {
        let url = self.url(&format!("/uploads/{}", upload_id));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::connect_err(&url, e))?;
        Self::expect_json(url, resp).await
    }

    pub async fn delete_upload(&self, upload_id: &str) -> Result<()> {
        let url = self.url(&format!("/uploads/{}", upload_id));
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| Self::connect_err(&url, e))?;
        Self::expect_ok(url, resp).await
    }

    // -- invitations ---------------------------------------------------------

    pub async fn invite(
        &self,
        project_id: &str,
        email: &str,
        inviter_name: Option<&str>,
    ) -> Result<InviteResponse> {
        let url = self.url(&format!("/projects/{}/invite", project_id));
        let body = InviteRequest {
            email: email.to_string(),
            inviter_name: inviter_name.map(str::to_string),
        };
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::connect_err(&url, e))?;
        Self::expect_json(url, resp).await
    }

    pub async fn validate_invitation(&self, token: &str) -> Result<InvitationCheck> {
        let url = self.url(&format!("/invitations/{}/validate", token));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::connect_err(&url, e))?;
        Self::expect_json(url, resp).await
    }

    pub async fn accept_invitation(
        &self,
        token: &str,
        ctx: &SessionContext,
    ) -> Result<JoinOutcome> {
        let url = self.url(&format!("/invitations/{}/accept", token));
        let resp = self
            .client
            .post(&url)
            .headers(Self::session_headers(ctx))
            .send()
            .await
            .map_err(|e| Self::connect_err(&url, e))?;
        Self::expect_json(url, resp).await
    }
}

// ---------------------------------------------------------------------------
// ChatSender — single-flight send guard
// ---------------------------------------------------------------------------

/// Guards against concurrent sends from the same tab: a second send while
/// one is pending is rejected without issuing a request. Two different
/// clients joined to the same project are deliberately not coordinated.
pub struct ChatSender {
    in_flight: AtomicBool,
}

impl Default for ChatSender {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatSender {
    pub fn new() -> Self {
        ChatSender {
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Claim the in-flight slot. Returns false when a send is already pending.
    fn try_begin(&self) -> bool {
        !self.in_flight.swap(true, Ordering::SeqCst)
    }

    fn finish(&self) {
        self.in_flight.store(false, Ordering::SeqCst);
    }

    /// Send one chat message through `client`, holding the in-flight flag for
    /// the duration. The message is NOT appended locally first — the sync
    /// loop picks it up from the server, which avoids duplicate entries.
    pub async fn send(
        &self,
        client: &ApiClient,
        ctx: &SessionContext,
        message: &str,
    ) -> Result<ChatResponse> {
        if !self.try_begin() {
            return Err(PlanroomError::SendInFlight);
        }
        let result = client.chat(ctx, message).await;
        self.finish();
        result
    }
}
