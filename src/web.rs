//! HTTP service.
//!
//! A hand-rolled HTTP/1.1 server on `tokio::net::TcpListener`: one task per
//! connection, request heads parsed with httparse, JSON in and out, and a
//! `Connection: close` response per request. Identity is the self-asserted
//! `X-Session-Id` header; a missing header on join/accept gets a fresh UUID.
//!
//! A background task sweeps idle sessions every `sweep_interval_secs` —
//! leave-on-unload is unreliable, so ghost sessions are expected and purged
//! here and via POST /projects/{id}/cleanup-sessions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::api::*;
use crate::client::SESSION_HEADER;
use crate::config::Config;
use crate::error::{PlanroomError, Result};
use crate::registry;
use crate::store::{SharedStore, Store};
use crate::PlannerEngine;

/// Process start, for the health endpoint's uptime report.
static STARTED_AT: Lazy<Instant> = Lazy::new(Instant::now);

/// Requests larger than this are rejected outright.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared handles cloned into every connection task.
#[derive(Clone)]
pub struct ServerState {
    pub store: SharedStore,
    pub engine: Arc<PlannerEngine>,
}

/// Start the API server and run until the process is killed.
pub async fn serve(config: &Config) -> Result<()> {
    Lazy::force(&STARTED_AT);

    let store = Store::open(&config.db_path)?.into_shared();
    let engine = Arc::new(PlannerEngine::new(
        config.provider.clone(),
        config.resolved_model(),
    )?);
    let state = ServerState { store, engine };

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(
        port = config.port,
        db = %config.db_path.display(),
        provider = %config.provider,
        "planroom API listening"
    );

    // Periodic ghost-session sweep.
    {
        let store = state.store.clone();
        let idle_secs = config.session_idle_secs;
        let sweep_every = Duration::from_secs(config.sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match registry::sweep_idle_sessions(&store, idle_secs) {
                    Ok(0) => {}
                    Ok(n) => info!(swept = n, "marked idle sessions inactive"),
                    Err(e) => warn!(error = %e, "session sweep failed"),
                }
            }
        });
    }

    run_listener(listener, state).await
}

/// Accept loop over an already-bound listener. Split out so tests can bind an
/// ephemeral port and drive the full HTTP surface.
pub async fn run_listener(listener: TcpListener, state: ServerState) -> Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, state).await {
                error!(peer = %addr, error = %e, "connection error");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Request / response plumbing
// ---------------------------------------------------------------------------

/// One parsed HTTP request.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn session_id(&self) -> Option<&str> {
        self.header(SESSION_HEADER).filter(|s| !s.is_empty())
    }

    /// Session id from the header, or a freshly allocated one.
    pub fn session_id_or_new(&self) -> String {
        self.session_id()
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| PlanroomError::Validation(format!("invalid request body: {}", e)))
    }
}

/// Read one request (head + body) off the stream. Returns None when the peer
/// closed the connection before sending anything.
pub async fn read_request<S>(stream: &mut S) -> Result<Option<Request>>
where
    S: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    // Accumulate until the header terminator shows up.
    let head_end = loop {
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > 64 * 1024 {
            return Err(PlanroomError::Validation("request head too large".into()));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(PlanroomError::Validation("truncated request head".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let mut header_storage = [httparse::EMPTY_HEADER; 32];
    let mut parsed = httparse::Request::new(&mut header_storage);
    match parsed.parse(&buf[..head_end]) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) | Err(_) => {
            return Err(PlanroomError::Validation("malformed request head".into()));
        }
    }

    let method = parsed.method.unwrap_or("GET").to_string();
    let path = parsed.path.unwrap_or("/").to_string();
    let headers: Vec<(String, String)> = parsed
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).to_string(),
            )
        })
        .collect();

    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Err(PlanroomError::Validation("request body too large".into()));
    }

    let mut body = buf[head_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(PlanroomError::Validation("truncated request body".into()));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(Some(Request {
        method,
        path,
        headers,
        body,
    }))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Status + optional JSON body, ready to be written out.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Option<String>,
}

impl HttpResponse {
    pub fn json<T: serde::Serialize>(value: &T) -> Self {
        HttpResponse {
            status: 200,
            body: Some(serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())),
        }
    }

    pub fn no_content() -> Self {
        HttpResponse {
            status: 204,
            body: None,
        }
    }

    pub fn from_error(err: &PlanroomError) -> Self {
        HttpResponse {
            status: err.status_code(),
            body: Some(
                serde_json::to_string(&ErrorResponse {
                    error: err.to_string(),
                })
                .unwrap_or_else(|_| "{}".to_string()),
            ),
        }
    }
}

fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        409 => "Conflict",
        _ => "Internal Server Error",
    }
}

async fn write_response<S>(stream: &mut S, response: &HttpResponse) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let head = match &response.body {
        Some(body) => format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nAccess-Control-Allow-Origin: *\r\nConnection: close\r\n\r\n{}",
            response.status,
            status_text(response.status),
            body.len(),
            body
        ),
        None => format!(
            "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nAccess-Control-Allow-Origin: *\r\nConnection: close\r\n\r\n",
            response.status,
            status_text(response.status)
        ),
    };
    stream.write_all(head.as_bytes()).await?;
    stream.flush().await
}

async fn handle_connection(
    mut stream: tokio::net::TcpStream,
    state: ServerState,
) -> Result<()> {
    let request = match read_request(&mut stream).await {
        Ok(Some(req)) => req,
        Ok(None) => return Ok(()),
        Err(e) => {
            let _ = write_response(&mut stream, &HttpResponse::from_error(&e)).await;
            return Ok(());
        }
    };

    let response = dispatch(&state, &request).await;
    write_response(&mut stream, &response).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Route a parsed request to its handler. Errors become JSON error bodies
/// with the status the error maps to.
pub async fn dispatch(state: &ServerState, req: &Request) -> HttpResponse {
    let path = req.path.split('?').next().unwrap_or("/");
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let result = route(state, req, &segments).await;
    match result {
        Ok(response) => response,
        Err(e) => {
            if e.status_code() >= 500 {
                error!(method = %req.method, path = %req.path, error = %e, "request failed");
            }
            HttpResponse::from_error(&e)
        }
    }
}

async fn route(state: &ServerState, req: &Request, segments: &[&str]) -> Result<HttpResponse> {
    match (req.method.as_str(), segments) {
        ("GET", []) => Ok(HttpResponse::json(&json!({
            "message": "Planroom API is running",
            "uptimeSeconds": STARTED_AT.elapsed().as_secs(),
        }))),

        ("POST", ["join"]) => {
            let body: JoinRequest = req.json()?;
            let session_id = req.session_id_or_new();
            let outcome = registry::join_project(
                &state.store,
                &body.project_id,
                &session_id,
                body.user_name.as_deref(),
            )?;
            Ok(HttpResponse::json(&outcome))
        }

        ("POST", ["leave"]) => {
            let Some(session_id) = req.session_id() else {
                return Err(PlanroomError::Validation(
                    "X-Session-Id header is required".into(),
                ));
            };
            registry::leave_project(&state.store, session_id)?;
            Ok(HttpResponse::no_content())
        }

        ("POST", ["chat"]) => handle_chat(state, req).await,

        ("GET", ["document", project_id]) => {
            let document = registry::project_document(&state.store, project_id)?;
            Ok(HttpResponse::json(&DocumentResponse { document }))
        }

        ("GET", ["history", project_id]) => {
            let snapshot = registry::project_snapshot(&state.store, project_id)?;
            Ok(HttpResponse::json(&snapshot))
        }

        ("GET", ["projects"]) => {
            let projects = registry::list_projects(&state.store)?;
            Ok(HttpResponse::json(&ProjectsResponse { projects }))
        }

        ("GET", ["projects", project_id, "status"]) => {
            let status = registry::project_status(&state.store, project_id)?;
            Ok(HttpResponse::json(&status))
        }

        ("GET", ["projects", project_id, "users"]) => {
            let users = registry::active_users(&state.store, project_id)?;
            Ok(HttpResponse::json(&json!({ "activeUsers": users })))
        }

        // DELETE /history/{id} is the legacy spelling of project deletion.
        ("DELETE", ["projects", project_id]) | ("DELETE", ["history", project_id]) => {
            registry::delete_project(&state.store, project_id)?;
            Ok(HttpResponse::no_content())
        }

        ("POST", ["projects", project_id, "cleanup-sessions"]) => {
            let purged = registry::cleanup_project_sessions(&state.store, project_id)?;
            info!(project = %project_id, purged, "purged ghost sessions");
            Ok(HttpResponse::no_content())
        }

        ("POST", ["projects", project_id, "upload"]) => handle_upload(state, req, project_id),

        ("GET", ["projects", project_id, "uploads"]) => {
            let documents = registry::list_uploads(&state.store, project_id)?;
            Ok(HttpResponse::json(&UploadsResponse { documents }))
        }

        ("GET", ["uploads", upload_id]) => {
            use base64::Engine;
            let (meta, bytes) = registry::fetch_upload(&state.store, upload_id)?;
            Ok(HttpResponse::json(&UploadContent {
                upload_id: meta.upload_id,
                filename: meta.filename,
                file_type: meta.file_type,
                file_size: meta.file_size,
                uploaded_by: meta.uploaded_by,
                uploaded_at: meta.uploaded_at,
                content: base64::engine::general_purpose::STANDARD.encode(bytes),
            }))
        }

        ("DELETE", ["uploads", upload_id]) => {
            registry::remove_upload(&state.store, upload_id)?;
            Ok(HttpResponse::no_content())
        }

        ("POST", ["projects", project_id, "invite"]) => {
            let body: InviteRequest = req.json()?;
            let invitation = registry::create_invitation(
                &state.store,
                project_id,
                &body.email,
                body.inviter_name.as_deref(),
            )?;
            // Delivery belongs to the external mail service; only record it.
            info!(
                project = %project_id,
                email = %invitation.email,
                "invitation recorded, delivery delegated to mail service"
            );
            Ok(HttpResponse::json(&InviteResponse {
                success: true,
                message: format!("Invitation created for {}", invitation.email),
                invitation_id: Some(invitation.token),
            }))
        }

        ("GET", ["invitations", token, "validate"]) => {
            let check = registry::validate_invitation(&state.store, token)?;
            Ok(HttpResponse::json(&check))
        }

        ("POST", ["invitations", token, "accept"]) => {
            let session_id = req.session_id_or_new();
            let outcome = registry::accept_invitation(&state.store, token, &session_id, None)?;
            Ok(HttpResponse::json(&outcome))
        }

        _ => Err(PlanroomError::NotFound(format!(
            "{} {}",
            req.method, req.path
        ))),
    }
}

/// One chat turn: append the user message, run the pipeline with the history
/// that preceded it, append the reply, and include the document only when the
/// turn changed it. The store lock is never held across the provider call.
async fn handle_chat(state: &ServerState, req: &Request) -> Result<HttpResponse> {
    let body: ChatRequest = req.json()?;
    let session_id = req.session_id_or_new();

    let doc_before = registry::record_user_message(
        &state.store,
        &body.project_id,
        &session_id,
        body.user_name.as_deref(),
        &body.message,
    )?;

    let snapshot = registry::project_snapshot(&state.store, &body.project_id)?;
    let prior_history = &snapshot.history[..snapshot.history.len().saturating_sub(1)];

    let outcome = state
        .engine
        .run_turn(prior_history, &doc_before, &body.message)
        .await?;

    let active_users = registry::record_assistant_reply(
        &state.store,
        &body.project_id,
        &outcome.reply,
        outcome.document.as_deref(),
    )?;

    let document = outcome.document.filter(|d| *d != doc_before);
    Ok(HttpResponse::json(&ChatResponse {
        response: outcome.reply,
        document,
        active_users,
    }))
}

// ---------------------------------------------------------------------------
// Multipart upload handling
// ---------------------------------------------------------------------------

/// A file part extracted from a multipart/form-data body.
#[derive(Debug, PartialEq)]
pub struct MultipartFile {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

fn handle_upload(state: &ServerState, req: &Request, project_id: &str) -> Result<HttpResponse> {
    let content_type = req
        .header("content-type")
        .ok_or_else(|| PlanroomError::Validation("Content-Type header is required".into()))?;
    let file = parse_multipart(content_type, &req.body)?;

    // Attribute the upload to the caller's display name when the session is
    // known; uploads from unjoined callers stay anonymous.
    let uploaded_by = req.session_id().and_then(|sid| {
        state
            .store
            .lock()
            .ok()
            .and_then(|guard| guard.get_session(sid).ok().flatten())
            .and_then(|session| session.user_name)
    });

    let meta = registry::attach_upload(
        &state.store,
        project_id,
        &file.filename,
        &file.content_type,
        uploaded_by.as_deref(),
        &file.data,
    )?;

    Ok(HttpResponse::json(&UploadReceipt {
        upload_id: meta.upload_id,
        filename: meta.filename.clone(),
        file_size: meta.file_size,
        message: format!("Uploaded {}", meta.filename),
    }))
}

/// Extract the first file part from a multipart/form-data body.
pub fn parse_multipart(content_type: &str, body: &[u8]) -> Result<MultipartFile> {
    let boundary = content_type
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("boundary="))
        .map(|b| b.trim_matches('"'))
        .ok_or_else(|| PlanroomError::Validation("multipart boundary missing".into()))?;

    let delimiter = format!("--{}", boundary);
    let mut rest = body;

    loop {
        let Some(start) = find_subslice(rest, delimiter.as_bytes()) else {
            return Err(PlanroomError::Validation("no file part in upload".into()));
        };
        rest = &rest[start + delimiter.len()..];
        // Closing delimiter is "--boundary--".
        if rest.starts_with(b"--") {
            return Err(PlanroomError::Validation("no file part in upload".into()));
        }
        rest = rest.strip_prefix(b"\r\n").unwrap_or(rest);

        let Some(head_end) = find_subslice(rest, b"\r\n\r\n") else {
            return Err(PlanroomError::Validation("malformed multipart part".into()));
        };
        let head = String::from_utf8_lossy(&rest[..head_end]).to_string();
        let content = &rest[head_end + 4..];
        let Some(end) = find_subslice(content, delimiter.as_bytes()) else {
            return Err(PlanroomError::Validation("unterminated multipart part".into()));
        };
        // Trailing CRLF before the next delimiter belongs to the framing.
        let mut data = &content[..end];
        if data.ends_with(b"\r\n") {
            data = &data[..data.len() - 2];
        }

        let filename = head
            .lines()
            .find(|l| l.to_ascii_lowercase().starts_with("content-disposition"))
            .and_then(|l| {
                l.split(';').map(str::trim).find_map(|attr| {
                    attr.strip_prefix("filename=")
                        .map(|f| f.trim_matches('"').to_string())
                })
            });

        match filename {
            Some(filename) if !filename.is_empty() => {
                let content_type = head
                    .lines()
                    .find_map(|l| {
                        let lower = l.to_ascii_lowercase();
                        lower
                            .starts_with("content-type:")
                            .then(|| l.splitn(2, ':').nth(1).unwrap_or("").trim().to_string())
                    })
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                return Ok(MultipartFile {
                    filename,
                    content_type,
                    data: data.to_vec(),
                });
            }
            // Not a file part (or unnamed); skip to the next delimiter.
            _ => {
                rest = &content[end..];
                continue;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
