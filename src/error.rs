//! Crate-level error type.
//!
//! Every fallible path in the server, store, client, and sync loop funnels
//! into [`PlanroomError`]. Variants carry enough context to diagnose a
//! failure without inspecting the originating error directly.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanroomError {
    /// The remote server replied with a non-2xx HTTP status code.
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    /// A TCP-level connection could not be established.
    #[error("connection failed to {url}: {detail}")]
    Connect { url: String, detail: String },

    /// Response body could not be parsed as the expected JSON structure.
    #[error("JSON parse error on {context}: {detail}")]
    Json { context: String, detail: String },

    /// The LLM provider rejected or failed the request.
    #[error("{provider} API error: {detail}")]
    Provider { provider: String, detail: String },

    /// A required API key environment variable is not set.
    #[error("{0} not set. Export it or pass via environment.")]
    MissingApiKey(&'static str),

    /// Request input failed validation (empty project id, malformed email).
    #[error("invalid request: {0}")]
    Validation(String),

    /// The named project, upload, or invitation does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A send was attempted while a previous send is still in flight.
    #[error("a message is already in flight for this session")]
    SendInFlight,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    /// Poisoned lock or other invariant breakage that should never surface
    /// to a well-behaved caller.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PlanroomError {
    /// HTTP status code this error maps to at the service boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            PlanroomError::Validation(_) => 400,
            PlanroomError::NotFound(_) => 404,
            PlanroomError::SendInFlight => 409,
            _ => 500,
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, PlanroomError>;
