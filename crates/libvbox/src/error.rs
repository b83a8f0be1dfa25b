use thiserror::Error;
use vbox_protocol::{BoxId, ErrorCode, FileId, TerminalId};

use crate::rate_limit::OperationKind;

/// Shown to shared collaborators while the box owner is away.
pub const OWNER_ABSENT_MESSAGE: &str = "The virtualbox owner is not connected.";

#[derive(Error, Debug)]
pub enum VboxError {
    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("file not found: {0}")]
    FileNotFound(FileId),

    #[error("terminal not found: {0}")]
    TerminalNotFound(TerminalId),

    #[error("terminal quota exceeded: at most {0} terminals per box")]
    TerminalQuota(usize),

    #[error("project size exceeded: {used} of {limit} bytes in use")]
    ProjectQuota { used: u64, limit: u64 },

    #[error("rate limited: {0}")]
    RateLimited(OperationKind),

    #[error("body too large: {size} bytes exceeds {limit}")]
    BodyTooLarge { size: usize, limit: usize },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("box session closed: {0}")]
    SessionClosed(BoxId),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl VboxError {
    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            VboxError::InvalidHandshake(_) => (ErrorCode::InvalidHandshake, self.to_string()),
            VboxError::AccessDenied(_) => (ErrorCode::AccessDenied, self.to_string()),
            VboxError::FileNotFound(_) | VboxError::TerminalNotFound(_) => {
                (ErrorCode::NotFound, self.to_string())
            }
            VboxError::TerminalQuota(_) | VboxError::ProjectQuota { .. } => {
                (ErrorCode::QuotaExceeded, self.to_string())
            }
            VboxError::RateLimited(_) | VboxError::BodyTooLarge { .. } => {
                (ErrorCode::RateLimited, self.to_string())
            }
            VboxError::InvalidRequest(_) => (ErrorCode::InvalidRequest, self.to_string()),
            VboxError::UpstreamUnavailable(_) => {
                (ErrorCode::UpstreamUnavailable, self.to_string())
            }
            VboxError::SessionClosed(_) | VboxError::Pty(_) => {
                (ErrorCode::ServerError, self.to_string())
            }
            VboxError::Io(_) => (ErrorCode::ServerError, "internal I/O error".to_string()),
        }
    }

    /// User-facing notice pushed as a `rateLimit` event alongside the error reply.
    pub fn rate_limit_notice(&self) -> Option<String> {
        match self {
            VboxError::RateLimited(kind) => {
                Some(format!("Rate limited: {}. Please slow down.", kind.describe()))
            }
            VboxError::BodyTooLarge { .. } => Some(
                "Rate limited: file size too large. Please reduce the file size.".to_string(),
            ),
            VboxError::ProjectQuota { .. } => Some(
                "Rate limited: project size exceeded. Please delete some files.".to_string(),
            ),
            VboxError::TerminalQuota(max) => Some(format!(
                "Rate limited: too many terminals. Close one of the {max} open terminals first."
            )),
            _ => None,
        }
    }
}

/// Maps transport failures of an upstream HTTP service.
pub(crate) fn upstream(service: &str, err: reqwest::Error) -> VboxError {
    VboxError::UpstreamUnavailable(format!("{service}: {err}"))
}
