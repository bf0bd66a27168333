//! Error taxonomy for the protocol layer.

use thiserror::Error;

use crate::ratelimit::GovernorError;

/// Body-level error codes the endpoint reports inside a 200 response.
pub const CODE_EXCEED_POST_LIMIT: i64 = 88;
pub const CODE_ACCOUNT_LOCKED: i64 = 326;

/// An error object returned in the response body (`errors[0]`).
#[derive(Debug, Clone)]
pub struct ApiError {
    pub code: i64,
    pub message: String,
}

impl ApiError {
    /// Whether this code permanently disables the session for the rest of
    /// the run (daily view limit reached, account locked).
    pub fn is_session_fatal(&self) -> bool {
        matches!(self.code, CODE_EXCEED_POST_LIMIT | CODE_ACCOUNT_LOCKED)
    }

    pub fn session_fault_reason(&self) -> &'static str {
        match self.code {
            CODE_EXCEED_POST_LIMIT => "reached the daily limit for viewing posts",
            CODE_ACCOUNT_LOCKED => "account is locked",
            _ => "endpoint error",
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "endpoint error code {}: {}", self.code, self.message)
    }
}

/// Errors produced by gated endpoint calls.
///
/// `WouldBlock` and `Cancelled` are expected control-flow outcomes, not
/// failures; callers reschedule on the former and unwind on the latter.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("session rate limited for this endpoint")]
    WouldBlock,

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Api(ApiError),

    #[error("http status {0}")]
    Status(u16),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    Parse(String),
}

impl From<GovernorError> for FetchError {
    fn from(err: GovernorError) -> Self {
        match err {
            GovernorError::WouldBlock => FetchError::WouldBlock,
            GovernorError::Cancelled => FetchError::Cancelled,
        }
    }
}
