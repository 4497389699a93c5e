use thiserror::Error;

/// Failure of a single API request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// No usable network path: DNS, refused connection, dropped socket.
    #[error("network unavailable: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    /// HTTP 401. The credential is no longer valid.
    #[error("session expired")]
    SessionExpired,

    /// The server answered and rejected the request. `message` is the
    /// server's own text and is shown to the user verbatim.
    #[error("{message}")]
    Http { status: u16, message: String },

    #[error("invalid response: {0}")]
    Decode(String),

    /// The request could not be formed or followed (bad URL, redirect
    /// loop). Retrying will not help.
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl RequestError {
    /// The device could not reach the server (or not in time). Only these
    /// failures are deferred to the mutation queue.
    #[must_use]
    pub fn is_offline(&self) -> bool {
        matches!(self, RequestError::Network(_) | RequestError::Timeout)
    }

    #[must_use]
    pub fn is_session_expired(&self) -> bool {
        matches!(self, RequestError::SessionExpired)
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::Http { status, .. } => Some(*status),
            RequestError::SessionExpired => Some(401),
            _ => None,
        }
    }
}

/// Offline classification for errors that went through `anyhow`.
#[must_use]
pub fn is_offline_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<RequestError>()
        .is_some_and(RequestError::is_offline)
}
