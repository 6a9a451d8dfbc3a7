use thiserror::Error;

/// Failure classes surfaced by the sync engine and its collaborators.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connect-level failure: the server was never reached.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The server answered and rejected the request.
    #[error("request failed: {0}")]
    RequestFailed(String),
    /// Rejected locally before any network call.
    #[error("validation failed: {0}")]
    Validation(String),
    /// The upload phase of an attachment send failed; nothing was posted.
    #[error("upload failed: {0}")]
    Upload(String),
    /// A history response that lost the selection race. Never user-visible;
    /// consumed inside the engine and logged for diagnostics.
    #[error("stale history result for selection epoch {epoch}")]
    Stale { epoch: u64 },
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Self::Transport(err.to_string())
        } else {
            Self::RequestFailed(err.to_string())
        }
    }
}
