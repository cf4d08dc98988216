//! Error types shared by every component of the client.
//!
//! Each variant carries a message that names the failing URL or register key.
//! Secrets never end up in these messages.

/// Represents all possible errors that can occur while talking to the Agua IOT cloud.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Bad credentials, a rejected app registration or a persistent 401.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// DNS, TCP or TLS failure while reaching `url`.
    #[error("Connection error to {url}: {source}")]
    Connection {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A job did not reach a terminal state within its time budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Malformed or unexpected server response, or a job the cloud aborted.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The register schema is internally inconsistent.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A caller supplied value is outside the declared bounds.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A register formula could not be parsed or evaluated.
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// The client was shut down while an operation was waiting.
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// `true` when the caller should re-prompt for credentials instead of retrying.
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Unauthorized(..))
    }

    pub(crate) fn connection(
        url: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Error::Connection {
            url: url.into(),
            source: source.into(),
        }
    }
}

impl From<crate::formula::EvaluationError> for Error {
    fn from(err: crate::formula::EvaluationError) -> Self {
        Error::Evaluation(err.to_string())
    }
}

/// The result type for all client operations.
pub type Result<T> = std::result::Result<T, Error>;
