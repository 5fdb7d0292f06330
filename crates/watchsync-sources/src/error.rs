use thiserror::Error;

/// Failure talking to a media server.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("server unreachable: {0}")]
    Unreachable(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("request rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("{0}")]
    Api(String),
}

impl SourceError {
    /// Errors that mean the server as a whole cannot be used.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, SourceError::Unreachable(_) | SourceError::Unauthorized(_))
    }

    pub fn from_status(status: reqwest::StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match status.as_u16() {
            401 | 403 => SourceError::Unauthorized(message),
            404 => SourceError::NotFound(message),
            code => SourceError::Rejected { status: code, message },
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            SourceError::Unreachable(e.to_string())
        } else if let Some(status) = e.status() {
            SourceError::from_status(status, e.to_string())
        } else {
            SourceError::Api(e.to_string())
        }
    }
}

impl From<anyhow::Error> for SourceError {
    fn from(e: anyhow::Error) -> Self {
        // Keep the typed error when one is at the root of the chain
        match e.downcast::<SourceError>() {
            Ok(source) => source,
            Err(e) => match e.downcast::<reqwest::Error>() {
                Ok(http) => http.into(),
                Err(e) => SourceError::Api(format!("{:#}", e)),
            },
        }
    }
}
