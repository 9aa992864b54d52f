use thiserror::Error;

pub type Result<T> = std::result::Result<T, RenderError>;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Render wait timed out: {0}")]
    WaitTimeout(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },
}

impl From<reqwest::Error> for RenderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RenderError::WaitTimeout(err.to_string())
        } else {
            RenderError::Network(err.to_string())
        }
    }
}
