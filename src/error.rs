use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("incomplete frame")]
    IncompleteFrame,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("listener bind failed after retries: {0}")]
    BindFailed(std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
