use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackuparrError>;

#[derive(Debug, Error)]
pub enum BackuparrError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("restore failed: {0}")]
    Restore(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}
