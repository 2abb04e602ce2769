use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrackenError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("verify error: {0}")]
    Verify(#[from] VerifyError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct StorageError(pub String);

#[derive(Debug, Error)]
#[error("{0}")]
pub struct VerifyError(pub String);
