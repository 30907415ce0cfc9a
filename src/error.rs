use thiserror::Error;

#[derive(Debug, Error)]
pub enum SiteError {
    #[error("StoreError: {0}")]
    Store(#[from] anyhow::Error),
    #[error("InvalidHeader: {0}")]
    InvalidHeader(#[from] axum::http::header::InvalidHeaderValue),
    #[error("LockError: {0}")]
    Lock(String),
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("SiteError: {}", crate::unpack_error(.0))]
    Site(#[from] SiteError),
    #[error("ValidationError: {0}")]
    Validation(String),
}
