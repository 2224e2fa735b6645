use thiserror::Error;

/// Error kinds at the pipeline seams.
///
/// `Validation` and `NotFound` drop work before or during processing,
/// `Transient` is retried by the queue, `Fatal` aborts startup.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient: {0}")]
    Transient(#[source] anyhow::Error),
    #[error("fatal: {0}")]
    Fatal(String),
}
