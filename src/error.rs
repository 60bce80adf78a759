//! Usage agent errors.
use thiserror::Error;

/// Errors raised while producing an operation signature.
#[derive(Debug, Error)]
pub enum SignatureError {
    /// The requested operation does not exist in the document, or the document
    /// contains several operations and no name was given to pick one.
    #[error("operation {} not found in document", .0.as_deref().unwrap_or("<anonymous>"))]
    OperationNotFound(Option<String>),
}
