//! Custom error types and result handling for Seihon operations.
//!
//! Every fallible operation returns a [`Result<T>`], an alias for
//! `std::result::Result<T, Error>`. The variants follow the failure classes the
//! pipeline distinguishes: transient fetch failures and validation failures are
//! retried by the fetch layer, assembly failures abort a single volume, and
//! transform failures are logged while the untransformed container is kept.
//!
use std::path::PathBuf;

/// Type alias for Results with Seihon errors.
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error type for all Seihon operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// I/O errors from the standard library
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Image decoding errors
    #[error(transparent)]
    Image(#[from] image::ImageError),
    /// ZIP container errors
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    /// XML parsing errors raised while rewriting container documents
    #[error(transparent)]
    Xml(#[from] quick_xml::Error),
    /// Manifest (de)serialization errors
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// HTTP transport errors
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    /// Async task join errors
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Semaphore(#[from] tokio::sync::AcquireError),
    #[error(transparent)]
    SeihonBuilder(#[from] crate::seihon::SeihonConfigBuilderError),
    /// Error for invalid file or directory paths
    #[error("The given path '{0:?}' is invalid: {1}")]
    InvalidPath(PathBuf, String),
    /// Error for failed asynchronous tasks
    #[error("Asynchronous task failed: {0}")]
    AsyncTaskError(String),
    /// A page could not be fetched from its source
    #[error("Failed to fetch '{url}': {reason}")]
    Fetch { url: String, reason: String },
    /// Downloaded or local bytes did not decode as an image
    #[error("File {0:?} is not a valid image")]
    Validation(PathBuf),
    /// The package could not be assembled into a container
    #[error("Assembly failed: {0}")]
    Assembly(String),
    /// A device transform pass failed
    #[error("Transform failed: {0}")]
    Transform(String),
    /// The operation was cancelled before it finished
    #[error("Operation cancelled")]
    Cancelled,
    /// Error for unsupported operations or formats (e.g., unknown image extension)
    #[error("Unsupported: {0}")]
    Unsupported(String),
    /// Error for resources that couldn't be found
    #[error("Not found: {0}")]
    NotFound(String),
    /// Other errors that don't fit into specific categories
    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Whether the fetch layer should retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Fetch { .. } | Error::Http(_) | Error::Validation(_) | Error::Image(_)
        ) || matches!(self, Error::Io(e) if e.kind() != std::io::ErrorKind::PermissionDenied)
    }
}

impl From<quick_xml::events::attributes::AttrError> for Error {
    fn from(error: quick_xml::events::attributes::AttrError) -> Self {
        Error::Xml(error.into())
    }
}

impl From<quick_xml::encoding::EncodingError> for Error {
    fn from(error: quick_xml::encoding::EncodingError) -> Self {
        Error::Xml(error.into())
    }
}

// Basic From<String> conversion for convenience
impl From<String> for Error {
    fn from(error: String) -> Self {
        Error::Other(error)
    }
}

impl From<&str> for Error {
    fn from(error: &str) -> Self {
        Error::Other(error.to_string())
    }
}

impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.to_string().as_ref())
    }
}
