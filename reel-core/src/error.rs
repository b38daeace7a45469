//! Error taxonomy for the playback core.

use thiserror::Error;

use crate::backend::BackendError;
use crate::sink::SinkError;

#[derive(Debug, Error)]
pub enum MediaError {
    /// Queue or backend context could not be allocated
    #[error("Allocation failed: {0}")]
    Allocation(String),
    /// Bad file, unsupported container or codec
    #[error("Open failed: {0}")]
    Open(String),
    /// Unexpected backend decode failure
    #[error("Decode failed: {0}")]
    Decode(String),
    /// Stream not open, queue empty, or nothing decoded yet
    #[error("Not ready: {0}")]
    NotReady(&'static str),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// The backend could not reposition the container
    #[error("Seek failed: {0}")]
    Seek(String),
    #[error("Audio sink error: {0}")]
    Sink(#[from] SinkError),
}

impl MediaError {
    /// True for errors the caller may simply retry later.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MediaError::NotReady(_))
    }

    pub(crate) fn open(context: &str, err: BackendError) -> Self {
        MediaError::Open(format!("{}: {}", context, err))
    }
}

impl From<BackendError> for MediaError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Io(e) => MediaError::Open(e.to_string()),
            BackendError::Unsupported(what) => MediaError::Open(what),
            other => MediaError::Decode(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, MediaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_ready_is_recoverable() {
        assert!(MediaError::NotReady("video queue empty").is_recoverable());
        assert!(!MediaError::Decode("boom".into()).is_recoverable());
    }

    #[test]
    fn test_backend_error_mapping() {
        let e: MediaError = BackendError::Unsupported("flv".into()).into();
        assert!(matches!(e, MediaError::Open(_)));

        let e: MediaError = BackendError::Malformed("bad header".into()).into();
        assert!(matches!(e, MediaError::Decode(_)));
    }
}
