use std::fmt;

use thiserror::Error;

/// Status of a failing native call, tagged with the API family that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeError {
    pub api: &'static str,
    pub call: &'static str,
    pub code: i32,
}

impl NativeError {
    pub const fn new(api: &'static str, call: &'static str, code: i32) -> Self {
        Self { api, call, code }
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed with {} error code {}", self.call, self.api, self.code)
    }
}

impl std::error::Error for NativeError {}

pub type NativeResult<T> = Result<T, NativeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Allocation,
    Transfer,
    Launch,
    Configuration,
    ArgumentMapping,
    Synchronization,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    pub message: String,
    pub native: Option<NativeError>,
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.native {
            Some(native) => write!(f, "{} ({native})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("allocation error: {0}")]
    Allocation(ErrorDetail),
    #[error("transfer error: {0}")]
    Transfer(ErrorDetail),
    #[error("launch error: {0}")]
    Launch(ErrorDetail),
    #[error("configuration error: {0}")]
    Configuration(ErrorDetail),
    #[error("argument mapping error: {0}")]
    ArgumentMapping(ErrorDetail),
    #[error("synchronization error: {0}")]
    Synchronization(ErrorDetail),
}

impl RuntimeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::from_detail(
            kind,
            ErrorDetail {
                message: message.into(),
                native: None,
            },
        )
    }

    /// Wraps a native status so the API tag and code survive into the report.
    pub fn native(kind: ErrorKind, message: impl Into<String>, native: NativeError) -> Self {
        Self::from_detail(
            kind,
            ErrorDetail {
                message: message.into(),
                native: Some(native),
            },
        )
    }

    pub fn allocation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Allocation, message)
    }

    pub fn transfer(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transfer, message)
    }

    pub fn launch(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Launch, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn argument_mapping(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ArgumentMapping, message)
    }

    pub fn synchronization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Synchronization, message)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::Allocation(_) => ErrorKind::Allocation,
            RuntimeError::Transfer(_) => ErrorKind::Transfer,
            RuntimeError::Launch(_) => ErrorKind::Launch,
            RuntimeError::Configuration(_) => ErrorKind::Configuration,
            RuntimeError::ArgumentMapping(_) => ErrorKind::ArgumentMapping,
            RuntimeError::Synchronization(_) => ErrorKind::Synchronization,
        }
    }

    pub fn detail(&self) -> &ErrorDetail {
        match self {
            RuntimeError::Allocation(detail)
            | RuntimeError::Transfer(detail)
            | RuntimeError::Launch(detail)
            | RuntimeError::Configuration(detail)
            | RuntimeError::ArgumentMapping(detail)
            | RuntimeError::Synchronization(detail) => detail,
        }
    }

    pub fn message(&self) -> &str {
        &self.detail().message
    }

    pub fn native_error(&self) -> Option<&NativeError> {
        self.detail().native.as_ref()
    }

    fn from_detail(kind: ErrorKind, detail: ErrorDetail) -> Self {
        match kind {
            ErrorKind::Allocation => RuntimeError::Allocation(detail),
            ErrorKind::Transfer => RuntimeError::Transfer(detail),
            ErrorKind::Launch => RuntimeError::Launch(detail),
            ErrorKind::Configuration => RuntimeError::Configuration(detail),
            ErrorKind::ArgumentMapping => RuntimeError::ArgumentMapping(detail),
            ErrorKind::Synchronization => RuntimeError::Synchronization(detail),
        }
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_errors_keep_api_tag_and_code() {
        let err = RuntimeError::native(
            ErrorKind::Transfer,
            "queue: couldn't submit memcpy",
            NativeError::new("MUSA", "musaMemcpyAsync", 1),
        );
        assert_eq!(err.kind(), ErrorKind::Transfer);
        assert_eq!(err.native_error().map(|n| n.code), Some(1));
        assert_eq!(
            err.to_string(),
            "transfer error: queue: couldn't submit memcpy (musaMemcpyAsync failed with MUSA error code 1)"
        );
    }

    #[test]
    fn plain_errors_render_message_only() {
        let err = RuntimeError::configuration("no compatible image");
        assert_eq!(err.to_string(), "configuration error: no compatible image");
        assert!(err.native_error().is_none());
    }
}
