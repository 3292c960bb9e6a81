use serde::{Deserialize, Serialize};

/// Coarse classification of a failure, used to decide whether it is worth retrying.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Transient,
    RateLimited,
    ClientError,
    ServerError,
    NetworkError,
    Timeout,
    Unknown,
}

impl ErrorCategory {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Transient
                | ErrorCategory::RateLimited
                | ErrorCategory::ServerError
                | ErrorCategory::NetworkError
                | ErrorCategory::Timeout
        )
    }
}

/// Errors that know whether another attempt could succeed.
///
/// The retry policy only re-invokes work whose error reports `true`.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for ErrorCategory {
    fn is_retryable(&self) -> bool {
        ErrorCategory::is_retryable(self)
    }
}

impl Retryable for std::io::Error {
    fn is_retryable(&self) -> bool {
        use std::io::ErrorKind;
        matches!(
            self.kind(),
            ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::NotConnected
                | ErrorKind::BrokenPipe
                | ErrorKind::TimedOut
                | ErrorKind::Interrupted
                | ErrorKind::WouldBlock
        )
    }
}

/// Maximum length of an error descriptor persisted by a store.
pub const MAX_ERROR_DESCRIPTOR_BYTES: usize = 512;

pub(crate) fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }

    let mut truncate_at = max_bytes;
    while truncate_at > 0 && !s.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    s.truncate(truncate_at);
}

/// Renders an error into a bounded descriptor suitable for persistence.
pub(crate) fn error_descriptor(error: &dyn std::fmt::Display) -> String {
    let mut descriptor = error.to_string();
    truncate_utf8_safe(&mut descriptor, MAX_ERROR_DESCRIPTOR_BYTES);
    descriptor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf8_truncation() {
        let mut s = "Hello 🌍 World".to_string();
        truncate_utf8_safe(&mut s, 10);
        assert!(s.is_char_boundary(s.len()));
        assert!(s.len() <= 10);
    }

    #[test]
    fn test_utf8_truncation_multi_byte() {
        let mut s = "日本語".to_string();
        truncate_utf8_safe(&mut s, 4);
        assert_eq!(s, "日");
    }

    #[test]
    fn test_error_category_retryable() {
        assert!(ErrorCategory::Transient.is_retryable());
        assert!(ErrorCategory::RateLimited.is_retryable());
        assert!(ErrorCategory::NetworkError.is_retryable());
        assert!(!ErrorCategory::ClientError.is_retryable());
        assert!(!ErrorCategory::Unknown.is_retryable());
    }

    #[test]
    fn test_io_error_classification() {
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(Retryable::is_retryable(&reset));
        assert!(!Retryable::is_retryable(&denied));
    }

    #[test]
    fn test_descriptor_is_bounded() {
        let long = "x".repeat(2_000);
        assert_eq!(error_descriptor(&long).len(), MAX_ERROR_DESCRIPTOR_BYTES);
    }
}
