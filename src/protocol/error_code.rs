//! Canonical protocol error codes with retry guidance

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Fixed set of wire-level error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    UnknownCommand,
    InvalidParameters,
    AuthenticationFailed,
    AuthorizationFailed,
    ResourceNotFound,
    FileNotFound,
    FileAccessError,
    ChecksumMismatch,
    InternalError,
    ServiceUnavailable,
    NetworkError,
    Timeout,
    ConnectionFailed,
    PeerUnavailable,
    RateLimited,
    CircuitBreakerOpen,
    SystemOverload,
    TransferFailed,
    ResourceExhausted,
}

/// Broad classification used to pick a recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Client,
    Server,
    Unavailable,
    Network,
    RateLimit,
    Breaker,
    System,
}

/// What a caller should do about an error of this code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryGuidance {
    pub retryable: bool,
    pub strategy: &'static str,
    pub retry_after: Option<Duration>,
}

impl ErrorCode {
    pub fn class(&self) -> ErrorClass {
        use ErrorCode::*;
        match self {
            InvalidMessage | UnknownCommand | InvalidParameters | AuthenticationFailed
            | AuthorizationFailed | ResourceNotFound | FileNotFound | ChecksumMismatch => {
                ErrorClass::Client
            }
            InternalError | FileAccessError | TransferFailed => ErrorClass::Server,
            ServiceUnavailable => ErrorClass::Unavailable,
            NetworkError | Timeout | ConnectionFailed | PeerUnavailable => ErrorClass::Network,
            RateLimited => ErrorClass::RateLimit,
            CircuitBreakerOpen => ErrorClass::Breaker,
            SystemOverload | ResourceExhausted => ErrorClass::System,
        }
    }

    pub fn guidance(&self) -> RetryGuidance {
        match self.class() {
            ErrorClass::Client => {
                RetryGuidance { retryable: false, strategy: "fail-fast", retry_after: None }
            }
            ErrorClass::Server => RetryGuidance {
                retryable: true,
                strategy: "retry-exponential",
                retry_after: None,
            },
            ErrorClass::Unavailable => RetryGuidance {
                retryable: true,
                strategy: "circuit-breaker-fallback",
                retry_after: None,
            },
            ErrorClass::Network => RetryGuidance {
                retryable: true,
                strategy: "retry-exponential-jitter",
                retry_after: None,
            },
            ErrorClass::RateLimit => RetryGuidance {
                retryable: true,
                strategy: "retry-after",
                retry_after: Some(Duration::from_secs(1)),
            },
            ErrorClass::Breaker => {
                RetryGuidance { retryable: false, strategy: "fallback", retry_after: None }
            }
            ErrorClass::System => RetryGuidance {
                retryable: false,
                strategy: "surface-to-operator",
                retry_after: None,
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.guidance().retryable
    }

    /// The wire spelling, e.g. `CHECKSUM_MISMATCH`.
    pub fn as_str(&self) -> &'static str {
        use ErrorCode::*;
        match self {
            InvalidMessage => "INVALID_MESSAGE",
            UnknownCommand => "UNKNOWN_COMMAND",
            InvalidParameters => "INVALID_PARAMETERS",
            AuthenticationFailed => "AUTHENTICATION_FAILED",
            AuthorizationFailed => "AUTHORIZATION_FAILED",
            ResourceNotFound => "RESOURCE_NOT_FOUND",
            FileNotFound => "FILE_NOT_FOUND",
            FileAccessError => "FILE_ACCESS_ERROR",
            ChecksumMismatch => "CHECKSUM_MISMATCH",
            InternalError => "INTERNAL_ERROR",
            ServiceUnavailable => "SERVICE_UNAVAILABLE",
            NetworkError => "NETWORK_ERROR",
            Timeout => "TIMEOUT",
            ConnectionFailed => "CONNECTION_FAILED",
            PeerUnavailable => "PEER_UNAVAILABLE",
            RateLimited => "RATE_LIMITED",
            CircuitBreakerOpen => "CIRCUIT_BREAKER_OPEN",
            SystemOverload => "SYSTEM_OVERLOAD",
            TransferFailed => "TRANSFER_FAILED",
            ResourceExhausted => "RESOURCE_EXHAUSTED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_not_retryable() {
        for code in [
            ErrorCode::InvalidMessage,
            ErrorCode::UnknownCommand,
            ErrorCode::FileNotFound,
            ErrorCode::ChecksumMismatch,
        ] {
            assert_eq!(code.class(), ErrorClass::Client);
            assert!(!code.is_retryable(), "{code} must not be retryable");
        }
    }

    #[test]
    fn network_errors_retry_with_jitter() {
        for code in [
            ErrorCode::NetworkError,
            ErrorCode::Timeout,
            ErrorCode::ConnectionFailed,
            ErrorCode::PeerUnavailable,
        ] {
            assert!(code.is_retryable());
            assert_eq!(code.guidance().strategy, "retry-exponential-jitter");
        }
    }

    #[test]
    fn rate_limit_carries_retry_after() {
        let guidance = ErrorCode::RateLimited.guidance();
        assert!(guidance.retryable);
        assert_eq!(guidance.retry_after, Some(Duration::from_secs(1)));
    }

    #[test]
    fn breaker_and_system_fail_without_retry() {
        assert!(!ErrorCode::CircuitBreakerOpen.is_retryable());
        assert!(!ErrorCode::SystemOverload.is_retryable());
        assert!(!ErrorCode::ResourceExhausted.is_retryable());
    }

    #[test]
    fn wire_spelling_round_trips_through_serde() {
        let json = serde_json::to_string(&ErrorCode::ChecksumMismatch).unwrap();
        assert_eq!(json, "\"CHECKSUM_MISMATCH\"");
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorCode::ChecksumMismatch);
    }
}
