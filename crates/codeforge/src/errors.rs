//! Error taxonomy for the orchestration core, with retry classification.
//!
//! Every failure surfaced across the sandbox, gateway, and orchestrator
//! layers is represented here. Callers query `is_retryable()` instead of
//! string-matching messages.
//!
//! ## Kinds
//!
//! | Kind                | Retriable | Recovery |
//! |---------------------|-----------|----------|
//! | Transport           | no        | abort current phase |
//! | Provider (network)  | yes       | bounded retry (2s, 4s, 6s) |
//! | Provider (HTTP/payload) | no    | propagate |
//! | AllProvidersFailed  | no        | propagate |
//! | QueueFull           | no        | fail fast |
//! | AlreadyRunning / NotFound | no  | return to caller |

use std::fmt;

use thiserror::Error;

/// Categorized sandbox transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Remote host or container engine rejected the operation.
    PermissionDenied,
    /// The transport invocation exceeded its own timeout.
    Timeout,
    /// The secure-shell channel itself failed (connection, auth, exit 255).
    SshFailed,
    /// The container engine returned a non-warning error.
    EngineFailed,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermissionDenied => write!(f, "permission_denied"),
            Self::Timeout => write!(f, "timeout"),
            Self::SshFailed => write!(f, "ssh_failed"),
            Self::EngineFailed => write!(f, "engine_failed"),
        }
    }
}

/// Classification of provider-side failures.
///
/// Only the network classes are retryable; HTTP errors and malformed
/// payloads propagate immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderErrorClass {
    Connection,
    Timeout,
    ConnRefused,
    TimedOut,
    FetchFailed,
    /// Non-2xx HTTP status from the provider.
    Http(u16),
    /// Response body did not contain the fields we need.
    BadPayload,
}

impl ProviderErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection
                | Self::Timeout
                | Self::ConnRefused
                | Self::TimedOut
                | Self::FetchFailed
        )
    }
}

impl fmt::Display for ProviderErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Timeout => write!(f, "timeout"),
            Self::ConnRefused => write!(f, "econnrefused"),
            Self::TimedOut => write!(f, "etimedout"),
            Self::FetchFailed => write!(f, "fetch_failed"),
            Self::Http(status) => write!(f, "http_{status}"),
            Self::BadPayload => write!(f, "bad_payload"),
        }
    }
}

/// Unified error type for the orchestration core.
#[derive(Debug, Error)]
pub enum ForgeError {
    /// Sandbox transport failure (SSH channel or container engine).
    #[error("sandbox transport failed ({kind}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    /// A single provider endpoint failed.
    #[error("provider {provider} failed ({class}): {message}")]
    Provider {
        provider: &'static str,
        class: ProviderErrorClass,
        message: String,
    },

    /// Both the primary and fallback chat endpoints failed.
    #[error("all providers failed — primary: {primary}; fallback: {fallback}")]
    AllProvidersFailed { primary: String, fallback: String },

    /// `start` was called for a session with an active execution.
    #[error("execution already running for session {0}")]
    AlreadyRunning(String),

    /// No execution (or container) is known for this session.
    #[error("session {0} not found")]
    NotFound(String),

    /// A bounded queue rejected the request at capacity.
    #[error("{queue} queue full ({capacity} waiting)")]
    QueueFull {
        queue: &'static str,
        capacity: usize,
    },

    /// A write or read targeted a path outside the container workspace.
    #[error("path escapes workspace: {0}")]
    PathTraversal(String),

    /// Configuration is invalid or missing required fields.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The operation was explicitly cancelled.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl ForgeError {
    /// Build a transport error conveniently.
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: message.into(),
        }
    }

    /// Returns `true` if the gateway may retry after this error.
    ///
    /// Only provider network failures qualify; transport errors abort the
    /// current phase and everything else propagates.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider { class, .. } => class.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ForgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_provider_errors_are_retryable() {
        for class in [
            ProviderErrorClass::Connection,
            ProviderErrorClass::Timeout,
            ProviderErrorClass::ConnRefused,
            ProviderErrorClass::TimedOut,
            ProviderErrorClass::FetchFailed,
        ] {
            let err = ForgeError::Provider {
                provider: "chat",
                class,
                message: "boom".into(),
            };
            assert!(err.is_retryable(), "{err} should be retryable");
        }
    }

    #[test]
    fn http_and_payload_errors_are_terminal() {
        let http = ForgeError::Provider {
            provider: "chat",
            class: ProviderErrorClass::Http(401),
            message: "unauthorized".into(),
        };
        assert!(!http.is_retryable());

        let payload = ForgeError::Provider {
            provider: "chat",
            class: ProviderErrorClass::BadPayload,
            message: "no choices".into(),
        };
        assert!(!payload.is_retryable());
    }

    #[test]
    fn transport_errors_never_retry() {
        let err = ForgeError::transport(TransportErrorKind::SshFailed, "exit 255");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("ssh_failed"));
    }

    #[test]
    fn transport_kind_display_matches_wire_names() {
        assert_eq!(TransportErrorKind::PermissionDenied.to_string(), "permission_denied");
        assert_eq!(TransportErrorKind::EngineFailed.to_string(), "engine_failed");
    }

    #[test]
    fn all_providers_failed_carries_both_messages() {
        let err = ForgeError::AllProvidersFailed {
            primary: "http 500".into(),
            fallback: "econnrefused".into(),
        };
        let text = err.to_string();
        assert!(text.contains("http 500"));
        assert!(text.contains("econnrefused"));
    }
}
