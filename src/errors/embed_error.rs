//! Error taxonomy for the embed client.
//!
//! Every error surfaced by this crate is one of the closed set of kinds
//! below, each carrying a stable machine-readable code so integrators can
//! branch on `code()` instead of parsing message text. The [`classify`]
//! function maps backend error responses (HTTP status plus the optional
//! `{code, message}` body) onto the taxonomy and always succeeds, falling
//! back to the generic API kind.

use serde_json::Value;

/// Stable machine-readable error codes.
pub mod codes {
    pub const AUTHENTICATION_FAILED: &str = "AUTHENTICATION_FAILED";
    pub const INSUFFICIENT_CREDITS: &str = "INSUFFICIENT_CREDITS";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const CONNECTION_FAILED: &str = "CONNECTION_FAILED";
    pub const CONNECTION_ABORTED: &str = "CONNECTION_ABORTED";
    pub const CONFIGURATION_ERROR: &str = "CONFIGURATION_ERROR";
    pub const ASSISTANT_NOT_FOUND: &str = "ASSISTANT_NOT_FOUND";
    pub const MEDIA_DEVICES_ERROR: &str = "MEDIA_DEVICES_ERROR";
    pub const API_ERROR: &str = "API_ERROR";

    pub const CALL_IN_PROGRESS: &str = "CALL_IN_PROGRESS";
    pub const NO_ACTIVE_CALL: &str = "NO_ACTIVE_CALL";
    pub const NO_AUDIO_TRACK: &str = "NO_AUDIO_TRACK";
    pub const NOT_CONNECTED: &str = "NOT_CONNECTED";
    pub const CHAT_IN_PROGRESS: &str = "CHAT_IN_PROGRESS";
    pub const CHAT_START_ABORTED: &str = "CHAT_START_ABORTED";
}

/// Embed client error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbedError {
    /// Authentication or authorization failed (401/403 from the control API,
    /// or the transport rejecting our token).
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The account backing the API key has no credits left (402).
    #[error("Insufficient credits: {0}")]
    InsufficientCredits(String),

    /// Request rate limit exceeded (429), with retry hints when the backend
    /// supplied them.
    #[error("Rate limit exceeded: {message}")]
    RateLimit {
        message: String,
        /// Seconds to wait before retrying, if supplied.
        retry_after: Option<u64>,
        /// Epoch millis at which the limit window resets, if supplied.
        reset_at: Option<u64>,
    },

    /// Transport-level connection failure. `code` distinguishes retry
    /// exhaustion from an externally aborted attempt.
    #[error("Connection error: {message}")]
    Connection { code: &'static str, message: String },

    /// Invalid client configuration (bad or missing API key). Fatal and never
    /// retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The requested assistant does not exist (404).
    #[error("Assistant not found: {0}")]
    AssistantNotFound(String),

    /// Microphone acquisition or audio publishing failed.
    #[error("Media device error: {0}")]
    MediaDevices(String),

    /// Generic backend error carrying whatever code the API supplied.
    #[error("API error ({code}): {message}")]
    Api {
        status: Option<u16>,
        code: String,
        message: String,
        details: Option<Value>,
    },

    /// Client-side state error carrying a free-form machine code such as
    /// `CALL_IN_PROGRESS` or `NO_ACTIVE_CALL`.
    #[error("{message}")]
    Client { code: &'static str, message: String },
}

/// Result type for embed client operations.
pub type EmbedResult<T> = Result<T, EmbedError>;

impl EmbedError {
    /// Build a client-side state error with the given machine code.
    pub fn client(code: &'static str, message: impl Into<String>) -> Self {
        EmbedError::Client {
            code,
            message: message.into(),
        }
    }

    /// Build a connection error with the given machine code.
    pub fn connection(code: &'static str, message: impl Into<String>) -> Self {
        EmbedError::Connection {
            code,
            message: message.into(),
        }
    }

    /// Get the stable machine-readable code for this error.
    pub fn code(&self) -> &str {
        match self {
            EmbedError::Authentication(_) => codes::AUTHENTICATION_FAILED,
            EmbedError::InsufficientCredits(_) => codes::INSUFFICIENT_CREDITS,
            EmbedError::RateLimit { .. } => codes::RATE_LIMITED,
            EmbedError::Connection { code, .. } => code,
            EmbedError::Configuration(_) => codes::CONFIGURATION_ERROR,
            EmbedError::AssistantNotFound(_) => codes::ASSISTANT_NOT_FOUND,
            EmbedError::MediaDevices(_) => codes::MEDIA_DEVICES_ERROR,
            EmbedError::Api { code, .. } => code,
            EmbedError::Client { code, .. } => code,
        }
    }

    /// Get the HTTP-like status associated with this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            EmbedError::Authentication(_) => Some(401),
            EmbedError::InsufficientCredits(_) => Some(402),
            EmbedError::RateLimit { .. } => Some(429),
            EmbedError::AssistantNotFound(_) => Some(404),
            EmbedError::Api { status, .. } => *status,
            _ => None,
        }
    }

    /// Whether automatically retrying the failed operation makes sense.
    ///
    /// Authentication, configuration, and session-exclusion failures are
    /// deterministic and never worth retrying.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            EmbedError::Authentication(_) | EmbedError::Configuration(_)
        ) && !matches!(
            self.code(),
            codes::CALL_IN_PROGRESS | codes::CHAT_IN_PROGRESS
        )
    }
}

/// Map a backend error response onto the taxonomy.
///
/// `status` is the HTTP status if the response carried one, `code` and
/// `message` come from the `{success: false, error: {code, message}}` body,
/// and `details` is any extra payload. Classification always succeeds.
pub fn classify(
    status: Option<u16>,
    code: Option<String>,
    message: String,
    details: Option<Value>,
) -> EmbedError {
    match status {
        Some(401) | Some(403) => EmbedError::Authentication(message),
        Some(402) => EmbedError::InsufficientCredits(message),
        Some(404) => EmbedError::AssistantNotFound(message),
        Some(429) => {
            let retry_after = details
                .as_ref()
                .and_then(|d| d.get("retryAfter"))
                .and_then(Value::as_u64);
            let reset_at = details
                .as_ref()
                .and_then(|d| d.get("resetAt"))
                .and_then(Value::as_u64);
            EmbedError::RateLimit {
                message,
                retry_after,
                reset_at,
            }
        }
        // No usable status (stream error records, proxied failures): fall
        // back to the code itself.
        _ => match code.as_deref() {
            Some(codes::AUTHENTICATION_FAILED) => EmbedError::Authentication(message),
            Some(codes::INSUFFICIENT_CREDITS) => EmbedError::InsufficientCredits(message),
            Some(codes::ASSISTANT_NOT_FOUND) => EmbedError::AssistantNotFound(message),
            Some(codes::RATE_LIMITED) => {
                let retry_after = details
                    .as_ref()
                    .and_then(|d| d.get("retryAfter"))
                    .and_then(Value::as_u64);
                let reset_at = details
                    .as_ref()
                    .and_then(|d| d.get("resetAt"))
                    .and_then(Value::as_u64);
                EmbedError::RateLimit {
                    message,
                    retry_after,
                    reset_at,
                }
            }
            _ => EmbedError::Api {
                status,
                code: code.unwrap_or_else(|| codes::API_ERROR.to_string()),
                message,
                details,
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_auth_statuses() {
        for status in [401, 403] {
            let err = classify(Some(status), None, "denied".to_string(), None);
            assert!(matches!(err, EmbedError::Authentication(_)));
            assert_eq!(err.code(), codes::AUTHENTICATION_FAILED);
        }
    }

    #[test]
    fn test_classify_credits_and_not_found() {
        let err = classify(Some(402), None, "no credits".to_string(), None);
        assert!(matches!(err, EmbedError::InsufficientCredits(_)));

        let err = classify(Some(404), None, "missing".to_string(), None);
        assert!(matches!(err, EmbedError::AssistantNotFound(_)));
    }

    #[test]
    fn test_classify_rate_limit_hints() {
        let details = json!({"retryAfter": 30, "resetAt": 1700000000000u64});
        let err = classify(
            Some(429),
            None,
            "slow down".to_string(),
            Some(details),
        );
        match err {
            EmbedError::RateLimit {
                retry_after,
                reset_at,
                ..
            } => {
                assert_eq!(retry_after, Some(30));
                assert_eq!(reset_at, Some(1_700_000_000_000));
            }
            other => panic!("expected RateLimit, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_generic_keeps_backend_code() {
        let err = classify(
            Some(500),
            Some("ROOM_UNAVAILABLE".to_string()),
            "boom".to_string(),
            None,
        );
        assert_eq!(err.code(), "ROOM_UNAVAILABLE");
        assert_eq!(err.status(), Some(500));
    }

    #[test]
    fn test_classify_without_status_falls_back_to_generic() {
        let err = classify(None, None, "odd".to_string(), None);
        assert_eq!(err.code(), codes::API_ERROR);
        assert_eq!(err.status(), None);
    }

    #[test]
    fn test_retryability() {
        assert!(!EmbedError::Authentication("x".into()).is_retryable());
        assert!(!EmbedError::client(codes::CALL_IN_PROGRESS, "busy").is_retryable());
        assert!(!EmbedError::Configuration("bad key".into()).is_retryable());
        assert!(EmbedError::connection(codes::CONNECTION_FAILED, "down").is_retryable());
        assert!(classify(Some(500), None, "oops".into(), None).is_retryable());
    }
}
