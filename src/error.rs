use serde::Serialize;
use thiserror::Error;

/// Failure of a single call to the translation provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("translation request timed out")]
    Timeout,

    #[error("translation provider is rate limiting (429)")]
    RateLimited,

    #[error("translation provider server error ({status}): {body}")]
    Server { status: u16, body: String },

    #[error("translation provider rejected the request ({status}): {body}")]
    Client { status: u16, body: String },

    #[error("malformed translation response: {0}")]
    Malformed(String),

    #[error("translation transport error: {0}")]
    Transport(String),
}

impl ProviderError {
    /// Classify a non-success HTTP status returned by the provider
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => ProviderError::RateLimited,
            500..=599 => ProviderError::Server { status, body },
            _ => ProviderError::Client { status, body },
        }
    }

    /// Timeouts, 429 and 5xx are retried and count against the circuit breaker.
    /// Everything else aborts the attempt loop immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout | ProviderError::RateLimited | ProviderError::Server { .. }
        )
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return ProviderError::Timeout;
        }
        if let Some(status) = err.status() {
            return ProviderError::from_status(status.as_u16(), err.to_string());
        }
        if err.is_decode() {
            return ProviderError::Malformed(err.to_string());
        }
        ProviderError::Transport(err.to_string())
    }
}

/// Terminal outcome of a guarded translation (breaker + governor + retries).
#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("circuit breaker is open, translation skipped")]
    CircuitOpen,

    #[error("non-retryable provider error: {0}")]
    NonRetryable(#[source] ProviderError),

    #[error("translation failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: ProviderError,
    },
}

/// Errors from the messaging platform REST API
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("platform resource not found")]
    NotFound,

    #[error("missing platform permission: {0}")]
    Forbidden(String),

    #[error("platform API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("platform transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected platform response: {0}")]
    Decode(String),
}

/// Errors from the remote quota store
#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("quota service error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("quota service transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed quota response: {0}")]
    Malformed(String),
}

/// Errors from a link directory backend
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("link database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("link file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("link file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Why a message was not relayed. Every drop is logged and counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    NotInGuild,
    AutomatedAuthor,
    AlreadyRelayed,
    SupersededByProxy,
    UserCooldown,
    ChannelCooldown,
    TooShort,
    Duplicate,
    LinkNotFound,
    InvalidTarget,
    QuotaUnavailable,
    TranslationDisabled,
    QuotaExhausted,
    CircuitOpen,
    TranslationFailed,
    IdentityUnavailable,
    DispatchFailed,
}

impl DropReason {
    pub const ALL: [DropReason; 17] = [
        DropReason::NotInGuild,
        DropReason::AutomatedAuthor,
        DropReason::AlreadyRelayed,
        DropReason::SupersededByProxy,
        DropReason::UserCooldown,
        DropReason::ChannelCooldown,
        DropReason::TooShort,
        DropReason::Duplicate,
        DropReason::LinkNotFound,
        DropReason::InvalidTarget,
        DropReason::QuotaUnavailable,
        DropReason::TranslationDisabled,
        DropReason::QuotaExhausted,
        DropReason::CircuitOpen,
        DropReason::TranslationFailed,
        DropReason::IdentityUnavailable,
        DropReason::DispatchFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::NotInGuild => "not_in_guild",
            DropReason::AutomatedAuthor => "automated_author",
            DropReason::AlreadyRelayed => "already_relayed",
            DropReason::SupersededByProxy => "superseded_by_proxy",
            DropReason::UserCooldown => "user_cooldown",
            DropReason::ChannelCooldown => "channel_cooldown",
            DropReason::TooShort => "too_short",
            DropReason::Duplicate => "duplicate",
            DropReason::LinkNotFound => "link_not_found",
            DropReason::InvalidTarget => "invalid_target",
            DropReason::QuotaUnavailable => "quota_unavailable",
            DropReason::TranslationDisabled => "translation_disabled",
            DropReason::QuotaExhausted => "quota_exhausted",
            DropReason::CircuitOpen => "circuit_open",
            DropReason::TranslationFailed => "translation_failed",
            DropReason::IdentityUnavailable => "identity_unavailable",
            DropReason::DispatchFailed => "dispatch_failed",
        }
    }

    /// Position in [`DropReason::ALL`], used for per-reason counters
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Provider Error Classification ====================

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            ProviderError::from_status(429, String::new()),
            ProviderError::RateLimited
        ));
        assert!(matches!(
            ProviderError::from_status(503, String::new()),
            ProviderError::Server { status: 503, .. }
        ));
        assert!(matches!(
            ProviderError::from_status(400, String::new()),
            ProviderError::Client { status: 400, .. }
        ));
    }

    #[test]
    fn test_transient_errors() {
        assert!(ProviderError::Timeout.is_transient());
        assert!(ProviderError::RateLimited.is_transient());
        assert!(ProviderError::Server {
            status: 500,
            body: "boom".to_string()
        }
        .is_transient());
    }

    #[test]
    fn test_permanent_errors() {
        assert!(!ProviderError::Client {
            status: 403,
            body: String::new()
        }
        .is_transient());
        assert!(!ProviderError::Malformed("not json".to_string()).is_transient());
        assert!(!ProviderError::Transport("dns".to_string()).is_transient());
    }

    #[test]
    fn test_exhausted_message_includes_attempts() {
        let err = TranslateError::Exhausted {
            attempts: 3,
            last: ProviderError::RateLimited,
        };
        let msg = err.to_string();
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("429"));
    }

    // ==================== Drop Reasons ====================

    #[test]
    fn test_drop_reason_index_matches_all() {
        for (i, reason) in DropReason::ALL.iter().enumerate() {
            assert_eq!(reason.index(), i, "{} is out of order", reason);
        }
    }

    #[test]
    fn test_drop_reason_serializes_snake_case() {
        let json = serde_json::to_string(&DropReason::QuotaExhausted).unwrap();
        assert_eq!(json, "\"quota_exhausted\"");
        assert_eq!(DropReason::QuotaExhausted.as_str(), "quota_exhausted");
    }
}
