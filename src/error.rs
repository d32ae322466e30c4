//! Classified upstream-error taxonomy.
//!
//! Every brokerage-facing error message passes through [`classify`] exactly
//! once; no other module inspects error strings directly.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CopierError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transient upstream error: {0}")]
    TransientUpstream(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),
    #[error("auth failure: {0}")]
    AuthFailure(String),
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl CopierError {
    /// Whether the order executor's retry loop should retry this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CopierError::RateLimited(_) | CopierError::TransientUpstream(_)
        )
    }
}

/// Classify a raw upstream error message into the taxonomy.
///
/// Substring matching, case-insensitive. This is brittle by nature — it is
/// reading free-text error strings from a brokerage SDK — so it is kept in
/// exactly one place.
pub fn classify(message: &str) -> CopierError {
    let lower = message.to_lowercase();

    if lower.contains("rate limit") || lower.contains("429") || lower.contains("too many requests")
    {
        return CopierError::RateLimited(message.to_string());
    }
    if lower.contains("unauthorized")
        || lower.contains("authentication")
        || lower.contains("401")
        || lower.contains("403")
        || lower.contains("failed to authenticate")
    {
        return CopierError::AuthFailure(message.to_string());
    }
    if lower.contains("insufficient") || lower.contains("buying power") {
        return CopierError::InsufficientFunds(message.to_string());
    }
    if lower.contains("not found") || lower.contains("invalid") || lower.contains("halt") {
        return CopierError::InvalidSymbol(message.to_string());
    }
    if lower.contains("500")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("timeout")
    {
        return CopierError::TransientUpstream(message.to_string());
    }
    CopierError::Unknown(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rate_limit() {
        assert_eq!(
            classify("HTTP 429: rate limit exceeded"),
            CopierError::RateLimited("HTTP 429: rate limit exceeded".into())
        );
        assert!(classify("rate limit exceeded").is_retryable());
    }

    #[test]
    fn classifies_transient() {
        assert!(matches!(
            classify("upstream returned 503"),
            CopierError::TransientUpstream(_)
        ));
        assert!(classify("request timeout").is_retryable());
    }

    #[test]
    fn classifies_insufficient_funds_as_not_retryable() {
        let e = classify("insufficient buying power for this order");
        assert!(matches!(e, CopierError::InsufficientFunds(_)));
        assert!(!e.is_retryable());
    }

    #[test]
    fn classifies_invalid_symbol() {
        assert!(matches!(
            classify("symbol not found"),
            CopierError::InvalidSymbol(_)
        ));
    }

    #[test]
    fn classifies_auth_failure() {
        assert!(matches!(
            classify("401 Unauthorized"),
            CopierError::AuthFailure(_)
        ));
    }

    #[test]
    fn falls_back_to_unknown_and_not_retryable() {
        let e = classify("the wheels fell off");
        assert_eq!(e, CopierError::Unknown("the wheels fell off".into()));
        assert!(!e.is_retryable());
    }
}
