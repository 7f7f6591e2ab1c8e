//! Classified SAML errors.
//!
//! Every variant carries operator detail in its `Display` output. Callers
//! facing an end user must show `user_message()` instead.

use thiserror::Error;

/// Message shown to the end user for any SAML failure.
pub const GENERIC_FAILURE_MESSAGE: &str = "authentication failed";

/// Reason an incoming response was not trusted. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrustFailure {
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("payload too large: {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("malformed XML: {0}")]
    MalformedXml(String),

    #[error("response status is not Success: {0}")]
    StatusNotSuccess(String),

    #[error("signature verification failed: {0}")]
    Signature(String),

    #[error("assertion decryption failed: {0}")]
    Decryption(String),

    #[error("assertion not yet valid (NotBefore {not_before})")]
    NotYetValid { not_before: String },

    #[error("assertion expired (NotOnOrAfter {not_on_or_after})")]
    Expired { not_on_or_after: String },

    #[error("assertion issued too long ago (IssueInstant {issue_instant})")]
    Stale { issue_instant: String },

    #[error("audience restriction does not include {expected}")]
    WrongAudience { expected: String },

    #[error("issuer mismatch: expected {expected}, got {actual}")]
    WrongIssuer { expected: String, actual: String },

    #[error("destination mismatch: expected {expected}, got {actual}")]
    WrongDestination { expected: String, actual: String },

    #[error("InResponseTo mismatch: expected {expected}, got {actual}")]
    WrongInResponseTo { expected: String, actual: String },

    #[error("response contains no assertion")]
    MissingAssertion,

    #[error("assertion {0} was already used")]
    Replay(String),
}

impl TrustFailure {
    /// Short machine-readable class, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            TrustFailure::InvalidEncoding(_) => "invalid_encoding",
            TrustFailure::PayloadTooLarge { .. } => "payload_too_large",
            TrustFailure::MalformedXml(_) => "malformed_xml",
            TrustFailure::StatusNotSuccess(_) => "status_not_success",
            TrustFailure::Signature(_) => "signature",
            TrustFailure::Decryption(_) => "decryption",
            TrustFailure::NotYetValid { .. } => "not_yet_valid",
            TrustFailure::Expired { .. } => "expired",
            TrustFailure::Stale { .. } => "stale",
            TrustFailure::WrongAudience { .. } => "wrong_audience",
            TrustFailure::WrongIssuer { .. } => "wrong_issuer",
            TrustFailure::WrongDestination { .. } => "wrong_destination",
            TrustFailure::WrongInResponseTo { .. } => "wrong_in_response_to",
            TrustFailure::MissingAssertion => "missing_assertion",
            TrustFailure::Replay(_) => "replay",
        }
    }

    pub fn user_message(&self) -> &'static str {
        GENERIC_FAILURE_MESSAGE
    }
}

/// Failure of an assertion consumer request.
#[derive(Debug, Error)]
pub enum AcsError {
    #[error("unknown SAML provider: {0}")]
    UnknownProvider(String),

    #[error("untrusted SAML response: {0}")]
    Trust(#[from] TrustFailure),

    #[error("unsolicited response rejected for provider {0}")]
    Unsolicited(String),

    #[error("user provisioning failed: {0}")]
    Provisioning(#[source] anyhow::Error),

    #[error("token issuance failed: {0}")]
    TokenIssuance(#[source] anyhow::Error),

    #[error("state store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("failed to build SAML message: {0}")]
    Internal(#[source] anyhow::Error),
}

impl AcsError {
    pub fn user_message(&self) -> &'static str {
        GENERIC_FAILURE_MESSAGE
    }
}

/// Provider registry initialization failure.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no SAML providers configured")]
    NoProviders,

    #[error("all {} SAML providers failed to initialize: {}", .0.len(), summarize(.0))]
    AllProvidersFailed(Vec<(String, String)>),
}

fn summarize(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(id, err)| format!("{}: {}", id, err))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_is_generic() {
        let failure = TrustFailure::WrongIssuer {
            expected: "https://idp.example.com".to_string(),
            actual: "https://evil.example.com".to_string(),
        };
        assert_eq!(failure.user_message(), "authentication failed");
        assert!(failure.to_string().contains("evil.example.com"));
        assert_eq!(failure.kind(), "wrong_issuer");

        let acs: AcsError = failure.into();
        assert_eq!(acs.user_message(), "authentication failed");
    }

    #[test]
    fn test_registry_error_lists_failures() {
        let err = RegistryError::AllProvidersFailed(vec![
            ("okta".to_string(), "bad metadata".to_string()),
            ("entra".to_string(), "missing key".to_string()),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("all 2 SAML providers"));
        assert!(msg.contains("okta: bad metadata"));
        assert!(msg.contains("entra: missing key"));
    }
}
