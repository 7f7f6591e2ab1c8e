//! Assertion trust checks.
//!
//! Turns a raw, base64-encoded SAML response into a trusted `Assertion`, or a
//! classified `TrustFailure`. Checks run in a fixed order: size and encoding
//! first, then well-formedness and signature placement, then the parsed
//! document. Encrypted assertions are decrypted after the response signature
//! is checked, and their own signature is verified on the decrypted element.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use samael::schema::{Assertion as SamlAssertion, Response};
use tracing::{debug, error, warn};

use super::assertion::Assertion;
use super::config::ProviderConfig;
use super::encryption::AssertionDecryptor;
use super::envelope::{self, AssertionForm, Layout};
use super::error::TrustFailure;
use super::signature::ResponseVerifier;
use super::xml;

const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";

/// Produces a trusted assertion from a raw response.
pub trait AssertionValidator: Send + Sync {
    /// Validate a base64-encoded response.
    ///
    /// `expected_destination` is the URL the response was posted to; when
    /// `None` the configured ACS URL is expected instead.
    fn validate(
        &self,
        raw_response: &str,
        expected_destination: Option<&str>,
    ) -> Result<Assertion, TrustFailure>;
}

/// Validator for responses from one IdP.
pub struct ResponseValidator {
    provider_id: String,
    sp_entity_id: String,
    acs_url: String,
    idp_entity_id: String,
    clock_skew: Duration,
    max_issue_delay: Duration,
    max_response_bytes: usize,
    allow_unsigned: bool,
    verifier: Arc<dyn ResponseVerifier>,
    decryptor: Option<Arc<AssertionDecryptor>>,
}

impl ResponseValidator {
    pub fn new(
        config: &ProviderConfig,
        idp_entity_id: impl Into<String>,
        verifier: Arc<dyn ResponseVerifier>,
    ) -> Self {
        Self {
            provider_id: config.id.clone(),
            sp_entity_id: config.entity_id.clone(),
            acs_url: config.acs_url.clone(),
            idp_entity_id: idp_entity_id.into(),
            clock_skew: Duration::seconds(config.clock_skew_secs.max(0)),
            max_issue_delay: Duration::seconds(config.max_issue_delay_secs.max(0)),
            max_response_bytes: config.max_response_bytes,
            allow_unsigned: config.allow_unsigned_assertions,
            verifier,
            decryptor: None,
        }
    }

    /// Decrypt `EncryptedAssertion`s with the SP private key. Without one,
    /// encrypted assertions are rejected.
    pub fn with_decryptor(mut self, decryptor: AssertionDecryptor) -> Self {
        self.decryptor = Some(Arc::new(decryptor));
        self
    }

    pub fn idp_entity_id(&self) -> &str {
        &self.idp_entity_id
    }

    /// Validate against an explicit clock.
    pub fn validate_at(
        &self,
        raw_response: &str,
        expected_destination: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Assertion, TrustFailure> {
        self.check(raw_response, expected_destination, now)
            .map_err(|e| {
                error!(
                    provider = %self.provider_id,
                    kind = e.kind(),
                    error = %e,
                    "SAML response rejected"
                );
                e
            })
    }

    fn check(
        &self,
        raw_response: &str,
        expected_destination: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Assertion, TrustFailure> {
        xml::ensure_within_limit(raw_response.len(), xml::encoded_limit(self.max_response_bytes))?;
        let decoded = xml::decode_base64(raw_response)?;
        xml::ensure_within_limit(decoded.len(), self.max_response_bytes)?;
        xml::check_well_formed(&decoded)?;
        let layout = envelope::inspect_response(&decoded)?;

        // samael cannot read EncryptedAssertion content, so response fields
        // come from the document with that element cut out.
        let encrypted_span = layout
            .assertion
            .as_ref()
            .filter(|a| a.form == AssertionForm::Encrypted)
            .map(|a| a.span);
        let response: Response = match encrypted_span {
            Some(span) => envelope::cut(&decoded, span).parse(),
            None => decoded.parse(),
        }
        .map_err(|e| TrustFailure::MalformedXml(format!("not a SAML response: {}", e)))?;

        self.check_status(&response)?;
        self.check_destination(&response, expected_destination)?;
        self.check_response_issuer(&response)?;

        let mut parsed = match (&layout.assertion, encrypted_span) {
            (None, _) => return Err(TrustFailure::MissingAssertion),
            (Some(_), None) => {
                self.check_signature(&decoded, layout.is_signed())?;
                let assertion = response
                    .assertion
                    .as_ref()
                    .ok_or(TrustFailure::MissingAssertion)?;
                Assertion::from(assertion)
            }
            (Some(_), Some(span)) => {
                if layout.root_signed {
                    self.verifier.verify(&decoded)?;
                }
                let assertion = self.decrypt_assertion(&decoded[span.start..span.end], &layout)?;
                Assertion::from(&assertion)
            }
        };
        parsed.in_response_to = response.in_response_to.clone();

        self.check_assertion_issuer(&parsed)?;
        self.check_time_window(&parsed, now)?;
        self.check_issue_instant(&parsed, now)?;
        self.check_audience(&parsed)?;

        debug!(
            provider = %self.provider_id,
            assertion_id = %parsed.id,
            encrypted = encrypted_span.is_some(),
            "SAML response validated"
        );

        Ok(parsed)
    }

    fn check_status(&self, response: &Response) -> Result<(), TrustFailure> {
        let status = response
            .status
            .as_ref()
            .ok_or_else(|| TrustFailure::StatusNotSuccess("missing Status".to_string()))?;

        let code = status.status_code.value.as_deref().unwrap_or_default();
        if code != STATUS_SUCCESS {
            let message = status
                .status_message
                .as_ref()
                .and_then(|m| m.value.clone())
                .unwrap_or_default();
            return Err(TrustFailure::StatusNotSuccess(format!("{} {}", code, message).trim().to_string()));
        }
        Ok(())
    }

    fn check_destination(
        &self,
        response: &Response,
        expected_destination: Option<&str>,
    ) -> Result<(), TrustFailure> {
        let expected = expected_destination
            .filter(|d| !d.is_empty())
            .unwrap_or(&self.acs_url);
        if expected.is_empty() {
            return Ok(());
        }

        match response.destination.as_deref() {
            Some(actual) if actual == expected => Ok(()),
            actual => Err(TrustFailure::WrongDestination {
                expected: expected.to_string(),
                actual: actual.unwrap_or("<none>").to_string(),
            }),
        }
    }

    /// The response-level issuer is optional, but must match when present.
    fn check_response_issuer(&self, response: &Response) -> Result<(), TrustFailure> {
        match response.issuer.as_ref().and_then(|i| i.value.as_deref()) {
            Some(actual) if actual != self.idp_entity_id => Err(TrustFailure::WrongIssuer {
                expected: self.idp_entity_id.clone(),
                actual: actual.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// `signed` comes from the layout check, so the verifier always sees the
    /// signature covering the consumed assertion.
    fn check_signature(&self, xml: &str, signed: bool) -> Result<(), TrustFailure> {
        if signed {
            return self.verifier.verify(xml);
        }
        if self.allow_unsigned {
            warn!(
                provider = %self.provider_id,
                "Accepting unsigned SAML assertion (allow_unsigned_assertions is set)"
            );
            return Ok(());
        }
        Err(TrustFailure::Signature(
            "response and assertion are not signed".to_string(),
        ))
    }

    fn decrypt_assertion(&self, encrypted: &str, layout: &Layout) -> Result<SamlAssertion, TrustFailure> {
        let decryptor = self
            .decryptor
            .as_ref()
            .ok_or_else(|| TrustFailure::Decryption("no SP private key loaded".to_string()))?;

        let encrypted = envelope::with_namespaces(encrypted, &layout.namespaces)?;
        let plaintext = decryptor.decrypt(&encrypted)?;
        let standalone = envelope::with_namespaces(&plaintext, &layout.namespaces)?;
        xml::check_well_formed(&standalone)?;

        let inner = envelope::inspect_assertion(&standalone)?;
        if inner.root_signed || !layout.root_signed {
            self.check_signature(&standalone, inner.root_signed)?;
        }

        standalone
            .parse()
            .map_err(|e| TrustFailure::MalformedXml(format!("not a SAML assertion: {}", e)))
    }

    fn check_assertion_issuer(&self, assertion: &Assertion) -> Result<(), TrustFailure> {
        match assertion.issuer.as_deref() {
            Some(actual) if actual == self.idp_entity_id => Ok(()),
            actual => Err(TrustFailure::WrongIssuer {
                expected: self.idp_entity_id.clone(),
                actual: actual.unwrap_or("<none>").to_string(),
            }),
        }
    }

    fn check_time_window(&self, assertion: &Assertion, now: DateTime<Utc>) -> Result<(), TrustFailure> {
        let Some(conditions) = assertion.conditions.as_ref() else {
            return Ok(());
        };

        if let Some(not_before) = conditions.not_before {
            if now < not_before - self.clock_skew {
                return Err(TrustFailure::NotYetValid {
                    not_before: not_before.to_rfc3339(),
                });
            }
        }
        if let Some(not_on_or_after) = conditions.not_on_or_after {
            if now >= not_on_or_after + self.clock_skew {
                return Err(TrustFailure::Expired {
                    not_on_or_after: not_on_or_after.to_rfc3339(),
                });
            }
        }
        Ok(())
    }

    /// IssueInstant must lie within `max_issue_delay` of now, so an assertion
    /// without Conditions still ages out.
    fn check_issue_instant(&self, assertion: &Assertion, now: DateTime<Utc>) -> Result<(), TrustFailure> {
        let issued = assertion.issue_instant.ok_or_else(|| TrustFailure::Stale {
            issue_instant: "<none>".to_string(),
        })?;

        if issued > now + self.clock_skew {
            return Err(TrustFailure::NotYetValid {
                not_before: issued.to_rfc3339(),
            });
        }
        if now > issued + self.max_issue_delay + self.clock_skew {
            return Err(TrustFailure::Stale {
                issue_instant: issued.to_rfc3339(),
            });
        }
        Ok(())
    }

    /// Every AudienceRestriction must name this SP.
    fn check_audience(&self, assertion: &Assertion) -> Result<(), TrustFailure> {
        let restrictions = assertion
            .conditions
            .as_ref()
            .map(|c| c.audience_restrictions.as_slice())
            .unwrap_or_default();

        let all_match = restrictions
            .iter()
            .all(|audiences| audiences.iter().any(|a| a == &self.sp_entity_id));
        if !all_match {
            return Err(TrustFailure::WrongAudience {
                expected: self.sp_entity_id.clone(),
            });
        }
        Ok(())
    }
}

impl AssertionValidator for ResponseValidator {
    fn validate(
        &self,
        raw_response: &str,
        expected_destination: Option<&str>,
    ) -> Result<Assertion, TrustFailure> {
        self.validate_at(raw_response, expected_destination, Utc::now())
    }
}
