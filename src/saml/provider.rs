//! SAML Service Provider for one IdP.
//!
//! Handles SP-initiated SSO, response consumption and Single Logout.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use super::assertion::Assertion;
use super::config::ProviderConfig;
use super::encryption::AssertionDecryptor;
use super::error::{AcsError, TrustFailure};
use super::keys::SpKeyMaterial;
use super::logout::{self, LogoutRequest};
use super::metadata::{load_idp_metadata, IdpMetadata};
use super::signature::{verifier_for, ResponseVerifier};
use super::user_info::{extract_user_info, UserInfo};
use super::validator::{AssertionValidator, ResponseValidator};
use super::xml;
use crate::state::StateStore;

const HTTP_POST_BINDING: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST";

/// How long a replay record is kept when an assertion carries no time bound
/// at all. Only reachable with a custom validator.
const DEFAULT_REPLAY_WINDOW_SECS: i64 = 60 * 60;

/// Redirect to the IdP carrying an AuthnRequest.
#[derive(Debug, Clone)]
pub struct AuthnRedirect {
    pub url: String,
    pub request_id: String,
}

/// A validated, not previously seen assertion and the user it resolves to.
#[derive(Debug, Clone)]
pub struct ProcessedAssertion {
    pub assertion: Assertion,
    pub user_info: UserInfo,
}

/// Fully initialized provider context. Immutable once built.
pub struct SamlProvider {
    config: ProviderConfig,
    idp: IdpMetadata,
    validator: Arc<dyn AssertionValidator>,
}

impl std::fmt::Debug for SamlProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamlProvider")
            .field("id", &self.config.id)
            .field("idp", &self.idp.entity_id)
            .finish()
    }
}

impl SamlProvider {
    /// Validate configuration, load key material and IdP metadata.
    pub async fn initialize(config: ProviderConfig) -> Result<Self> {
        config.validate().map_err(|e| anyhow!(e))?;

        let sp_keys = SpKeyMaterial::load(&config)
            .with_context(|| format!("SAML provider {}: failed to load SP key material", config.id))?;
        let idp = load_idp_metadata(&config)
            .await
            .with_context(|| format!("SAML provider {}: failed to load IdP metadata", config.id))?;
        let verifier = verifier_for(&idp.signing_certificates);
        let decryptor = AssertionDecryptor::from_pem(&sp_keys.private_key_pem)
            .with_context(|| format!("SAML provider {}: unusable SP private key", config.id))?;

        info!(
            provider = %config.id,
            idp = %idp.entity_id,
            sso_url = %idp.sso_url,
            certificates = idp.signing_certificates.len(),
            "SAML provider initialized"
        );

        let validator = ResponseValidator::new(&config, idp.entity_id.clone(), verifier)
            .with_decryptor(decryptor);
        Ok(Self::with_validator(config, idp, Arc::new(validator)))
    }

    /// Build a provider from already loaded parts.
    pub fn with_verifier(
        config: ProviderConfig,
        idp: IdpMetadata,
        verifier: Arc<dyn ResponseVerifier>,
    ) -> Self {
        let validator = Arc::new(ResponseValidator::new(&config, idp.entity_id.clone(), verifier));
        Self::with_validator(config, idp, validator)
    }

    /// Build a provider around a custom validator.
    pub fn with_validator(
        config: ProviderConfig,
        idp: IdpMetadata,
        validator: Arc<dyn AssertionValidator>,
    ) -> Self {
        Self {
            config,
            idp,
            validator,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn idp(&self) -> &IdpMetadata {
        &self.idp
    }

    /// Create an AuthnRequest and return the redirect URL to the IdP.
    pub fn create_authn_request(&self, relay_state: Option<&str>) -> Result<AuthnRedirect> {
        let request_id = format!("_id{}", uuid::Uuid::new_v4());
        let issue_instant = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();

        let force_authn = if self.config.force_authn {
            r#" ForceAuthn="true""#
        } else {
            ""
        };
        let name_id_policy = self
            .config
            .name_id_format
            .as_deref()
            .filter(|f| !f.is_empty())
            .map(|format| {
                format!(
                    r#"<samlp:NameIDPolicy Format="{}" AllowCreate="true"/>"#,
                    xml::escape(format)
                )
            })
            .unwrap_or_default();

        let authn_request = format!(
            r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{}" Version="2.0" IssueInstant="{}" Destination="{}" AssertionConsumerServiceURL="{}" ProtocolBinding="{}"{}><saml:Issuer>{}</saml:Issuer>{}</samlp:AuthnRequest>"#,
            request_id,
            issue_instant,
            xml::escape(&self.idp.sso_url),
            xml::escape(&self.config.acs_url),
            HTTP_POST_BINDING,
            force_authn,
            xml::escape(&self.config.entity_id),
            name_id_policy,
        );

        let encoded = deflate_and_encode(&authn_request)?;

        let separator = if self.idp.sso_url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}SAMLRequest={}",
            self.idp.sso_url,
            separator,
            urlencoding::encode(&encoded)
        );

        if let Some(state) = relay_state {
            url.push_str(&format!("&RelayState={}", urlencoding::encode(state)));
        }

        debug!(provider = %self.config.id, request_id = %request_id, "Created SAML AuthnRequest redirect");
        Ok(AuthnRedirect { url, request_id })
    }

    /// Validate a response and resolve the user without recording it.
    pub fn resolve(
        &self,
        raw_response: &str,
        expected_destination: Option<&str>,
    ) -> Result<ProcessedAssertion, TrustFailure> {
        let assertion = self.validator.validate(raw_response, expected_destination)?;
        let user_info = extract_user_info(&assertion, &self.config);
        Ok(ProcessedAssertion {
            assertion,
            user_info,
        })
    }

    /// Validate a posted response, reject replays and resolve the user.
    ///
    /// `expected_request_id` is the ID of the AuthnRequest this response
    /// answers, or `None` for an unsolicited response. The response's
    /// `InResponseTo` must match it exactly, absent included.
    pub fn process_response(
        &self,
        raw_response: &str,
        expected_destination: Option<&str>,
        expected_request_id: Option<&str>,
        store: &StateStore,
    ) -> Result<ProcessedAssertion, AcsError> {
        let assertion = self.validator.validate(raw_response, expected_destination)?;

        match (expected_request_id, assertion.in_response_to.as_deref()) {
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => {}
            (expected, actual) => {
                return Err(self.reject(TrustFailure::WrongInResponseTo {
                    expected: expected.unwrap_or("<none>").to_string(),
                    actual: actual.unwrap_or("<none>").to_string(),
                }));
            }
        }

        let keep_until = self.replay_keep_until(&assertion, Utc::now());
        let fresh = store
            .mark_assertion_used(&assertion.id, keep_until)
            .map_err(AcsError::Store)?;
        if !fresh {
            return Err(self.reject(TrustFailure::Replay(assertion.id.clone())));
        }

        let user_info = extract_user_info(&assertion, &self.config);

        info!(
            provider = %self.config.id,
            assertion_id = %assertion.id,
            id_type = %user_info.id_type,
            "SAML assertion accepted"
        );

        Ok(ProcessedAssertion {
            assertion,
            user_info,
        })
    }

    /// End of the window in which the validator would still accept
    /// `assertion`. Its replay record must outlive this.
    fn replay_keep_until(&self, assertion: &Assertion, now: DateTime<Utc>) -> DateTime<Utc> {
        let skew = Duration::seconds(self.config.clock_skew_secs.max(0));
        let by_conditions = assertion
            .conditions
            .as_ref()
            .and_then(|c| c.not_on_or_after)
            .map(|t| t + skew);
        let by_issue = assertion
            .issue_instant
            .map(|t| t + Duration::seconds(self.config.max_issue_delay_secs.max(0)) + skew);

        let acceptance_end = match (by_conditions, by_issue) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        acceptance_end
            .filter(|t| *t > now)
            .unwrap_or_else(|| now + Duration::seconds(DEFAULT_REPLAY_WINDOW_SECS))
    }

    fn reject(&self, failure: TrustFailure) -> AcsError {
        tracing::error!(
            provider = %self.config.id,
            kind = failure.kind(),
            error = %failure,
            "SAML response rejected"
        );
        failure.into()
    }

    /// Decode and check an IdP-initiated LogoutRequest.
    pub fn parse_logout_request(&self, encoded: &str) -> Result<LogoutRequest, TrustFailure> {
        let document = logout::decode_logout_message(encoded)?;
        logout::parse_logout_request(&document, &self.idp.entity_id).map_err(|e| {
            tracing::error!(
                provider = %self.config.id,
                kind = e.kind(),
                error = %e,
                "SAML logout request rejected"
            );
            e
        })
    }

    /// Build the base64 LogoutResponse sent back to the IdP.
    pub fn make_logout_response(&self, in_response_to: &str, status: &str) -> String {
        logout::build_logout_response(
            &self.config.entity_id,
            self.idp.slo_url.as_deref(),
            in_response_to,
            status,
        )
    }
}

/// Deflate and base64 encode for SAML redirect binding.
fn deflate_and_encode(xml: &str) -> Result<String> {
    use std::io::Write;

    let mut encoder =
        flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(xml.as_bytes())?;
    let compressed = encoder.finish()?;
    Ok(BASE64.encode(compressed))
}
