//! XML signature verification.
//!
//! The validator only talks to `ResponseVerifier`. With the `xmlsec` cargo
//! feature the verifier is backed by libxmlsec1 through samael. Without it
//! the default verifier rejects every signed response, so a build without
//! a signature engine fails closed.

use std::sync::Arc;

use super::error::TrustFailure;
use super::keys::IdpCertificate;

/// Cryptographic check of an enveloped signature.
pub trait ResponseVerifier: Send + Sync {
    /// Verify the first `ds:Signature` of `xml` in document order against
    /// the IdP certificates.
    ///
    /// Callers run `envelope::inspect_response` or `inspect_assertion` on
    /// `xml` first, which guarantees that signature covers the assertion.
    fn verify(&self, xml: &str) -> Result<(), TrustFailure>;
}

/// Verifier used when no signature engine is compiled in.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableVerifier;

impl ResponseVerifier for UnavailableVerifier {
    fn verify(&self, _xml: &str) -> Result<(), TrustFailure> {
        Err(TrustFailure::Signature(
            "built without the xmlsec feature; signatures cannot be verified".to_string(),
        ))
    }
}

/// Build the verifier for a provider from its IdP certificates.
#[cfg(feature = "xmlsec")]
pub fn verifier_for(idp_certificates: &[IdpCertificate]) -> Arc<dyn ResponseVerifier> {
    Arc::new(xmlsec::XmlSecVerifier::new(idp_certificates))
}

/// Build the verifier for a provider from its IdP certificates.
#[cfg(not(feature = "xmlsec"))]
pub fn verifier_for(_idp_certificates: &[IdpCertificate]) -> Arc<dyn ResponseVerifier> {
    tracing::warn!("Built without the xmlsec feature, signed SAML responses will be rejected");
    Arc::new(UnavailableVerifier)
}

#[cfg(feature = "xmlsec")]
mod xmlsec {
    use super::ResponseVerifier;
    use crate::saml::error::TrustFailure;
    use crate::saml::keys::IdpCertificate;

    /// libxmlsec1-backed verifier. Any one of the IdP certificates may match.
    pub struct XmlSecVerifier {
        certificates: Vec<Vec<u8>>,
    }

    impl XmlSecVerifier {
        pub fn new(idp_certificates: &[IdpCertificate]) -> Self {
            Self {
                certificates: idp_certificates.iter().map(|c| c.der.clone()).collect(),
            }
        }
    }

    impl ResponseVerifier for XmlSecVerifier {
        fn verify(&self, xml: &str) -> Result<(), TrustFailure> {
            if self.certificates.is_empty() {
                return Err(TrustFailure::Signature("no IdP signing certificate".to_string()));
            }

            let mut last_error = String::new();
            for der in &self.certificates {
                match samael::crypto::verify_signed_xml(xml, der, Some("ID")) {
                    Ok(()) => return Ok(()),
                    Err(e) => last_error = e.to_string(),
                }
            }
            Err(TrustFailure::Signature(last_error))
        }
    }
}
