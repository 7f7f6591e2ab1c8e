//! IdP metadata loading.
//!
//! Metadata comes from a URL, base64 XML or inline XML. It goes through the
//! same size and DOCTYPE guard as responses before being parsed.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use samael::metadata::EntityDescriptor;
use tracing::{debug, info, warn};

use super::config::ProviderConfig;
use super::keys::IdpCertificate;
use super::xml;

/// Metadata fetch timeout.
pub const METADATA_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest metadata document accepted.
pub const MAX_METADATA_BYTES: usize = 100 * 1024;

const HTTP_REDIRECT_BINDING: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect";

/// What the SP needs to know about an IdP.
#[derive(Debug, Clone)]
pub struct IdpMetadata {
    pub entity_id: String,
    pub sso_url: String,
    pub slo_url: Option<String>,
    /// Signing certificates; any one of them may sign a response.
    pub signing_certificates: Vec<IdpCertificate>,
}

/// Resolve IdP metadata from whichever source the provider configures.
///
/// Direct `idp_sso_url` / `idp_entity_id` settings override what the
/// metadata document says.
pub async fn load_idp_metadata(config: &ProviderConfig) -> Result<IdpMetadata> {
    let document = if let Some(url) = config.idp_metadata_url.as_deref().filter(|u| !u.is_empty()) {
        Some(fetch_metadata(url).await?)
    } else if let Some(b64) = config.idp_metadata_b64_xml.as_deref().filter(|b| !b.is_empty()) {
        let compact: String = b64.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = STANDARD
            .decode(compact.as_bytes())
            .context("Failed to decode base64 IdP metadata")?;
        Some(String::from_utf8(bytes).context("IdP metadata is not valid UTF-8")?)
    } else {
        config.idp_metadata_xml.clone().filter(|x| !x.is_empty())
    };

    let mut metadata = match document {
        Some(doc) => parse_metadata(&doc)?,
        None => IdpMetadata {
            entity_id: String::new(),
            sso_url: String::new(),
            slo_url: None,
            signing_certificates: Vec::new(),
        },
    };

    if let Some(entity_id) = config.idp_entity_id.as_deref().filter(|e| !e.is_empty()) {
        metadata.entity_id = entity_id.to_string();
    }
    if let Some(sso_url) = config.idp_sso_url.as_deref().filter(|u| !u.is_empty()) {
        metadata.sso_url = sso_url.to_string();
    }
    if let Some(pem) = config.idp_certificate_pem.as_deref().filter(|p| !p.is_empty()) {
        let cert = IdpCertificate::from_pem(pem).context("Failed to parse IdP certificate")?;
        metadata.signing_certificates.push(cert);
    }

    if metadata.entity_id.is_empty() {
        bail!("IdP entity id is missing");
    }
    if metadata.sso_url.is_empty() {
        bail!("IdP SSO URL is missing");
    }
    if metadata.signing_certificates.is_empty() {
        if !config.allow_unsigned_assertions {
            bail!("IdP {} has no signing certificate", metadata.entity_id);
        }
        warn!(
            provider = %config.id,
            idp = %metadata.entity_id,
            "No IdP signing certificate found, only unsigned responses will be accepted"
        );
    }

    Ok(metadata)
}

/// Fetch a metadata document, aborting once it grows past the size limit.
pub async fn fetch_metadata(url: &str) -> Result<String> {
    debug!(url = %url, "Fetching IdP metadata");

    let client = reqwest::Client::builder()
        .timeout(METADATA_FETCH_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")?;

    let mut response = client
        .get(url)
        .send()
        .await
        .context("Failed to fetch IdP metadata")?;

    if !response.status().is_success() {
        return Err(anyhow!(
            "IdP metadata endpoint returned status {}",
            response.status()
        ));
    }

    if let Some(len) = response.content_length() {
        if len as usize > MAX_METADATA_BYTES {
            bail!("IdP metadata too large: {} bytes", len);
        }
    }

    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .context("Failed to read IdP metadata")?
    {
        if body.len() + chunk.len() > MAX_METADATA_BYTES {
            bail!("IdP metadata exceeds {} bytes", MAX_METADATA_BYTES);
        }
        body.extend_from_slice(&chunk);
    }

    let text = String::from_utf8(body).context("IdP metadata is not valid UTF-8")?;
    info!(url = %url, bytes = text.len(), "Fetched IdP metadata");
    Ok(text)
}

/// Parse an `EntityDescriptor` document.
pub fn parse_metadata(document: &str) -> Result<IdpMetadata> {
    xml::ensure_within_limit(document.len(), MAX_METADATA_BYTES)?;
    xml::check_well_formed(document)?;

    let descriptor: EntityDescriptor = samael::metadata::de::from_str(document)
        .map_err(|e| anyhow!("Failed to parse IdP metadata: {}", e))?;

    let entity_id = descriptor
        .entity_id
        .clone()
        .filter(|e| !e.is_empty())
        .ok_or_else(|| anyhow!("IdP metadata has no EntityID"))?;

    let idp = descriptor
        .idp_sso_descriptors
        .as_ref()
        .and_then(|d| d.first())
        .ok_or_else(|| anyhow!("IdP metadata has no IDPSSODescriptor"))?;

    let sso_url = idp
        .single_sign_on_services
        .iter()
        .find(|svc| svc.binding == HTTP_REDIRECT_BINDING)
        .or_else(|| idp.single_sign_on_services.first())
        .map(|svc| svc.location.clone())
        .unwrap_or_default();

    let slo_url = idp
        .single_logout_services
        .iter()
        .find(|svc| svc.binding == HTTP_REDIRECT_BINDING)
        .or_else(|| idp.single_logout_services.first())
        .map(|svc| svc.location.clone());

    let mut signing_certificates = Vec::new();
    for key in &idp.key_descriptors {
        // Keys without a `use` attribute serve both purposes
        if key.key_use.as_deref() == Some("encryption") {
            continue;
        }
        let certs = key
            .key_info
            .x509_data
            .as_ref()
            .map(|d| d.certificates.as_slice())
            .unwrap_or_default();
        for cert in certs {
            match IdpCertificate::from_base64_der(cert) {
                Ok(cert) => signing_certificates.push(cert),
                Err(e) => warn!(idp = %entity_id, error = %e, "Skipping unparseable IdP certificate"),
            }
        }
    }

    debug!(
        idp = %entity_id,
        sso_url = %sso_url,
        certificates = signing_certificates.len(),
        "Parsed IdP metadata"
    );

    Ok(IdpMetadata {
        entity_id,
        sso_url,
        slo_url,
        signing_certificates,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    const IDP_CERT: &str = include_str!("../../tests/fixtures/idp.crt");

    pub(crate) fn metadata_xml() -> String {
        let cert_b64: String = IDP_CERT
            .lines()
            .filter(|l| !l.starts_with("-----"))
            .collect();
        format!(
            r#"<?xml version="1.0"?>
<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="https://idp.example.com">
  <md:IDPSSODescriptor protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
    <md:KeyDescriptor use="signing">
      <ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#">
        <ds:X509Data><ds:X509Certificate>{cert}</ds:X509Certificate></ds:X509Data>
      </ds:KeyInfo>
    </md:KeyDescriptor>
    <md:SingleLogoutService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="https://idp.example.com/slo"/>
    <md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="https://idp.example.com/sso/post"/>
    <md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="https://idp.example.com/sso"/>
  </md:IDPSSODescriptor>
</md:EntityDescriptor>"#,
            cert = cert_b64
        )
    }

    #[test]
    fn test_parse_metadata() {
        let metadata = parse_metadata(&metadata_xml()).unwrap();
        assert_eq!(metadata.entity_id, "https://idp.example.com");
        assert_eq!(metadata.sso_url, "https://idp.example.com/sso");
        assert_eq!(metadata.slo_url.as_deref(), Some("https://idp.example.com/slo"));
        assert_eq!(metadata.signing_certificates.len(), 1);
        assert!(metadata.signing_certificates[0]
            .info
            .subject_dn
            .contains("idp.example.com"));
    }

    #[test]
    fn test_metadata_doctype_rejected() {
        let doc = metadata_xml().replacen(
            "<md:EntityDescriptor",
            "<!DOCTYPE m [<!ENTITY x SYSTEM \"file:///etc/passwd\">]><md:EntityDescriptor",
            1,
        );
        assert!(parse_metadata(&doc).is_err());
    }

    #[test]
    fn test_metadata_too_large() {
        let padding = " ".repeat(MAX_METADATA_BYTES);
        let doc = format!("{}{}", metadata_xml(), padding);
        assert!(parse_metadata(&doc).is_err());
    }

    #[tokio::test]
    async fn test_load_from_b64_with_overrides() {
        let config = ProviderConfig {
            id: "okta".to_string(),
            idp_metadata_b64_xml: Some(STANDARD.encode(metadata_xml())),
            idp_sso_url: Some("https://idp.example.com/custom-sso".to_string()),
            ..Default::default()
        };
        let metadata = load_idp_metadata(&config).await.unwrap();
        assert_eq!(metadata.entity_id, "https://idp.example.com");
        assert_eq!(metadata.sso_url, "https://idp.example.com/custom-sso");
    }

    #[tokio::test]
    async fn test_load_direct_config() {
        let config = ProviderConfig {
            id: "okta".to_string(),
            idp_entity_id: Some("https://idp.example.com".to_string()),
            idp_sso_url: Some("https://idp.example.com/sso".to_string()),
            idp_certificate_pem: Some(IDP_CERT.to_string()),
            ..Default::default()
        };
        let metadata = load_idp_metadata(&config).await.unwrap();
        assert_eq!(metadata.entity_id, "https://idp.example.com");
        assert_eq!(metadata.signing_certificates.len(), 1);
        assert!(metadata.slo_url.is_none());
    }

    #[tokio::test]
    async fn test_load_requires_entity_id() {
        let config = ProviderConfig {
            id: "okta".to_string(),
            idp_sso_url: Some("https://idp.example.com/sso".to_string()),
            ..Default::default()
        };
        let err = load_idp_metadata(&config).await.unwrap_err();
        assert!(err.to_string().contains("entity id"));
    }

    #[tokio::test]
    async fn test_load_requires_signing_certificate() {
        let config = ProviderConfig {
            id: "okta".to_string(),
            idp_entity_id: Some("https://idp.example.com".to_string()),
            idp_sso_url: Some("https://idp.example.com/sso".to_string()),
            ..Default::default()
        };
        let err = load_idp_metadata(&config).await.unwrap_err();
        assert!(err.to_string().contains("no signing certificate"));

        let unsigned = ProviderConfig {
            allow_unsigned_assertions: true,
            ..config
        };
        let metadata = load_idp_metadata(&unsigned).await.unwrap();
        assert!(metadata.signing_certificates.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_unreachable_url_fails() {
        let err = fetch_metadata("http://127.0.0.1:1/metadata").await;
        assert!(err.is_err());
    }
}
