//! SP key material and IdP certificate loading.
//!
//! All material is decoded and parsed during provider initialization so a
//! broken key or certificate fails that provider instead of a login.

use std::io::Read;

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use tracing::{debug, warn};
use x509_parser::prelude::*;

use super::config::ProviderConfig;

/// Largest PEM document read for a key or certificate.
pub const MAX_PEM_BYTES: usize = 64 * 1024;

/// Parsed certificate details kept for logging and expiry checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject_dn: String,
    pub issuer_dn: String,
    /// Serial number (colon-separated hex).
    pub serial: String,
    /// Not valid before (Unix timestamp).
    pub not_before: i64,
    /// Not valid after (Unix timestamp).
    pub not_after: i64,
}

impl CertificateInfo {
    pub fn is_expired_at(&self, unix_time: i64) -> bool {
        unix_time > self.not_after
    }
}

/// An IdP signing certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdpCertificate {
    pub der: Vec<u8>,
    pub info: CertificateInfo,
}

impl IdpCertificate {
    /// Parse a PEM `CERTIFICATE` block.
    pub fn from_pem(pem: &str) -> Result<Self> {
        Self::from_der(decode_pem(pem, "CERTIFICATE")?)
    }

    /// Parse base64 DER, as found in metadata `X509Certificate` elements.
    pub fn from_base64_der(data: &str) -> Result<Self> {
        let compact: String = data.chars().filter(|c| !c.is_whitespace()).collect();
        let der = STANDARD
            .decode(compact.as_bytes())
            .context("Failed to base64 decode certificate")?;
        Self::from_der(der)
    }

    pub fn from_der(der: Vec<u8>) -> Result<Self> {
        let info = parse_certificate(&der)?;
        Ok(Self { der, info })
    }
}

/// SP private key and certificate.
#[derive(Clone)]
pub struct SpKeyMaterial {
    /// Private key PEM as configured (PKCS#1 or PKCS#8).
    pub private_key_pem: String,
    pub certificate: IdpCertificate,
}

impl std::fmt::Debug for SpKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpKeyMaterial")
            .field("private_key_pem", &"<redacted>")
            .field("certificate", &self.certificate.info.subject_dn)
            .finish()
    }
}

impl SpKeyMaterial {
    /// Load the SP key and certificate from inline PEM or files.
    ///
    /// Inline PEM takes precedence over a path.
    pub fn load(config: &ProviderConfig) -> Result<Self> {
        let private_key_pem = read_pem_source(
            config.sp_private_key_pem.as_deref(),
            config.sp_private_key_path.as_deref(),
            "SP private key",
        )?;
        let certificate_pem = read_pem_source(
            config.sp_certificate_pem.as_deref(),
            config.sp_certificate_path.as_deref(),
            "SP certificate",
        )?;

        // PKCS#1 ("RSA PRIVATE KEY") or PKCS#8 ("PRIVATE KEY")
        decode_pem(&private_key_pem, "RSA PRIVATE KEY")
            .or_else(|_| decode_pem(&private_key_pem, "PRIVATE KEY"))
            .context("Failed to parse SP private key PEM")?;

        let certificate =
            IdpCertificate::from_pem(&certificate_pem).context("Failed to parse SP certificate")?;

        let now = chrono::Utc::now().timestamp();
        if certificate.info.is_expired_at(now) {
            warn!(
                provider = %config.id,
                subject_dn = %certificate.info.subject_dn,
                "SP certificate has expired"
            );
        }

        debug!(
            provider = %config.id,
            subject_dn = %certificate.info.subject_dn,
            serial = %certificate.info.serial,
            "Loaded SP key material"
        );

        Ok(Self {
            private_key_pem,
            certificate,
        })
    }
}

fn read_pem_source(inline: Option<&str>, path: Option<&str>, what: &str) -> Result<String> {
    if let Some(pem) = inline.filter(|p| !p.trim().is_empty()) {
        if pem.len() > MAX_PEM_BYTES {
            bail!("Inline {} exceeds {} bytes", what, MAX_PEM_BYTES);
        }
        return Ok(pem.to_string());
    }
    match path.filter(|p| !p.is_empty()) {
        Some(path) => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("Failed to read {} file: {}", what, path))?;
            let mut pem = String::new();
            file.take(MAX_PEM_BYTES as u64 + 1)
                .read_to_string(&mut pem)
                .with_context(|| format!("Failed to read {} file: {}", what, path))?;
            if pem.len() > MAX_PEM_BYTES {
                bail!("{} file {} exceeds {} bytes", what, path, MAX_PEM_BYTES);
            }
            Ok(pem)
        }
        None => bail!("No {} configured", what),
    }
}

/// Extract the DER bytes of the first PEM block with the given label.
pub fn decode_pem(pem: &str, label: &str) -> Result<Vec<u8>> {
    let begin = format!("-----BEGIN {}-----", label);
    let end = format!("-----END {}-----", label);

    let start = pem
        .find(&begin)
        .ok_or_else(|| anyhow!("Invalid PEM: missing BEGIN {} marker", label))?;
    let body_start = start + begin.len();
    let stop = pem[body_start..]
        .find(&end)
        .map(|i| body_start + i)
        .ok_or_else(|| anyhow!("Invalid PEM: missing END {} marker", label))?;

    let base64_content: String = pem[body_start..stop]
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    STANDARD
        .decode(&base64_content)
        .context("Failed to decode PEM base64 content")
}

/// Parse an X.509 certificate.
pub fn parse_certificate(der_bytes: &[u8]) -> Result<CertificateInfo> {
    let (_, cert) = X509Certificate::from_der(der_bytes)
        .map_err(|e| anyhow!("Failed to parse X.509 certificate: {:?}", e))?;

    let serial = cert
        .serial
        .to_bytes_be()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":");

    Ok(CertificateInfo {
        subject_dn: cert.subject().to_string(),
        issuer_dn: cert.issuer().to_string(),
        serial,
        not_before: cert.validity().not_before.timestamp(),
        not_after: cert.validity().not_after.timestamp(),
    })
}
