//! SAML Service Provider configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Default ceiling for a decoded SAML response body.
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 256 * 1024;

/// Top-level SAML configuration: one entry per IdP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SamlConfig {
    /// Enable SAML authentication.
    #[serde(default)]
    pub enabled: bool,

    /// Providers keyed by IdP id (e.g. "okta", "entra").
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,

    /// Relay state store path (redb database file).
    #[serde(default = "default_state_store_path")]
    pub state_store_path: String,

    /// Relay state lifetime in seconds.
    #[serde(default = "default_relay_state_ttl")]
    pub relay_state_ttl_secs: u64,

    /// Cleanup interval in seconds.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

/// Per-IdP configuration. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// IdP id. Filled from the map key when loaded through `SamlConfig`.
    #[serde(default)]
    pub id: String,

    /// Display name.
    #[serde(default)]
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// SP Entity ID (unique identifier for this service provider).
    #[serde(default)]
    pub entity_id: String,

    /// Assertion Consumer Service URL (where IdP posts SAML response).
    #[serde(default)]
    pub acs_url: String,

    /// Single Logout Service URL (optional).
    #[serde(default)]
    pub slo_url: Option<String>,

    /// IdP metadata URL (fetched once at initialization).
    #[serde(default)]
    pub idp_metadata_url: Option<String>,

    /// IdP metadata XML, base64 encoded (avoids shell quoting of namespace prefixes).
    #[serde(default)]
    pub idp_metadata_b64_xml: Option<String>,

    /// IdP metadata XML (inline).
    #[serde(default)]
    pub idp_metadata_xml: Option<String>,

    /// IdP SSO URL (direct configuration, alternative to metadata).
    #[serde(default)]
    pub idp_sso_url: Option<String>,

    /// IdP Entity ID (direct configuration).
    #[serde(default)]
    pub idp_entity_id: Option<String>,

    /// IdP signing certificate (PEM), used with direct configuration.
    #[serde(default)]
    pub idp_certificate_pem: Option<String>,

    /// SP private key (PEM format, for signing requests/decrypting assertions).
    #[serde(default)]
    pub sp_private_key_pem: Option<String>,

    /// SP private key file.
    #[serde(default)]
    pub sp_private_key_path: Option<String>,

    /// SP certificate (PEM format).
    #[serde(default)]
    pub sp_certificate_pem: Option<String>,

    /// SP certificate file.
    #[serde(default)]
    pub sp_certificate_path: Option<String>,

    /// Allow unsigned responses (NOT recommended for production).
    #[serde(default)]
    pub allow_unsigned_assertions: bool,

    /// Accept responses that were not solicited by an AuthnRequest.
    #[serde(default)]
    pub allow_idp_initiated: bool,

    /// Ask the IdP to re-authenticate the user.
    #[serde(default)]
    pub force_authn: bool,

    /// NameID format to request (optional).
    /// e.g., "urn:oasis:names:tc:SAML:2.0:nameid-format:persistent"
    #[serde(default)]
    pub name_id_format: Option<String>,

    /// Logical field -> IdP attribute name.
    #[serde(default)]
    pub attribute_mapping: AttributeMapping,

    /// Raw attribute name to read groups from when the mapping yields none.
    #[serde(default)]
    pub group_attribute_name: Option<String>,

    /// Keep only groups starting with this prefix.
    #[serde(default)]
    pub group_prefix: Option<String>,

    /// Clock skew tolerance in seconds.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: i64,

    /// Maximum decoded response size in bytes.
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,

    /// Maximum age of an assertion's IssueInstant in seconds, on top of the
    /// clock skew. Bounds assertions that carry no NotOnOrAfter.
    #[serde(default = "default_max_issue_delay")]
    pub max_issue_delay_secs: i64,
}

/// Logical user fields an IdP attribute can be mapped onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappedField {
    Email,
    Name,
    GivenName,
    FamilyName,
    Groups,
}

/// Per-IdP attribute names for each logical field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttributeMapping {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub given_name: Option<String>,
    #[serde(default)]
    pub family_name: Option<String>,
    #[serde(default)]
    pub groups: Option<String>,
}

impl AttributeMapping {
    /// Configured attribute name for a field. Blank names count as unmapped.
    pub fn get(&self, field: MappedField) -> Option<&str> {
        let name = match field {
            MappedField::Email => &self.email,
            MappedField::Name => &self.name,
            MappedField::GivenName => &self.given_name,
            MappedField::FamilyName => &self.family_name,
            MappedField::Groups => &self.groups,
        };
        name.as_deref().filter(|n| !n.trim().is_empty())
    }

    pub fn is_empty(&self) -> bool {
        [
            MappedField::Email,
            MappedField::Name,
            MappedField::GivenName,
            MappedField::FamilyName,
            MappedField::Groups,
        ]
        .iter()
        .all(|f| self.get(*f).is_none())
    }
}

fn default_true() -> bool {
    true
}

fn default_clock_skew() -> i64 {
    300 // 5 minutes
}

fn default_max_issue_delay() -> i64 {
    90
}

fn default_max_response_bytes() -> usize {
    DEFAULT_MAX_RESPONSE_BYTES
}

fn default_state_store_path() -> String {
    "/var/lib/zentinel-saml/state.redb".to_string()
}

fn default_relay_state_ttl() -> u64 {
    10 * 60 // 10 minutes
}

fn default_cleanup_interval() -> u64 {
    300 // 5 minutes
}

impl Default for SamlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            providers: BTreeMap::new(),
            state_store_path: default_state_store_path(),
            relay_state_ttl_secs: default_relay_state_ttl(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            enabled: true,
            entity_id: String::new(),
            acs_url: String::new(),
            slo_url: None,
            idp_metadata_url: None,
            idp_metadata_b64_xml: None,
            idp_metadata_xml: None,
            idp_sso_url: None,
            idp_entity_id: None,
            idp_certificate_pem: None,
            sp_private_key_pem: None,
            sp_private_key_path: None,
            sp_certificate_pem: None,
            sp_certificate_path: None,
            allow_unsigned_assertions: false,
            allow_idp_initiated: false,
            force_authn: false,
            name_id_format: None,
            attribute_mapping: AttributeMapping::default(),
            group_attribute_name: None,
            group_prefix: None,
            clock_skew_secs: default_clock_skew(),
            max_response_bytes: default_max_response_bytes(),
            max_issue_delay_secs: default_max_issue_delay(),
        }
    }
}

impl SamlConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read SAML config: {:?}", path))?;
        Self::from_json(&raw).with_context(|| format!("Invalid SAML config: {:?}", path))
    }

    /// Parse configuration from JSON, filling each provider's id from its key.
    pub fn from_json(raw: &str) -> Result<Self> {
        let mut config: SamlConfig =
            serde_json::from_str(raw).context("Failed to parse SAML config JSON")?;
        for (id, provider) in config.providers.iter_mut() {
            if provider.id.is_empty() {
                provider.id = id.clone();
            }
        }
        Ok(config)
    }

    /// Providers that are switched on.
    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.values().filter(|p| p.enabled)
    }
}

impl ProviderConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("SAML provider id is required".to_string());
        }

        if self.entity_id.is_empty() {
            return Err(format!("SAML provider {}: entity_id is required", self.id));
        }

        if self.acs_url.is_empty() {
            return Err(format!("SAML provider {}: acs_url is required", self.id));
        }

        // Must have either metadata or direct IdP config
        let has_metadata = self.idp_metadata_url.is_some()
            || self.idp_metadata_b64_xml.is_some()
            || self.idp_metadata_xml.is_some();
        let has_direct_config = self.idp_sso_url.is_some() && self.idp_entity_id.is_some();

        if !has_metadata && !has_direct_config {
            return Err(format!(
                "SAML provider {}: requires idp_metadata_url, idp_metadata_b64_xml, idp_metadata_xml or idp_sso_url+idp_entity_id",
                self.id
            ));
        }

        if self.sp_private_key_pem.is_none() && self.sp_private_key_path.is_none() {
            return Err(format!("SAML provider {}: no SP private key configured", self.id));
        }

        if self.sp_certificate_pem.is_none() && self.sp_certificate_path.is_none() {
            return Err(format!("SAML provider {}: no SP certificate configured", self.id));
        }

        if self.clock_skew_secs < 0 {
            return Err(format!("SAML provider {}: clock_skew_secs must not be negative", self.id));
        }

        if self.max_response_bytes == 0 {
            return Err(format!("SAML provider {}: max_response_bytes must be positive", self.id));
        }

        if self.max_issue_delay_secs <= 0 {
            return Err(format!("SAML provider {}: max_issue_delay_secs must be positive", self.id));
        }

        Ok(())
    }

    /// Group prefix filter, if one is set.
    pub fn group_prefix(&self) -> Option<&str> {
        self.group_prefix.as_deref().filter(|p| !p.is_empty())
    }

    /// Fallback group attribute name, if one is set.
    pub fn group_attribute_name(&self) -> Option<&str> {
        self.group_attribute_name.as_deref().filter(|n| !n.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_provider() -> ProviderConfig {
        ProviderConfig {
            id: "okta".to_string(),
            entity_id: "https://sp.example.com".to_string(),
            acs_url: "https://sp.example.com/saml/acs".to_string(),
            idp_sso_url: Some("https://idp.example.com/sso".to_string()),
            idp_entity_id: Some("https://idp.example.com".to_string()),
            sp_private_key_pem: Some("key".to_string()),
            sp_certificate_pem: Some("cert".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = SamlConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.relay_state_ttl_secs, 600);
        let provider = ProviderConfig::default();
        assert!(provider.enabled);
        assert_eq!(provider.clock_skew_secs, 300);
        assert_eq!(provider.max_response_bytes, DEFAULT_MAX_RESPONSE_BYTES);
        assert_eq!(provider.max_issue_delay_secs, 90);
    }

    #[test]
    fn test_validation() {
        let mut config = ProviderConfig {
            id: "okta".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err()); // missing entity_id

        config.entity_id = "https://sp.example.com".to_string();
        assert!(config.validate().is_err()); // missing acs_url

        config.acs_url = "https://sp.example.com/saml/acs".to_string();
        assert!(config.validate().is_err()); // missing IdP config

        config.idp_metadata_url = Some("https://idp.example.com/metadata".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.contains("private key"));

        config.sp_private_key_path = Some("/etc/saml/sp.key".to_string());
        config.sp_certificate_path = Some("/etc/saml/sp.crt".to_string());
        assert!(config.validate().is_ok());

        assert!(valid_provider().validate().is_ok());

        let err = ProviderConfig {
            max_issue_delay_secs: 0,
            ..valid_provider()
        }
        .validate()
        .unwrap_err();
        assert!(err.contains("max_issue_delay_secs"));
    }

    #[test]
    fn test_from_json_fills_ids() {
        let raw = r#"{
            "enabled": true,
            "providers": {
                "okta": {
                    "entity_id": "https://sp.example.com",
                    "acs_url": "https://sp.example.com/saml/acs",
                    "idp_metadata_url": "https://okta.example.com/metadata",
                    "attribute_mapping": {"email": "mail", "groups": "memberOf"},
                    "group_prefix": "app-"
                }
            }
        }"#;

        let config = SamlConfig::from_json(raw).unwrap();
        let okta = &config.providers["okta"];
        assert_eq!(okta.id, "okta");
        assert_eq!(okta.attribute_mapping.get(MappedField::Email), Some("mail"));
        assert_eq!(okta.attribute_mapping.get(MappedField::Name), None);
        assert_eq!(okta.group_prefix(), Some("app-"));
        assert_eq!(config.enabled_providers().count(), 1);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let raw = r#"{"providers": {"x": {"entity_idd": "typo"}}}"#;
        assert!(SamlConfig::from_json(raw).is_err());
    }

    #[test]
    fn test_blank_mapping_is_unmapped() {
        let mapping = AttributeMapping {
            email: Some("  ".to_string()),
            ..Default::default()
        };
        assert_eq!(mapping.get(MappedField::Email), None);
        assert!(mapping.is_empty());
    }

    #[test]
    fn test_empty_prefix_is_none() {
        let config = ProviderConfig {
            group_prefix: Some(String::new()),
            group_attribute_name: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(config.group_prefix(), None);
        assert_eq!(config.group_attribute_name(), None);
    }
}
