//! Resolved user record built from a trusted assertion.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::assertion::Assertion;
use super::attributes::AttributeIndex;
use super::config::ProviderConfig;
use super::fallback::apply_fallbacks;
use super::identity::{resolve_identity, IdType};
use super::mapper::map_attributes;

/// Identity handed to the provisioning and token collaborators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Stable identifier, empty when unresolved.
    pub id: String,
    pub id_type: IdType,
    pub email: String,
    /// True only when the email came from the assertion.
    pub email_verified: bool,
    pub name: String,
    pub given_name: String,
    pub family_name: String,
    /// Provider id the user authenticated with.
    pub identity_provider_id: String,
    /// Group memberships in assertion order.
    pub groups: Vec<String>,
}

/// Run the full extraction pipeline on a validated assertion.
///
/// Never fails: missing attributes degrade to empty fields.
pub fn extract_user_info(assertion: &Assertion, config: &ProviderConfig) -> UserInfo {
    let index = AttributeIndex::from_assertion(assertion);
    let resolved = resolve_identity(assertion, &index);
    let mapped = map_attributes(&index, config);

    let info = UserInfo {
        id: resolved.id,
        id_type: resolved.id_type,
        email: mapped.email,
        email_verified: mapped.email_verified,
        name: mapped.name,
        given_name: mapped.given_name,
        family_name: mapped.family_name,
        identity_provider_id: config.id.clone(),
        groups: mapped.groups,
    };

    let info = apply_fallbacks(info, &index, config);

    debug!(
        provider = %config.id,
        assertion_id = %assertion.id,
        id_type = %info.id_type,
        attributes = index.len(),
        groups = info.groups.len(),
        email_verified = info.email_verified,
        "Extracted SAML user info"
    );

    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::assertion::{Attribute, AttributeStatement, NameId, Subject};
    use crate::saml::config::AttributeMapping;
    use crate::saml::identity::SUBJECT_ID_URN;

    fn okta() -> ProviderConfig {
        ProviderConfig {
            id: "okta".to_string(),
            attribute_mapping: AttributeMapping {
                email: Some("email".to_string()),
                name: Some("displayName".to_string()),
                groups: Some("groups".to_string()),
                ..Default::default()
            },
            group_prefix: Some("tmi-".to_string()),
            ..Default::default()
        }
    }

    fn assertion(attributes: Vec<Attribute>, name_id: Option<&str>) -> Assertion {
        Assertion {
            id: "_assert1".to_string(),
            subject: Some(Subject {
                name_id: name_id.map(|v| NameId {
                    value: v.to_string(),
                    format: None,
                }),
            }),
            attribute_statements: vec![AttributeStatement { attributes }],
            ..Default::default()
        }
    }

    #[test]
    fn test_full_extraction() {
        let a = assertion(
            vec![
                Attribute::new(SUBJECT_ID_URN, &["u-123@example.com"]),
                Attribute::new("email", &["alice@example.com"]),
                Attribute::new("displayName", &["Alice"]),
                Attribute::new("groups", &["tmi-admins", "other", "tmi-users"]),
            ],
            Some("ignored"),
        );

        let info = extract_user_info(&a, &okta());
        assert_eq!(info.id, "u-123@example.com");
        assert_eq!(info.id_type, IdType::SubjectId);
        assert_eq!(info.email, "alice@example.com");
        assert!(info.email_verified);
        assert_eq!(info.name, "Alice");
        assert_eq!(info.identity_provider_id, "okta");
        assert_eq!(info.groups, vec!["tmi-admins", "tmi-users"]);
    }

    #[test]
    fn test_nameid_only_synthesizes_fields() {
        let a = assertion(vec![], Some("alice"));
        let info = extract_user_info(&a, &okta());
        assert_eq!(info.id, "alice");
        assert_eq!(info.id_type, IdType::NameId);
        assert_eq!(info.email, "alice@okta.saml.tmi");
        assert!(!info.email_verified);
        assert_eq!(info.name, "alice");
        assert!(info.groups.is_empty());
    }

    #[test]
    fn test_unresolved_identity_is_not_an_error() {
        let a = assertion(vec![], None);
        let info = extract_user_info(&a, &okta());
        assert_eq!(info.id, "");
        assert_eq!(info.id_type, IdType::Unresolved);
        assert_eq!(info.email, "");
        assert_eq!(info.name, "");
    }

    #[test]
    fn test_json_shape() {
        let info = UserInfo {
            id: "alice".to_string(),
            id_type: IdType::NameId,
            identity_provider_id: "okta".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["id_type"], "nameid");
        assert_eq!(json["identity_provider_id"], "okta");
        assert!(json["groups"].as_array().unwrap().is_empty());
    }
}
