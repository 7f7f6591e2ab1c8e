//! Projection of IdP attributes onto logical user fields.
//!
//! Email verification trust assumption: an email taken from a validated,
//! signed assertion is treated as proof that the user controls the mailbox,
//! so `email_verified` is set. An IdP that asserts unverified addresses can
//! therefore take over accounts that are matched by email. Only enable a
//! provider whose email attribute is authoritative.

use super::attributes::AttributeIndex;
use super::config::{MappedField, ProviderConfig};

/// Fields populated from the configured attribute mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappedAttributes {
    pub email: String,
    pub email_verified: bool,
    pub name: String,
    pub given_name: String,
    pub family_name: String,
    pub groups: Vec<String>,
}

/// Map configured attributes to user fields.
///
/// Unmapped fields and mapped attributes missing from the index stay empty.
pub fn map_attributes(index: &AttributeIndex, config: &ProviderConfig) -> MappedAttributes {
    let mapping = &config.attribute_mapping;
    let scalar = |field: MappedField| -> String {
        mapping
            .get(field)
            .and_then(|attr| index.first(attr))
            .map(str::to_string)
            .unwrap_or_default()
    };

    let email = scalar(MappedField::Email);
    let email_verified = !email.is_empty();

    let groups = mapping
        .get(MappedField::Groups)
        .and_then(|attr| lookup_groups(index, attr, config.group_prefix()))
        .unwrap_or_default();

    MappedAttributes {
        email,
        email_verified,
        name: scalar(MappedField::Name),
        given_name: scalar(MappedField::GivenName),
        family_name: scalar(MappedField::FamilyName),
        groups,
    }
}

/// Look up a group attribute and apply the prefix filter.
pub fn lookup_groups(
    index: &AttributeIndex,
    attribute: &str,
    prefix: Option<&str>,
) -> Option<Vec<String>> {
    index.values(attribute).map(|values| filter_groups(values, prefix))
}

/// Keep groups that start with `prefix` (case-sensitive). No prefix keeps all.
pub fn filter_groups(groups: &[String], prefix: Option<&str>) -> Vec<String> {
    match prefix.filter(|p| !p.is_empty()) {
        Some(prefix) => groups
            .iter()
            .filter(|g| g.starts_with(prefix))
            .cloned()
            .collect(),
        None => groups.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::assertion::{Assertion, Attribute, AttributeStatement};
    use crate::saml::config::AttributeMapping;
    use proptest::prelude::*;

    fn index(attributes: Vec<Attribute>) -> AttributeIndex {
        AttributeIndex::from_assertion(&Assertion {
            attribute_statements: vec![AttributeStatement { attributes }],
            ..Default::default()
        })
    }

    fn config(mapping: AttributeMapping, prefix: Option<&str>) -> ProviderConfig {
        ProviderConfig {
            id: "okta".to_string(),
            attribute_mapping: mapping,
            group_prefix: prefix.map(str::to_string),
            ..Default::default()
        }
    }

    fn full_mapping() -> AttributeMapping {
        AttributeMapping {
            email: Some("mail".to_string()),
            name: Some("displayName".to_string()),
            given_name: Some("givenName".to_string()),
            family_name: Some("sn".to_string()),
            groups: Some("memberOf".to_string()),
        }
    }

    #[test]
    fn test_maps_all_fields() {
        let idx = index(vec![
            Attribute::new("mail", &["alice@example.com", "alias@example.com"]),
            Attribute::new("displayName", &["Alice Doe"]),
            Attribute::new("givenName", &["Alice"]),
            Attribute::new("sn", &["Doe"]),
            Attribute::new("memberOf", &["eng", "ops"]),
        ]);

        let mapped = map_attributes(&idx, &config(full_mapping(), None));
        assert_eq!(mapped.email, "alice@example.com");
        assert!(mapped.email_verified);
        assert_eq!(mapped.name, "Alice Doe");
        assert_eq!(mapped.given_name, "Alice");
        assert_eq!(mapped.family_name, "Doe");
        assert_eq!(mapped.groups, vec!["eng", "ops"]);
    }

    #[test]
    fn test_missing_attributes_stay_empty() {
        let idx = index(vec![Attribute::new("mail", &[])]);
        let mapped = map_attributes(&idx, &config(full_mapping(), None));
        assert_eq!(mapped, MappedAttributes::default());
        assert!(!mapped.email_verified);
    }

    #[test]
    fn test_no_mapping() {
        let idx = index(vec![Attribute::new("mail", &["alice@example.com"])]);
        let mapped = map_attributes(&idx, &config(AttributeMapping::default(), None));
        assert!(mapped.email.is_empty());
        assert!(!mapped.email_verified);
    }

    #[test]
    fn test_mapping_by_technical_name_finds_friendly_alias() {
        let idx = index(vec![
            Attribute::new("urn:oid:0.9.2342.19200300.100.1.3", &["bob@example.com"]).with_friendly_name("mail"),
        ]);
        let mapping = AttributeMapping {
            email: Some("urn:oid:0.9.2342.19200300.100.1.3".to_string()),
            ..Default::default()
        };
        assert_eq!(map_attributes(&idx, &config(mapping, None)).email, "bob@example.com");

        let mapping = AttributeMapping {
            email: Some("mail".to_string()),
            ..Default::default()
        };
        assert_eq!(map_attributes(&idx, &config(mapping, None)).email, "bob@example.com");
    }

    #[test]
    fn test_group_prefix_filter() {
        let idx = index(vec![Attribute::new(
            "memberOf",
            &["app-admins", "App-users", "staff", "app-readers"],
        )]);
        let mapped = map_attributes(&idx, &config(full_mapping(), Some("app-")));
        assert_eq!(mapped.groups, vec!["app-admins", "app-readers"]);
    }

    #[test]
    fn test_filter_groups_without_prefix_preserves_order() {
        let groups = vec!["b".to_string(), "a".to_string(), "b".to_string()];
        assert_eq!(filter_groups(&groups, None), groups);
        assert_eq!(filter_groups(&groups, Some("")), groups);
    }

    #[test]
    fn test_filter_groups_is_not_a_wildcard() {
        let groups = vec!["app-*".to_string(), "app-x".to_string()];
        assert_eq!(filter_groups(&groups, Some("app-*")), vec!["app-*"]);
    }

    proptest! {
        #[test]
        fn prop_filter_groups_idempotent(
            groups in prop::collection::vec("[a-c-]{0,6}", 0..10),
            prefix in prop::option::of("[a-c-]{0,3}"),
        ) {
            let once = filter_groups(&groups, prefix.as_deref());
            let twice = filter_groups(&once, prefix.as_deref());
            prop_assert_eq!(once, twice);
        }
    }
}
