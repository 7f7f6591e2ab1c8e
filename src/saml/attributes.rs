//! Attribute index built from an assertion's attribute statements.

use std::collections::HashMap;

use super::assertion::Assertion;

/// Attribute name -> values, keyed by both technical and friendly name.
///
/// Built once per assertion and never mutated afterwards. When an attribute
/// carries a friendly name, both keys resolve to the same value sequence.
/// If the same key appears in more than one attribute (or statement), the
/// later one wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeIndex {
    entries: HashMap<String, Vec<String>>,
}

impl AttributeIndex {
    /// Index every attribute of every statement in document order.
    pub fn from_assertion(assertion: &Assertion) -> Self {
        let mut entries = HashMap::new();

        for stmt in &assertion.attribute_statements {
            for attr in &stmt.attributes {
                if !attr.name.is_empty() {
                    entries.insert(attr.name.clone(), attr.values.clone());
                }
                if let Some(friendly) = attr.friendly_name.as_deref().filter(|f| !f.is_empty()) {
                    entries.insert(friendly.to_string(), attr.values.clone());
                }
            }
        }

        Self { entries }
    }

    /// All values for an attribute, if present.
    pub fn values(&self, name: &str) -> Option<&[String]> {
        self.entries.get(name).map(|v| v.as_slice())
    }

    /// First value of an attribute, ignoring absent or empty values.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.values(name)
            .and_then(|values| values.first())
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Number of distinct keys (technical and friendly names).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}
