//! Stable user identifier resolution.
//!
//! Priority: subject-id, then pairwise-id, then the subject NameID. Each
//! attribute step is checked under its URN and its short name.

use serde::{Deserialize, Serialize};

use super::assertion::Assertion;
use super::attributes::AttributeIndex;

pub const SUBJECT_ID_URN: &str = "urn:oasis:names:tc:SAML:attribute:subject-id";
pub const SUBJECT_ID: &str = "subject-id";
pub const PAIRWISE_ID_URN: &str = "urn:oasis:names:tc:SAML:attribute:pairwise-id";
pub const PAIRWISE_ID: &str = "pairwise-id";

/// Where the resolved identifier came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdType {
    #[serde(rename = "subject-id")]
    SubjectId,
    #[serde(rename = "pairwise-id")]
    PairwiseId,
    #[serde(rename = "nameid")]
    NameId,
    /// No stable identifier could be extracted.
    #[default]
    #[serde(rename = "")]
    Unresolved,
}

impl IdType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdType::SubjectId => "subject-id",
            IdType::PairwiseId => "pairwise-id",
            IdType::NameId => "nameid",
            IdType::Unresolved => "",
        }
    }
}

impl std::fmt::Display for IdType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier chosen for the user and its provenance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedId {
    pub id: String,
    pub id_type: IdType,
}

impl ResolvedId {
    pub fn is_resolved(&self) -> bool {
        self.id_type != IdType::Unresolved
    }
}

type ResolveStep = fn(&Assertion, &AttributeIndex) -> Option<ResolvedId>;

/// Resolution steps in priority order.
const STEPS: &[ResolveStep] = &[from_subject_id, from_pairwise_id, from_name_id];

/// Resolve the stable identifier. An unresolved result is not an error.
pub fn resolve_identity(assertion: &Assertion, index: &AttributeIndex) -> ResolvedId {
    STEPS
        .iter()
        .find_map(|step| step(assertion, index))
        .unwrap_or_default()
}

fn from_attribute(index: &AttributeIndex, names: &[&str], id_type: IdType) -> Option<ResolvedId> {
    names.iter().find_map(|name| {
        index.first(name).map(|value| ResolvedId {
            id: value.to_string(),
            id_type,
        })
    })
}

fn from_subject_id(_assertion: &Assertion, index: &AttributeIndex) -> Option<ResolvedId> {
    from_attribute(index, &[SUBJECT_ID_URN, SUBJECT_ID], IdType::SubjectId)
}

fn from_pairwise_id(_assertion: &Assertion, index: &AttributeIndex) -> Option<ResolvedId> {
    from_attribute(index, &[PAIRWISE_ID_URN, PAIRWISE_ID], IdType::PairwiseId)
}

fn from_name_id(assertion: &Assertion, _index: &AttributeIndex) -> Option<ResolvedId> {
    assertion.name_id().map(|name_id| ResolvedId {
        id: name_id.value.clone(),
        id_type: IdType::NameId,
    })
}
