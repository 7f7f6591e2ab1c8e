//! Trusted assertion model.
//!
//! The validator converts the library's parsed `Assertion` into these plain
//! types once signature and decryption are done. Everything downstream of the
//! trust boundary works on this model only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A validated SAML assertion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assertion {
    /// Assertion `ID` attribute (used for replay prevention).
    pub id: String,

    /// Issuer entity id.
    pub issuer: Option<String>,

    /// When the IdP issued the assertion.
    pub issue_instant: Option<DateTime<Utc>>,

    /// `InResponseTo` of the enclosing Response, set by the validator.
    pub in_response_to: Option<String>,

    /// Subject of the assertion.
    pub subject: Option<Subject>,

    /// Validity window and audience restrictions.
    pub conditions: Option<Conditions>,

    /// Session index from the first AuthnStatement (for Single Logout).
    pub session_index: Option<String>,

    /// Attribute statements in document order.
    pub attribute_statements: Vec<AttributeStatement>,
}

/// Assertion subject.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub name_id: Option<NameId>,
}

/// Subject NameID.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameId {
    pub value: String,
    pub format: Option<String>,
}

/// Assertion conditions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conditions {
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    /// One entry per `AudienceRestriction`; each must name this SP.
    pub audience_restrictions: Vec<Vec<String>>,
}

/// A single `AttributeStatement`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeStatement {
    pub attributes: Vec<Attribute>,
}

/// A single attribute with its values in source order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    /// Technical name (often a URN or OID).
    pub name: String,
    /// Human-readable alias.
    pub friendly_name: Option<String>,
    pub values: Vec<String>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, values: &[&str]) -> Self {
        Self {
            name: name.into(),
            friendly_name: None,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn with_friendly_name(mut self, friendly_name: impl Into<String>) -> Self {
        self.friendly_name = Some(friendly_name.into());
        self
    }
}

impl Assertion {
    /// NameID value of the subject, if both are present.
    pub fn name_id(&self) -> Option<&NameId> {
        self.subject.as_ref().and_then(|s| s.name_id.as_ref())
    }
}

impl From<&samael::schema::Assertion> for Assertion {
    fn from(assertion: &samael::schema::Assertion) -> Self {
        let subject = assertion.subject.as_ref().map(|subject| Subject {
            name_id: subject.name_id.as_ref().map(|name_id| NameId {
                value: name_id.value.clone(),
                format: name_id.format.clone(),
            }),
        });

        let conditions = assertion.conditions.as_ref().map(|conditions| Conditions {
            not_before: conditions.not_before,
            not_on_or_after: conditions.not_on_or_after,
            audience_restrictions: conditions
                .audience_restrictions
                .as_ref()
                .map(|restrictions| {
                    restrictions
                        .iter()
                        .map(|r| r.audience.clone())
                        .collect()
                })
                .unwrap_or_default(),
        });

        let session_index = assertion
            .authn_statements
            .as_ref()
            .and_then(|stmts| stmts.first())
            .and_then(|s| s.session_index.clone());

        // Empty <AttributeValue/> elements keep their position as "".
        let attribute_statements = assertion
            .attribute_statements
            .as_ref()
            .map(|stmts| {
                stmts
                    .iter()
                    .map(|stmt| AttributeStatement {
                        attributes: stmt
                            .attributes
                            .iter()
                            .map(|attr| Attribute {
                                name: attr.name.clone().unwrap_or_default(),
                                friendly_name: attr.friendly_name.clone(),
                                values: attr
                                    .values
                                    .iter()
                                    .map(|v| v.value.clone().unwrap_or_default())
                                    .collect(),
                            })
                            .collect(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            id: assertion.id.clone(),
            issuer: assertion.issuer.value.clone(),
            issue_instant: Some(assertion.issue_instant),
            in_response_to: None,
            subject,
            conditions,
            session_index,
            attribute_statements,
        }
    }
}
