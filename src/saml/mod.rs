//! SAML 2.0 Service Provider.
//!
//! Raw IdP responses are validated into a trusted `Assertion`, which is then
//! resolved into a `UserInfo`: stable id, mapped attributes, fallbacks.

pub mod acs;
pub mod assertion;
pub mod attributes;
pub mod config;
pub mod encryption;
pub mod envelope;
pub mod error;
pub mod fallback;
pub mod identity;
pub mod keys;
pub mod logout;
pub mod mapper;
pub mod metadata;
pub mod provider;
pub mod registry;
pub mod signature;
pub mod user_info;
pub mod validator;
pub mod xml;

pub use acs::{AcsOutcome, LoginRedirect, LogoutOutcome, SamlService, TokenIssuer, User, UserProvisioner};
pub use assertion::Assertion;
pub use config::{AttributeMapping, ProviderConfig, SamlConfig};
pub use error::{AcsError, RegistryError, TrustFailure};
pub use identity::IdType;
pub use metadata::IdpMetadata;
pub use provider::{ProcessedAssertion, SamlProvider};
pub use registry::ProviderRegistry;
pub use signature::ResponseVerifier;
pub use user_info::{extract_user_info, UserInfo};
pub use validator::{AssertionValidator, ResponseValidator};
