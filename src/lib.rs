//! SAML 2.0 Service Provider identity pipeline for Zentinel.
//!
//! Validates IdP responses, rejects replays and resolves the authenticated
//! user from assertion attributes.

pub mod saml;
pub mod state;
