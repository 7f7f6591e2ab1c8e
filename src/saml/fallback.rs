//! Fallbacks for fields the attribute mapping left empty.
//!
//! Steps run in order and never overwrite a populated field. The email step
//! depends on the resolved id, and the name step depends on the email.

use super::attributes::AttributeIndex;
use super::config::ProviderConfig;
use super::mapper::lookup_groups;
use super::user_info::UserInfo;

/// Domain suffix for emails synthesized from a bare identifier.
pub const SYNTHETIC_EMAIL_DOMAIN: &str = "saml.tmi";

type FallbackStep = fn(&mut UserInfo, &AttributeIndex, &ProviderConfig);

const STEPS: &[FallbackStep] = &[group_fallback, email_fallback, name_fallback];

/// Fill missing groups, email and name.
pub fn apply_fallbacks(
    mut info: UserInfo,
    index: &AttributeIndex,
    config: &ProviderConfig,
) -> UserInfo {
    for step in STEPS {
        step(&mut info, index, config);
    }
    info
}

/// Read groups from the raw group attribute when the mapping produced none.
fn group_fallback(info: &mut UserInfo, index: &AttributeIndex, config: &ProviderConfig) {
    if !info.groups.is_empty() {
        return;
    }
    if let Some(groups) = config
        .group_attribute_name()
        .and_then(|name| lookup_groups(index, name, config.group_prefix()))
    {
        info.groups = groups;
    }
}

/// Derive an email from the resolved id. The result is never verified.
fn email_fallback(info: &mut UserInfo, _index: &AttributeIndex, config: &ProviderConfig) {
    if !info.email.is_empty() || info.id.is_empty() {
        return;
    }
    info.email = synthesize_email(&info.id, &config.id);
    info.email_verified = false;
}

/// Use the local part of the email as the display name.
fn name_fallback(info: &mut UserInfo, _index: &AttributeIndex, _config: &ProviderConfig) {
    if !info.name.is_empty() || info.email.is_empty() {
        return;
    }
    info.name = local_part(&info.email).to_string();
}

/// `id` if it already looks like an email, else `id@<provider>.saml.tmi`.
pub fn synthesize_email(id: &str, provider_id: &str) -> String {
    if id.contains('@') {
        id.to_string()
    } else {
        format!("{}@{}.{}", id, provider_id, SYNTHETIC_EMAIL_DOMAIN)
    }
}

fn local_part(email: &str) -> &str {
    email.split('@').next().unwrap_or(email)
}
