//! Login initiation, assertion consumer and logout orchestration.
//!
//! User persistence and token issuance are collaborators behind traits; this
//! module only decides what to call and in which order.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::error::AcsError;
use super::logout::{self, LogoutRequest};
use super::provider::SamlProvider;
use super::registry::ProviderRegistry;
use super::user_info::UserInfo;
use crate::state::{RelayState, RelayToken, StateStore};

/// A user record as returned by the provisioning collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub identity_provider_id: String,
}

/// Creates or updates the local user for a resolved identity.
#[async_trait]
pub trait UserProvisioner: Send + Sync {
    async fn provision(&self, provider_id: &str, info: &UserInfo) -> anyhow::Result<User>;
}

/// Issues the session token handed back to the client.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self, user: &User, info: &UserInfo) -> anyhow::Result<String>;
}

/// Where to send the browser to start a login.
#[derive(Debug, Clone)]
pub struct LoginRedirect {
    pub redirect_url: String,
    pub relay_state: RelayToken,
}

/// Result of a successful assertion consumer request.
#[derive(Debug, Clone)]
pub struct AcsOutcome {
    pub user: User,
    pub user_info: UserInfo,
    pub access_token: String,
    /// Client callback remembered at login, if the relay state was redeemed.
    pub callback_url: Option<String>,
    pub relay_state: Option<String>,
}

/// JSON body returned when there is no callback to redirect to.
#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse<'a> {
    pub access_token: &'a str,
    pub token_type: &'static str,
    pub user: TokenResponseUser<'a>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenResponseUser<'a> {
    pub id: &'a str,
    pub email: &'a str,
    pub name: &'a str,
    pub idp: &'a str,
    pub groups: &'a [String],
}

impl AcsOutcome {
    /// Callback URL carrying the token, or `None` without a callback.
    pub fn redirect_url(&self) -> Option<String> {
        let callback = self.callback_url.as_deref()?;
        let mut params = vec![
            ("access_token", self.access_token.as_str()),
            ("token_type", "Bearer"),
        ];
        if let Some(state) = self.relay_state.as_deref() {
            params.push(("state", state));
        }
        Some(append_query(callback, &params))
    }

    pub fn token_response(&self) -> TokenResponse<'_> {
        TokenResponse {
            access_token: &self.access_token,
            token_type: "Bearer",
            user: TokenResponseUser {
                id: &self.user.id,
                email: &self.user.email,
                name: &self.user.name,
                idp: &self.user_info.identity_provider_id,
                groups: &self.user_info.groups,
            },
        }
    }
}

/// Result of an IdP-initiated logout.
#[derive(Debug, Clone)]
pub struct LogoutOutcome {
    pub request: LogoutRequest,
    /// Base64 LogoutResponse to return to the IdP.
    pub saml_response: String,
    pub idp_slo_url: Option<String>,
}

/// SAML flows over a provider registry and state store.
pub struct SamlService {
    registry: Arc<ProviderRegistry>,
    store: Arc<StateStore>,
    provisioner: Arc<dyn UserProvisioner>,
    tokens: Arc<dyn TokenIssuer>,
}

impl SamlService {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<StateStore>,
        provisioner: Arc<dyn UserProvisioner>,
        tokens: Arc<dyn TokenIssuer>,
    ) -> Self {
        Self {
            registry,
            store,
            provisioner,
            tokens,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    fn provider(&self, provider_id: &str) -> Result<Arc<SamlProvider>, AcsError> {
        self.registry
            .get(provider_id)
            .ok_or_else(|| AcsError::UnknownProvider(provider_id.to_string()))
    }

    /// Start an SP-initiated login.
    pub fn initiate_login(
        &self,
        provider_id: &str,
        callback_url: Option<String>,
    ) -> Result<LoginRedirect, AcsError> {
        let provider = self.provider(provider_id)?;

        let mut state = RelayState::new(provider_id, callback_url, self.store.default_ttl_secs());
        let redirect = provider
            .create_authn_request(Some(&state.token.to_hex()))
            .map_err(AcsError::Internal)?;
        state.request_id = Some(redirect.request_id);
        self.store.put_relay_state(&state).map_err(AcsError::Store)?;

        debug!(provider = %provider_id, has_callback = state.callback_url.is_some(), "SAML login initiated");

        Ok(LoginRedirect {
            redirect_url: redirect.url,
            relay_state: state.token,
        })
    }

    /// Consume a posted SAML response.
    ///
    /// Order: look up relay state, validate (binding `InResponseTo` to the
    /// AuthnRequest the relay state was issued for), replay check, extract,
    /// redeem relay state, provision, issue token. An unknown or expired relay
    /// state only means there is no callback URL and no outstanding request.
    pub async fn handle_acs(
        &self,
        provider_id: &str,
        saml_response: &str,
        relay_state: Option<&str>,
        expected_destination: Option<&str>,
    ) -> Result<AcsOutcome, AcsError> {
        let provider = self.provider(provider_id)?;
        let relay_state = relay_state.filter(|r| !r.is_empty());

        if relay_state.is_none() && !provider.config().allow_idp_initiated {
            warn!(provider = %provider_id, "Rejecting SAML response without RelayState");
            return Err(AcsError::Unsolicited(provider_id.to_string()));
        }

        let pending = match relay_state {
            Some(raw) => self.pending_relay_state(provider_id, raw)?,
            None => None,
        };
        let expected_request_id = pending.as_ref().and_then(|s| s.request_id.as_deref());

        let processed = provider.process_response(
            saml_response,
            expected_destination,
            expected_request_id,
            &self.store,
        )?;

        let callback_url = match pending {
            Some(state) => self.redeem_relay_state(provider_id, &state)?,
            None => None,
        };

        let user_info = processed.user_info;
        let user = self
            .provisioner
            .provision(provider_id, &user_info)
            .await
            .map_err(|e| {
                error!(provider = %provider_id, error = %e, "SAML user provisioning failed");
                AcsError::Provisioning(e)
            })?;

        let access_token = self.tokens.issue(&user, &user_info).await.map_err(|e| {
            error!(provider = %provider_id, error = %e, "SAML token issuance failed");
            AcsError::TokenIssuance(e)
        })?;

        info!(
            provider = %provider_id,
            user_id = %user.id,
            groups = user_info.groups.len(),
            "SAML login completed"
        );

        Ok(AcsOutcome {
            user,
            user_info,
            access_token,
            callback_url,
            relay_state: relay_state.map(str::to_string),
        })
    }

    /// Relay state issued by this SP for `provider_id`, without consuming it.
    fn pending_relay_state(&self, provider_id: &str, raw: &str) -> Result<Option<RelayState>, AcsError> {
        let Some(token) = RelayToken::from_hex(raw) else {
            debug!(provider = %provider_id, "RelayState is not one of ours");
            return Ok(None);
        };

        match self.store.get_relay_state(&token).map_err(AcsError::Store)? {
            Some(state) if state.provider_id == provider_id => Ok(Some(state)),
            Some(state) => {
                warn!(
                    provider = %provider_id,
                    issued_for = %state.provider_id,
                    "RelayState was issued for another provider"
                );
                Ok(None)
            }
            None => {
                debug!(provider = %provider_id, "RelayState unknown or expired");
                Ok(None)
            }
        }
    }

    /// Consume the relay state once its response has been accepted.
    fn redeem_relay_state(&self, provider_id: &str, state: &RelayState) -> Result<Option<String>, AcsError> {
        match self.store.take_relay_state(&state.token).map_err(AcsError::Store)? {
            Some(taken) => Ok(taken.callback_url),
            None => {
                warn!(provider = %provider_id, "RelayState was redeemed concurrently");
                Ok(None)
            }
        }
    }

    /// Handle an IdP-initiated LogoutRequest.
    ///
    /// The caller invalidates the user's sessions for `request.name_id`.
    /// Only the request's Issuer is checked, not its signature.
    pub fn handle_logout(&self, provider_id: &str, saml_request: &str) -> Result<LogoutOutcome, AcsError> {
        let provider = self.provider(provider_id)?;
        let request = provider
            .parse_logout_request(saml_request)
            .map_err(AcsError::from)?;
        let saml_response = provider.make_logout_response(&request.id, logout::STATUS_SUCCESS);

        info!(provider = %provider_id, session_index = ?request.session_index, "SAML logout request accepted");

        Ok(LogoutOutcome {
            request,
            saml_response,
            idp_slo_url: provider.idp().slo_url.clone(),
        })
    }
}

/// Append query parameters, respecting an existing query string.
fn append_query(base: &str, params: &[(&str, &str)]) -> String {
    let (without_fragment, fragment) = match base.split_once('#') {
        Some((head, frag)) => (head, Some(frag)),
        None => (base, None),
    };
    let mut url = without_fragment.to_string();
    for (key, value) in params {
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str(&urlencoding::encode(key));
        url.push('=');
        url.push_str(&urlencoding::encode(value));
    }
    if let Some(fragment) = fragment {
        url.push('#');
        url.push_str(fragment);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_query() {
        assert_eq!(
            append_query("https://app.example.com/cb", &[("a", "1"), ("b", "x y")]),
            "https://app.example.com/cb?a=1&b=x%20y"
        );
        assert_eq!(
            append_query("https://app.example.com/cb?x=1#frag", &[("a", "1")]),
            "https://app.example.com/cb?x=1&a=1#frag"
        );
    }

    #[test]
    fn test_redirect_url() {
        let outcome = AcsOutcome {
            user: User::default(),
            user_info: UserInfo::default(),
            access_token: "tok".to_string(),
            callback_url: Some("https://app.example.com/cb".to_string()),
            relay_state: Some("abc".to_string()),
        };
        assert_eq!(
            outcome.redirect_url().unwrap(),
            "https://app.example.com/cb?access_token=tok&token_type=Bearer&state=abc"
        );

        let no_callback = AcsOutcome {
            callback_url: None,
            ..outcome
        };
        assert!(no_callback.redirect_url().is_none());
        let body = serde_json::to_value(no_callback.token_response()).unwrap();
        assert_eq!(body["token_type"], "Bearer");
        assert_eq!(body["access_token"], "tok");
    }
}
