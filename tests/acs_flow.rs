//! End-to-end login flow: initiate, post a response, redeem relay state.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{Duration, Utc};
use tempfile::TempDir;

use zentinel_saml_sp::saml::config::{AttributeMapping, ProviderConfig};
use zentinel_saml_sp::saml::signature::UnavailableVerifier;
use zentinel_saml_sp::saml::{
    AcsError, IdType, IdpMetadata, ProviderRegistry, SamlProvider, SamlService, TokenIssuer,
    TrustFailure, User, UserInfo, UserProvisioner,
};
use zentinel_saml_sp::state::StateStore;

const SP_ENTITY: &str = "https://sp.example.com";
const ACS_URL: &str = "https://sp.example.com/saml/acs";
const IDP_ENTITY: &str = "https://idp.example.com";

#[derive(Default)]
struct RecordingProvisioner {
    seen: Mutex<Vec<(String, UserInfo)>>,
    fail: bool,
}

#[async_trait]
impl UserProvisioner for RecordingProvisioner {
    async fn provision(&self, provider_id: &str, info: &UserInfo) -> anyhow::Result<User> {
        if self.fail {
            anyhow::bail!("directory unavailable");
        }
        self.seen
            .lock()
            .unwrap()
            .push((provider_id.to_string(), info.clone()));
        Ok(User {
            id: format!("user-{}", info.id),
            email: info.email.clone(),
            name: info.name.clone(),
            identity_provider_id: provider_id.to_string(),
        })
    }
}

struct StaticTokens;

#[async_trait]
impl TokenIssuer for StaticTokens {
    async fn issue(&self, user: &User, _info: &UserInfo) -> anyhow::Result<String> {
        Ok(format!("token-for-{}", user.id))
    }
}

fn provider_config(allow_idp_initiated: bool) -> ProviderConfig {
    ProviderConfig {
        id: "okta".to_string(),
        entity_id: SP_ENTITY.to_string(),
        acs_url: ACS_URL.to_string(),
        allow_unsigned_assertions: true,
        allow_idp_initiated,
        attribute_mapping: AttributeMapping {
            email: Some("mail".to_string()),
            name: Some("displayName".to_string()),
            ..Default::default()
        },
        group_attribute_name: Some("groups".to_string()),
        group_prefix: Some("app-".to_string()),
        ..Default::default()
    }
}

fn idp() -> IdpMetadata {
    IdpMetadata {
        entity_id: IDP_ENTITY.to_string(),
        sso_url: "https://idp.example.com/sso".to_string(),
        slo_url: Some("https://idp.example.com/slo".to_string()),
        signing_certificates: Vec::new(),
    }
}

struct Harness {
    _dir: TempDir,
    store: Arc<StateStore>,
    provisioner: Arc<RecordingProvisioner>,
    service: SamlService,
}

fn harness(config: ProviderConfig, provisioner: RecordingProvisioner) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(StateStore::open(&dir.path().join("state.redb"), 600).unwrap());
    let registry = ProviderRegistry::new();
    // Unsigned fixtures pass because allow_unsigned_assertions is set.
    registry.insert(SamlProvider::with_verifier(config, idp(), Arc::new(UnavailableVerifier)));
    let provisioner = Arc::new(provisioner);
    let service = SamlService::new(
        Arc::new(registry),
        store.clone(),
        provisioner.clone(),
        Arc::new(StaticTokens),
    );
    Harness {
        _dir: dir,
        store,
        provisioner,
        service,
    }
}

fn response(assertion_id: &str, in_response_to: Option<&str>) -> String {
    let ts = |d: Duration| (Utc::now() + d).format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let in_response_to = in_response_to
        .map(|id| format!(r#" InResponseTo="{}""#, id))
        .unwrap_or_default();
    let xml = format!(
        r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_resp-{id}" Version="2.0" IssueInstant="{now}" Destination="{acs}"{irt}><saml:Issuer>{idp}</saml:Issuer><samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status><saml:Assertion ID="{id}" Version="2.0" IssueInstant="{now}"><saml:Issuer>{idp}</saml:Issuer><saml:Subject><saml:NameID Format="urn:oasis:names:tc:SAML:2.0:nameid-format:persistent">00u1abcd</saml:NameID></saml:Subject><saml:Conditions NotBefore="{nb}" NotOnOrAfter="{noa}"><saml:AudienceRestriction><saml:Audience>{sp}</saml:Audience></saml:AudienceRestriction></saml:Conditions><saml:AttributeStatement><saml:Attribute Name="mail"><saml:AttributeValue>alice@example.com</saml:AttributeValue></saml:Attribute><saml:Attribute Name="displayName"><saml:AttributeValue>Alice Example</saml:AttributeValue></saml:Attribute><saml:Attribute Name="groups"><saml:AttributeValue>app-admins</saml:AttributeValue><saml:AttributeValue>everyone</saml:AttributeValue></saml:Attribute></saml:AttributeStatement></saml:Assertion></samlp:Response>"#,
        id = assertion_id,
        irt = in_response_to,
        now = ts(Duration::zero()),
        nb = ts(Duration::minutes(-5)),
        noa = ts(Duration::minutes(5)),
        acs = ACS_URL,
        idp = IDP_ENTITY,
        sp = SP_ENTITY,
    );
    BASE64.encode(xml)
}

#[tokio::test]
async fn sp_initiated_login_redirects_to_callback() {
    let h = harness(provider_config(false), RecordingProvisioner::default());

    let login = h
        .service
        .initiate_login("okta", Some("https://app.example.com/cb".to_string()))
        .unwrap();
    assert!(login.redirect_url.starts_with("https://idp.example.com/sso?SAMLRequest="));
    let relay = login.relay_state.to_hex();
    assert!(login.redirect_url.ends_with(&format!("RelayState={}", relay)));

    let stored = h.store.get_relay_state(&login.relay_state).unwrap().unwrap();
    let request_id = stored.request_id.expect("request id recorded");

    let outcome = h
        .service
        .handle_acs("okta", &response("_a-1", Some(&request_id)), Some(&relay), None)
        .await
        .unwrap();

    assert_eq!(outcome.user_info.id, "00u1abcd");
    assert_eq!(outcome.user_info.id_type, IdType::NameId);
    assert_eq!(outcome.user_info.email, "alice@example.com");
    assert!(outcome.user_info.email_verified);
    assert_eq!(outcome.user_info.name, "Alice Example");
    assert_eq!(outcome.user_info.groups, vec!["app-admins"]);
    assert_eq!(outcome.user.id, "user-00u1abcd");
    assert_eq!(outcome.access_token, "token-for-user-00u1abcd");
    assert_eq!(
        outcome.redirect_url().unwrap(),
        format!(
            "https://app.example.com/cb?access_token=token-for-user-00u1abcd&token_type=Bearer&state={}",
            relay
        )
    );

    // relay state is single use
    assert!(h.store.get_relay_state(&login.relay_state).unwrap().is_none());
    assert_eq!(h.provisioner.seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn replayed_response_is_rejected() {
    let h = harness(provider_config(true), RecordingProvisioner::default());
    let raw = response("_a-2", None);

    h.service.handle_acs("okta", &raw, None, None).await.unwrap();
    let err = h.service.handle_acs("okta", &raw, None, None).await.unwrap_err();
    assert!(matches!(err, AcsError::Trust(TrustFailure::Replay(ref id)) if id == "_a-2"));
    assert_eq!(err.user_message(), "authentication failed");
    assert_eq!(h.provisioner.seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn response_must_answer_the_pending_request() {
    let h = harness(provider_config(false), RecordingProvisioner::default());
    let first = h.service.initiate_login("okta", None).unwrap();
    let second = h.service.initiate_login("okta", None).unwrap();
    let first_request = h
        .store
        .get_relay_state(&first.relay_state)
        .unwrap()
        .unwrap()
        .request_id
        .unwrap();

    // an answer to the first request posted with the second relay state
    let raw = response("_a-7", Some(&first_request));
    let err = h
        .service
        .handle_acs("okta", &raw, Some(&second.relay_state.to_hex()), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AcsError::Trust(TrustFailure::WrongInResponseTo { ref actual, .. }) if actual == &first_request
    ));
    // nothing was consumed or recorded by the rejected response
    assert!(h.store.get_relay_state(&second.relay_state).unwrap().is_some());
    assert!(!h.store.is_assertion_used("_a-7").unwrap());

    // an unsolicited response cannot redeem a pending relay state either
    let err = h
        .service
        .handle_acs("okta", &response("_a-8", None), Some(&second.relay_state.to_hex()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, AcsError::Trust(TrustFailure::WrongInResponseTo { .. })));

    h.service
        .handle_acs("okta", &raw, Some(&first.relay_state.to_hex()), None)
        .await
        .unwrap();
    assert!(h.store.get_relay_state(&first.relay_state).unwrap().is_none());
}

#[tokio::test]
async fn unsolicited_response_needs_opt_in() {
    let h = harness(provider_config(false), RecordingProvisioner::default());
    let err = h
        .service
        .handle_acs("okta", &response("_a-3", None), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AcsError::Unsolicited(_)));

    let h = harness(provider_config(true), RecordingProvisioner::default());
    let outcome = h
        .service
        .handle_acs("okta", &response("_a-3", None), None, None)
        .await
        .unwrap();
    assert!(outcome.callback_url.is_none());
    assert!(outcome.redirect_url().is_none());
    let body = serde_json::to_value(outcome.token_response()).unwrap();
    assert_eq!(body["user"]["idp"], "okta");
}

#[tokio::test]
async fn foreign_relay_state_yields_no_callback() {
    let h = harness(provider_config(false), RecordingProvisioner::default());
    let outcome = h
        .service
        .handle_acs("okta", &response("_a-4", None), Some("https://app.example.com/deep/link"), None)
        .await
        .unwrap();
    assert!(outcome.callback_url.is_none());
}

#[tokio::test]
async fn unknown_provider_and_provisioning_failure() {
    let h = harness(
        provider_config(true),
        RecordingProvisioner {
            fail: true,
            ..Default::default()
        },
    );

    let err = h.service.initiate_login("entra", None).unwrap_err();
    assert!(matches!(err, AcsError::UnknownProvider(ref id) if id == "entra"));

    let err = h
        .service
        .handle_acs("okta", &response("_a-5", None), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AcsError::Provisioning(_)));
}

#[tokio::test]
async fn wrong_destination_is_rejected() {
    let h = harness(provider_config(true), RecordingProvisioner::default());
    let err = h
        .service
        .handle_acs(
            "okta",
            &response("_a-6", None),
            None,
            Some("https://other.example.com/saml/acs"),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AcsError::Trust(TrustFailure::WrongDestination { .. })
    ));
    assert!(!h.store.is_assertion_used("_a-6").unwrap());
}

#[tokio::test]
async fn idp_initiated_logout() {
    let h = harness(provider_config(false), RecordingProvisioner::default());
    let request = format!(
        r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_lr-1" Version="2.0" IssueInstant="2030-01-01T00:00:00Z"><saml:Issuer>{}</saml:Issuer><saml:NameID>00u1abcd</saml:NameID><samlp:SessionIndex>_s-1</samlp:SessionIndex></samlp:LogoutRequest>"#,
        IDP_ENTITY
    );

    let outcome = h
        .service
        .handle_logout("okta", &BASE64.encode(request))
        .unwrap();
    assert_eq!(outcome.request.name_id, "00u1abcd");
    assert_eq!(outcome.idp_slo_url.as_deref(), Some("https://idp.example.com/slo"));

    let decoded = String::from_utf8(BASE64.decode(outcome.saml_response).unwrap()).unwrap();
    assert!(decoded.contains(r#"InResponseTo="_lr-1""#));
}
