//! Single Logout: IdP-initiated LogoutRequest parsing and LogoutResponse building.
//!
//! LogoutRequest signatures are not verified. A request is accepted when its
//! `Issuer` matches the IdP entity id, so anyone who can reach the SLO
//! endpoint can end a session for a known NameID. Deployments that need
//! authenticated logout must verify the binding signature in front of this
//! module.

use std::io::Read;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use super::error::TrustFailure;
use super::xml;

pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
pub const STATUS_RESPONDER: &str = "urn:oasis:names:tc:SAML:2.0:status:Responder";

/// Largest LogoutRequest accepted, encoded or inflated.
const MAX_LOGOUT_REQUEST_BYTES: usize = 64 * 1024;

/// A parsed LogoutRequest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutRequest {
    pub id: String,
    pub issuer: String,
    pub name_id: String,
    pub name_id_format: Option<String>,
    pub session_index: Option<String>,
}

/// Decode a LogoutRequest from either binding.
///
/// HTTP-POST carries plain base64; HTTP-Redirect carries deflated base64.
pub fn decode_logout_message(encoded: &str) -> Result<String, TrustFailure> {
    xml::ensure_within_limit(encoded.len(), xml::encoded_limit(MAX_LOGOUT_REQUEST_BYTES))?;

    let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = BASE64
        .decode(compact.as_bytes())
        .map_err(|e| TrustFailure::InvalidEncoding(format!("base64: {}", e)))?;

    if bytes.first() == Some(&b'<') {
        return String::from_utf8(bytes)
            .map_err(|e| TrustFailure::InvalidEncoding(format!("utf-8: {}", e)));
    }

    let mut inflated = String::new();
    flate2::read::DeflateDecoder::new(bytes.as_slice())
        .take(MAX_LOGOUT_REQUEST_BYTES as u64 + 1)
        .read_to_string(&mut inflated)
        .map_err(|e| TrustFailure::InvalidEncoding(format!("deflate: {}", e)))?;
    xml::ensure_within_limit(inflated.len(), MAX_LOGOUT_REQUEST_BYTES)?;
    Ok(inflated)
}

/// Parse a LogoutRequest and check its Issuer is `idp_entity_id`.
///
/// Any `ds:Signature` in the request is ignored.
pub fn parse_logout_request(document: &str, idp_entity_id: &str) -> Result<LogoutRequest, TrustFailure> {
    xml::check_well_formed(document)?;

    let mut reader = Reader::from_str(document);
    reader.config_mut().trim_text(true);

    let mut id = None;
    let mut issuer = None;
    let mut name_id = None;
    let mut name_id_format = None;
    let mut session_index = None;
    let mut saw_root = false;
    let mut current = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let local = local_name(e);
                if !saw_root {
                    if local != "LogoutRequest" {
                        return Err(TrustFailure::MalformedXml(format!(
                            "expected LogoutRequest, found {}",
                            local
                        )));
                    }
                    saw_root = true;
                    id = attribute(e, "ID");
                } else if local == "NameID" {
                    name_id_format = attribute(e, "Format");
                }
                current = local;
            }
            Ok(Event::Text(ref t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| TrustFailure::MalformedXml(e.to_string()))?
                    .into_owned();
                match current.as_str() {
                    "Issuer" if issuer.is_none() => issuer = Some(text),
                    "NameID" if name_id.is_none() => name_id = Some(text),
                    "SessionIndex" if session_index.is_none() => session_index = Some(text),
                    _ => {}
                }
            }
            Ok(Event::End(_)) => current.clear(),
            Ok(Event::Eof) => break,
            Err(e) => return Err(TrustFailure::MalformedXml(e.to_string())),
            _ => {}
        }
    }

    let id = id
        .filter(|i| !i.is_empty())
        .ok_or_else(|| TrustFailure::MalformedXml("LogoutRequest has no ID".to_string()))?;

    match issuer.as_deref() {
        Some(actual) if actual == idp_entity_id => {}
        actual => {
            return Err(TrustFailure::WrongIssuer {
                expected: idp_entity_id.to_string(),
                actual: actual.unwrap_or("<none>").to_string(),
            })
        }
    }

    let name_id = name_id
        .filter(|n| !n.is_empty())
        .ok_or_else(|| TrustFailure::MalformedXml("LogoutRequest has no NameID".to_string()))?;

    Ok(LogoutRequest {
        id,
        issuer: idp_entity_id.to_string(),
        name_id,
        name_id_format,
        session_index,
    })
}

/// Build a base64-encoded LogoutResponse.
pub fn build_logout_response(
    sp_entity_id: &str,
    destination: Option<&str>,
    in_response_to: &str,
    status: &str,
) -> String {
    let response_id = format!("_id{}", uuid::Uuid::new_v4());
    let issue_instant = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let destination = destination
        .map(|d| format!(r#" Destination="{}""#, xml::escape(d)))
        .unwrap_or_default();

    let response = format!(
        r#"<samlp:LogoutResponse xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{}" Version="2.0" IssueInstant="{}"{} InResponseTo="{}"><saml:Issuer>{}</saml:Issuer><samlp:Status><samlp:StatusCode Value="{}"/></samlp:Status></samlp:LogoutResponse>"#,
        response_id,
        issue_instant,
        destination,
        xml::escape(in_response_to),
        xml::escape(sp_entity_id),
        xml::escape(status),
    );

    BASE64.encode(response)
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn attribute(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name.as_bytes())
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}
