//! Input guards applied before any SAML document reaches the parser.
//!
//! Documents with a DOCTYPE are rejected outright, which rules out external
//! entities and entity expansion bombs.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use quick_xml::events::Event;
use quick_xml::reader::Reader;

use super::error::TrustFailure;

/// Reject `size` when it exceeds `limit`.
pub fn ensure_within_limit(size: usize, limit: usize) -> Result<(), TrustFailure> {
    if size > limit {
        return Err(TrustFailure::PayloadTooLarge { size, limit });
    }
    Ok(())
}

/// Largest encoded length that can decode to at most `decoded_limit` bytes,
/// with room for line wrapping.
pub fn encoded_limit(decoded_limit: usize) -> usize {
    decoded_limit.saturating_add(2).saturating_div(3).saturating_mul(4).saturating_mul(2)
}

/// Base64-decode a form-posted SAML message into UTF-8 text.
///
/// Line breaks and other ASCII whitespace are ignored, since some IdPs wrap
/// the encoded value.
pub fn decode_base64(encoded: &str) -> Result<String, TrustFailure> {
    let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Err(TrustFailure::InvalidEncoding("empty message".to_string()));
    }
    let bytes = BASE64
        .decode(compact.as_bytes())
        .map_err(|e| TrustFailure::InvalidEncoding(format!("base64: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| TrustFailure::InvalidEncoding(format!("utf-8: {}", e)))
}

/// Check the document is well-formed XML with a single root and no DOCTYPE.
pub fn check_well_formed(xml: &str) -> Result<(), TrustFailure> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut depth: usize = 0;
    let mut roots: usize = 0;

    loop {
        match reader.read_event() {
            Ok(Event::DocType(_)) => {
                return Err(TrustFailure::MalformedXml(
                    "DOCTYPE declarations are not allowed".to_string(),
                ));
            }
            Ok(Event::Start(_)) => {
                if depth == 0 {
                    roots += 1;
                }
                depth += 1;
            }
            Ok(Event::Empty(_)) => {
                if depth == 0 {
                    roots += 1;
                }
            }
            Ok(Event::End(_)) => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    TrustFailure::MalformedXml("unexpected closing tag".to_string())
                })?;
            }
            Ok(Event::Text(ref t)) if depth == 0 => {
                if !t.iter().all(|b| b.is_ascii_whitespace()) {
                    return Err(TrustFailure::MalformedXml(
                        "text outside the root element".to_string(),
                    ));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(TrustFailure::MalformedXml(format!(
                    "at position {}: {}",
                    reader.buffer_position(),
                    e
                )));
            }
            _ => {}
        }
    }

    if depth != 0 {
        return Err(TrustFailure::MalformedXml("unclosed element".to_string()));
    }
    match roots {
        0 => Err(TrustFailure::MalformedXml("no root element".to_string())),
        1 => Ok(()),
        _ => Err(TrustFailure::MalformedXml("multiple root elements".to_string())),
    }
}

/// Escape text for inclusion in element content or attribute values.
pub fn escape(value: &str) -> String {
    quick_xml::escape::escape(value).into_owned()
}
