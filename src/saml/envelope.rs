//! Signature placement rules for SAML documents.
//!
//! libxmlsec1 verifies the first `ds:Signature` in document order and
//! resolves its reference by `ID`. That alone does not tie the signature to
//! the assertion the validator reads: a signed assertion can be moved under
//! an unrelated element while a forged one takes its place. The layout is
//! therefore pinned before any signature is checked:
//!
//! - every `ID` value in the document is unique;
//! - a Response carries at most one `Assertion` or `EncryptedAssertion`, as a
//!   direct child;
//! - a `ds:Signature` may only be a direct child of the root or of that
//!   assertion, at most one per element, and its single `Reference` must
//!   point at its parent's `ID`;
//! - the Response signature precedes the assertion.
//!
//! Under these rules the first signature in document order always covers the
//! assertion that is consumed.

use std::collections::HashSet;

use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::reader::{NsReader, Reader};

use super::error::TrustFailure;

const PROTOCOL_NS: &[u8] = b"urn:oasis:names:tc:SAML:2.0:protocol";
const ASSERTION_NS: &[u8] = b"urn:oasis:names:tc:SAML:2.0:assertion";
const DSIG_NS: &[u8] = b"http://www.w3.org/2000/09/xmldsig#";

/// Byte range of an element in the document it was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssertionForm {
    Plain,
    Encrypted,
}

/// The one assertion below a Response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionLayout {
    pub form: AssertionForm,
    pub span: Span,
    /// Carries its own enveloped signature.
    pub signed: bool,
}

/// Structure of a document that passed the placement rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Layout {
    pub root_id: Option<String>,
    /// The root element carries its own enveloped signature.
    pub root_signed: bool,
    pub assertion: Option<AssertionLayout>,
    /// Namespace declarations on the root start tag, raw attribute text.
    pub namespaces: Vec<(String, String)>,
}

impl Layout {
    /// True if any signature covers the assertion.
    pub fn is_signed(&self) -> bool {
        self.root_signed || self.assertion.as_ref().is_some_and(|a| a.signed)
    }
}

/// Check a Response document.
pub fn inspect_response(xml: &str) -> Result<Layout, TrustFailure> {
    inspect(xml, Root::Response)
}

/// Check a standalone Assertion document, such as a decrypted one.
pub fn inspect_assertion(xml: &str) -> Result<Layout, TrustFailure> {
    inspect(xml, Root::Assertion)
}

/// `xml` with the bytes of `span` removed.
pub fn cut(xml: &str, span: Span) -> String {
    let mut out = String::with_capacity(xml.len() - (span.end - span.start));
    out.push_str(&xml[..span.start]);
    out.push_str(&xml[span.end..]);
    out
}

/// Add the given namespace declarations to the root start tag of `fragment`,
/// skipping any it already declares.
///
/// A decrypted assertion may rely on prefixes declared on the enclosing
/// Response; this makes it parse on its own.
pub fn with_namespaces(
    fragment: &str,
    namespaces: &[(String, String)],
) -> Result<String, TrustFailure> {
    let mut reader = Reader::from_str(fragment);
    loop {
        let start = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let mut declared = Vec::new();
                for attr in e.attributes() {
                    let attr = attr.map_err(|e| malformed(e.to_string()))?;
                    declared.push(attr.key.as_ref().to_vec());
                }
                let missing: String = namespaces
                    .iter()
                    .filter(|(key, _)| !declared.iter().any(|d| d == key.as_bytes()))
                    .map(|(key, value)| format!(r#" {}="{}""#, key, value.replace('"', "&quot;")))
                    .collect();

                let insert_at = start + 1 + e.name().as_ref().len();
                let mut out = String::with_capacity(fragment.len() + missing.len());
                out.push_str(&fragment[..insert_at]);
                out.push_str(&missing);
                out.push_str(&fragment[insert_at..]);
                return Ok(out);
            }
            Ok(Event::Eof) => return Err(malformed("no root element")),
            Err(e) => return Err(malformed(e.to_string())),
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Root {
    Response,
    Assertion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Response,
    Assertion,
    EncryptedAssertion,
    Signature,
    SignedInfo,
    Reference,
    Other,
}

impl Kind {
    fn of(ns: Option<&[u8]>, local: &[u8]) -> Self {
        match ns {
            Some(ns) if ns == PROTOCOL_NS && local == b"Response" => Kind::Response,
            Some(ns) if ns == ASSERTION_NS && local == b"Assertion" => Kind::Assertion,
            Some(ns) if ns == ASSERTION_NS && local == b"EncryptedAssertion" => {
                Kind::EncryptedAssertion
            }
            Some(ns) if ns == DSIG_NS => match local {
                b"Signature" => Kind::Signature,
                b"SignedInfo" => Kind::SignedInfo,
                b"Reference" => Kind::Reference,
                _ => Kind::Other,
            },
            _ => Kind::Other,
        }
    }
}

struct Frame {
    kind: Kind,
    id: Option<String>,
    signatures: usize,
}

struct PendingSignature {
    depth: usize,
    references: Vec<String>,
}

struct Scanner {
    root: Root,
    stack: Vec<Frame>,
    ids: HashSet<String>,
    signature: Option<PendingSignature>,
    layout: Layout,
}

fn inspect(xml: &str, root: Root) -> Result<Layout, TrustFailure> {
    let mut reader = NsReader::from_str(xml);
    let mut scanner = Scanner {
        root,
        stack: Vec::new(),
        ids: HashSet::new(),
        signature: None,
        layout: Layout::default(),
    };

    loop {
        let start = reader.buffer_position() as usize;
        let (ns, event) = match reader.read_resolved_event() {
            Ok((ResolveResult::Bound(Namespace(ns)), event)) => (Some(ns.to_vec()), event),
            Ok((_, event)) => (None, event),
            Err(e) => return Err(malformed(e.to_string())),
        };
        match event {
            Event::Start(e) => scanner.open(ns.as_deref(), &e, start)?,
            Event::Empty(e) => {
                scanner.open(ns.as_deref(), &e, start)?;
                scanner.close(reader.buffer_position() as usize)?;
            }
            Event::End(_) => scanner.close(reader.buffer_position() as usize)?,
            Event::DocType(_) => return Err(malformed("DOCTYPE declarations are not allowed")),
            Event::Eof => break,
            _ => {}
        }
    }

    if scanner.layout.root_id.as_deref().map_or(true, str::is_empty) {
        return Err(malformed("root element has no ID"));
    }
    Ok(scanner.layout)
}

impl Scanner {
    fn open(&mut self, ns: Option<&[u8]>, e: &BytesStart<'_>, start: usize) -> Result<(), TrustFailure> {
        let depth = self.stack.len();
        let kind = Kind::of(ns, e.local_name().as_ref());

        let mut id = None;
        let mut uri = None;
        for attr in e.attributes() {
            let attr = attr.map_err(|e| malformed(e.to_string()))?;
            let key = attr.key.as_ref();
            if key == b"ID" {
                let value = attr
                    .unescape_value()
                    .map_err(|e| malformed(e.to_string()))?
                    .into_owned();
                if !self.ids.insert(value.clone()) {
                    return Err(malformed(format!("duplicate ID {}", value)));
                }
                id = Some(value);
            } else if kind == Kind::Reference && key == b"URI" {
                let value = attr.unescape_value().map_err(|e| malformed(e.to_string()))?;
                uri = Some(value.into_owned());
            } else if depth == 0 && (key == b"xmlns" || key.starts_with(b"xmlns:")) {
                self.layout.namespaces.push((
                    String::from_utf8_lossy(key).into_owned(),
                    String::from_utf8_lossy(&attr.value).into_owned(),
                ));
            }
        }

        if depth == 0 {
            let expected = match self.root {
                Root::Response => Kind::Response,
                Root::Assertion => Kind::Assertion,
            };
            if kind != expected {
                return Err(malformed("unexpected root element"));
            }
            self.layout.root_id = id.clone();
        } else {
            match kind {
                Kind::Assertion | Kind::EncryptedAssertion => self.open_assertion(kind, depth, start)?,
                Kind::Signature => self.open_signature(depth)?,
                Kind::Reference => {
                    let parent_is_signed_info =
                        self.stack.last().is_some_and(|f| f.kind == Kind::SignedInfo);
                    if let Some(signature) = self.signature.as_mut() {
                        if parent_is_signed_info && depth == signature.depth + 2 {
                            signature.references.push(uri.unwrap_or_default());
                        }
                    }
                }
                _ => {}
            }
        }

        self.stack.push(Frame {
            kind,
            id,
            signatures: 0,
        });
        Ok(())
    }

    fn open_assertion(&mut self, kind: Kind, depth: usize, start: usize) -> Result<(), TrustFailure> {
        if self.root == Root::Assertion {
            return Err(wrapped("assertion nested inside an assertion"));
        }
        if depth != 1 {
            return Err(wrapped("assertion is not a direct child of the response"));
        }
        if self.layout.assertion.is_some() {
            return Err(wrapped("response carries more than one assertion"));
        }
        let form = if kind == Kind::EncryptedAssertion {
            AssertionForm::Encrypted
        } else {
            AssertionForm::Plain
        };
        self.layout.assertion = Some(AssertionLayout {
            form,
            span: Span { start, end: start },
            signed: false,
        });
        Ok(())
    }

    fn open_signature(&mut self, depth: usize) -> Result<(), TrustFailure> {
        let root = self.root;
        let assertion_seen = self.layout.assertion.is_some();
        let parent = self
            .stack
            .last_mut()
            .ok_or_else(|| malformed("signature without a parent"))?;

        let allowed = depth == 1 || (depth == 2 && parent.kind == Kind::Assertion);
        if !allowed {
            return Err(wrapped("signature outside the response or its assertion"));
        }
        parent.signatures += 1;
        if parent.signatures > 1 {
            return Err(wrapped("element carries more than one signature"));
        }
        if depth == 1 && root == Root::Response && assertion_seen {
            return Err(wrapped("response signature follows the assertion"));
        }

        self.signature = Some(PendingSignature {
            depth,
            references: Vec::new(),
        });
        Ok(())
    }

    fn close(&mut self, end: usize) -> Result<(), TrustFailure> {
        let frame = self
            .stack
            .pop()
            .ok_or_else(|| malformed("unexpected closing tag"))?;
        let depth = self.stack.len();

        match frame.kind {
            Kind::Signature => {
                let Some(signature) = self.signature.take() else {
                    return Ok(());
                };
                let owner_id = self
                    .stack
                    .last()
                    .and_then(|owner| owner.id.as_deref())
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| wrapped("signed element has no ID"))?;

                match signature.references.as_slice() {
                    [uri] if uri.strip_prefix('#') == Some(owner_id) => {}
                    _ => {
                        return Err(wrapped(format!(
                            "signature must reference its parent element {}",
                            owner_id
                        )))
                    }
                }

                if signature.depth == 1 {
                    self.layout.root_signed = true;
                } else if let Some(assertion) = self.layout.assertion.as_mut() {
                    assertion.signed = true;
                }
            }
            Kind::Assertion | Kind::EncryptedAssertion if depth == 1 => {
                if let Some(assertion) = self.layout.assertion.as_mut() {
                    assertion.span.end = end;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn malformed(message: impl Into<String>) -> TrustFailure {
    TrustFailure::MalformedXml(message.into())
}

fn wrapped(message: impl Into<String>) -> TrustFailure {
    TrustFailure::Signature(message.into())
}
