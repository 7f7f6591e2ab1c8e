//! `EncryptedAssertion` decryption (XML Encryption 1.0 and 1.1).
//!
//! The content key is wrapped with RSA-OAEP for the SP certificate and the
//! assertion is encrypted with AES-CBC or AES-GCM. RSA PKCS#1 v1.5 key
//! transport is refused.

use std::fmt;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use openssl::md::{Md, MdRef};
use openssl::pkey::{PKey, Private};
use openssl::pkey_ctx::PkeyCtx;
use openssl::rsa::Padding;
use openssl::symm::{decrypt_aead, Cipher, Crypter, Mode};
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::reader::NsReader;

use super::error::TrustFailure;

const XENC_NS: &[u8] = b"http://www.w3.org/2001/04/xmlenc#";
const XENC11_NS: &[u8] = b"http://www.w3.org/2009/xmlenc11#";
const DSIG_NS: &[u8] = b"http://www.w3.org/2000/09/xmldsig#";

const RSA_OAEP_MGF1P: &str = "http://www.w3.org/2001/04/xmlenc#rsa-oaep-mgf1p";
const RSA_OAEP: &str = "http://www.w3.org/2009/xmlenc11#rsa-oaep";
const RSA_1_5: &str = "http://www.w3.org/2001/04/xmlenc#rsa-1_5";

const AES128_CBC: &str = "http://www.w3.org/2001/04/xmlenc#aes128-cbc";
const AES192_CBC: &str = "http://www.w3.org/2001/04/xmlenc#aes192-cbc";
const AES256_CBC: &str = "http://www.w3.org/2001/04/xmlenc#aes256-cbc";
const AES128_GCM: &str = "http://www.w3.org/2009/xmlenc11#aes128-gcm";
const AES192_GCM: &str = "http://www.w3.org/2009/xmlenc11#aes192-gcm";
const AES256_GCM: &str = "http://www.w3.org/2009/xmlenc11#aes256-gcm";

const GCM_IV_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;

/// Decrypts assertions addressed to this SP.
pub struct AssertionDecryptor {
    key: PKey<Private>,
}

impl fmt::Debug for AssertionDecryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssertionDecryptor").finish_non_exhaustive()
    }
}

impl AssertionDecryptor {
    pub fn from_pem(private_key_pem: &str) -> anyhow::Result<Self> {
        let key = PKey::private_key_from_pem(private_key_pem.as_bytes())
            .context("Failed to load SP private key")?;
        Ok(Self { key })
    }

    /// Decrypt the `EncryptedAssertion` element `xml` into the assertion text.
    pub fn decrypt(&self, xml: &str) -> Result<String, TrustFailure> {
        let parts = EncryptedParts::parse(xml)?;

        let mut last_error = failure("no EncryptedKey");
        for wrapped in &parts.keys {
            match self.unwrap_key(wrapped) {
                Ok(key) => {
                    let plaintext = decrypt_content(&parts.algorithm, &key, &parts.cipher_value)?;
                    return String::from_utf8(plaintext)
                        .map_err(|e| failure(format!("assertion is not UTF-8: {}", e)));
                }
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }

    fn unwrap_key(&self, wrapped: &EncryptedKey) -> Result<Vec<u8>, TrustFailure> {
        let (oaep_md, mgf1_md) = match wrapped.algorithm.as_str() {
            RSA_OAEP_MGF1P => (digest(wrapped.digest.as_deref())?, Md::sha1()),
            RSA_OAEP => (
                digest(wrapped.digest.as_deref())?,
                mgf1(wrapped.mgf.as_deref())?,
            ),
            RSA_1_5 => return Err(failure("RSA PKCS#1 v1.5 key transport is not accepted")),
            other => return Err(failure(format!("unsupported key transport {}", other))),
        };
        let cipher = decode(&wrapped.cipher_value)?;

        let oaep = || -> Result<Vec<u8>, openssl::error::ErrorStack> {
            let mut ctx = PkeyCtx::new(&self.key)?;
            ctx.decrypt_init()?;
            ctx.set_rsa_padding(Padding::PKCS1_OAEP)?;
            ctx.set_rsa_oaep_md(oaep_md)?;
            ctx.set_rsa_mgf1_md(mgf1_md)?;
            let mut out = Vec::new();
            ctx.decrypt_to_vec(&cipher, &mut out)?;
            Ok(out)
        };
        // every unwrap failure reads the same
        oaep().map_err(|_| failure("content key could not be unwrapped"))
    }
}

fn decrypt_content(algorithm: &str, key: &[u8], cipher_value: &str) -> Result<Vec<u8>, TrustFailure> {
    let (cipher, gcm) = match algorithm {
        AES128_CBC => (Cipher::aes_128_cbc(), false),
        AES192_CBC => (Cipher::aes_192_cbc(), false),
        AES256_CBC => (Cipher::aes_256_cbc(), false),
        AES128_GCM => (Cipher::aes_128_gcm(), true),
        AES192_GCM => (Cipher::aes_192_gcm(), true),
        AES256_GCM => (Cipher::aes_256_gcm(), true),
        other => return Err(failure(format!("unsupported content encryption {}", other))),
    };
    if key.len() != cipher.key_len() {
        return Err(failure(format!(
            "content key is {} bytes, {} needs {}",
            key.len(),
            algorithm,
            cipher.key_len()
        )));
    }

    let data = decode(cipher_value)?;
    if gcm {
        decrypt_gcm(cipher, key, &data)
    } else {
        decrypt_cbc(cipher, key, &data)
    }
}

fn decrypt_gcm(cipher: Cipher, key: &[u8], data: &[u8]) -> Result<Vec<u8>, TrustFailure> {
    if data.len() < GCM_IV_LEN + GCM_TAG_LEN {
        return Err(failure("ciphertext too short"));
    }
    let (iv, rest) = data.split_at(GCM_IV_LEN);
    let (body, tag) = rest.split_at(rest.len() - GCM_TAG_LEN);
    decrypt_aead(cipher, key, Some(iv), &[], body, tag)
        .map_err(|_| failure("authentication tag mismatch"))
}

fn decrypt_cbc(cipher: Cipher, key: &[u8], data: &[u8]) -> Result<Vec<u8>, TrustFailure> {
    let block = cipher.block_size();
    let iv_len = cipher.iv_len().unwrap_or(block);
    if data.len() < iv_len + block || (data.len() - iv_len) % block != 0 {
        return Err(failure("ciphertext is not a whole number of blocks"));
    }
    let (iv, body) = data.split_at(iv_len);

    let run = || -> Result<Vec<u8>, openssl::error::ErrorStack> {
        let mut crypter = Crypter::new(cipher, Mode::Decrypt, key, Some(iv))?;
        crypter.pad(false);
        let mut out = vec![0; body.len() + block];
        let mut n = crypter.update(body, &mut out)?;
        n += crypter.finalize(&mut out[n..])?;
        out.truncate(n);
        Ok(out)
    };
    let mut out = run().map_err(|_| failure("content could not be decrypted"))?;

    // XML Encryption padding: only the final octet (the pad length) is defined.
    let pad = out.last().copied().unwrap_or(0) as usize;
    if pad == 0 || pad > block || pad > out.len() {
        return Err(failure("invalid padding"));
    }
    out.truncate(out.len() - pad);
    Ok(out)
}

fn digest(uri: Option<&str>) -> Result<&'static MdRef, TrustFailure> {
    match uri {
        None | Some("http://www.w3.org/2000/09/xmldsig#sha1") => Ok(Md::sha1()),
        Some("http://www.w3.org/2001/04/xmlenc#sha256") => Ok(Md::sha256()),
        Some("http://www.w3.org/2001/04/xmldsig-more#sha384") => Ok(Md::sha384()),
        Some("http://www.w3.org/2001/04/xmlenc#sha512") => Ok(Md::sha512()),
        Some(other) => Err(failure(format!("unsupported OAEP digest {}", other))),
    }
}

fn mgf1(uri: Option<&str>) -> Result<&'static MdRef, TrustFailure> {
    match uri {
        None | Some("http://www.w3.org/2009/xmlenc11#mgf1sha1") => Ok(Md::sha1()),
        Some("http://www.w3.org/2009/xmlenc11#mgf1sha224") => Ok(Md::sha224()),
        Some("http://www.w3.org/2009/xmlenc11#mgf1sha256") => Ok(Md::sha256()),
        Some("http://www.w3.org/2009/xmlenc11#mgf1sha384") => Ok(Md::sha384()),
        Some("http://www.w3.org/2009/xmlenc11#mgf1sha512") => Ok(Md::sha512()),
        Some(other) => Err(failure(format!("unsupported MGF {}", other))),
    }
}

fn decode(value: &str) -> Result<Vec<u8>, TrustFailure> {
    let compact: String = value.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    BASE64
        .decode(compact.as_bytes())
        .map_err(|e| failure(format!("CipherValue: {}", e)))
}

fn failure(message: impl Into<String>) -> TrustFailure {
    TrustFailure::Decryption(message.into())
}

#[derive(Debug, Default)]
struct EncryptedKey {
    algorithm: String,
    digest: Option<String>,
    mgf: Option<String>,
    cipher_value: String,
}

/// The pieces of an `EncryptedAssertion` needed to decrypt it.
#[derive(Debug, Default)]
struct EncryptedParts {
    algorithm: String,
    cipher_value: String,
    keys: Vec<EncryptedKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    EncryptedData,
    EncryptedKey,
    EncryptionMethod,
    CipherData,
    CipherValue,
    Other,
}

impl Node {
    fn of(ns: Option<&[u8]>, local: &[u8]) -> Self {
        match ns {
            Some(ns) if ns == XENC_NS => match local {
                b"EncryptedData" => Node::EncryptedData,
                b"EncryptedKey" => Node::EncryptedKey,
                b"EncryptionMethod" => Node::EncryptionMethod,
                b"CipherData" => Node::CipherData,
                b"CipherValue" => Node::CipherValue,
                _ => Node::Other,
            },
            _ => Node::Other,
        }
    }
}

impl EncryptedParts {
    fn parse(xml: &str) -> Result<Self, TrustFailure> {
        let mut reader = NsReader::from_str(xml);
        let mut parts = EncryptedParts::default();
        let mut stack: Vec<Node> = Vec::new();
        let mut data_seen = false;

        loop {
            let (ns, event) = match reader.read_resolved_event() {
                Ok((ResolveResult::Bound(Namespace(ns)), event)) => (Some(ns.to_vec()), event),
                Ok((_, event)) => (None, event),
                Err(e) => return Err(failure(format!("EncryptedAssertion: {}", e))),
            };
            match event {
                Event::Start(e) => {
                    let node = parts.open(ns.as_deref(), &e, &stack, &mut data_seen)?;
                    stack.push(node);
                }
                Event::Empty(e) => {
                    parts.open(ns.as_deref(), &e, &stack, &mut data_seen)?;
                }
                Event::End(_) => {
                    stack.pop();
                }
                Event::Text(t) if stack.last() == Some(&Node::CipherValue) => {
                    let text = t
                        .unescape()
                        .map_err(|e| failure(format!("CipherValue: {}", e)))?;
                    match owner(&stack) {
                        Some(Node::EncryptedKey) => {
                            if let Some(key) = parts.keys.last_mut() {
                                key.cipher_value.push_str(&text);
                            }
                        }
                        Some(Node::EncryptedData) => parts.cipher_value.push_str(&text),
                        _ => {}
                    }
                }
                Event::DocType(_) => {
                    return Err(failure("DOCTYPE declarations are not allowed"));
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !data_seen || parts.cipher_value.is_empty() {
            return Err(failure("no EncryptedData CipherValue"));
        }
        if parts.algorithm.is_empty() {
            return Err(failure("no content EncryptionMethod"));
        }
        if parts.keys.is_empty() {
            return Err(failure("no EncryptedKey"));
        }
        Ok(parts)
    }

    fn open(
        &mut self,
        ns: Option<&[u8]>,
        e: &BytesStart<'_>,
        stack: &[Node],
        data_seen: &mut bool,
    ) -> Result<Node, TrustFailure> {
        let local = e.local_name();
        let node = Node::of(ns, local.as_ref());
        let parent = stack.last().copied();

        match node {
            Node::EncryptedData => {
                if *data_seen {
                    return Err(failure("more than one EncryptedData"));
                }
                *data_seen = true;
            }
            Node::EncryptedKey => self.keys.push(EncryptedKey::default()),
            Node::EncryptionMethod => {
                let algorithm = attribute(e, b"Algorithm")?.unwrap_or_default();
                match parent {
                    Some(Node::EncryptedKey) => {
                        if let Some(key) = self.keys.last_mut() {
                            key.algorithm = algorithm;
                        }
                    }
                    Some(Node::EncryptedData) => self.algorithm = algorithm,
                    _ => {}
                }
            }
            Node::Other if parent == Some(Node::EncryptionMethod)
                && owner(stack) == Some(Node::EncryptedKey) =>
            {
                let algorithm = attribute(e, b"Algorithm")?;
                if let Some(key) = self.keys.last_mut() {
                    match ns {
                        Some(ns) if ns == DSIG_NS && local.as_ref() == b"DigestMethod" => {
                            key.digest = algorithm
                        }
                        Some(ns) if ns == XENC11_NS && local.as_ref() == b"MGF" => key.mgf = algorithm,
                        _ => {}
                    }
                }
            }
            _ => {}
        }
        Ok(node)
    }
}

/// Nearest enclosing EncryptedKey or EncryptedData.
fn owner(stack: &[Node]) -> Option<Node> {
    stack
        .iter()
        .rev()
        .copied()
        .find(|n| matches!(n, Node::EncryptedKey | Node::EncryptedData))
}

fn attribute(e: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>, TrustFailure> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| failure(e.to_string()))?;
        if attr.key.as_ref() == name {
            let value = attr.unescape_value().map_err(|e| failure(e.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}
