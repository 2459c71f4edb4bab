// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! RFC 9421 HTTP message signatures with the host key.
//!
//! The profile is fixed: label `sig`, covered components `@method`,
//! `@authority`, `@path`, `@query` and `content-digest`, and metadata
//! `created`, `keyid` (certificate serial, upper-case hex) and `nonce`.
//! `@target-uri` is left out so signatures survive a proxy rewriting the
//! scheme, and `alg` is never sent; verifiers derive it from `keyid`.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Url;
use sha2::Digest;
use tracing::trace;
use x509_cert::serial_number::SerialNumber;
use x509_cert::Certificate;

use crate::error::{Error, Result};
use crate::tee::{signature_to_raw, EcPublicKey, EccAlgorithm, Signer};

pub const SIGNATURE_LABEL: &str = "sig";
pub const COVERED_COMPONENTS: [&str; 5] =
    ["@method", "@authority", "@path", "@query", "content-digest"];

pub const CONTENT_DIGEST: HeaderName = HeaderName::from_static("content-digest");
pub const SIGNATURE_INPUT: HeaderName = HeaderName::from_static("signature-input");
pub const SIGNATURE: HeaderName = HeaderName::from_static("signature");

/// `sha-256=:<base64>:` for `body`.
pub fn content_digest(body: &[u8]) -> String {
    format!("sha-256=:{}:", STANDARD.encode(sha2::Sha256::digest(body)))
}

/// Certificate serial as an unsigned integer in upper-case hex, no leading zeros.
pub fn keyid_from_serial(serial: &SerialNumber) -> String {
    let hex = hex::encode_upper(serial.as_bytes());
    match hex.trim_start_matches('0') {
        "" => "0".to_string(),
        trimmed => trimmed.to_string(),
    }
}

/// The three headers a signed request carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeaders {
    pub content_digest: String,
    pub signature_input: String,
    pub signature: String,
}

/// Signs requests with a host key on behalf of its certificate.
///
/// Cheap to clone; clones share the underlying TEE signer.
#[derive(Clone)]
pub struct HttpSigner {
    signer: Arc<dyn Signer>,
    keyid: String,
    algorithm: EccAlgorithm,
}

impl HttpSigner {
    pub fn new(signer: Arc<dyn Signer>, certificate: &Certificate) -> Self {
        let algorithm = signer.public_key().algorithm();
        Self {
            keyid: keyid_from_serial(&certificate.tbs_certificate.serial_number),
            signer,
            algorithm,
        }
    }

    pub fn keyid(&self) -> &str {
        &self.keyid
    }

    /// RFC 9421 algorithm name matching the key's curve.
    pub fn algorithm(&self) -> &'static str {
        self.algorithm.http_signature_algorithm()
    }

    /// Sign a request given as method, URL and the final body bytes.
    pub fn sign_parts(&self, method: &str, url: &Url, body: &[u8]) -> Result<SignatureHeaders> {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| Error::Signing("system clock is before the Unix epoch".into()))?
            .as_secs();
        let mut nonce = [0u8; 16];
        OsRng.fill_bytes(&mut nonce);
        self.sign_parts_at(method, url, body, created, &URL_SAFE_NO_PAD.encode(nonce))
    }

    /// [`Self::sign_parts`] with caller-chosen `created` and `nonce`.
    pub fn sign_parts_at(
        &self,
        method: &str,
        url: &Url,
        body: &[u8],
        created: u64,
        nonce: &str,
    ) -> Result<SignatureHeaders> {
        let content_digest = content_digest(body);
        let params = signature_params(created, &self.keyid, nonce);
        let base = signature_base(method, url, &content_digest, &params)?;
        trace!(%base, "signature base");

        let hash = self.algorithm.hash();
        let der = self.signer.sign(&hash.digest(base.as_bytes()), hash)?;
        let raw = signature_to_raw(self.algorithm, &der)?;

        Ok(SignatureHeaders {
            content_digest,
            signature_input: format!("{SIGNATURE_LABEL}={params}"),
            signature: format!("{SIGNATURE_LABEL}=:{}:", STANDARD.encode(raw)),
        })
    }

    /// Add `Content-Digest`, `Signature-Input` and `Signature` to `request`.
    ///
    /// The body must be buffered; streaming bodies cannot be digested.
    pub fn sign_request(&self, request: &mut reqwest::Request) -> Result<()> {
        let body = match request.body() {
            None => &[][..],
            Some(body) => body.as_bytes().ok_or_else(|| {
                Error::InvalidArgument("cannot sign a streaming request body".into())
            })?,
        };
        let headers = self.sign_parts(request.method().as_str(), request.url(), body)?;

        let value = |s: String| {
            HeaderValue::try_from(s)
                .map_err(|e| Error::Signing(format!("invalid signature header: {e}")))
        };
        let map = request.headers_mut();
        map.insert(CONTENT_DIGEST, value(headers.content_digest)?);
        map.insert(SIGNATURE_INPUT, value(headers.signature_input)?);
        map.insert(SIGNATURE, value(headers.signature)?);
        Ok(())
    }
}

fn signature_params(created: u64, keyid: &str, nonce: &str) -> String {
    let components = COVERED_COMPONENTS
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(" ");
    format!("({components});created={created};keyid=\"{keyid}\";nonce=\"{nonce}\"")
}

fn authority(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidArgument(format!("URL {url} has no host")))?
        .to_ascii_lowercase();
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    })
}

fn signature_base(method: &str, url: &Url, content_digest: &str, params: &str) -> Result<String> {
    let path = match url.path() {
        "" => "/",
        path => path,
    };
    let query = url.query().unwrap_or_default();
    Ok(format!(
        "\"@method\": {}\n\"@authority\": {}\n\"@path\": {path}\n\"@query\": ?{query}\n\
         \"content-digest\": {content_digest}\n\"@signature-params\": {params}",
        method.to_ascii_uppercase(),
        authority(url)?,
    ))
}

/// Metadata of a signature that passed [`verify_headers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSignature {
    pub keyid: String,
    pub created: u64,
    pub nonce: String,
}

fn rejected(msg: impl Into<String>) -> Error {
    Error::Signing(format!("signature rejected: {}", msg.into()))
}

fn strip_label<'a>(header: &'a str, name: &str) -> Result<&'a str> {
    header
        .strip_prefix(SIGNATURE_LABEL)
        .and_then(|rest| rest.strip_prefix('='))
        .ok_or_else(|| rejected(format!("{name} has no `{SIGNATURE_LABEL}` entry")))
}

/// Check a signed request the way the receiving server does.
///
/// Enforces the fixed component list, requires `created`, `keyid` and
/// `nonce`, refuses `alg`, checks `Content-Digest` against `body` and the
/// raw `r || s` signature against `key`. Resolving `keyid` to `key` is the
/// caller's business.
pub fn verify_headers(
    method: &str,
    url: &Url,
    body: &[u8],
    headers: &SignatureHeaders,
    key: &EcPublicKey,
) -> Result<VerifiedSignature> {
    if headers.content_digest != content_digest(body) {
        return Err(rejected("content-digest does not match the body"));
    }

    let params = strip_label(&headers.signature_input, "Signature-Input")?;
    let (components, metadata) = params
        .strip_prefix('(')
        .and_then(|rest| rest.split_once(')'))
        .ok_or_else(|| rejected("malformed component list"))?;
    let components = components
        .split_whitespace()
        .map(|c| c.trim_matches('"'))
        .collect::<Vec<_>>();
    if components != COVERED_COMPONENTS {
        return Err(rejected(format!("unexpected components {components:?}")));
    }

    let mut created = None;
    let mut keyid = None;
    let mut nonce = None;
    for param in metadata.split(';').filter(|p| !p.is_empty()) {
        let (name, value) = param
            .split_once('=')
            .ok_or_else(|| rejected(format!("malformed parameter {param:?}")))?;
        match name {
            "created" => {
                created = Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| rejected("created is not an integer"))?,
                )
            }
            "keyid" => keyid = Some(value.trim_matches('"').to_string()),
            "nonce" => nonce = Some(value.trim_matches('"').to_string()),
            "alg" => return Err(rejected("alg parameter is not allowed")),
            _ => {}
        }
    }
    let (Some(created), Some(keyid), Some(nonce)) = (created, keyid, nonce) else {
        return Err(rejected("created, keyid and nonce are required"));
    };

    let signature = strip_label(&headers.signature, "Signature")?
        .strip_prefix(':')
        .and_then(|s| s.strip_suffix(':'))
        .ok_or_else(|| rejected("signature is not a byte sequence"))?;
    let signature = STANDARD
        .decode(signature)
        .map_err(|_| rejected("signature is not base64"))?;

    let base = signature_base(method, url, &headers.content_digest, params)?;
    let hash = key.algorithm().hash();
    key.verify_raw(&hash.digest(base.as_bytes()), &signature)
        .map_err(|_| rejected("signature does not verify"))?;

    Ok(VerifiedSignature {
        keyid,
        created,
        nonce,
    })
}
