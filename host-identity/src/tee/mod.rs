// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TEE adapter: custody of the non-extractable host key.
//!
//! A [`Tee`] creates or reloads the single host key of a metadata directory
//! and hands out [`TeeKey`] handles. Each key exposes a [`Signer`] that
//! submits digests to the TEE; the private scalar never enters this process
//! (the software backend excepted).
//!
//! Backends keep their keys in a [`KeySlots`] arena owned by the device.
//! A key handle is an index into it, so closing a key empties one slot and
//! closing the device empties all of them.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use der::asn1::{Any, BitString, ObjectIdentifier};
use p256::elliptic_curve::sec1::ToEncodedPoint as _;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use sha2::Digest;
use spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};

use crate::config::TeeBackend;
use crate::error::{Error, Result};
use crate::oids;
use crate::store::MetadataStore;

pub mod envelope;
mod software;
mod tpm;
mod unavailable;

pub use envelope::{KeyBlobs, KeyKind};
pub use software::SoftwareTee;
pub use tpm::TpmTee;
pub use unavailable::UnavailableTee;

/// Curves a host key may live on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EccAlgorithm {
    P256,
    P384,
}

impl EccAlgorithm {
    /// The hash that must be used with this curve.
    pub fn hash(self) -> HashAlgorithm {
        match self {
            EccAlgorithm::P256 => HashAlgorithm::Sha256,
            EccAlgorithm::P384 => HashAlgorithm::Sha384,
        }
    }

    pub fn coordinate_size(self) -> usize {
        match self {
            EccAlgorithm::P256 => 32,
            EccAlgorithm::P384 => 48,
        }
    }

    pub fn curve_oid(self) -> ObjectIdentifier {
        match self {
            EccAlgorithm::P256 => oids::SECP256R1,
            EccAlgorithm::P384 => oids::SECP384R1,
        }
    }

    pub fn from_curve_oid(oid: &ObjectIdentifier) -> Option<Self> {
        if *oid == oids::SECP256R1 {
            Some(EccAlgorithm::P256)
        } else if *oid == oids::SECP384R1 {
            Some(EccAlgorithm::P384)
        } else {
            None
        }
    }

    /// X.509 signature algorithm for signatures made with this curve.
    pub fn signature_oid(self) -> ObjectIdentifier {
        match self {
            EccAlgorithm::P256 => oids::ECDSA_WITH_SHA256,
            EccAlgorithm::P384 => oids::ECDSA_WITH_SHA384,
        }
    }

    /// RFC 9421 algorithm name.
    pub fn http_signature_algorithm(self) -> &'static str {
        match self {
            EccAlgorithm::P256 => "ecdsa-p256-sha256",
            EccAlgorithm::P384 => "ecdsa-p384-sha384",
        }
    }
}

impl fmt::Display for EccAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EccAlgorithm::P256 => f.write_str("P-256"),
            EccAlgorithm::P384 => f.write_str("P-384"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
}

impl HashAlgorithm {
    pub fn output_size(self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha256 => sha2::Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha384 => sha2::Sha384::digest(data).to_vec(),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Sha256 => f.write_str("SHA-256"),
            HashAlgorithm::Sha384 => f.write_str("SHA-384"),
        }
    }
}

/// An EC public key in canonical form: curve plus uncompressed SEC1 point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcPublicKey {
    algorithm: EccAlgorithm,
    point: Vec<u8>,
}

impl EcPublicKey {
    /// Parse a compressed or uncompressed SEC1 point and canonicalize it.
    pub fn from_sec1(algorithm: EccAlgorithm, bytes: &[u8]) -> Result<Self> {
        let point = match algorithm {
            EccAlgorithm::P256 => p256::PublicKey::from_sec1_bytes(bytes)
                .map(|key| key.to_encoded_point(false).as_bytes().to_vec()),
            EccAlgorithm::P384 => p384::PublicKey::from_sec1_bytes(bytes)
                .map(|key| key.to_encoded_point(false).as_bytes().to_vec()),
        }
        .map_err(|_| Error::InvalidArgument(format!("not a valid {algorithm} point")))?;
        Ok(Self { algorithm, point })
    }

    /// Build from affine coordinates, left-padding short big-endian values.
    pub fn from_coordinates(algorithm: EccAlgorithm, x: &[u8], y: &[u8]) -> Result<Self> {
        let size = algorithm.coordinate_size();
        if x.len() > size || y.len() > size {
            return Err(Error::InvalidArgument(format!(
                "coordinate too long for {algorithm}"
            )));
        }
        let mut sec1 = vec![0u8; 1 + 2 * size];
        sec1[0] = 0x04;
        sec1[1 + size - x.len()..1 + size].copy_from_slice(x);
        sec1[1 + 2 * size - y.len()..].copy_from_slice(y);
        Self::from_sec1(algorithm, &sec1)
    }

    pub fn from_spki(spki: &SubjectPublicKeyInfoOwned) -> Result<Self> {
        if spki.algorithm.oid != oids::EC_PUBLIC_KEY {
            return Err(Error::InvalidArgument(format!(
                "public key algorithm {} is not EC",
                spki.algorithm.oid
            )));
        }
        let curve = spki
            .algorithm
            .parameters
            .as_ref()
            .and_then(|params| params.decode_as::<ObjectIdentifier>().ok())
            .ok_or_else(|| Error::InvalidArgument("EC key without a named curve".into()))?;
        let algorithm = EccAlgorithm::from_curve_oid(&curve)
            .ok_or_else(|| Error::InvalidArgument(format!("unsupported curve {curve}")))?;
        let point = spki
            .subject_public_key
            .as_bytes()
            .ok_or_else(|| Error::InvalidArgument("public key has unused bits".into()))?;
        Self::from_sec1(algorithm, point)
    }

    pub fn algorithm(&self) -> EccAlgorithm {
        self.algorithm
    }

    /// Uncompressed SEC1 encoding (`0x04 || x || y`).
    pub fn sec1_bytes(&self) -> &[u8] {
        &self.point
    }

    pub fn to_spki(&self) -> Result<SubjectPublicKeyInfoOwned> {
        let encoding = |e: der::Error| Error::InvalidArgument(format!("encode SPKI: {e}"));
        Ok(SubjectPublicKeyInfoOwned {
            algorithm: AlgorithmIdentifierOwned {
                oid: oids::EC_PUBLIC_KEY,
                parameters: Some(Any::encode_from(&self.algorithm.curve_oid()).map_err(encoding)?),
            },
            subject_public_key: BitString::from_bytes(&self.point).map_err(encoding)?,
        })
    }

    pub fn to_spki_der(&self) -> Result<Vec<u8>> {
        use der::Encode;
        self.to_spki()?
            .to_der()
            .map_err(|e| Error::InvalidArgument(format!("encode SPKI: {e}")))
    }

    /// Verify a DER-encoded ECDSA signature over a prehashed message.
    pub fn verify_der(&self, digest: &[u8], signature: &[u8]) -> Result<()> {
        let bad = |_| Error::Signing("signature verification failed".into());
        match self.algorithm {
            EccAlgorithm::P256 => {
                let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(&self.point).map_err(bad)?;
                let sig = p256::ecdsa::Signature::from_der(signature).map_err(bad)?;
                key.verify_prehash(digest, &sig).map_err(bad)
            }
            EccAlgorithm::P384 => {
                let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(&self.point).map_err(bad)?;
                let sig = p384::ecdsa::Signature::from_der(signature).map_err(bad)?;
                key.verify_prehash(digest, &sig).map_err(bad)
            }
        }
    }

    /// Verify a fixed-width `r || s` signature over a prehashed message.
    pub fn verify_raw(&self, digest: &[u8], signature: &[u8]) -> Result<()> {
        let der = signature_from_raw(self.algorithm, signature)?;
        self.verify_der(digest, &der)
    }
}

/// Signing capability of a host key.
///
/// Implementations serialize concurrent calls at the TEE.
pub trait Signer: Send + Sync {
    fn public_key(&self) -> &EcPublicKey;

    /// Sign a prehashed message; returns a DER-encoded ECDSA signature.
    ///
    /// `hash` must be the hash matched to the key's curve.
    fn sign(&self, digest: &[u8], hash: HashAlgorithm) -> Result<Vec<u8>>;
}

/// Handle to a key held by a [`Tee`].
pub trait TeeKey: Send + Sync {
    fn ecc_algorithm(&self) -> EccAlgorithm;

    fn signer(&self) -> Result<Arc<dyn Signer>>;

    /// Release the key. Idempotent; outstanding signers stop working.
    fn close(&self) -> Result<()>;
}

/// A platform TEE bound to one metadata directory.
pub trait Tee: Send + Sync {
    /// Create the host key, persist its blobs and return a loaded handle.
    fn create_key(&self) -> Result<Box<dyn TeeKey>>;

    /// Reload the persisted host key.
    ///
    /// Fails with [`Error::KeyNotFound`] when no key was ever created.
    fn load_key(&self) -> Result<Box<dyn TeeKey>>;

    /// Release the device and every key handed out. Idempotent.
    fn close(&self) -> Result<()>;
}

/// Open the TEE selected by `backend` for keys stored under `metadata_dir`.
pub fn open_tee(backend: &TeeBackend, metadata_dir: &Path) -> Result<Arc<dyn Tee>> {
    if metadata_dir.as_os_str().is_empty() {
        return Err(Error::InvalidArgument(
            "metadata directory must not be empty".into(),
        ));
    }
    let store = MetadataStore::new(metadata_dir);
    Ok(match backend {
        TeeBackend::Tpm { device } => Arc::new(TpmTee::open(store, device.as_deref())?),
        TeeBackend::Software { p256_only } => Arc::new(SoftwareTee::new(store, *p256_only)),
        TeeBackend::Unavailable => Arc::new(UnavailableTee),
    })
}

pub(crate) fn check_digest(
    algorithm: EccAlgorithm,
    digest: &[u8],
    hash: HashAlgorithm,
) -> Result<()> {
    if hash != algorithm.hash() {
        return Err(Error::InvalidArgument(format!(
            "{hash} cannot be used with a {algorithm} key"
        )));
    }
    if digest.len() != hash.output_size() {
        return Err(Error::InvalidArgument(format!(
            "{hash} digest must be {} bytes, got {}",
            hash.output_size(),
            digest.len()
        )));
    }
    Ok(())
}

/// DER-encode an ECDSA signature given as big-endian scalars.
pub fn signature_from_scalars(algorithm: EccAlgorithm, r: &[u8], s: &[u8]) -> Result<Vec<u8>> {
    let size = algorithm.coordinate_size();
    let r = r.strip_prefix(&[0u8][..]).unwrap_or(r);
    let s = s.strip_prefix(&[0u8][..]).unwrap_or(s);
    if r.len() > size || s.len() > size {
        return Err(Error::Signing("TEE returned an oversized scalar".into()));
    }
    let mut raw = vec![0u8; 2 * size];
    raw[size - r.len()..size].copy_from_slice(r);
    raw[2 * size - s.len()..].copy_from_slice(s);
    signature_from_raw(algorithm, &raw)
}

/// Convert `r || s` to DER.
pub fn signature_from_raw(algorithm: EccAlgorithm, raw: &[u8]) -> Result<Vec<u8>> {
    let bad = |_| Error::Signing(format!("malformed {algorithm} signature"));
    Ok(match algorithm {
        EccAlgorithm::P256 => p256::ecdsa::Signature::from_slice(raw)
            .map_err(bad)?
            .to_der()
            .as_bytes()
            .to_vec(),
        EccAlgorithm::P384 => p384::ecdsa::Signature::from_slice(raw)
            .map_err(bad)?
            .to_der()
            .as_bytes()
            .to_vec(),
    })
}

/// Convert a DER signature to fixed-width `r || s`.
pub fn signature_to_raw(algorithm: EccAlgorithm, der: &[u8]) -> Result<Vec<u8>> {
    let bad = |_| Error::Signing(format!("malformed {algorithm} signature"));
    Ok(match algorithm {
        EccAlgorithm::P256 => p256::ecdsa::Signature::from_der(der)
            .map_err(bad)?
            .to_bytes()
            .to_vec(),
        EccAlgorithm::P384 => p384::ecdsa::Signature::from_der(der)
            .map_err(bad)?
            .to_bytes()
            .to_vec(),
    })
}

/// Arena of loaded keys owned by a device.
pub(crate) struct KeySlots<T> {
    slots: Vec<Option<T>>,
    closed: bool,
}

impl<T> KeySlots<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            closed: false,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// Slots are never reused, so a stale handle cannot reach a newer key.
    pub(crate) fn insert(&mut self, value: T) -> Result<usize> {
        self.ensure_open()?;
        self.slots.push(Some(value));
        Ok(self.slots.len() - 1)
    }

    pub(crate) fn get(&self, index: usize) -> Result<&T> {
        self.ensure_open()?;
        self.slots
            .get(index)
            .and_then(Option::as_ref)
            .ok_or_else(closed_key)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Result<&mut T> {
        self.ensure_open()?;
        self.slots
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or_else(closed_key)
    }

    pub(crate) fn remove(&mut self, index: usize) -> Option<T> {
        self.slots.get_mut(index).and_then(Option::take)
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().flatten()
    }

    /// Mark the arena closed and hand back whatever was still live.
    pub(crate) fn close(&mut self) -> Vec<T> {
        self.closed = true;
        self.slots.drain(..).flatten().collect()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::TeeUnavailable("TEE device has been closed".into()));
        }
        Ok(())
    }
}

fn closed_key() -> Error {
    Error::InvalidArgument("key handle has been closed".into())
}

pub(crate) fn poisoned<G>(_: std::sync::PoisonError<G>) -> Error {
    Error::TeeUnavailable("TEE state lock poisoned".into())
}
