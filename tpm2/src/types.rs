// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 data types

use anyhow::{anyhow, bail, Result};

use super::constants::*;
use super::marshal::*;

fn alg_from_u16(v: u16) -> Result<TpmAlgId> {
    TpmAlgId::from_u16(v).ok_or_else(|| anyhow!("unknown algorithm: 0x{:04x}", v))
}

/// TPM2B_DIGEST - Variable length digest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tpm2bDigest {
    pub buffer: Vec<u8>,
}

impl Tpm2bDigest {
    pub fn empty() -> Self {
        Self { buffer: Vec::new() }
    }
}

impl Marshal for Tpm2bDigest {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.buffer);
    }
}

impl Unmarshal for Tpm2bDigest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            buffer: buf.get_tpm2b()?,
        })
    }
}

/// TPM2B_AUTH - Authorization value
pub type Tpm2bAuth = Tpm2bDigest;

/// TPML_PCR_SELECTION - only the empty selection is ever sent
#[derive(Debug, Clone, Copy, Default)]
pub struct TpmlPcrSelection;

impl Marshal for TpmlPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(0);
    }
}

/// TPMT_SYM_DEF_OBJECT - Symmetric algorithm definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtSymDef {
    pub algorithm: TpmAlgId,
    pub key_bits: u16,
    pub mode: TpmAlgId,
}

impl TpmtSymDef {
    pub fn null() -> Self {
        Self {
            algorithm: TpmAlgId::Null,
            key_bits: 0,
            mode: TpmAlgId::Null,
        }
    }

    pub fn aes_128_cfb() -> Self {
        Self {
            algorithm: TpmAlgId::Aes,
            key_bits: 128,
            mode: TpmAlgId::Cfb,
        }
    }
}

impl Marshal for TpmtSymDef {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.algorithm.to_u16());
        if self.algorithm != TpmAlgId::Null {
            buf.put_u16(self.key_bits);
            buf.put_u16(self.mode.to_u16());
        }
    }
}

impl Unmarshal for TpmtSymDef {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let algorithm = alg_from_u16(buf.get_u16()?)?;
        if algorithm == TpmAlgId::Null {
            return Ok(Self::null());
        }
        let key_bits = buf.get_u16()?;
        let mode = alg_from_u16(buf.get_u16()?)?;
        Ok(Self {
            algorithm,
            key_bits,
            mode,
        })
    }
}

/// A `{scheme, hash}` pair as used by TPMT_RSA_SCHEME, TPMT_ECC_SCHEME,
/// TPMT_KDF_SCHEME and TPMT_SIG_SCHEME. The hash is absent for `TPM_ALG_NULL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtScheme {
    pub scheme: TpmAlgId,
    pub hash_alg: Option<TpmAlgId>,
}

impl TpmtScheme {
    pub fn null() -> Self {
        Self {
            scheme: TpmAlgId::Null,
            hash_alg: None,
        }
    }

    pub fn ecdsa(hash: TpmAlgId) -> Self {
        Self {
            scheme: TpmAlgId::EcDsa,
            hash_alg: Some(hash),
        }
    }
}

impl Marshal for TpmtScheme {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.scheme.to_u16());
        if let Some(hash) = self.hash_alg {
            buf.put_u16(hash.to_u16());
        }
    }
}

impl Unmarshal for TpmtScheme {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let scheme = alg_from_u16(buf.get_u16()?)?;
        let hash_alg = if scheme == TpmAlgId::Null {
            None
        } else {
            Some(alg_from_u16(buf.get_u16()?)?)
        };
        Ok(Self { scheme, hash_alg })
    }
}

pub type TpmtRsaScheme = TpmtScheme;
pub type TpmtEccScheme = TpmtScheme;
pub type TpmtKdfScheme = TpmtScheme;
pub type TpmtSigScheme = TpmtScheme;

/// TPMS_RSA_PARMS - RSA key parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsRsaParms {
    pub symmetric: TpmtSymDef,
    pub scheme: TpmtRsaScheme,
    pub key_bits: u16,
    pub exponent: u32,
}

impl TpmsRsaParms {
    pub fn storage_key() -> Self {
        Self {
            symmetric: TpmtSymDef::aes_128_cfb(),
            scheme: TpmtRsaScheme::null(),
            key_bits: 2048,
            exponent: 0, // Default exponent (65537)
        }
    }
}

impl Marshal for TpmsRsaParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.symmetric.marshal(buf);
        self.scheme.marshal(buf);
        buf.put_u16(self.key_bits);
        buf.put_u32(self.exponent);
    }
}

impl Unmarshal for TpmsRsaParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            symmetric: TpmtSymDef::unmarshal(buf)?,
            scheme: TpmtRsaScheme::unmarshal(buf)?,
            key_bits: buf.get_u16()?,
            exponent: buf.get_u32()?,
        })
    }
}

/// TPMS_ECC_PARMS - ECC key parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsEccParms {
    pub symmetric: TpmtSymDef,
    pub scheme: TpmtEccScheme,
    pub curve_id: TpmEccCurve,
    pub kdf: TpmtKdfScheme,
}

impl Marshal for TpmsEccParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.symmetric.marshal(buf);
        self.scheme.marshal(buf);
        buf.put_u16(self.curve_id.to_u16());
        self.kdf.marshal(buf);
    }
}

impl Unmarshal for TpmsEccParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let symmetric = TpmtSymDef::unmarshal(buf)?;
        let scheme = TpmtEccScheme::unmarshal(buf)?;
        let raw_curve = buf.get_u16()?;
        let curve_id = TpmEccCurve::from_u16(raw_curve)
            .ok_or_else(|| anyhow!("unknown ECC curve: 0x{:04x}", raw_curve))?;
        let kdf = TpmtKdfScheme::unmarshal(buf)?;
        Ok(Self {
            symmetric,
            scheme,
            curve_id,
            kdf,
        })
    }
}

/// TPMU_PUBLIC_PARMS - Public parameters union
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmtPublicParms {
    Rsa(TpmsRsaParms),
    Ecc(TpmsEccParms),
}

impl Marshal for TpmtPublicParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        match self {
            TpmtPublicParms::Rsa(p) => p.marshal(buf),
            TpmtPublicParms::Ecc(p) => p.marshal(buf),
        }
    }
}

/// TPMU_PUBLIC_ID - Unique identifier union
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmtPublicUnique {
    Rsa(Vec<u8>),          // TPM2B_PUBLIC_KEY_RSA
    Ecc(Vec<u8>, Vec<u8>), // TPMS_ECC_POINT (x, y)
}

impl Marshal for TpmtPublicUnique {
    fn marshal(&self, buf: &mut CommandBuffer) {
        match self {
            TpmtPublicUnique::Rsa(n) => buf.put_tpm2b(n),
            TpmtPublicUnique::Ecc(x, y) => {
                buf.put_tpm2b(x);
                buf.put_tpm2b(y);
            }
        }
    }
}

/// TPMT_PUBLIC - Public area template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtPublic {
    pub type_alg: TpmAlgId,
    pub name_alg: TpmAlgId,
    pub object_attributes: TpmaObject,
    pub auth_policy: Tpm2bDigest,
    pub parameters: TpmtPublicParms,
    pub unique: TpmtPublicUnique,
}

impl TpmtPublic {
    /// Create an RSA storage key template (SRK)
    ///
    /// This is the TCG "RSA 2048 storage primary" template. CreatePrimary is
    /// deterministic for a given hierarchy seed and template, so every
    /// invocation yields the same SRK.
    pub fn rsa_storage_key() -> Self {
        Self {
            type_alg: TpmAlgId::Rsa,
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_sensitive_data_origin()
                .with_user_with_auth()
                .with_restricted()
                .with_decrypt(),
            auth_policy: Tpm2bDigest::empty(),
            parameters: TpmtPublicParms::Rsa(TpmsRsaParms::storage_key()),
            unique: TpmtPublicUnique::Rsa(Vec::new()),
        }
    }

    /// Create an ECC signing key template
    ///
    /// The key is non-duplicable (fixedTPM, fixedParent), generated inside
    /// the TPM, usable for signing only and authorized with the empty
    /// owner-style auth value.
    pub fn ecc_signing_key(curve: TpmEccCurve, hash: TpmAlgId) -> Self {
        Self {
            type_alg: TpmAlgId::Ecc,
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_sensitive_data_origin()
                .with_user_with_auth()
                .with_sign_encrypt(),
            auth_policy: Tpm2bDigest::empty(),
            parameters: TpmtPublicParms::Ecc(TpmsEccParms {
                symmetric: TpmtSymDef::null(),
                scheme: TpmtEccScheme::ecdsa(hash),
                curve_id: curve,
                kdf: TpmtKdfScheme::null(),
            }),
            unique: TpmtPublicUnique::Ecc(Vec::new(), Vec::new()),
        }
    }

    /// The ECC public point, if this is an ECC key
    pub fn ecc_point(&self) -> Option<(TpmEccCurve, &[u8], &[u8])> {
        match (&self.parameters, &self.unique) {
            (TpmtPublicParms::Ecc(parms), TpmtPublicUnique::Ecc(x, y)) => {
                Some((parms.curve_id, x.as_slice(), y.as_slice()))
            }
            _ => None,
        }
    }
}

impl Marshal for TpmtPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.type_alg.to_u16());
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.object_attributes.0);
        self.auth_policy.marshal(buf);
        self.parameters.marshal(buf);
        self.unique.marshal(buf);
    }
}

impl Unmarshal for TpmtPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let type_alg = alg_from_u16(buf.get_u16()?)?;
        let name_alg = alg_from_u16(buf.get_u16()?)?;
        let object_attributes = TpmaObject(buf.get_u32()?);
        let auth_policy = Tpm2bDigest::unmarshal(buf)?;
        let (parameters, unique) = match type_alg {
            TpmAlgId::Rsa => {
                let parms = TpmsRsaParms::unmarshal(buf)?;
                let n = buf.get_tpm2b()?;
                (TpmtPublicParms::Rsa(parms), TpmtPublicUnique::Rsa(n))
            }
            TpmAlgId::Ecc => {
                let parms = TpmsEccParms::unmarshal(buf)?;
                let x = buf.get_tpm2b()?;
                let y = buf.get_tpm2b()?;
                (TpmtPublicParms::Ecc(parms), TpmtPublicUnique::Ecc(x, y))
            }
            other => bail!("unsupported public area type: {:?}", other),
        };
        Ok(Self {
            type_alg,
            name_alg,
            object_attributes,
            auth_policy,
            parameters,
            unique,
        })
    }
}

/// TPM2B_PUBLIC - Public area with size prefix
#[derive(Debug, Clone)]
pub struct Tpm2bPublic {
    pub public_area: Vec<u8>, // Raw marshalled TPMT_PUBLIC
}

impl Tpm2bPublic {
    pub fn from_template(template: &TpmtPublic) -> Self {
        Self {
            public_area: template.to_bytes(),
        }
    }

    /// Decode the public area, rejecting trailing bytes
    pub fn decode(&self) -> Result<TpmtPublic> {
        let mut buf = ResponseBuffer::new(&self.public_area);
        let public = TpmtPublic::unmarshal(&mut buf)?;
        if buf.remaining() != 0 {
            bail!("{} trailing bytes after TPMT_PUBLIC", buf.remaining());
        }
        Ok(public)
    }
}

impl Marshal for Tpm2bPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.public_area);
    }
}

impl Unmarshal for Tpm2bPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let public_area = buf.get_tpm2b()?;
        Ok(Self { public_area })
    }
}

/// TPM2B_PRIVATE - Private area, encrypted under the parent
#[derive(Debug, Clone)]
pub struct Tpm2bPrivate {
    pub buffer: Vec<u8>,
}

impl Tpm2bPrivate {
    pub fn new(data: Vec<u8>) -> Self {
        Self { buffer: data }
    }
}

impl Marshal for Tpm2bPrivate {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.buffer);
    }
}

impl Unmarshal for Tpm2bPrivate {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            buffer: buf.get_tpm2b()?,
        })
    }
}

/// TPM2B_SENSITIVE_CREATE - Sensitive data for object creation
///
/// Both the user auth and the sensitive data are left empty: keys are
/// generated by the TPM and authorized with the empty password.
#[derive(Debug, Clone, Default)]
pub struct Tpm2bSensitiveCreate {
    pub user_auth: Tpm2bAuth,
}

impl Tpm2bSensitiveCreate {
    pub fn empty() -> Self {
        Self::default()
    }
}

impl Marshal for Tpm2bSensitiveCreate {
    fn marshal(&self, buf: &mut CommandBuffer) {
        let mut inner = CommandBuffer::new();
        self.user_auth.marshal(&mut inner);
        inner.put_tpm2b_empty(); // data
        buf.put_tpm2b(inner.as_bytes());
    }
}

/// TPMT_TK_HASHCHECK - Ticket proving a digest was computed by the TPM
///
/// Only the NULL ticket is produced here; it is accepted for keys that are
/// not restricted.
#[derive(Debug, Clone)]
pub struct TpmtTkHashcheck {
    pub hierarchy: u32,
    pub digest: Tpm2bDigest,
}

impl TpmtTkHashcheck {
    pub fn null() -> Self {
        Self {
            hierarchy: tpm_rh::NULL,
            digest: Tpm2bDigest::empty(),
        }
    }
}

impl Marshal for TpmtTkHashcheck {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(TpmSt::HashCheck.to_u16());
        buf.put_u32(self.hierarchy);
        self.digest.marshal(buf);
    }
}

/// TPMT_SIGNATURE for the ECDSA scheme
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsSignatureEcdsa {
    pub hash_alg: TpmAlgId,
    pub r: Vec<u8>,
    pub s: Vec<u8>,
}

impl Unmarshal for TpmsSignatureEcdsa {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let sig_alg = alg_from_u16(buf.get_u16()?)?;
        if sig_alg != TpmAlgId::EcDsa {
            bail!("expected an ECDSA signature, got {:?}", sig_alg);
        }
        let hash_alg = alg_from_u16(buf.get_u16()?)?;
        let r = buf.get_tpm2b()?;
        let s = buf.get_tpm2b()?;
        Ok(Self { hash_alg, r, s })
    }
}

/// TPML_ECC_CURVE - Curves reported by `TPM_CAP_ECC_CURVES`
///
/// Curve identifiers this crate does not model are skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmlEccCurve {
    pub curves: Vec<TpmEccCurve>,
}

impl Unmarshal for TpmlEccCurve {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        if count * 2 > buf.remaining() {
            bail!("ECC curve list claims {} entries", count);
        }
        let mut curves = Vec::with_capacity(count);
        for _ in 0..count {
            if let Some(curve) = TpmEccCurve::from_u16(buf.get_u16()?) {
                curves.push(curve);
            }
        }
        Ok(Self { curves })
    }
}
