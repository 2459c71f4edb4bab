// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 backend.
//!
//! The host key is an ordinary ECC signing key under the storage root key
//! (SRK). The SRK is never persisted: it is re-derived from the owner seed
//! with the standard RSA storage template whenever a key is created or
//! loaded, then flushed again. The key's public and private blobs live in
//! the metadata directory.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context as _};
use tpm2::{
    find_tpm_error, tpm_rh, Tpm2bPrivate, Tpm2bPublic, TpmAlgId, TpmCc, TpmContext, TpmEccCurve,
    TpmError, TpmaObject, TpmtPublic,
};
use tracing::{debug, info, warn};

use super::{
    check_digest, poisoned, signature_from_scalars, EcPublicKey, EccAlgorithm, HashAlgorithm,
    KeyBlobs, KeyKind, KeySlots, Signer, Tee, TeeKey,
};
use crate::error::{Error, Result};
use crate::store::MetadataStore;

/// Linux errno values for a busy resource manager.
const EAGAIN: i32 = 11;
const EBUSY: i32 = 16;

struct LoadedKey {
    public: Tpm2bPublic,
    private: Tpm2bPrivate,
    /// Transient handle; `None` after the connection was re-opened.
    handle: Option<u32>,
}

struct TpmState {
    device: Option<PathBuf>,
    ctx: Option<TpmContext>,
    slots: KeySlots<LoadedKey>,
}

impl TpmState {
    fn ctx(&mut self) -> anyhow::Result<&mut TpmContext> {
        self.ctx.as_mut().context("TPM connection is not open")
    }

    /// Replace the connection. The resource manager flushes every transient
    /// object of the old connection, so all keys must be reloaded.
    fn reopen(&mut self) -> Result<()> {
        self.ctx = None;
        for key in self.slots.iter_mut() {
            key.handle = None;
        }
        self.ctx = Some(open_context(self.device.as_deref())?);
        Ok(())
    }

    /// Run `op`, replaying it once on a fresh connection after a transient failure.
    fn run<T>(
        &mut self,
        operation: &str,
        mut op: impl FnMut(&mut Self) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        match op(self) {
            Err(err) if is_transient(&err) => {
                warn!(operation, "transient TPM failure, reopening device: {err:#}");
                self.reopen()?;
                op(self)
            }
            other => other,
        }
    }

    fn loaded_handle(&mut self, index: usize) -> anyhow::Result<u32> {
        let ctx = self.ctx.as_mut().context("TPM connection is not open")?;
        let key = self.slots.get_mut(index)?;
        if let Some(handle) = key.handle {
            return Ok(handle);
        }
        let handle = with_srk(ctx, |ctx, srk| ctx.load(srk, &key.private, &key.public))?;
        debug!("reloaded host key as 0x{handle:08x}");
        key.handle = Some(handle);
        Ok(handle)
    }

    fn flush(&mut self, handle: u32) {
        let result = self.ctx().and_then(|ctx| ctx.flush_context(handle));
        if let Err(err) = result {
            warn!("failed to flush TPM handle 0x{handle:08x}: {err:#}");
        }
    }
}

pub struct TpmTee {
    store: MetadataStore,
    state: Arc<Mutex<TpmState>>,
}

impl TpmTee {
    /// Connect to the TPM at `device`, or probe the default device nodes.
    pub fn open(store: MetadataStore, device: Option<&Path>) -> Result<Self> {
        let ctx = open_context(device)?;
        info!(device = ctx.device_path(), "opened TPM");
        Ok(Self {
            store,
            state: Arc::new(Mutex::new(TpmState {
                device: device.map(Path::to_path_buf),
                ctx: Some(ctx),
                slots: KeySlots::new(),
            })),
        })
    }

    fn key(&self, index: usize, algorithm: EccAlgorithm, public: EcPublicKey) -> Box<dyn TeeKey> {
        Box::new(TpmKey {
            state: self.state.clone(),
            index,
            algorithm,
            public,
        })
    }
}

impl Tee for TpmTee {
    fn create_key(&self) -> Result<Box<dyn TeeKey>> {
        let mut state = self.state.lock().map_err(poisoned)?;
        if state.slots.is_closed() {
            return Err(Error::TeeUnavailable("TEE device has been closed".into()));
        }

        let algorithm = state
            .run("select curve", |st| select_curve(st.ctx()?))
            .map_err(unavailable)?;
        let (curve, hash) = tpm_curve(algorithm);
        let template = TpmtPublic::ecc_signing_key(curve, hash);

        let (public, private, handle) = state
            .run("create key", |st| {
                with_srk(st.ctx()?, |ctx, srk| {
                    let (public, private) = ctx.create(srk, &template)?;
                    let handle = ctx.load(srk, &private, &public)?;
                    Ok((public, private, handle))
                })
            })
            .map_err(unavailable)?;

        let blobs = KeyBlobs::new(
            KeyKind::Tpm,
            public.public_area.clone(),
            private.buffer.clone(),
        );
        let persisted = ec_public_key(&public).and_then(|ec| {
            self.store.write_key_blobs(&blobs)?;
            Ok(ec)
        });
        let ec = match persisted {
            Ok(ec) => ec,
            Err(err) => {
                state.flush(handle);
                return Err(err);
            }
        };

        let index = state.slots.insert(LoadedKey {
            public,
            private,
            handle: Some(handle),
        })?;
        info!(curve = %algorithm, "created TPM host key");
        Ok(self.key(index, algorithm, ec))
    }

    fn load_key(&self) -> Result<Box<dyn TeeKey>> {
        let blobs = self.store.read_key_blobs()?;
        if blobs.kind != KeyKind::Tpm {
            return Err(Error::KeyCorrupt(format!(
                "key envelope was written by the {:?} backend",
                blobs.kind
            )));
        }
        let public = Tpm2bPublic {
            public_area: blobs.public,
        };
        let private = Tpm2bPrivate::new(blobs.private);
        let ec = ec_public_key(&public)?;

        let mut state = self.state.lock().map_err(poisoned)?;
        if state.slots.is_closed() {
            return Err(Error::TeeUnavailable("TEE device has been closed".into()));
        }
        let handle = state
            .run("load key", |st| {
                with_srk(st.ctx()?, |ctx, srk| ctx.load(srk, &private, &public))
            })
            .map_err(load_failure)?;

        let algorithm = ec.algorithm();
        let index = state.slots.insert(LoadedKey {
            public,
            private,
            handle: Some(handle),
        })?;
        debug!(curve = %algorithm, "loaded TPM host key as 0x{handle:08x}");
        Ok(self.key(index, algorithm, ec))
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock().map_err(poisoned)?;
        for key in state.slots.close() {
            if let Some(handle) = key.handle {
                state.flush(handle);
            }
        }
        state.ctx = None;
        Ok(())
    }
}

struct TpmKey {
    state: Arc<Mutex<TpmState>>,
    index: usize,
    algorithm: EccAlgorithm,
    public: EcPublicKey,
}

impl TeeKey for TpmKey {
    fn ecc_algorithm(&self) -> EccAlgorithm {
        self.algorithm
    }

    fn signer(&self) -> Result<Arc<dyn Signer>> {
        self.state.lock().map_err(poisoned)?.slots.get(self.index)?;
        Ok(Arc::new(TpmSigner {
            state: self.state.clone(),
            index: self.index,
            public: self.public.clone(),
        }))
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock().map_err(poisoned)?;
        if let Some(handle) = state.slots.remove(self.index).and_then(|key| key.handle) {
            state.flush(handle);
        }
        Ok(())
    }
}

struct TpmSigner {
    state: Arc<Mutex<TpmState>>,
    index: usize,
    public: EcPublicKey,
}

impl Signer for TpmSigner {
    fn public_key(&self) -> &EcPublicKey {
        &self.public
    }

    fn sign(&self, digest: &[u8], hash: HashAlgorithm) -> Result<Vec<u8>> {
        let algorithm = self.public.algorithm();
        check_digest(algorithm, digest, hash)?;
        let (_, tpm_hash) = tpm_curve(algorithm);

        let mut state = self.state.lock().map_err(poisoned)?;
        state.slots.get(self.index)?;
        let (r, s) = state
            .run("sign", |st| {
                let handle = st.loaded_handle(self.index)?;
                st.ctx()?.sign(handle, digest, tpm_hash)
            })
            .map_err(|err| Error::Signing(format!("{err:#}")))?;
        signature_from_scalars(algorithm, &r, &s)
    }
}

fn open_context(device: Option<&Path>) -> Result<TpmContext> {
    let path = device
        .map(|p| {
            p.to_str().ok_or_else(|| {
                Error::InvalidArgument(format!("TPM device path {} is not UTF-8", p.display()))
            })
        })
        .transpose()?;
    TpmContext::new(path).map_err(unavailable)
}

fn unavailable(err: anyhow::Error) -> Error {
    Error::TeeUnavailable(format!("{err:#}"))
}

/// Classify a failed load.
///
/// Only a format-1 code from TPM2_Load itself blames the blobs. SRK
/// creation failures and everything else leave the key file alone.
fn load_failure(err: anyhow::Error) -> Error {
    match find_tpm_error(&err) {
        Some(&TpmError::ResponseCode {
            command: TpmCc::Load,
            code,
        }) if code & 0x80 != 0 => {
            Error::KeyCorrupt(format!("TPM rejected the key blobs: {err:#}"))
        }
        _ => unavailable(err),
    }
}

/// Transient response codes plus a busy or interrupted device node.
fn is_transient(err: &anyhow::Error) -> bool {
    if find_tpm_error(err).is_some_and(|e| e.is_transient()) {
        return true;
    }
    err.chain()
        .filter_map(|e| e.downcast_ref::<std::io::Error>())
        .any(|e| {
            e.kind() == std::io::ErrorKind::Interrupted
                || matches!(e.raw_os_error(), Some(EAGAIN | EBUSY))
        })
}

/// Create the SRK, run `f` under it and flush it again.
fn with_srk<T>(
    ctx: &mut TpmContext,
    f: impl FnOnce(&mut TpmContext, u32) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let (srk, _) = ctx
        .create_primary(tpm_rh::OWNER, &TpmtPublic::rsa_storage_key())
        .context("failed to create SRK")?;
    let result = f(ctx, srk);
    if let Err(err) = ctx.flush_context(srk) {
        warn!("failed to flush SRK: {err:#}");
    }
    result
}

/// Prefer P-384, fall back to P-256.
fn select_curve(ctx: &mut TpmContext) -> anyhow::Result<EccAlgorithm> {
    let curves = ctx.ecc_curves()?;
    if curves.contains(&TpmEccCurve::NistP384) {
        Ok(EccAlgorithm::P384)
    } else if curves.contains(&TpmEccCurve::NistP256) {
        Ok(EccAlgorithm::P256)
    } else {
        bail!("TPM implements neither P-384 nor P-256")
    }
}

fn tpm_curve(algorithm: EccAlgorithm) -> (TpmEccCurve, TpmAlgId) {
    match algorithm {
        EccAlgorithm::P256 => (TpmEccCurve::NistP256, TpmAlgId::Sha256),
        EccAlgorithm::P384 => (TpmEccCurve::NistP384, TpmAlgId::Sha384),
    }
}

fn ec_public_key(public: &Tpm2bPublic) -> Result<EcPublicKey> {
    let area = public
        .decode()
        .map_err(|e| Error::KeyCorrupt(format!("invalid public area: {e:#}")))?;
    if !area.object_attributes.contains(TpmaObject::SIGN_ENCRYPT) {
        return Err(Error::KeyCorrupt("key is not a signing key".into()));
    }
    let (curve, x, y) = area
        .ecc_point()
        .ok_or_else(|| Error::KeyCorrupt("key is not an ECC key".into()))?;
    let algorithm = match curve {
        TpmEccCurve::NistP256 => EccAlgorithm::P256,
        TpmEccCurve::NistP384 => EccAlgorithm::P384,
        other => return Err(Error::KeyCorrupt(format!("unsupported curve {other:?}"))),
    };
    EcPublicKey::from_coordinates(algorithm, x, y).map_err(|e| Error::KeyCorrupt(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::elliptic_curve::sec1::ToEncodedPoint;
    use tpm2::TpmtPublicUnique;

    fn detached(dir: &Path) -> TpmTee {
        TpmTee {
            store: MetadataStore::new(dir),
            state: Arc::new(Mutex::new(TpmState {
                device: None,
                ctx: None,
                slots: KeySlots::new(),
            })),
        }
    }

    fn p256_public_area() -> (Tpm2bPublic, Vec<u8>) {
        let secret = p256::SecretKey::from_slice(&[3u8; 32]).unwrap();
        let point = secret.public_key().to_encoded_point(false);
        let mut template = TpmtPublic::ecc_signing_key(TpmEccCurve::NistP256, TpmAlgId::Sha256);
        template.unique =
            TpmtPublicUnique::Ecc(point.x().unwrap().to_vec(), point.y().unwrap().to_vec());
        (
            Tpm2bPublic::from_template(&template),
            point.as_bytes().to_vec(),
        )
    }

    #[test]
    fn test_public_area_to_ec_key() {
        let (public, sec1) = p256_public_area();
        let key = ec_public_key(&public).unwrap();
        assert_eq!(key.algorithm(), EccAlgorithm::P256);
        assert_eq!(key.sec1_bytes(), sec1.as_slice());
    }

    #[test]
    fn test_storage_key_is_not_a_host_key() {
        let public = Tpm2bPublic::from_template(&TpmtPublic::rsa_storage_key());
        assert!(matches!(ec_public_key(&public), Err(Error::KeyCorrupt(_))));
    }

    #[test]
    fn test_load_without_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let tee = detached(dir.path());
        assert!(matches!(tee.load_key(), Err(Error::KeyNotFound)));
    }

    #[test]
    fn test_load_rejects_foreign_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        store
            .write_key_blobs(&KeyBlobs::new(KeyKind::Software, vec![4; 65], vec![1; 32]))
            .unwrap();
        assert!(matches!(
            detached(dir.path()).load_key(),
            Err(Error::KeyCorrupt(_))
        ));
    }

    #[test]
    fn test_transient_classification() {
        let busy: anyhow::Error = TpmError::ResponseCode {
            command: TpmCc::Load,
            code: 0x902,
        }
        .into();
        assert!(is_transient(&busy.context("Load failed")));

        let interrupted = anyhow::Error::from(std::io::Error::from_raw_os_error(EBUSY));
        assert!(is_transient(&interrupted));

        let integrity: anyhow::Error = TpmError::ResponseCode {
            command: TpmCc::Load,
            code: 0x19F,
        }
        .into();
        assert!(!is_transient(&integrity));
    }

    fn tpm_failure(command: TpmCc, code: u32, context: &'static str) -> anyhow::Error {
        anyhow::Error::from(TpmError::ResponseCode { command, code }).context(context)
    }

    #[test]
    fn test_load_failure_blames_blobs_only_for_load() {
        // TPM_RC_INTEGRITY on the private blob
        let rejected = tpm_failure(TpmCc::Load, 0x19F, "Load failed");
        assert!(matches!(load_failure(rejected), Error::KeyCorrupt(_)));

        // A locked-out or broken owner hierarchy must not condemn the key.
        let srk = tpm_failure(TpmCc::CreatePrimary, 0x1C4, "failed to create SRK");
        assert!(matches!(load_failure(srk), Error::TeeUnavailable(_)));

        let lockout = tpm_failure(TpmCc::Load, 0x921, "Load failed");
        assert!(matches!(load_failure(lockout), Error::TeeUnavailable(_)));

        let io = anyhow::Error::from(std::io::Error::from_raw_os_error(EBUSY));
        assert!(matches!(load_failure(io), Error::TeeUnavailable(_)));
    }

    #[test]
    fn test_closed_device_rejects_keys() {
        let dir = tempfile::tempdir().unwrap();
        let tee = detached(dir.path());
        tee.close().unwrap();
        tee.close().unwrap();
        assert!(matches!(tee.create_key(), Err(Error::TeeUnavailable(_))));
    }
}
