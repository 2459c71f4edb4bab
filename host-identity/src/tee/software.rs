// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! File-backed keys for development machines and tests.
//!
//! The private scalar is stored in the key envelope and held in memory, so
//! this backend offers none of the guarantees of a TPM.

use std::sync::{Arc, Mutex};

use p256::ecdsa::signature::hazmat::PrehashSigner;
use rand::rngs::OsRng;
use tracing::info;

use super::{
    check_digest, poisoned, EcPublicKey, EccAlgorithm, HashAlgorithm, KeyBlobs, KeyKind,
    KeySlots, Signer, Tee, TeeKey,
};
use crate::error::{Error, Result};
use crate::store::MetadataStore;

enum SigningKey {
    P256(p256::ecdsa::SigningKey),
    P384(p384::ecdsa::SigningKey),
}

impl SigningKey {
    fn generate(algorithm: EccAlgorithm) -> Self {
        match algorithm {
            EccAlgorithm::P256 => SigningKey::P256(p256::ecdsa::SigningKey::random(&mut OsRng)),
            EccAlgorithm::P384 => SigningKey::P384(p384::ecdsa::SigningKey::random(&mut OsRng)),
        }
    }

    fn from_blobs(blobs: &KeyBlobs) -> Result<Self> {
        let corrupt = |_| Error::KeyCorrupt("invalid software key scalar".into());
        let key = match blobs.private.len() {
            32 => SigningKey::P256(
                p256::ecdsa::SigningKey::from_slice(&blobs.private).map_err(corrupt)?,
            ),
            48 => SigningKey::P384(
                p384::ecdsa::SigningKey::from_slice(&blobs.private).map_err(corrupt)?,
            ),
            n => return Err(Error::KeyCorrupt(format!("software key scalar of {n} bytes"))),
        };
        if key.public_key()?.sec1_bytes() != blobs.public.as_slice() {
            return Err(Error::KeyCorrupt(
                "public blob does not match the private scalar".into(),
            ));
        }
        Ok(key)
    }

    fn algorithm(&self) -> EccAlgorithm {
        match self {
            SigningKey::P256(_) => EccAlgorithm::P256,
            SigningKey::P384(_) => EccAlgorithm::P384,
        }
    }

    fn public_key(&self) -> Result<EcPublicKey> {
        let point = match self {
            SigningKey::P256(k) => k.verifying_key().to_encoded_point(false).as_bytes().to_vec(),
            SigningKey::P384(k) => k.verifying_key().to_encoded_point(false).as_bytes().to_vec(),
        };
        EcPublicKey::from_sec1(self.algorithm(), &point)
    }

    fn to_blobs(&self) -> Result<KeyBlobs> {
        let private = match self {
            SigningKey::P256(k) => k.to_bytes().to_vec(),
            SigningKey::P384(k) => k.to_bytes().to_vec(),
        };
        let public = self.public_key()?.sec1_bytes().to_vec();
        Ok(KeyBlobs::new(KeyKind::Software, public, private))
    }

    fn sign_prehash(&self, digest: &[u8]) -> Result<Vec<u8>> {
        let failed = |e| Error::Signing(format!("software ECDSA: {e}"));
        Ok(match self {
            SigningKey::P256(k) => {
                let sig: p256::ecdsa::Signature = k.sign_prehash(digest).map_err(failed)?;
                sig.to_der().as_bytes().to_vec()
            }
            SigningKey::P384(k) => {
                let sig: p384::ecdsa::Signature = k.sign_prehash(digest).map_err(failed)?;
                sig.to_der().as_bytes().to_vec()
            }
        })
    }
}

type Slots = Arc<Mutex<KeySlots<SigningKey>>>;

pub struct SoftwareTee {
    store: MetadataStore,
    p256_only: bool,
    slots: Slots,
}

impl SoftwareTee {
    pub fn new(store: MetadataStore, p256_only: bool) -> Self {
        Self {
            store,
            p256_only,
            slots: Arc::new(Mutex::new(KeySlots::new())),
        }
    }

    fn insert(&self, key: SigningKey) -> Result<Box<dyn TeeKey>> {
        let algorithm = key.algorithm();
        let public = key.public_key()?;
        let handle = self.slots.lock().map_err(poisoned)?.insert(key)?;
        Ok(Box::new(SoftwareKey {
            slots: self.slots.clone(),
            handle,
            algorithm,
            public,
        }))
    }
}

impl Tee for SoftwareTee {
    fn create_key(&self) -> Result<Box<dyn TeeKey>> {
        if self.slots.lock().map_err(poisoned)?.is_closed() {
            return Err(Error::TeeUnavailable("TEE device has been closed".into()));
        }
        let algorithm = if self.p256_only {
            EccAlgorithm::P256
        } else {
            EccAlgorithm::P384
        };
        let key = SigningKey::generate(algorithm);
        self.store.write_key_blobs(&key.to_blobs()?)?;
        info!(curve = %algorithm, "created software host key");
        self.insert(key)
    }

    fn load_key(&self) -> Result<Box<dyn TeeKey>> {
        let blobs = self.store.read_key_blobs()?;
        if blobs.kind != KeyKind::Software {
            return Err(Error::KeyCorrupt(format!(
                "key envelope was written by the {:?} backend",
                blobs.kind
            )));
        }
        let key = SigningKey::from_blobs(&blobs)?;
        if self.p256_only && key.algorithm() != EccAlgorithm::P256 {
            return Err(Error::TeeUnavailable(format!(
                "{} keys are not supported",
                key.algorithm()
            )));
        }
        self.insert(key)
    }

    fn close(&self) -> Result<()> {
        self.slots.lock().map_err(poisoned)?.close();
        Ok(())
    }
}

struct SoftwareKey {
    slots: Slots,
    handle: usize,
    algorithm: EccAlgorithm,
    public: EcPublicKey,
}

impl TeeKey for SoftwareKey {
    fn ecc_algorithm(&self) -> EccAlgorithm {
        self.algorithm
    }

    fn signer(&self) -> Result<Arc<dyn Signer>> {
        self.slots.lock().map_err(poisoned)?.get(self.handle)?;
        Ok(Arc::new(SoftwareSigner {
            slots: self.slots.clone(),
            handle: self.handle,
            public: self.public.clone(),
        }))
    }

    fn close(&self) -> Result<()> {
        self.slots.lock().map_err(poisoned)?.remove(self.handle);
        Ok(())
    }
}

struct SoftwareSigner {
    slots: Slots,
    handle: usize,
    public: EcPublicKey,
}

impl Signer for SoftwareSigner {
    fn public_key(&self) -> &EcPublicKey {
        &self.public
    }

    fn sign(&self, digest: &[u8], hash: HashAlgorithm) -> Result<Vec<u8>> {
        check_digest(self.public.algorithm(), digest, hash)?;
        let slots = self.slots.lock().map_err(poisoned)?;
        slots.get(self.handle)?.sign_prehash(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tee(dir: &tempfile::TempDir, p256_only: bool) -> SoftwareTee {
        SoftwareTee::new(MetadataStore::new(dir.path()), p256_only)
    }

    #[test]
    fn test_create_then_load_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let tee = tee(&dir, false);
        let created = tee.create_key().unwrap();
        assert_eq!(created.ecc_algorithm(), EccAlgorithm::P384);

        let loaded = tee.load_key().unwrap();
        let a = created.signer().unwrap();
        let b = loaded.signer().unwrap();
        assert_eq!(a.public_key(), b.public_key());

        let digest = HashAlgorithm::Sha384.digest(b"hello");
        let sig = b.sign(&digest, HashAlgorithm::Sha384).unwrap();
        a.public_key().verify_der(&digest, &sig).unwrap();
    }

    #[test]
    fn test_falls_back_to_p256() {
        let dir = tempfile::tempdir().unwrap();
        let key = tee(&dir, true).create_key().unwrap();
        assert_eq!(key.ecc_algorithm(), EccAlgorithm::P256);
        assert_eq!(key.signer().unwrap().public_key().sec1_bytes().len(), 65);
    }

    #[test]
    fn test_load_from_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(tee(&dir, false).load_key(), Err(Error::KeyNotFound)));
    }

    #[test]
    fn test_close_invalidates_signers() {
        let dir = tempfile::tempdir().unwrap();
        let tee = tee(&dir, true);
        let key = tee.create_key().unwrap();
        let signer = key.signer().unwrap();
        let digest = HashAlgorithm::Sha256.digest(b"x");

        key.close().unwrap();
        key.close().unwrap();
        assert!(matches!(
            signer.sign(&digest, HashAlgorithm::Sha256),
            Err(Error::InvalidArgument(_))
        ));

        let other = tee.load_key().unwrap().signer().unwrap();
        tee.close().unwrap();
        tee.close().unwrap();
        assert!(matches!(
            other.sign(&digest, HashAlgorithm::Sha256),
            Err(Error::TeeUnavailable(_))
        ));
    }

    #[test]
    fn test_signers_shared_across_threads() {
        let dir = tempfile::tempdir().unwrap();
        let tee = tee(&dir, false);
        let key = tee.create_key().unwrap();
        let reloaded = tee.load_key().unwrap();
        let signers = [key.signer().unwrap(), reloaded.signer().unwrap()];

        std::thread::scope(|scope| {
            for t in 0..8 {
                let signer = signers[t % 2].clone();
                scope.spawn(move || {
                    for i in 0..16 {
                        let digest = HashAlgorithm::Sha384.digest(format!("{t}/{i}").as_bytes());
                        let sig = signer.sign(&digest, HashAlgorithm::Sha384).unwrap();
                        signer.public_key().verify_der(&digest, &sig).unwrap();
                    }
                });
            }
        });
        tee.close().unwrap();
    }

    #[test]
    fn test_tampered_public_blob() {
        let dir = tempfile::tempdir().unwrap();
        let tee = tee(&dir, true);
        tee.create_key().unwrap();

        let store = MetadataStore::new(dir.path());
        let mut blobs = store.read_key_blobs().unwrap();
        blobs.public[10] ^= 0xff;
        store.write_key_blobs(&blobs).unwrap();
        assert!(matches!(tee.load_key(), Err(Error::KeyCorrupt(_))));
    }
}
