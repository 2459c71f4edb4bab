// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Setup: bring the host identity to a usable state.
//!
//! ensure directory → load key (create on first run) → read certificate
//! (enroll when missing, corrupt or expired) → persist → validate.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use der::Encode;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use x509_cert::Certificate;

use crate::config::HostIdentityConfig;
use crate::error::{Error, Result, ResultExt};
use crate::httpsig::HttpSigner;
use crate::scep::ScepClient;
use crate::store::{is_expired, MetadataStore};
use crate::tee::{open_tee, EcPublicKey, EccAlgorithm, Signer, Tee, TeeKey};
use crate::validator;

/// A loaded host key together with the certificate that binds it.
pub struct Credentials {
    tee: Arc<dyn Tee>,
    key: Box<dyn TeeKey>,
    signer: Arc<dyn Signer>,
    certificate: Certificate,
    cert_path: PathBuf,
}

impl Credentials {
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn certificate_der(&self) -> Result<Vec<u8>> {
        self.certificate
            .to_der()
            .map_err(|e| Error::CertCorrupt(format!("encode certificate: {e}")))
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn public_key(&self) -> &EcPublicKey {
        self.signer.public_key()
    }

    pub fn ecc_algorithm(&self) -> EccAlgorithm {
        self.key.ecc_algorithm()
    }

    pub fn signer(&self) -> Arc<dyn Signer> {
        self.signer.clone()
    }

    pub fn http_signer(&self) -> HttpSigner {
        HttpSigner::new(self.signer.clone(), &self.certificate)
    }

    /// Release the key and the TEE. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.key.close()?;
        self.tee.close()
    }
}

/// Run TEE work on the blocking pool; TPM commands are synchronous device I/O.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::TeeUnavailable(format!("TEE task failed: {e}")))?
}

fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

/// Run Setup against the TEE selected in `config`.
pub async fn setup(config: &HostIdentityConfig, cancel: &CancellationToken) -> Result<Credentials> {
    let tee = open_tee(&config.tee, &config.metadata_dir).context("open TEE")?;
    let result = setup_with_tee(config, tee.clone(), cancel).await;
    if result.is_err() {
        if let Err(e) = tee.close() {
            warn!("failed to close TEE: {e}");
        }
    }
    result
}

/// Run Setup with an already opened TEE.
#[instrument(skip_all, fields(dir = %config.metadata_dir.display()))]
pub async fn setup_with_tee(
    config: &HostIdentityConfig,
    tee: Arc<dyn Tee>,
    cancel: &CancellationToken,
) -> Result<Credentials> {
    let store = MetadataStore::new(&config.metadata_dir);
    checkpoint(cancel)?;
    store.ensure_dir()?;

    checkpoint(cancel)?;
    let loader = tee.clone();
    let key = match blocking(move || loader.load_key()).await {
        Ok(key) => {
            info!(curve = %key.ecc_algorithm(), "loaded host key");
            key
        }
        Err(Error::KeyNotFound) => {
            info!("no host key yet, creating one");
            let creator = tee.clone();
            blocking(move || creator.create_key())
                .await
                .context("create host key")?
        }
        Err(e) => return Err(e.context("load host key")),
    };

    match certify(config, &store, key.as_ref(), cancel).await {
        Ok((signer, certificate)) => Ok(Credentials {
            tee,
            key,
            signer,
            certificate,
            cert_path: store.cert_path(),
        }),
        Err(e) => {
            if let Err(close) = key.close() {
                warn!("failed to release host key: {close}");
            }
            Err(e)
        }
    }
}

async fn certify(
    config: &HostIdentityConfig,
    store: &MetadataStore,
    key: &dyn TeeKey,
    cancel: &CancellationToken,
) -> Result<(Arc<dyn Signer>, Certificate)> {
    let signer = key.signer()?;

    checkpoint(cancel)?;
    let certificate = match usable_certificate(store)? {
        Some(cert) => cert,
        None => {
            let client = ScepClient::new(&config.scep)?;
            let cert = client.enroll(signer.clone(), cancel).await?;
            checkpoint(cancel)?;
            store.write_cert(&cert).context("store certificate")?;
            info!(path = %store.cert_path().display(), "stored host certificate");
            cert
        }
    };

    validator::validate(store, signer.public_key(), &certificate)?;
    Ok((signer, certificate))
}

/// The stored certificate, or `None` when a new one must be enrolled.
fn usable_certificate(store: &MetadataStore) -> Result<Option<Certificate>> {
    match store.read_cert() {
        Ok(cert) if is_expired(&cert, SystemTime::now()) => {
            warn!("host certificate has expired, re-enrolling");
            Ok(None)
        }
        Ok(cert) => Ok(Some(cert)),
        Err(Error::CertNotFound) => {
            info!("no host certificate yet, enrolling");
            Ok(None)
        }
        Err(Error::CertCorrupt(reason)) => {
            warn!(%reason, "host certificate is corrupt, removing it and re-enrolling");
            store.remove_cert()?;
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Load existing credentials without touching the network.
pub fn load_credentials(config: &HostIdentityConfig) -> Result<Credentials> {
    let tee = open_tee(&config.tee, &config.metadata_dir).context("open TEE")?;
    let result = load_credentials_with_tee(&config.metadata_dir, tee.clone());
    if result.is_err() {
        if let Err(e) = tee.close() {
            warn!("failed to close TEE: {e}");
        }
    }
    result
}

/// [`load_credentials`] with an already opened TEE.
pub fn load_credentials_with_tee(metadata_dir: &Path, tee: Arc<dyn Tee>) -> Result<Credentials> {
    let store = MetadataStore::new(metadata_dir);
    let key = tee.load_key().context("load host key")?;
    let loaded = key.signer().and_then(|signer| {
        let certificate = store.read_cert()?;
        validator::validate(&store, signer.public_key(), &certificate)?;
        Ok((signer, certificate))
    });
    match loaded {
        Ok((signer, certificate)) => Ok(Credentials {
            tee,
            key,
            signer,
            certificate,
            cert_path: store.cert_path(),
        }),
        Err(e) => {
            if let Err(close) = key.close() {
                warn!("failed to release host key: {close}");
            }
            Err(e)
        }
    }
}
