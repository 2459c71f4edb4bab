// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Cross-check of the resident key against the stored certificate.

use tracing::{info, warn};
use x509_cert::Certificate;

use crate::error::{Error, Result};
use crate::store::MetadataStore;
use crate::tee::EcPublicKey;

/// Whether `cert` binds `key`, comparing canonical uncompressed points.
pub fn public_key_matches(key: &EcPublicKey, cert: &Certificate) -> bool {
    EcPublicKey::from_spki(&cert.tbs_certificate.subject_public_key_info)
        .is_ok_and(|cert_key| cert_key == *key)
}

/// Fail with [`Error::KeyCertMismatch`], removing the certificate, when it
/// does not bind the resident key.
pub fn validate(store: &MetadataStore, key: &EcPublicKey, cert: &Certificate) -> Result<()> {
    if public_key_matches(key, cert) {
        return Ok(());
    }
    warn!(
        path = %store.cert_path().display(),
        "certificate does not match the host key, removing it"
    );
    store.remove_cert()?;
    info!("a fresh certificate will be issued on next startup");
    Err(Error::KeyCertMismatch)
}
