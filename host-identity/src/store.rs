// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! On-disk layout of the host identity.
//!
//! ```text
//! <metadata>/
//!   host-identity.key     # TEE key envelope
//!   host-identity.crt     # PEM certificate, once issued
//! ```
//!
//! Both files are owner-only (0600) and are replaced atomically.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use der::{Decode, Encode};
use tracing::{debug, info};
use x509_cert::Certificate;

use crate::error::{Error, Result};
use crate::tee::KeyBlobs;

pub const KEY_FILE_NAME: &str = "host-identity.key";
pub const CERT_FILE_NAME: &str = "host-identity.crt";

const CERT_PEM_LABEL: &str = "CERTIFICATE";

#[derive(Debug, Clone)]
pub struct MetadataStore {
    dir: PathBuf,
}

impl MetadataStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE_NAME)
    }

    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(CERT_FILE_NAME)
    }

    /// Create the metadata directory (mode 0700) if it does not exist yet.
    pub fn ensure_dir(&self) -> Result<()> {
        if self.dir.is_dir() {
            return Ok(());
        }
        fs_err::create_dir_all(&self.dir)
            .map_err(|e| Error::io("failed to create metadata directory", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs_err::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o700))
                .map_err(|e| Error::io("failed to restrict metadata directory", e))?;
        }
        info!(path = %self.dir.display(), "created metadata directory");
        Ok(())
    }

    pub fn read_cert_pem(&self) -> Result<String> {
        let data = read_optional(&self.cert_path())?.ok_or(Error::CertNotFound)?;
        String::from_utf8(data).map_err(|_| Error::CertCorrupt("certificate is not text".into()))
    }

    pub fn read_cert(&self) -> Result<Certificate> {
        let data = read_optional(&self.cert_path())?.ok_or(Error::CertNotFound)?;
        let block = pem::parse(&data).map_err(|e| Error::CertCorrupt(format!("invalid PEM: {e}")))?;
        if block.tag() != CERT_PEM_LABEL {
            return Err(Error::CertCorrupt(format!(
                "unexpected PEM label {:?}",
                block.tag()
            )));
        }
        Certificate::from_der(block.contents())
            .map_err(|e| Error::CertCorrupt(format!("invalid DER: {e}")))
    }

    pub fn write_cert(&self, cert: &Certificate) -> Result<()> {
        let der = cert
            .to_der()
            .map_err(|e| Error::InvalidArgument(format!("encode certificate: {e}")))?;
        let pem = pem::encode(&pem::Pem::new(CERT_PEM_LABEL, der));
        write_atomic(&self.cert_path(), pem.as_bytes())?;
        debug!(path = %self.cert_path().display(), "wrote certificate");
        Ok(())
    }

    /// Delete the certificate. A missing file is not an error.
    pub fn remove_cert(&self) -> Result<()> {
        remove_optional(&self.cert_path())
    }

    pub fn read_key_blobs(&self) -> Result<KeyBlobs> {
        let data = read_optional(&self.key_path())?.ok_or(Error::KeyNotFound)?;
        KeyBlobs::from_pem(&data)
    }

    pub fn write_key_blobs(&self, blobs: &KeyBlobs) -> Result<()> {
        write_atomic(&self.key_path(), blobs.to_pem()?.as_bytes())?;
        debug!(path = %self.key_path().display(), kind = ?blobs.kind, "wrote key blobs");
        Ok(())
    }

    /// Delete the key envelope. A missing file is not an error.
    pub fn remove_key(&self) -> Result<()> {
        remove_optional(&self.key_path())
    }
}

/// Whether `now` is past the certificate's notAfter.
pub fn is_expired(cert: &Certificate, now: SystemTime) -> bool {
    cert.tbs_certificate.validity.not_after.to_system_time() <= now
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs_err::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io("failed to read metadata file", e)),
    }
}

fn remove_optional(path: &Path) -> Result<()> {
    match fs_err::remove_file(path) {
        Ok(()) => {
            info!(path = %path.display(), "removed metadata file");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io("failed to remove metadata file", e)),
    }
}

/// Flush a directory entry change (create, rename) to disk.
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    fs_err::File::open(dir)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

/// Write through a 0600 temp file in the same directory, fsync, rename,
/// then fsync the directory so the rename survives a crash.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::InvalidArgument(format!("{} has no parent", path.display())))?;
    let context = || format!("failed to write {}", path.display());

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::io(context(), e))?;
    tmp.write_all(contents).map_err(|e| Error::io(context(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::io(context(), e))?;
    tmp.persist(path).map_err(|e| Error::io(context(), e.error))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs_err::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::io(context(), e))?;
    }
    sync_dir(dir).map_err(|e| Error::io(context(), e))
}
