// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! On-disk envelope for TEE key blobs.
//!
//! A PEM block whose label names the backend and whose body is
//! `u16 len | public blob | u16 len | private blob`, lengths big-endian.

use std::fmt;

use crate::error::{Error, Result};

pub const TPM_KEY_LABEL: &str = "TSS2 PRIVATE KEY";
pub const SOFTWARE_KEY_LABEL: &str = "HOST IDENTITY SOFTWARE KEY";

/// Backend that produced a pair of blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Tpm,
    Software,
}

impl KeyKind {
    pub fn label(self) -> &'static str {
        match self {
            KeyKind::Tpm => TPM_KEY_LABEL,
            KeyKind::Software => SOFTWARE_KEY_LABEL,
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        match label {
            TPM_KEY_LABEL => Some(KeyKind::Tpm),
            SOFTWARE_KEY_LABEL => Some(KeyKind::Software),
            _ => None,
        }
    }
}

/// Public and private key blobs, opaque outside their backend.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyBlobs {
    pub kind: KeyKind,
    pub public: Vec<u8>,
    pub private: Vec<u8>,
}

impl fmt::Debug for KeyBlobs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyBlobs")
            .field("kind", &self.kind)
            .field("public", &hex::encode(&self.public))
            .field("private", &format_args!("<{} bytes>", self.private.len()))
            .finish()
    }
}

impl KeyBlobs {
    pub fn new(kind: KeyKind, public: Vec<u8>, private: Vec<u8>) -> Self {
        Self {
            kind,
            public,
            private,
        }
    }

    pub fn to_pem(&self) -> Result<String> {
        let mut body = Vec::with_capacity(4 + self.public.len() + self.private.len());
        for blob in [&self.public, &self.private] {
            let len = u16::try_from(blob.len()).map_err(|_| {
                Error::InvalidArgument(format!("key blob of {} bytes is too large", blob.len()))
            })?;
            body.extend_from_slice(&len.to_be_bytes());
            body.extend_from_slice(blob);
        }
        Ok(pem::encode(&pem::Pem::new(self.kind.label(), body)))
    }

    pub fn from_pem(data: &[u8]) -> Result<Self> {
        let block = pem::parse(data).map_err(|e| Error::KeyCorrupt(format!("invalid PEM: {e}")))?;
        let kind = KeyKind::from_label(block.tag())
            .ok_or_else(|| Error::KeyCorrupt(format!("unexpected PEM label {:?}", block.tag())))?;

        let mut rest = block.contents();
        let public = take_blob(&mut rest, "public")?;
        let private = take_blob(&mut rest, "private")?;
        if !rest.is_empty() {
            return Err(Error::KeyCorrupt(format!(
                "{} trailing bytes after key blobs",
                rest.len()
            )));
        }
        Ok(Self::new(kind, public, private))
    }
}

fn take_blob(rest: &mut &[u8], what: &str) -> Result<Vec<u8>> {
    let truncated = || Error::KeyCorrupt(format!("{what} blob truncated"));
    let (len, tail) = rest.split_first_chunk::<2>().ok_or_else(truncated)?;
    let len = u16::from_be_bytes(*len) as usize;
    if tail.len() < len {
        return Err(truncated());
    }
    let (blob, tail) = tail.split_at(len);
    *rest = tail;
    Ok(blob.to_vec())
}
