// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Command framing and the character-device transport.
//!
//! The kernel exposes the TPM as `/dev/tpmrm0` (with the in-kernel resource
//! manager) or `/dev/tpm0` (raw). One `write` carries a whole command and
//! one `read` returns the whole response.

use anyhow::{anyhow, bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use tracing::trace;

use super::constants::*;
use super::error::TpmError;
use super::marshal::*;

/// Largest response any command here can produce.
const MAX_RESPONSE_SIZE: usize = 4096;

/// tag (2) + size (4) + command or response code (4)
const HEADER_SIZE: usize = 10;

/// Device nodes probed by [`TpmDevice::detect`], in order.
const DEFAULT_DEVICES: [&str; 2] = ["/dev/tpmrm0", "/dev/tpm0"];

/// An open TPM character device
pub struct TpmDevice {
    file: File,
    path: String,
}

impl TpmDevice {
    /// Open `path`; a `device:` prefix in TCTI style is accepted.
    pub fn open(path: &str) -> Result<Self> {
        let path = path.strip_prefix("device:").unwrap_or(path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open TPM device {path}"))?;
        Ok(Self {
            file,
            path: path.to_string(),
        })
    }

    /// Open the first device node that exists.
    pub fn detect() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::open(path),
            None => bail!("no TPM device found (tried {})", DEFAULT_DEVICES.join(", ")),
        }
    }

    /// The first device node present, preferring the kernel resource manager
    pub fn default_path() -> Option<&'static str> {
        DEFAULT_DEVICES
            .iter()
            .copied()
            .find(|path| Path::new(path).exists())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.file
            .write_all(command)
            .context("failed to write TPM command")?;
        let mut response = vec![0u8; MAX_RESPONSE_SIZE];
        let n = self
            .file
            .read(&mut response)
            .context("failed to read TPM response")?;
        response.truncate(n);
        Ok(response)
    }

    /// Send `command` and return its response.
    ///
    /// A non-zero response code becomes a [`TpmError`] in the chain.
    pub fn run(&mut self, command: &TpmCommand) -> Result<TpmResponse> {
        let bytes = command.encode();
        trace!(code = ?command.code, len = bytes.len(), "TPM command");
        let response = TpmResponse::parse(&self.transmit(&bytes)?)?;
        response.ensure_success(command.code)?;
        Ok(response)
    }
}

/// A command under construction.
///
/// Handles, the authorization area and parameters are kept apart and laid
/// out in wire order by [`TpmCommand::encode`].
#[derive(Debug)]
pub struct TpmCommand {
    code: TpmCc,
    handles: Vec<u32>,
    password_auth: bool,
    params: CommandBuffer,
}

impl TpmCommand {
    pub fn new(code: TpmCc) -> Self {
        Self {
            code,
            handles: Vec::new(),
            password_auth: false,
            params: CommandBuffer::with_capacity(256),
        }
    }

    pub fn code(&self) -> TpmCc {
        self.code
    }

    pub fn handle(mut self, handle: u32) -> Self {
        self.handles.push(handle);
        self
    }

    /// Authorize every handle with an empty password (TPM_RS_PW).
    pub fn password_auth(mut self) -> Self {
        self.password_auth = true;
        self
    }

    pub fn param<T: Marshal + ?Sized>(mut self, value: &T) -> Self {
        value.marshal(&mut self.params);
        self
    }

    pub fn param_tpm2b(mut self, bytes: &[u8]) -> Self {
        self.params.put_tpm2b(bytes);
        self
    }

    pub fn param_tpm2b_empty(mut self) -> Self {
        self.params.put_tpm2b_empty();
        self
    }

    /// Wire bytes with the size field filled in.
    pub fn encode(&self) -> Vec<u8> {
        let tag = if self.password_auth {
            TpmSt::Sessions
        } else {
            TpmSt::NoSessions
        };
        let mut buf = CommandBuffer::with_capacity(HEADER_SIZE + self.params.as_bytes().len());
        buf.put_u16(tag.to_u16());
        buf.put_u32(0);
        buf.put_u32(self.code.to_u32());
        for handle in &self.handles {
            buf.put_u32(*handle);
        }
        if self.password_auth {
            // One password session per handle: handle, empty nonce,
            // attributes, empty password.
            let session_len = 4 + 2 + 1 + 2;
            buf.put_u32((session_len * self.handles.len()) as u32);
            for _ in &self.handles {
                buf.put_u32(tpm_rh::PW);
                buf.put_tpm2b_empty();
                buf.put_u8(0);
                buf.put_tpm2b_empty();
            }
        }
        buf.put_bytes(self.params.as_bytes());
        let size = buf.as_bytes().len() as u32;
        buf.update_u32(2, size);
        buf.into_vec()
    }
}

/// A parsed response frame.
#[derive(Debug)]
pub struct TpmResponse {
    pub tag: TpmSt,
    pub code: u32,
    body: Vec<u8>,
}

impl TpmResponse {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut buf = ResponseBuffer::new(bytes);
        let raw_tag = buf.get_u16()?;
        let tag = TpmSt::from_u16(raw_tag)
            .ok_or_else(|| anyhow!("invalid response tag 0x{raw_tag:04x}"))?;
        let size = buf.get_u32()? as usize;
        if size < HEADER_SIZE || size > bytes.len() {
            bail!("TPM response claims {size} bytes, got {}", bytes.len());
        }
        let code = buf.get_u32()?;
        Ok(Self {
            tag,
            code,
            body: bytes[HEADER_SIZE..size].to_vec(),
        })
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    pub fn ensure_success(&self, command: TpmCc) -> Result<()> {
        if self.is_success() {
            return Ok(());
        }
        Err(TpmError::ResponseCode {
            command,
            code: self.code,
        }
        .into())
    }

    /// Split off `handle_count` output handles and return them with a
    /// reader over the parameters.
    ///
    /// With sessions, a parameterSize word sits between the two and the
    /// authorization area trails the parameters; the reader is bounded to
    /// the parameters.
    pub fn split(&self, handle_count: usize) -> Result<(Vec<u32>, ResponseBuffer<'_>)> {
        let mut buf = ResponseBuffer::new(&self.body);
        let handles = (0..handle_count)
            .map(|_| buf.get_u32())
            .collect::<Result<Vec<_>>>()?;
        if self.tag != TpmSt::Sessions {
            return Ok((handles, buf));
        }
        let param_size = buf.get_u32()? as usize;
        let start = self.body.len() - buf.remaining();
        let params = self
            .body
            .get(start..start + param_size)
            .ok_or_else(|| anyhow!("parameterSize {param_size} overruns the response"))?;
        Ok((handles, ResponseBuffer::new(params)))
    }
}
