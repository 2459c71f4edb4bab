// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! The commands a host signing key needs.

use anyhow::{bail, Context, Result};
use tracing::debug;

use super::constants::*;
use super::device::*;
use super::marshal::*;
use super::types::*;

/// Largest curve list GetCapability is asked for.
const MAX_CURVES: u32 = 64;

/// Connection to one TPM
pub struct TpmContext {
    device: TpmDevice,
}

impl TpmContext {
    /// Open `tcti_path`, or probe the default device nodes when `None`.
    pub fn new(tcti_path: Option<&str>) -> Result<Self> {
        let device = match tcti_path {
            Some(path) => TpmDevice::open(path)?,
            None => TpmDevice::detect()?,
        };
        Ok(Self { device })
    }

    pub fn device_path(&self) -> &str {
        self.device.path()
    }

    /// ECC curves the TPM implements.
    pub fn ecc_curves(&mut self) -> Result<Vec<TpmEccCurve>> {
        let cmd = TpmCommand::new(TpmCc::GetCapability)
            .param(&TpmCap::EccCurves.to_u32())
            .param(&0u32)
            .param(&MAX_CURVES);
        let response = self.device.run(&cmd).context("GetCapability failed")?;

        // moreData, then TPMS_CAPABILITY_DATA
        let (_, mut params) = response.split(0)?;
        let _more_data = params.get_u8()?;
        let capability = params.get_u32()?;
        if capability != TpmCap::EccCurves.to_u32() {
            bail!("GetCapability answered capability 0x{capability:08x}");
        }
        let list = TpmlEccCurve::unmarshal(&mut params)?;
        debug!(curves = ?list.curves, "TPM ECC curves");
        Ok(list.curves)
    }

    /// Create a primary key under `hierarchy`.
    ///
    /// Returns the transient handle and the marshalled public area.
    pub fn create_primary(
        &mut self,
        hierarchy: u32,
        template: &TpmtPublic,
    ) -> Result<(u32, Vec<u8>)> {
        let cmd = TpmCommand::new(TpmCc::CreatePrimary)
            .handle(hierarchy)
            .password_auth()
            .param(&Tpm2bSensitiveCreate::empty())
            .param(&Tpm2bPublic::from_template(template))
            .param_tpm2b_empty()
            .param(&TpmlPcrSelection::default());
        let response = self.device.run(&cmd).context("CreatePrimary failed")?;

        let (handles, mut params) = response.split(1)?;
        let out_public = Tpm2bPublic::unmarshal(&mut params)?;
        debug!("created primary key 0x{:08x}", handles[0]);
        Ok((handles[0], out_public.public_area))
    }

    /// Create an ordinary key under a loaded parent.
    ///
    /// Nothing is loaded; the returned blobs are what [`Self::load`] takes.
    /// The private blob is wrapped by the parent and useless elsewhere.
    pub fn create(
        &mut self,
        parent: u32,
        template: &TpmtPublic,
    ) -> Result<(Tpm2bPublic, Tpm2bPrivate)> {
        let cmd = TpmCommand::new(TpmCc::Create)
            .handle(parent)
            .password_auth()
            .param(&Tpm2bSensitiveCreate::empty())
            .param(&Tpm2bPublic::from_template(template))
            .param_tpm2b_empty()
            .param(&TpmlPcrSelection::default());
        let response = self.device.run(&cmd).context("Create failed")?;

        // outPrivate, outPublic; creation data and ticket are dropped
        let (_, mut params) = response.split(0)?;
        let out_private = Tpm2bPrivate::unmarshal(&mut params)?;
        let out_public = Tpm2bPublic::unmarshal(&mut params)?;
        debug!(
            "created key under 0x{parent:08x}, private blob {} bytes",
            out_private.buffer.len()
        );
        Ok((out_public, out_private))
    }

    /// Load a key made by [`Self::create`] and return its transient handle.
    pub fn load(
        &mut self,
        parent: u32,
        private: &Tpm2bPrivate,
        public: &Tpm2bPublic,
    ) -> Result<u32> {
        let cmd = TpmCommand::new(TpmCc::Load)
            .handle(parent)
            .password_auth()
            .param(private)
            .param(public);
        let response = self.device.run(&cmd).context("Load failed")?;

        let (handles, _) = response.split(1)?;
        debug!("loaded key 0x{:08x}", handles[0]);
        Ok(handles[0])
    }

    pub fn flush_context(&mut self, handle: u32) -> Result<()> {
        let cmd = TpmCommand::new(TpmCc::FlushContext).handle(handle);
        self.device.run(&cmd).context("FlushContext failed")?;
        Ok(())
    }

    /// ECDSA-sign `digest`, returning the big-endian `r` and `s`.
    pub fn sign(
        &mut self,
        handle: u32,
        digest: &[u8],
        hash_alg: TpmAlgId,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        if digest.len() != hash_alg.digest_size() {
            bail!(
                "digest is {} bytes, {hash_alg:?} needs {}",
                digest.len(),
                hash_alg.digest_size()
            );
        }

        // The key is unrestricted, so a NULL hashcheck ticket suffices.
        let cmd = TpmCommand::new(TpmCc::Sign)
            .handle(handle)
            .password_auth()
            .param_tpm2b(digest)
            .param(&TpmtSigScheme::ecdsa(hash_alg))
            .param(&TpmtTkHashcheck::null());
        let response = self.device.run(&cmd).context("Sign failed")?;

        let (_, mut params) = response.split(0)?;
        let signature = TpmsSignatureEcdsa::unmarshal(&mut params)?;
        if signature.hash_alg != hash_alg {
            bail!(
                "TPM signed with {:?}, requested {hash_alg:?}",
                signature.hash_alg
            );
        }
        Ok((signature.r, signature.s))
    }
}
