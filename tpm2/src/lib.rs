// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 commands for non-duplicable ECC signing keys.
//!
//! Talks to `/dev/tpmrm0` or `/dev/tpm0` directly, so nothing links against
//! libtss2. Only the commands a host signing key needs are here:
//! CreatePrimary, Create, Load, FlushContext, ECDSA Sign and
//! GetCapability for the implemented curves.
//!
//! Failures are `anyhow` errors; a [`TpmError`] somewhere in the chain
//! carries the response code when the TPM itself refused the command.
//!
//! ```no_run
//! use tpm2::{TpmContext, TpmEccCurve};
//!
//! let mut ctx = TpmContext::new(None)?;
//! let p384 = ctx.ecc_curves()?.contains(&TpmEccCurve::NistP384);
//! println!("P-384: {p384}");
//! # Ok::<(), anyhow::Error>(())
//! ```

mod commands;
mod constants;
mod device;
mod error;
mod marshal;
mod types;

pub use commands::TpmContext;
pub use constants::*;
pub use error::{find_tpm_error, TpmError};
pub use types::*;

pub use device::{TpmCommand, TpmDevice, TpmResponse};
pub use marshal::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};
