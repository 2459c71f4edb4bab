// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use super::{Tee, TeeKey};
use crate::error::{Error, Result};

/// Stand-in for platforms without a TEE.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableTee;

fn unavailable() -> Error {
    Error::TeeUnavailable("no TEE on this platform".into())
}

impl Tee for UnavailableTee {
    fn create_key(&self) -> Result<Box<dyn TeeKey>> {
        Err(unavailable())
    }

    fn load_key(&self) -> Result<Box<dyn TeeKey>> {
        Err(unavailable())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
