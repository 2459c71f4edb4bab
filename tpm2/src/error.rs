// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use crate::constants::{TpmCc, TpmRc};

/// Typed failures reported by the TPM itself.
///
/// Command functions return `anyhow::Error`; callers that need to react to a
/// specific response code find this type in the error chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TpmError {
    #[error("{command:?} failed with TPM response code 0x{code:08x}")]
    ResponseCode { command: TpmCc, code: u32 },
}

impl TpmError {
    pub fn code(&self) -> u32 {
        match self {
            TpmError::ResponseCode { code, .. } => *code,
        }
    }

    /// Whether the command may succeed if replayed on a fresh connection.
    pub fn is_transient(&self) -> bool {
        TpmRc::is_transient(self.code())
    }
}

/// Find a [`TpmError`] anywhere in an `anyhow` chain.
pub fn find_tpm_error(err: &anyhow::Error) -> Option<&TpmError> {
    err.chain().find_map(|e| e.downcast_ref::<TpmError>())
}
