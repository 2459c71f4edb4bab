// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Display;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures surfaced by the host identity subsystem.
///
/// Layers wrap errors in [`Error::Context`] as they propagate; match on
/// [`Error::root`] to classify a failure regardless of how much context was
/// added on the way up.
#[derive(Debug, Error)]
pub enum Error {
    #[error("TEE unavailable: {0}")]
    TeeUnavailable(String),
    #[error("host identity key not found")]
    KeyNotFound,
    #[error("host identity key is corrupt: {0}")]
    KeyCorrupt(String),
    #[error("host identity certificate not found")]
    CertNotFound,
    #[error("host identity certificate is corrupt: {0}")]
    CertCorrupt(String),
    #[error(
        "certificate does not match the host identity key; it was removed and a fresh \
         certificate will be issued on next startup"
    )]
    KeyCertMismatch,
    #[error("SCEP {operation} request failed")]
    ScepTransport {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("SCEP protocol error: {0}")]
    ScepProtocol(String),
    #[error("SCEP server rejected the request: {info}")]
    ScepFailure { info: String },
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error("SCEP enrollment did not complete before the deadline")]
    DeadlineExceeded,
    #[error("{context}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub fn protocol(msg: impl Display) -> Self {
        Error::ScepProtocol(msg.to_string())
    }

    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with every [`Error::Context`] layer stripped.
    pub fn root(&self) -> &Error {
        let mut err = self;
        while let Error::Context { source, .. } = err {
            err = source;
        }
        err
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            Error::ScepTransport { .. } | Error::DeadlineExceeded
        )
    }
}

/// `anyhow::Context`-style helpers for [`Result`].
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| e.context(f()))
    }
}
