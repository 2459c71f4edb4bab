// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Everything Setup needs, as handed over by the embedding agent.
#[derive(Debug, Clone, Deserialize)]
pub struct HostIdentityConfig {
    pub metadata_dir: PathBuf,
    #[serde(default)]
    pub tee: TeeBackend,
    pub scep: ScepOptions,
}

/// Which TEE adapter backs the host key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum TeeBackend {
    /// TPM 2.0 resource manager. `None` probes the default device nodes.
    Tpm {
        #[serde(default)]
        device: Option<PathBuf>,
    },
    /// File-backed keys held in process memory. Development and tests only.
    Software {
        /// Advertise P-256 only, like a TPM without P-384 support.
        #[serde(default)]
        p256_only: bool,
    },
    /// Always reports the TEE as unavailable.
    Unavailable,
}

impl Default for TeeBackend {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            TeeBackend::Tpm { device: None }
        } else {
            TeeBackend::Unavailable
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct ScepOptions {
    pub server_url: String,
    pub challenge_password: String,
    pub common_name: String,
    /// PEM bundle trusted for HTTPS in addition to the platform roots.
    #[serde(default)]
    pub root_ca_pem: Option<String>,
    /// Skip TLS certificate verification.
    #[serde(default)]
    pub insecure_transport: bool,
    /// Also place the challenge password inside the CSR.
    #[serde(default)]
    pub challenge_in_csr: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub poll: PollPolicy,
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl ScepOptions {
    pub fn new(
        server_url: impl Into<String>,
        challenge_password: impl Into<String>,
        common_name: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            challenge_password: challenge_password.into(),
            common_name: common_name.into(),
            root_ca_pem: None,
            insecure_transport: false,
            challenge_in_csr: false,
            request_timeout_secs: default_request_timeout_secs(),
            poll: PollPolicy::default(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl fmt::Debug for ScepOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScepOptions")
            .field("server_url", &self.server_url)
            .field("challenge_password", &"<redacted>")
            .field("common_name", &self.common_name)
            .field("root_ca_pem", &self.root_ca_pem.as_ref().map(|_| "<pem>"))
            .field("insecure_transport", &self.insecure_transport)
            .field("challenge_in_csr", &self.challenge_in_csr)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("poll", &self.poll)
            .finish()
    }
}

/// Backoff applied while the server answers PENDING.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Bound on the whole enrollment, PENDING rounds included.
    pub deadline_secs: u64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 2000,
            max_backoff_ms: 30000,
            deadline_secs: 60,
        }
    }
}

impl PollPolicy {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    /// The wait that follows `current`: doubled, capped at the maximum.
    pub fn next_backoff(&self, current: Duration) -> Duration {
        current
            .saturating_mul(2)
            .min(Duration::from_millis(self.max_backoff_ms))
    }
}
