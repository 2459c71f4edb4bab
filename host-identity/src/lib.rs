// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TEE-backed host identity.
//!
//! A host proves who it is with an ECC key that never leaves its TPM, and a
//! certificate for that key obtained from a SCEP CA. This crate covers the
//! whole lifecycle:
//!
//! - [`tee`]: key custody behind the [`Tee`] / [`TeeKey`] / [`Signer`] traits
//! - [`store`]: `host-identity.key` and `host-identity.crt` on disk
//! - [`csr`]: PKCS#10 requests signed by the host key
//! - [`scep`]: RFC 8894 enrollment
//! - [`validator`]: key/certificate binding check
//! - [`httpsig`]: RFC 9421 request signing
//!
//! [`setup`] ties them together and returns [`Credentials`].
//!
//! ## Example
//!
//! ```no_run
//! use host_identity::{setup, CancellationToken, HostIdentityConfig, ScepOptions, TeeBackend};
//!
//! # async fn run() -> host_identity::Result<()> {
//! let config = HostIdentityConfig {
//!     metadata_dir: "/var/lib/host-identity".into(),
//!     tee: TeeBackend::default(),
//!     scep: ScepOptions::new("https://scep.example/scep", "secret", "fleet-device"),
//! };
//! let credentials = setup(&config, &CancellationToken::new()).await?;
//! let signer = credentials.http_signer();
//! println!("keyid {}", signer.keyid());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod csr;
pub mod error;
pub mod httpsig;
pub mod oids;
pub mod scep;
pub mod setup;
pub mod store;
pub mod tee;
pub mod validator;

pub use config::{HostIdentityConfig, PollPolicy, ScepOptions, TeeBackend};
pub use error::{Error, Result, ResultExt};
pub use httpsig::{HttpSigner, SignatureHeaders};
pub use scep::ScepClient;
pub use setup::{
    load_credentials, load_credentials_with_tee, setup, setup_with_tee, Credentials,
};
pub use store::MetadataStore;
pub use tee::{open_tee, EcPublicKey, EccAlgorithm, HashAlgorithm, Signer, Tee, TeeKey};
pub use tokio_util::sync::CancellationToken;
pub use x509_cert;
