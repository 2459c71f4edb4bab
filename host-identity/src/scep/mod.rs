// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! SCEP (RFC 8894) enrollment client.
//!
//! One enrollment is GetCACert, GetCACaps, then PKIOperation rounds until
//! the CA answers SUCCESS or FAILURE. PENDING answers are retried with
//! exponential backoff; a single deadline bounds the whole exchange and
//! every await point also races the caller's cancellation token.

use std::future::Future;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use const_oid::AssociatedOid;
use der::Decode;
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use x509_cert::ext::pkix::{BasicConstraints, KeyUsage};
use x509_cert::Certificate;

use crate::config::{PollPolicy, ScepOptions};
use crate::csr::build_csr;
use crate::error::{Error, Result, ResultExt};
use crate::oids;
use crate::tee::{EcPublicKey, Signer};

pub mod caps;
pub mod message;
pub mod pkcs7;

pub use caps::Capabilities;
use message::{parse_cert_rep, Nonce, PkcsReq, PkiStatus, TransactionId};
use pkcs7::RsaIdentity;

const CA_CERT_TYPE: &str = "application/x-x509-ca-cert";
const CA_RA_CERT_TYPE: &str = "application/x-x509-ca-ra-cert";
const PKI_MESSAGE_TYPE: &str = "application/x-pki-message";

fn transport(operation: &'static str) -> impl FnOnce(reqwest::Error) -> Error {
    move |source| Error::ScepTransport { operation, source }
}

pub struct ScepClient {
    http: reqwest::Client,
    url: Url,
    challenge_password: String,
    common_name: String,
    challenge_in_csr: bool,
    poll: PollPolicy,
}

impl ScepClient {
    pub fn new(options: &ScepOptions) -> Result<Self> {
        let url = Url::parse(&options.server_url).map_err(|e| {
            Error::InvalidArgument(format!("invalid SCEP URL {:?}: {e}", options.server_url))
        })?;
        if options.common_name.is_empty() {
            return Err(Error::InvalidArgument("common name must not be empty".into()));
        }

        let mut builder = reqwest::Client::builder()
            .timeout(options.request_timeout())
            .danger_accept_invalid_certs(options.insecure_transport);
        if let Some(pem) = &options.root_ca_pem {
            let roots = reqwest::Certificate::from_pem_bundle(pem.as_bytes())
                .map_err(|e| Error::InvalidArgument(format!("invalid root CA bundle: {e}")))?;
            for root in roots {
                builder = builder.add_root_certificate(root);
            }
        }
        if options.insecure_transport {
            warn!("TLS certificate verification is disabled for SCEP");
        }
        let http = builder
            .build()
            .map_err(|e| Error::InvalidArgument(format!("build HTTP client: {e}")))?;

        Ok(Self {
            http,
            url,
            challenge_password: options.challenge_password.clone(),
            common_name: options.common_name.clone(),
            challenge_in_csr: options.challenge_in_csr,
            poll: options.poll,
        })
    }

    /// CA (and RA) certificates published by the server.
    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn get_ca_certs(&self) -> Result<Vec<Certificate>> {
        let response = self
            .http
            .get(self.url.clone())
            .query(&[("operation", "GetCACert")])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(transport("GetCACert"))?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let body = response.bytes().await.map_err(transport("GetCACert"))?;
        let certs = parse_ca_certs(&content_type, &body)?;
        debug!(count = certs.len(), %content_type, "received CA certificates");
        Ok(certs)
    }

    /// Server capabilities; empty when the server does not implement GetCACaps.
    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn get_ca_caps(&self) -> Result<Capabilities> {
        let response = self
            .http
            .get(self.url.clone())
            .query(&[("operation", "GetCACaps")])
            .send()
            .await
            .map_err(transport("GetCACaps"))?;
        if !response.status().is_success() {
            debug!(status = %response.status(), "GetCACaps not supported, assuming none");
            return Ok(Capabilities::default());
        }
        let text = response.text().await.map_err(transport("GetCACaps"))?;
        let caps = Capabilities::parse(&text);
        debug!(?caps, "server capabilities");
        Ok(caps)
    }

    async fn pki_operation(&self, message: &[u8], use_post: bool) -> Result<Vec<u8>> {
        let request = if use_post {
            self.http
                .post(self.url.clone())
                .query(&[("operation", "PKIOperation")])
                .header(CONTENT_TYPE, PKI_MESSAGE_TYPE)
                .body(message.to_vec())
        } else {
            let encoded = STANDARD.encode(message);
            self.http
                .get(self.url.clone())
                .query(&[("operation", "PKIOperation"), ("message", encoded.as_str())])
        };
        let response = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(transport("PKIOperation"))?;
        let body = response.bytes().await.map_err(transport("PKIOperation"))?;
        Ok(body.to_vec())
    }

    /// Enroll the key behind `signer` and return the issued certificate.
    ///
    /// The host key signs the CSR. The PKIMessage itself is signed by a
    /// fresh RSA identity, which is also the key the CA encrypts the
    /// response to. Both run on the blocking pool.
    #[instrument(skip_all, fields(url = %self.url, common_name = %self.common_name))]
    pub async fn enroll(
        &self,
        signer: Arc<dyn Signer>,
        cancel: &CancellationToken,
    ) -> Result<Certificate> {
        let deadline = Instant::now() + self.poll.deadline();

        let ca_certs = bounded(cancel, deadline, self.get_ca_certs())
            .await
            .context("SCEP GetCACert")?;
        let caps = bounded(cancel, deadline, self.get_ca_caps())
            .await
            .context("SCEP GetCACaps")?;
        let recipient = select_recipient(&ca_certs)?;

        let csr_signer = signer.clone();
        let common_name = self.common_name.clone();
        let challenge = self
            .challenge_in_csr
            .then(|| self.challenge_password.clone());
        let csr_der = bounded(cancel, deadline, async move {
            tokio::task::spawn_blocking(move || {
                build_csr(csr_signer.as_ref(), &common_name, challenge.as_deref())
            })
            .await
            .map_err(|e| Error::Signing(format!("CSR task: {e}")))?
        })
        .await
        .context("build CSR")?;
        let transaction_id = TransactionId::from_spki_der(&signer.public_key().to_spki_der()?);

        let common_name = self.common_name.clone();
        let identity = bounded(cancel, deadline, async move {
            tokio::task::spawn_blocking(move || RsaIdentity::generate(&common_name))
                .await
                .map_err(|e| Error::Signing(format!("RSA identity task: {e}")))?
        })
        .await?;

        let request = PkcsReq {
            csr_der: &csr_der,
            transaction_id: &transaction_id,
            challenge_password: &self.challenge_password,
            recipient,
            identity: &identity,
            cipher: caps.content_cipher(),
            digest: caps.digest_algorithm(),
        };
        info!(
            %transaction_id,
            cipher = ?request.cipher,
            digest = ?request.digest,
            post = caps.use_post(),
            "sending PKCSReq"
        );

        let mut backoff = self.poll.initial_backoff();
        loop {
            let nonce = Nonce::random();
            let message = request.encode(&nonce)?;
            let response = bounded(cancel, deadline, self.pki_operation(&message, caps.use_post()))
                .await
                .context("SCEP PKIOperation")?;
            let rep = parse_cert_rep(&response, &ca_certs, &transaction_id, &nonce)
                .context("parse CertRep")?;

            match rep.status {
                PkiStatus::Success => {
                    let issued = rep
                        .decrypt_certificates(&identity)
                        .context("decrypt CertRep")?;
                    let cert = pick_issued(issued, signer.public_key())?;
                    info!(%transaction_id, "certificate issued");
                    return Ok(cert);
                }
                PkiStatus::Failure => {
                    let info = rep.failure_description();
                    warn!(%transaction_id, %info, "SCEP server rejected the request");
                    return Err(Error::ScepFailure { info });
                }
                PkiStatus::Pending => {
                    info!(
                        %transaction_id,
                        backoff_ms = backoff.as_millis() as u64,
                        "SCEP request pending, retrying"
                    );
                    bounded(cancel, deadline, async {
                        tokio::time::sleep(backoff).await;
                        Ok(())
                    })
                    .await?;
                    backoff = self.poll.next_backoff(backoff);
                }
            }
        }
    }
}

/// Run `fut` unless the token fires or the deadline passes first.
async fn bounded<T>(
    cancel: &CancellationToken,
    deadline: Instant,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep_until(deadline) => Err(Error::DeadlineExceeded),
        result = fut => result,
    }
}

/// Decode a GetCACert body by content type, sniffing when it is unknown.
pub fn parse_ca_certs(content_type: &str, body: &[u8]) -> Result<Vec<Certificate>> {
    if content_type.starts_with(CA_RA_CERT_TYPE) {
        return pkcs7::parse_certs_only(body).context("GetCACert bundle");
    }
    if content_type.starts_with(CA_CERT_TYPE) {
        let cert = Certificate::from_der(body)
            .map_err(|e| Error::protocol(format!("GetCACert certificate: {e}")))?;
        return Ok(vec![cert]);
    }
    if let Ok(cert) = Certificate::from_der(body) {
        return Ok(vec![cert]);
    }
    if let Ok(certs) = pkcs7::parse_certs_only(body) {
        return Ok(certs);
    }
    match Certificate::load_pem_chain(body) {
        Ok(certs) if !certs.is_empty() => Ok(certs),
        _ => Err(Error::protocol(format!(
            "unrecognised GetCACert response ({content_type:?}, {} bytes)",
            body.len()
        ))),
    }
}

fn has_rsa_key(cert: &Certificate) -> bool {
    cert.tbs_certificate.subject_public_key_info.algorithm.oid == oids::RSA_ENCRYPTION
}

fn extension<T>(cert: &Certificate) -> Option<T>
where
    T: AssociatedOid + for<'a> Decode<'a>,
{
    cert.tbs_certificate
        .extensions
        .as_ref()?
        .iter()
        .find(|ext| ext.extn_id == T::OID)
        .and_then(|ext| T::from_der(ext.extn_value.as_bytes()).ok())
}

fn is_ra(cert: &Certificate) -> bool {
    let encipherment = extension::<KeyUsage>(cert).is_some_and(|ku| ku.key_encipherment());
    let ca = extension::<BasicConstraints>(cert).is_some_and(|bc| bc.ca);
    encipherment && !ca
}

/// The certificate requests are encrypted to: an RA if the server has one,
/// otherwise the first RSA certificate.
pub fn select_recipient(certs: &[Certificate]) -> Result<&Certificate> {
    certs
        .iter()
        .filter(|cert| has_rsa_key(cert))
        .find(|cert| is_ra(cert))
        .or_else(|| certs.iter().find(|cert| has_rsa_key(cert)))
        .ok_or_else(|| Error::protocol("no RSA certificate to encrypt the request to"))
}

fn pick_issued(issued: Vec<Certificate>, key: &EcPublicKey) -> Result<Certificate> {
    issued
        .into_iter()
        .find(|cert| {
            EcPublicKey::from_spki(&cert.tbs_certificate.subject_public_key_info)
                .is_ok_and(|candidate| candidate == *key)
        })
        .ok_or_else(|| Error::protocol("no issued certificate matches the request key"))
}
