// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! A scriptable in-process SCEP CA.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use der::asn1::{OctetString, UtcTime};
use der::Encode;
use host_identity::csr::{find_common_name, verify_csr};
use host_identity::oids;
use host_identity::scep::message::{FailInfo, MessageType, Nonce, PkiStatus};
use host_identity::scep::pkcs7::{self, ContentCipher, DigestAlgorithm, RsaIdentity};
use host_identity::x509_cert::builder::{Builder, CertificateBuilder, Profile};
use host_identity::x509_cert::request::CertReq;
use host_identity::x509_cert::serial_number::SerialNumber;
use host_identity::x509_cert::time::{Time, Validity};
use host_identity::x509_cert::Certificate;
use host_identity::{HostIdentityConfig, PollPolicy, ScepOptions, TeeBackend};

pub const CHALLENGE: &str = "secret";
pub const COMMON_NAME: &str = "fleet-device";
pub const MODERN_CAPS: &str = "AES\nSHA-256\nPOSTPKIOperation\nRenewal\n";

/// How the CA answers a PKCSReq.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Success,
    /// Issue a certificate that expired an hour ago.
    SuccessExpired,
    Pending,
    Failure(FailInfo),
}

/// What the CA saw in one PKIOperation.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub transaction_id: String,
    pub sender_nonce: Vec<u8>,
    pub cipher: ContentCipher,
    pub common_name: Option<String>,
    pub method: &'static str,
}

struct CaState {
    identity: RsaIdentity,
    caps: String,
    script: Mutex<VecDeque<Reply>>,
    http_requests: AtomicUsize,
    seen: Mutex<Vec<SeenRequest>>,
    next_serial: AtomicU32,
}

pub struct FakeCa {
    pub url: String,
    state: Arc<CaState>,
}

impl FakeCa {
    /// Serve on a loopback port. Replies are taken from `script` in order and
    /// the last one repeats; an empty script always succeeds.
    pub async fn start(caps: &str, script: Vec<Reply>) -> Self {
        let state = Arc::new(CaState {
            identity: RsaIdentity::generate("Test SCEP CA").unwrap(),
            caps: caps.to_string(),
            script: Mutex::new(script.into()),
            http_requests: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            next_serial: AtomicU32::new(0x1000),
        });
        let app = Router::new()
            .route("/scep", get(scep).post(scep))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            url: format!("http://{addr}/scep"),
            state,
        }
    }

    pub fn ca_certificate(&self) -> &Certificate {
        self.state.identity.certificate()
    }

    /// HTTP requests of any operation served so far.
    pub fn http_requests(&self) -> usize {
        self.state.http_requests.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.state.seen.lock().unwrap().clone()
    }

    pub fn config(&self, dir: &Path, p256_only: bool) -> HostIdentityConfig {
        let mut scep = ScepOptions::new(&self.url, CHALLENGE, COMMON_NAME);
        scep.poll = PollPolicy {
            initial_backoff_ms: 50,
            max_backoff_ms: 200,
            deadline_secs: 20,
        };
        HostIdentityConfig {
            metadata_dir: dir.to_path_buf(),
            tee: TeeBackend::Software { p256_only },
            scep,
        }
    }
}

async fn scep(
    State(ca): State<Arc<CaState>>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    ca.http_requests.fetch_add(1, Ordering::SeqCst);
    match params.get("operation").map(String::as_str) {
        Some("GetCACert") => (
            [(header::CONTENT_TYPE, "application/x-x509-ca-cert")],
            ca.identity.certificate().to_der().unwrap(),
        )
            .into_response(),
        Some("GetCACaps") => ca.caps.clone().into_response(),
        Some("PKIOperation") => {
            let (message, method) = match params.get("message") {
                Some(encoded) => (STANDARD.decode(encoded).unwrap(), "GET"),
                None => (body.to_vec(), "POST"),
            };
            (
                [(header::CONTENT_TYPE, "application/x-pki-message")],
                ca.pki_operation(&message, method),
            )
                .into_response()
        }
        _ => StatusCode::BAD_REQUEST.into_response(),
    }
}

fn string_attr(msg: &pkcs7::SignedMessage, oid: &der::asn1::ObjectIdentifier) -> String {
    String::from_utf8(msg.attribute(oid).unwrap().value().to_vec()).unwrap()
}

impl CaState {
    fn next_reply(&self) -> Reply {
        let mut script = self.script.lock().unwrap();
        match script.len() {
            0 => Reply::Success,
            1 => script[0],
            _ => script.pop_front().unwrap(),
        }
    }

    fn pki_operation(&self, der: &[u8], method: &'static str) -> Vec<u8> {
        let request = pkcs7::verify(der, &[]).unwrap();
        assert_eq!(
            string_attr(&request, &oids::SCEP_MESSAGE_TYPE),
            MessageType::PkcsReq.as_str()
        );
        let transaction_id = string_attr(&request, &oids::SCEP_TRANSACTION_ID);
        let sender_nonce = request
            .attribute(&oids::SCEP_SENDER_NONCE)
            .unwrap()
            .decode_as::<OctetString>()
            .unwrap()
            .into_bytes();
        let challenge = string_attr(&request, &oids::CHALLENGE_PASSWORD);

        let csr_der = pkcs7::open_envelope(&request.content, &self.identity).unwrap();
        let csr = verify_csr(&csr_der).unwrap();
        let cipher = envelope_cipher(&request.content);
        self.seen.lock().unwrap().push(SeenRequest {
            transaction_id: transaction_id.clone(),
            sender_nonce: sender_nonce.clone(),
            cipher,
            common_name: find_common_name(&csr.info.subject),
            method,
        });

        let reply = if challenge != CHALLENGE {
            Reply::Failure(FailInfo::BadRequest)
        } else {
            self.next_reply()
        };

        let (status, content) = match reply {
            Reply::Success | Reply::SuccessExpired => {
                let issued = self.issue(&csr, reply == Reply::SuccessExpired);
                let degenerate = pkcs7::certs_only(&[issued]).unwrap();
                let envelope =
                    pkcs7::envelope(&degenerate, &request.signer, ContentCipher::Aes256Cbc)
                        .unwrap();
                (PkiStatus::Success, envelope)
            }
            Reply::Pending => (PkiStatus::Pending, Vec::new()),
            Reply::Failure(_) => (PkiStatus::Failure, Vec::new()),
        };

        let mut attrs = vec![
            pkcs7::attribute(
                oids::SCEP_TRANSACTION_ID,
                pkcs7::printable(&transaction_id).unwrap(),
            )
            .unwrap(),
            pkcs7::attribute(
                oids::SCEP_MESSAGE_TYPE,
                pkcs7::printable(MessageType::CertRep.as_str()).unwrap(),
            )
            .unwrap(),
            pkcs7::attribute(
                oids::SCEP_PKI_STATUS,
                pkcs7::printable(status.as_str()).unwrap(),
            )
            .unwrap(),
            pkcs7::attribute(oids::SCEP_RECIPIENT_NONCE, pkcs7::octets(&sender_nonce).unwrap())
                .unwrap(),
            pkcs7::attribute(
                oids::SCEP_SENDER_NONCE,
                pkcs7::octets(Nonce::random().as_bytes()).unwrap(),
            )
            .unwrap(),
        ];
        if let Reply::Failure(info) = reply {
            attrs.push(
                pkcs7::attribute(oids::SCEP_FAIL_INFO, pkcs7::printable(info.as_str()).unwrap())
                    .unwrap(),
            );
            attrs.push(
                pkcs7::attribute(
                    oids::SCEP_FAIL_INFO_TEXT,
                    pkcs7::printable("request refused by test CA").unwrap(),
                )
                .unwrap(),
            );
        }
        pkcs7::sign(&content, &self.identity, DigestAlgorithm::Sha256, attrs).unwrap()
    }

    fn issue(&self, csr: &CertReq, expired: bool) -> Certificate {
        let validity = if expired {
            let now = SystemTime::now();
            Validity {
                not_before: utc(now - Duration::from_secs(7200)),
                not_after: utc(now - Duration::from_secs(3600)),
            }
        } else {
            Validity::from_now(Duration::from_secs(24 * 3600)).unwrap()
        };
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        let signing_key =
            rsa::pkcs1v15::SigningKey::<sha2::Sha256>::new(self.identity.key().clone());
        CertificateBuilder::new(
            Profile::Leaf {
                issuer: self.identity.certificate().tbs_certificate.subject.clone(),
                enable_key_agreement: false,
                enable_key_encipherment: false,
            },
            SerialNumber::from(serial),
            validity,
            csr.info.subject.clone(),
            csr.info.public_key.clone(),
            &signing_key,
        )
        .unwrap()
        .build::<rsa::pkcs1v15::Signature>()
        .unwrap()
    }
}

fn utc(time: SystemTime) -> Time {
    Time::UtcTime(UtcTime::from_system_time(time).unwrap())
}

fn envelope_cipher(enveloped: &[u8]) -> ContentCipher {
    use cms::content_info::ContentInfo;
    use cms::enveloped_data::EnvelopedData;
    use der::Decode;

    let info = ContentInfo::from_der(enveloped).unwrap();
    let data = info.content.decode_as::<EnvelopedData>().unwrap();
    ContentCipher::from_oid(&data.encrypted_content.content_enc_alg.oid).unwrap()
}

/// Unix permission bits of `path`.
#[cfg(unix)]
pub fn mode(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).unwrap().permissions().mode() & 0o777
}
