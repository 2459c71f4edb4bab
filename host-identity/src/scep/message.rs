// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! SCEP PKIMessages: the PKCSReq the client sends and the CertRep it gets
//! back (RFC 8894 §3.2).

use std::fmt;

use der::asn1::{Any, ObjectIdentifier, OctetString};
use rand::rngs::OsRng;
use rand::RngCore;
use x509_cert::Certificate;

use super::pkcs7::{self, ContentCipher, DigestAlgorithm, RsaIdentity, SignedMessage};
use crate::csr::directory_string;
use crate::error::{Error, Result};
use crate::oids;

pub const NONCE_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    CertRep,
    RenewalReq,
    PkcsReq,
    CertPoll,
    GetCert,
    GetCrl,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::CertRep => "3",
            MessageType::RenewalReq => "17",
            MessageType::PkcsReq => "19",
            MessageType::CertPoll => "20",
            MessageType::GetCert => "21",
            MessageType::GetCrl => "22",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "3" => MessageType::CertRep,
            "17" => MessageType::RenewalReq,
            "19" => MessageType::PkcsReq,
            "20" => MessageType::CertPoll,
            "21" => MessageType::GetCert,
            "22" => MessageType::GetCrl,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PkiStatus {
    Success,
    Failure,
    Pending,
}

impl PkiStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PkiStatus::Success => "0",
            PkiStatus::Failure => "2",
            PkiStatus::Pending => "3",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "0" => Some(PkiStatus::Success),
            "2" => Some(PkiStatus::Failure),
            "3" => Some(PkiStatus::Pending),
            _ => None,
        }
    }
}

/// Reasons a CA gives for `pkiStatus = FAILURE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailInfo {
    BadAlg,
    BadMessageCheck,
    BadRequest,
    BadTime,
    BadCertId,
}

impl FailInfo {
    pub fn as_str(self) -> &'static str {
        match self {
            FailInfo::BadAlg => "0",
            FailInfo::BadMessageCheck => "1",
            FailInfo::BadRequest => "2",
            FailInfo::BadTime => "3",
            FailInfo::BadCertId => "4",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "0" => FailInfo::BadAlg,
            "1" => FailInfo::BadMessageCheck,
            "2" => FailInfo::BadRequest,
            "3" => FailInfo::BadTime,
            "4" => FailInfo::BadCertId,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            FailInfo::BadAlg => "badAlg",
            FailInfo::BadMessageCheck => "badMessageCheck",
            FailInfo::BadRequest => "badRequest",
            FailInfo::BadTime => "badTime",
            FailInfo::BadCertId => "badCertId",
        }
    }
}

impl fmt::Display for FailInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lower-case hex SHA-256 of the requester's DER SubjectPublicKeyInfo.
///
/// Stable for a key, so every message of one enrollment (including
/// re-sends after PENDING) carries the same value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn from_spki_der(spki_der: &[u8]) -> Self {
        use sha2::Digest;
        Self(hex::encode(sha2::Sha256::digest(spki_der)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single-use 16-byte sender or recipient nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes = <[u8; NONCE_LEN]>::try_from(bytes).map_err(|_| {
            Error::protocol(format!("nonce of {} bytes, expected {NONCE_LEN}", bytes.len()))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Everything a PKCSReq needs apart from the per-attempt nonce.
pub struct PkcsReq<'a> {
    pub csr_der: &'a [u8],
    pub transaction_id: &'a TransactionId,
    pub challenge_password: &'a str,
    pub recipient: &'a Certificate,
    pub identity: &'a RsaIdentity,
    pub cipher: ContentCipher,
    pub digest: DigestAlgorithm,
}

impl PkcsReq<'_> {
    /// Encrypt the CSR to the recipient and sign the result (DER PKIMessage).
    pub fn encode(&self, sender_nonce: &Nonce) -> Result<Vec<u8>> {
        let envelope = pkcs7::envelope(self.csr_der, self.recipient, self.cipher)?;
        let attributes = vec![
            pkcs7::attribute(
                oids::SCEP_TRANSACTION_ID,
                pkcs7::printable(self.transaction_id.as_str())?,
            )?,
            pkcs7::attribute(
                oids::SCEP_MESSAGE_TYPE,
                pkcs7::printable(MessageType::PkcsReq.as_str())?,
            )?,
            pkcs7::attribute(oids::SCEP_SENDER_NONCE, pkcs7::octets(sender_nonce.as_bytes())?)?,
            pkcs7::attribute(
                oids::CHALLENGE_PASSWORD,
                directory_string(self.challenge_password)?,
            )?,
        ];
        pkcs7::sign(&envelope, self.identity, self.digest, attributes)
    }
}

/// A verified CertRep.
#[derive(Debug, Clone)]
pub struct CertRep {
    pub status: PkiStatus,
    pub fail_info: Option<FailInfo>,
    pub fail_info_text: Option<String>,
    pub sender_nonce: Option<Nonce>,
    message: SignedMessage,
}

fn string_value(any: &Any) -> Result<String> {
    String::from_utf8(any.value().to_vec())
        .map_err(|_| Error::protocol("SCEP attribute is not a string"))
}

fn required_string(message: &SignedMessage, oid: &ObjectIdentifier, name: &str) -> Result<String> {
    let value = message
        .attribute(oid)
        .ok_or_else(|| Error::protocol(format!("CertRep without {name}")))?;
    string_value(value)
}

fn nonce_value(message: &SignedMessage, oid: &ObjectIdentifier) -> Result<Option<Nonce>> {
    message
        .attribute(oid)
        .map(|any| {
            let octets = any
                .decode_as::<OctetString>()
                .map_err(|e| Error::protocol(format!("nonce attribute: {e}")))?;
            Nonce::from_slice(octets.as_bytes())
        })
        .transpose()
}

/// Verify and decode a CertRep answering the request identified by
/// `transaction_id` and `sender_nonce`.
///
/// The signer must be one of `ca_certs`, the certificates published by
/// GetCACert.
pub fn parse_cert_rep(
    der: &[u8],
    ca_certs: &[Certificate],
    transaction_id: &TransactionId,
    sender_nonce: &Nonce,
) -> Result<CertRep> {
    let message = pkcs7::verify_signed_by(der, ca_certs)?;

    let message_type = required_string(&message, &oids::SCEP_MESSAGE_TYPE, "messageType")?;
    if MessageType::parse(&message_type) != Some(MessageType::CertRep) {
        return Err(Error::protocol(format!(
            "expected a CertRep, got messageType {message_type}"
        )));
    }

    let tid = required_string(&message, &oids::SCEP_TRANSACTION_ID, "transactionID")?;
    if tid != transaction_id.as_str() {
        return Err(Error::protocol("transactionID does not match the request"));
    }

    let recipient_nonce = nonce_value(&message, &oids::SCEP_RECIPIENT_NONCE)?
        .ok_or_else(|| Error::protocol("CertRep without recipientNonce"))?;
    if recipient_nonce != *sender_nonce {
        return Err(Error::protocol("recipientNonce does not match the senderNonce"));
    }

    let status_text = required_string(&message, &oids::SCEP_PKI_STATUS, "pkiStatus")?;
    let status = PkiStatus::parse(&status_text)
        .ok_or_else(|| Error::protocol(format!("unknown pkiStatus {status_text}")))?;

    let (fail_info, fail_info_text) = if status == PkiStatus::Failure {
        let info = message
            .attribute(&oids::SCEP_FAIL_INFO)
            .map(string_value)
            .transpose()?
            .and_then(|value| FailInfo::parse(&value));
        let text = message
            .attribute(&oids::SCEP_FAIL_INFO_TEXT)
            .map(string_value)
            .transpose()?;
        (info, text)
    } else {
        (None, None)
    };

    Ok(CertRep {
        status,
        fail_info,
        fail_info_text,
        sender_nonce: nonce_value(&message, &oids::SCEP_SENDER_NONCE)?,
        message,
    })
}

impl CertRep {
    /// `failInfo` name followed by `failInfoText`, for error reporting.
    pub fn failure_description(&self) -> String {
        let name = self.fail_info.map_or("unspecified", FailInfo::name);
        match &self.fail_info_text {
            Some(text) => format!("{name}: {text}"),
            None => name.to_string(),
        }
    }

    /// Certificate that signed the response.
    pub fn signer(&self) -> &Certificate {
        &self.message.signer
    }

    /// Decrypt a SUCCESS response and return the issued certificates.
    pub fn decrypt_certificates(&self, identity: &RsaIdentity) -> Result<Vec<Certificate>> {
        if self.status != PkiStatus::Success {
            return Err(Error::protocol(format!(
                "CertRep with status {:?} carries no certificates",
                self.status
            )));
        }
        if self.message.content.is_empty() {
            return Err(Error::protocol("SUCCESS CertRep without content"));
        }
        let degenerate = pkcs7::open_envelope(&self.message.content, identity)?;
        pkcs7::parse_certs_only(&degenerate)
    }
}
