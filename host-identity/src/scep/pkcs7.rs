// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! The slice of CMS (RFC 5652) that SCEP needs.
//!
//! SCEP wraps every request and response in a SignedData whose content is an
//! EnvelopedData. Signing uses RSA PKCS#1 v1.5 with signed attributes, and key
//! transport uses RSA PKCS#1 v1.5 to the recipient certificate. Certificate
//! bundles travel as degenerate (signer-less) SignedData.

use std::time::{Duration, SystemTime};

use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cms::cert::{CertificateChoices, IssuerAndSerialNumber};
use cms::content_info::{CmsVersion, ContentInfo};
use cms::enveloped_data::{
    EncryptedContentInfo, EnvelopedData, KeyTransRecipientInfo, RecipientIdentifier,
    RecipientInfo, RecipientInfos,
};
use cms::signed_data::{
    CertificateSet, EncapsulatedContentInfo, SignedData, SignerIdentifier, SignerInfo,
    SignerInfos,
};
use der::asn1::{Any, ObjectIdentifier, OctetString, SetOfVec, UtcTime};
use der::{Decode, Encode};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::Digest;
use spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use x509_cert::attr::{Attribute, Attributes};
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::serial_number::SerialNumber;
use x509_cert::time::Validity;
use x509_cert::Certificate;

use crate::csr;
use crate::error::{Error, Result};
use crate::oids;

const IDENTITY_KEY_BITS: usize = 2048;
const IDENTITY_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);

fn asn1(e: der::Error) -> Error {
    Error::protocol(format!("ASN.1: {e}"))
}

/// Symmetric ciphers for the EnvelopedData content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCipher {
    Aes128Cbc,
    Aes192Cbc,
    Aes256Cbc,
    DesEde3Cbc,
}

impl ContentCipher {
    pub fn oid(self) -> ObjectIdentifier {
        match self {
            ContentCipher::Aes128Cbc => oids::AES128_CBC,
            ContentCipher::Aes192Cbc => oids::AES192_CBC,
            ContentCipher::Aes256Cbc => oids::AES256_CBC,
            ContentCipher::DesEde3Cbc => oids::DES_EDE3_CBC,
        }
    }

    pub fn from_oid(oid: &ObjectIdentifier) -> Option<Self> {
        [
            ContentCipher::Aes128Cbc,
            ContentCipher::Aes192Cbc,
            ContentCipher::Aes256Cbc,
            ContentCipher::DesEde3Cbc,
        ]
        .into_iter()
        .find(|cipher| cipher.oid() == *oid)
    }

    pub fn key_len(self) -> usize {
        match self {
            ContentCipher::Aes128Cbc => 16,
            ContentCipher::Aes192Cbc | ContentCipher::DesEde3Cbc => 24,
            ContentCipher::Aes256Cbc => 32,
        }
    }

    pub fn iv_len(self) -> usize {
        match self {
            ContentCipher::DesEde3Cbc => 8,
            _ => 16,
        }
    }

    /// CBC with PKCS#7 padding.
    pub fn encrypt(self, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        match self {
            ContentCipher::Aes128Cbc => {
                cbc_encrypt::<cbc::Encryptor<aes::Aes128>>(key, iv, plaintext)
            }
            ContentCipher::Aes192Cbc => {
                cbc_encrypt::<cbc::Encryptor<aes::Aes192>>(key, iv, plaintext)
            }
            ContentCipher::Aes256Cbc => {
                cbc_encrypt::<cbc::Encryptor<aes::Aes256>>(key, iv, plaintext)
            }
            ContentCipher::DesEde3Cbc => {
                cbc_encrypt::<cbc::Encryptor<des::TdesEde3>>(key, iv, plaintext)
            }
        }
    }

    pub fn decrypt(self, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        match self {
            ContentCipher::Aes128Cbc => {
                cbc_decrypt::<cbc::Decryptor<aes::Aes128>>(key, iv, ciphertext)
            }
            ContentCipher::Aes192Cbc => {
                cbc_decrypt::<cbc::Decryptor<aes::Aes192>>(key, iv, ciphertext)
            }
            ContentCipher::Aes256Cbc => {
                cbc_decrypt::<cbc::Decryptor<aes::Aes256>>(key, iv, ciphertext)
            }
            ContentCipher::DesEde3Cbc => {
                cbc_decrypt::<cbc::Decryptor<des::TdesEde3>>(key, iv, ciphertext)
            }
        }
    }
}

fn cbc_encrypt<E: KeyIvInit + BlockEncryptMut>(
    key: &[u8],
    iv: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = E::new_from_slices(key, iv)
        .map_err(|_| Error::protocol("content-encryption key or IV has the wrong length"))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

fn cbc_decrypt<D: KeyIvInit + BlockDecryptMut>(
    key: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = D::new_from_slices(key, iv)
        .map_err(|_| Error::protocol("content-encryption key or IV has the wrong length"))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::protocol("bad padding in decrypted content"))
}

/// Message digests for the SignedData layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub fn oid(self) -> ObjectIdentifier {
        match self {
            DigestAlgorithm::Sha1 => oids::SHA1,
            DigestAlgorithm::Sha256 => oids::SHA256,
            DigestAlgorithm::Sha512 => oids::SHA512,
        }
    }

    pub fn from_oid(oid: &ObjectIdentifier) -> Option<Self> {
        [
            DigestAlgorithm::Sha1,
            DigestAlgorithm::Sha256,
            DigestAlgorithm::Sha512,
        ]
        .into_iter()
        .find(|digest| digest.oid() == *oid)
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            DigestAlgorithm::Sha1 => sha1::Sha1::digest(data).to_vec(),
            DigestAlgorithm::Sha256 => sha2::Sha256::digest(data).to_vec(),
            DigestAlgorithm::Sha512 => sha2::Sha512::digest(data).to_vec(),
        }
    }

    fn pkcs1v15(self) -> Pkcs1v15Sign {
        match self {
            DigestAlgorithm::Sha1 => Pkcs1v15Sign::new::<sha1::Sha1>(),
            DigestAlgorithm::Sha256 => Pkcs1v15Sign::new::<sha2::Sha256>(),
            DigestAlgorithm::Sha512 => Pkcs1v15Sign::new::<sha2::Sha512>(),
        }
    }

    fn identifier(self) -> AlgorithmIdentifierOwned {
        AlgorithmIdentifierOwned {
            oid: self.oid(),
            parameters: None,
        }
    }
}

/// An RSA key and its certificate, used to sign and decrypt CMS messages.
///
/// The client generates a throwaway self-signed identity per enrollment,
/// since the host key is sign-only and cannot receive the encrypted reply.
pub struct RsaIdentity {
    key: RsaPrivateKey,
    certificate: Certificate,
}

impl RsaIdentity {
    /// Generate an RSA-2048 key with a self-signed certificate for `common_name`.
    pub fn generate(common_name: &str) -> Result<Self> {
        let key = RsaPrivateKey::new(&mut OsRng, IDENTITY_KEY_BITS)
            .map_err(|e| Error::Signing(format!("generate RSA identity: {e}")))?;
        let subject = csr::common_name(common_name)?;
        let spki = SubjectPublicKeyInfoOwned::from_key(key.to_public_key())
            .map_err(|e| Error::Signing(format!("encode RSA identity key: {e}")))?;

        let mut serial = [0u8; 16];
        OsRng.fill_bytes(&mut serial);
        serial[0] = (serial[0] & 0x7f) | 0x01;

        let signing_key = rsa::pkcs1v15::SigningKey::<sha2::Sha256>::new(key.clone());
        let builder = CertificateBuilder::new(
            Profile::Leaf {
                issuer: subject.clone(),
                enable_key_agreement: false,
                enable_key_encipherment: true,
            },
            SerialNumber::new(&serial).map_err(asn1)?,
            Validity::from_now(IDENTITY_VALIDITY).map_err(asn1)?,
            subject,
            spki,
            &signing_key,
        )
        .map_err(|e| Error::Signing(format!("self-signed identity: {e}")))?;
        let certificate = builder
            .build::<rsa::pkcs1v15::Signature>()
            .map_err(|e| Error::Signing(format!("self-signed identity: {e}")))?;
        Ok(Self { key, certificate })
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn key(&self) -> &RsaPrivateKey {
        &self.key
    }

    fn issuer_and_serial(&self) -> IssuerAndSerialNumber {
        issuer_and_serial(&self.certificate)
    }
}

fn issuer_and_serial(cert: &Certificate) -> IssuerAndSerialNumber {
    IssuerAndSerialNumber {
        issuer: cert.tbs_certificate.issuer.clone(),
        serial_number: cert.tbs_certificate.serial_number.clone(),
    }
}

fn identifies(id: &IssuerAndSerialNumber, cert: &Certificate) -> bool {
    cert.tbs_certificate.issuer == id.issuer
        && cert.tbs_certificate.serial_number == id.serial_number
}

/// The RSA public key of a certificate, if it has one.
pub fn rsa_public_key(cert: &Certificate) -> Result<RsaPublicKey> {
    let spki = cert
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(asn1)?;
    RsaPublicKey::from_public_key_der(&spki)
        .map_err(|_| Error::protocol("certificate does not carry an RSA key"))
}

/// Build a single-valued attribute.
pub fn attribute(oid: ObjectIdentifier, value: Any) -> Result<Attribute> {
    Ok(Attribute {
        oid,
        values: SetOfVec::try_from(vec![value]).map_err(asn1)?,
    })
}

/// A PrintableString value.
pub fn printable(value: &str) -> Result<Any> {
    Any::new(der::Tag::PrintableString, value.as_bytes()).map_err(asn1)
}

/// An OCTET STRING value.
pub fn octets(value: &[u8]) -> Result<Any> {
    Any::encode_from(&OctetString::new(value).map_err(asn1)?).map_err(asn1)
}

/// First value of the attribute `oid`.
pub fn find_attribute<'a>(attributes: &'a Attributes, oid: &ObjectIdentifier) -> Option<&'a Any> {
    attributes
        .iter()
        .find(|attr| attr.oid == *oid)
        .and_then(|attr| attr.values.iter().next())
}

fn wrap<T>(content_type: ObjectIdentifier, content: &T) -> Result<Vec<u8>>
where
    T: der::Tagged + der::EncodeValue,
{
    ContentInfo {
        content_type,
        content: Any::encode_from(content).map_err(asn1)?,
    }
    .to_der()
    .map_err(asn1)
}

fn unwrap_content<T>(der: &[u8], expected: ObjectIdentifier, what: &str) -> Result<T>
where
    T: for<'a> der::Choice<'a> + for<'a> der::DecodeValue<'a>,
{
    let info = ContentInfo::from_der(der).map_err(|e| Error::protocol(format!("{what}: {e}")))?;
    if info.content_type != expected {
        return Err(Error::protocol(format!(
            "{what}: unexpected content type {}",
            info.content_type
        )));
    }
    info.content
        .decode_as::<T>()
        .map_err(|e| Error::protocol(format!("{what}: {e}")))
}

/// Encrypt `content` to the RSA key of `recipient` (EnvelopedData, DER).
pub fn envelope(content: &[u8], recipient: &Certificate, cipher: ContentCipher) -> Result<Vec<u8>> {
    let mut key = vec![0u8; cipher.key_len()];
    let mut iv = vec![0u8; cipher.iv_len()];
    OsRng.fill_bytes(&mut key);
    OsRng.fill_bytes(&mut iv);
    let encrypted = cipher.encrypt(&key, &iv, content)?;

    let enc_key = rsa_public_key(recipient)?
        .encrypt(&mut OsRng, Pkcs1v15Encrypt, &key)
        .map_err(|e| Error::protocol(format!("encrypt content key: {e}")))?;

    let recipient_info = RecipientInfo::Ktri(KeyTransRecipientInfo {
        version: CmsVersion::V0,
        rid: RecipientIdentifier::IssuerAndSerialNumber(issuer_and_serial(recipient)),
        key_enc_alg: AlgorithmIdentifierOwned {
            oid: oids::RSA_ENCRYPTION,
            parameters: Some(Any::null()),
        },
        enc_key: OctetString::new(enc_key).map_err(asn1)?,
    });

    let enveloped = EnvelopedData {
        version: CmsVersion::V0,
        originator_info: None,
        recip_infos: RecipientInfos::try_from(vec![recipient_info]).map_err(asn1)?,
        encrypted_content: EncryptedContentInfo {
            content_type: oids::CMS_DATA,
            content_enc_alg: AlgorithmIdentifierOwned {
                oid: cipher.oid(),
                parameters: Some(octets(&iv)?),
            },
            encrypted_content: Some(OctetString::new(encrypted).map_err(asn1)?),
        },
        unprotected_attrs: None,
    };
    wrap(oids::CMS_ENVELOPED_DATA, &enveloped)
}

/// Decrypt an EnvelopedData addressed to `identity`.
pub fn open_envelope(der: &[u8], identity: &RsaIdentity) -> Result<Vec<u8>> {
    let enveloped: EnvelopedData = unwrap_content(der, oids::CMS_ENVELOPED_DATA, "EnvelopedData")?;
    let ours = identity.issuer_and_serial();
    let enc_key = enveloped
        .recip_infos
        .0
        .iter()
        .find_map(|info| match info {
            RecipientInfo::Ktri(KeyTransRecipientInfo {
                rid: RecipientIdentifier::IssuerAndSerialNumber(id),
                enc_key,
                ..
            }) if *id == ours => Some(enc_key),
            _ => None,
        })
        .ok_or_else(|| Error::protocol("EnvelopedData is not addressed to this client"))?;

    let content = &enveloped.encrypted_content;
    let cipher = ContentCipher::from_oid(&content.content_enc_alg.oid).ok_or_else(|| {
        Error::protocol(format!(
            "unsupported content cipher {}",
            content.content_enc_alg.oid
        ))
    })?;
    let iv = content
        .content_enc_alg
        .parameters
        .as_ref()
        .and_then(|params| params.decode_as::<OctetString>().ok())
        .ok_or_else(|| Error::protocol("content cipher without an IV"))?;
    let ciphertext = content
        .encrypted_content
        .as_ref()
        .ok_or_else(|| Error::protocol("EnvelopedData without encrypted content"))?;

    let key = identity
        .key
        .decrypt(Pkcs1v15Encrypt, enc_key.as_bytes())
        .map_err(|_| Error::protocol("cannot decrypt the content-encryption key"))?;
    if key.len() != cipher.key_len() {
        return Err(Error::protocol(format!(
            "content-encryption key of {} bytes for {:?}",
            key.len(),
            cipher
        )));
    }
    cipher.decrypt(&key, iv.as_bytes(), ciphertext.as_bytes())
}

/// Sign `content` as SignedData with `identity`, adding `extra` signed
/// attributes after contentType, messageDigest and signingTime.
pub fn sign(
    content: &[u8],
    identity: &RsaIdentity,
    digest: DigestAlgorithm,
    extra: Vec<Attribute>,
) -> Result<Vec<u8>> {
    let mut attrs = vec![
        attribute(oids::CONTENT_TYPE, Any::encode_from(&oids::CMS_DATA).map_err(asn1)?)?,
        attribute(oids::MESSAGE_DIGEST, octets(&digest.digest(content))?)?,
        attribute(
            oids::SIGNING_TIME,
            Any::encode_from(&UtcTime::from_system_time(SystemTime::now()).map_err(asn1)?)
                .map_err(asn1)?,
        )?,
    ];
    attrs.extend(extra);
    let signed_attrs: Attributes = SetOfVec::try_from(attrs).map_err(asn1)?;

    let to_sign = digest.digest(&signed_attrs.to_der().map_err(asn1)?);
    let signature = identity
        .key
        .sign(digest.pkcs1v15(), &to_sign)
        .map_err(|e| Error::Signing(format!("RSA signature: {e}")))?;

    let signer_info = SignerInfo {
        version: CmsVersion::V1,
        sid: SignerIdentifier::IssuerAndSerialNumber(identity.issuer_and_serial()),
        digest_alg: digest.identifier(),
        signed_attrs: Some(signed_attrs),
        signature_algorithm: AlgorithmIdentifierOwned {
            oid: oids::RSA_ENCRYPTION,
            parameters: Some(Any::null()),
        },
        signature: OctetString::new(signature).map_err(asn1)?,
        unsigned_attrs: None,
    };

    let signed = SignedData {
        version: CmsVersion::V1,
        digest_algorithms: SetOfVec::try_from(vec![digest.identifier()]).map_err(asn1)?,
        encap_content_info: EncapsulatedContentInfo {
            econtent_type: oids::CMS_DATA,
            econtent: Some(octets(content)?),
        },
        certificates: Some(
            CertificateSet::try_from(vec![CertificateChoices::Certificate(
                identity.certificate.clone(),
            )])
            .map_err(asn1)?,
        ),
        crls: None,
        signer_infos: SignerInfos::try_from(vec![signer_info]).map_err(asn1)?,
    };
    wrap(oids::CMS_SIGNED_DATA, &signed)
}

/// A SignedData whose signature has been checked.
#[derive(Debug, Clone)]
pub struct SignedMessage {
    pub content: Vec<u8>,
    pub attributes: Attributes,
    pub signer: Certificate,
    pub certificates: Vec<Certificate>,
}

impl SignedMessage {
    pub fn attribute(&self, oid: &ObjectIdentifier) -> Option<&Any> {
        find_attribute(&self.attributes, oid)
    }
}

fn embedded_certificates(signed: &SignedData) -> Vec<Certificate> {
    signed
        .certificates
        .iter()
        .flat_map(|set| set.0.iter())
        .filter_map(|choice| match choice {
            CertificateChoices::Certificate(cert) => Some(cert.clone()),
            _ => None,
        })
        .collect()
}

/// Decode a SignedData and verify its single signer.
///
/// The signer certificate is looked up by issuer and serial among the
/// embedded certificates and then `extra_certs`. Any embedded certificate
/// is accepted, so this only proves possession of the signing key.
pub fn verify(der: &[u8], extra_certs: &[Certificate]) -> Result<SignedMessage> {
    verify_with(der, |sid, embedded| {
        embedded
            .iter()
            .chain(extra_certs)
            .find(|cert| identifies(sid, cert))
            .cloned()
            .ok_or_else(|| Error::protocol("signer certificate not found"))
    })
}

/// Decode a SignedData whose signer must be one of `trusted`.
///
/// Embedded certificates are still returned but never considered as the
/// signer.
pub fn verify_signed_by(der: &[u8], trusted: &[Certificate]) -> Result<SignedMessage> {
    verify_with(der, |sid, _| {
        trusted
            .iter()
            .find(|cert| identifies(sid, cert))
            .cloned()
            .ok_or_else(|| Error::protocol("SignedData is not signed by a trusted certificate"))
    })
}

fn verify_with<F>(der: &[u8], find_signer: F) -> Result<SignedMessage>
where
    F: FnOnce(&IssuerAndSerialNumber, &[Certificate]) -> Result<Certificate>,
{
    let signed: SignedData = unwrap_content(der, oids::CMS_SIGNED_DATA, "SignedData")?;
    let certificates = embedded_certificates(&signed);

    let signer_info = match signed.signer_infos.0.as_slice() {
        [one] => one,
        [] => return Err(Error::protocol("SignedData has no signer")),
        _ => return Err(Error::protocol("SignedData has more than one signer")),
    };
    let SignerIdentifier::IssuerAndSerialNumber(sid) = &signer_info.sid else {
        return Err(Error::protocol(
            "signer identified by key identifier is not supported",
        ));
    };
    let signer = find_signer(sid, &certificates)?;

    let digest = DigestAlgorithm::from_oid(&signer_info.digest_alg.oid).ok_or_else(|| {
        Error::protocol(format!(
            "unsupported digest algorithm {}",
            signer_info.digest_alg.oid
        ))
    })?;
    let sig_oid = signer_info.signature_algorithm.oid;
    if ![
        oids::RSA_ENCRYPTION,
        oids::SHA1_WITH_RSA,
        oids::SHA256_WITH_RSA,
        oids::SHA512_WITH_RSA,
    ]
    .contains(&sig_oid)
    {
        return Err(Error::protocol(format!(
            "unsupported signature algorithm {sig_oid}"
        )));
    }

    let content = match &signed.encap_content_info.econtent {
        Some(any) => any
            .decode_as::<OctetString>()
            .map_err(|e| Error::protocol(format!("encapsulated content: {e}")))?
            .into_bytes(),
        None => Vec::new(),
    };

    let attributes = signer_info
        .signed_attrs
        .clone()
        .ok_or_else(|| Error::protocol("SignedData without signed attributes"))?;
    let message_digest = find_attribute(&attributes, &oids::MESSAGE_DIGEST)
        .and_then(|any| any.decode_as::<OctetString>().ok())
        .ok_or_else(|| Error::protocol("messageDigest attribute missing"))?;
    if message_digest.as_bytes() != digest.digest(&content).as_slice() {
        return Err(Error::protocol("messageDigest does not match the content"));
    }

    let hashed = digest.digest(&attributes.to_der().map_err(asn1)?);
    rsa_public_key(&signer)?
        .verify(digest.pkcs1v15(), &hashed, signer_info.signature.as_bytes())
        .map_err(|_| Error::protocol("SignedData signature verification failed"))?;

    Ok(SignedMessage {
        content,
        attributes,
        signer,
        certificates,
    })
}

/// Degenerate SignedData carrying only `certs`.
pub fn certs_only(certs: &[Certificate]) -> Result<Vec<u8>> {
    let choices = certs
        .iter()
        .cloned()
        .map(CertificateChoices::Certificate)
        .collect::<Vec<_>>();
    let signed = SignedData {
        version: CmsVersion::V1,
        digest_algorithms: SetOfVec::new(),
        encap_content_info: EncapsulatedContentInfo {
            econtent_type: oids::CMS_DATA,
            econtent: None,
        },
        certificates: Some(CertificateSet::try_from(choices).map_err(asn1)?),
        crls: None,
        signer_infos: SignerInfos::try_from(Vec::new()).map_err(asn1)?,
    };
    wrap(oids::CMS_SIGNED_DATA, &signed)
}

/// Certificates of a degenerate SignedData. Order is not preserved.
pub fn parse_certs_only(der: &[u8]) -> Result<Vec<Certificate>> {
    let signed: SignedData = unwrap_content(der, oids::CMS_SIGNED_DATA, "certificate bundle")?;
    let certs = embedded_certificates(&signed);
    if certs.is_empty() {
        return Err(Error::protocol("certificate bundle is empty"));
    }
    Ok(certs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(cn: &str) -> RsaIdentity {
        RsaIdentity::generate(cn).unwrap()
    }

    #[test]
    fn test_ciphers_roundtrip_and_reject_bad_padding() {
        for cipher in [
            ContentCipher::Aes128Cbc,
            ContentCipher::Aes192Cbc,
            ContentCipher::Aes256Cbc,
            ContentCipher::DesEde3Cbc,
        ] {
            let key = vec![0x42; cipher.key_len()];
            let iv = vec![0x24; cipher.iv_len()];
            let ct = cipher.encrypt(&key, &iv, b"pkcs10 request").unwrap();
            assert_eq!(ct.len() % cipher.iv_len(), 0);
            assert_eq!(cipher.decrypt(&key, &iv, &ct).unwrap(), b"pkcs10 request");
            assert_eq!(ContentCipher::from_oid(&cipher.oid()), Some(cipher));

            // Flipping only the low bit would hit DES parity bits.
            let wrong_key = vec![0x5a; cipher.key_len()];
            let garbled = cipher.decrypt(&wrong_key, &iv, &ct);
            assert!(garbled.map_or(true, |pt| pt != b"pkcs10 request"));
        }
        assert!(ContentCipher::Aes128Cbc.encrypt(&[0; 5], &[0; 16], b"x").is_err());
    }

    #[test]
    fn test_generated_identity_is_self_signed() {
        let id = identity("scep-client");
        let tbs = &id.certificate().tbs_certificate;
        assert_eq!(tbs.issuer, tbs.subject);
        assert_eq!(
            csr::find_common_name(&tbs.subject).as_deref(),
            Some("scep-client")
        );
        assert_eq!(
            rsa_public_key(id.certificate()).unwrap(),
            id.key().to_public_key()
        );
    }

    #[test]
    fn test_envelope_only_opens_for_recipient() {
        let recipient = identity("ca");
        let stranger = identity("stranger");
        let der =
            envelope(b"secret csr", recipient.certificate(), ContentCipher::Aes128Cbc).unwrap();
        assert_eq!(open_envelope(&der, &recipient).unwrap(), b"secret csr");
        assert!(open_envelope(&der, &stranger).is_err());
    }

    #[test]
    fn test_signed_data_verifies_and_carries_attributes() {
        let id = identity("client");
        let extra = vec![attribute(oids::SCEP_MESSAGE_TYPE, printable("19").unwrap()).unwrap()];
        let der = sign(b"payload", &id, DigestAlgorithm::Sha256, extra).unwrap();

        let msg = verify(&der, &[]).unwrap();
        assert_eq!(msg.content, b"payload");
        assert_eq!(msg.signer, *id.certificate());
        assert_eq!(msg.attribute(&oids::SCEP_MESSAGE_TYPE).unwrap().value(), b"19");
        assert!(msg.attribute(&oids::SIGNING_TIME).is_some());
    }

    #[test]
    fn test_tampered_signed_data_is_rejected() {
        let id = identity("client");
        let der = sign(b"payload", &id, DigestAlgorithm::Sha1, Vec::new()).unwrap();
        let needle = b"payload";
        let at = der.windows(needle.len()).position(|w| w == needle).unwrap();
        let mut tampered = der.clone();
        tampered[at] ^= 0x01;
        assert!(matches!(verify(&tampered, &[]), Err(Error::ScepProtocol(_))));
    }

    #[test]
    fn test_signed_by_ignores_embedded_signer() {
        let ca = identity("ca");
        let stranger = identity("stranger");
        let der = sign(b"reply", &stranger, DigestAlgorithm::Sha256, Vec::new()).unwrap();

        // The stranger's own certificate travels in the message.
        assert!(verify(&der, &[]).is_ok());
        let err = verify_signed_by(&der, &[ca.certificate().clone()]).unwrap_err();
        assert!(matches!(err, Error::ScepProtocol(_)), "{err}");

        let genuine = sign(b"reply", &ca, DigestAlgorithm::Sha256, Vec::new()).unwrap();
        let msg = verify_signed_by(&genuine, &[ca.certificate().clone()]).unwrap();
        assert_eq!(msg.signer, *ca.certificate());
    }

    #[test]
    fn test_certs_only_bundle() {
        let a = identity("ca");
        let b = identity("ra");
        let der = certs_only(&[a.certificate().clone(), b.certificate().clone()]).unwrap();
        let certs = parse_certs_only(&der).unwrap();
        assert_eq!(certs.len(), 2);
        assert!(certs.contains(a.certificate()));
        assert!(certs.contains(b.certificate()));
        assert!(parse_certs_only(&certs_only(&[]).unwrap()).is_err());
    }
}
