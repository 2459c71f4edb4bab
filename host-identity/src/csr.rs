// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! PKCS#10 certification requests signed by the host key.

use der::asn1::{Any, BitString, SetOfVec};
use der::{Decode, Encode, Tag};
use spki::AlgorithmIdentifierOwned;
use x509_cert::attr::{Attribute, AttributeTypeAndValue};
use x509_cert::name::{Name, RdnSequence, RelativeDistinguishedName};
use x509_cert::request::{CertReq, CertReqInfo, Version};

use crate::error::{Error, Result};
use crate::oids;
use crate::tee::{EcPublicKey, EccAlgorithm, Signer};

fn encoding(e: der::Error) -> Error {
    Error::InvalidArgument(format!("CSR encoding: {e}"))
}

/// `CN=<common_name>` as a single-RDN name.
pub fn common_name(common_name: &str) -> Result<Name> {
    if common_name.is_empty() {
        return Err(Error::InvalidArgument("common name must not be empty".into()));
    }
    let atv = AttributeTypeAndValue {
        oid: oids::COMMON_NAME,
        value: Any::new(Tag::Utf8String, common_name.as_bytes()).map_err(encoding)?,
    };
    let rdn = RelativeDistinguishedName(SetOfVec::try_from(vec![atv]).map_err(encoding)?);
    Ok(RdnSequence(vec![rdn]))
}

/// The first CN of a name, if it is a string.
pub fn find_common_name(name: &Name) -> Option<String> {
    name.0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .find(|atv| atv.oid == oids::COMMON_NAME)
        .and_then(|atv| std::str::from_utf8(atv.value.value()).ok())
        .map(str::to_owned)
}

/// A PKCS#9 DirectoryString: PrintableString when the value allows it.
pub(crate) fn directory_string(value: &str) -> Result<Any> {
    let printable = value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b" '()+,-./:=?".contains(&b));
    let tag = if printable {
        Tag::PrintableString
    } else {
        Tag::Utf8String
    };
    Any::new(tag, value.as_bytes()).map_err(encoding)
}

/// Build a DER-encoded CSR for the key behind `signer`.
///
/// `challenge` is added as a challengePassword attribute for servers that
/// read it from the CSR rather than the SCEP envelope.
pub fn build_csr(
    signer: &dyn Signer,
    common_name_value: &str,
    challenge: Option<&str>,
) -> Result<Vec<u8>> {
    let public_key = signer.public_key();
    let algorithm = public_key.algorithm();

    let mut attributes = Vec::new();
    if let Some(challenge) = challenge {
        attributes.push(Attribute {
            oid: oids::CHALLENGE_PASSWORD,
            values: SetOfVec::try_from(vec![directory_string(challenge)?]).map_err(encoding)?,
        });
    }

    let info = CertReqInfo {
        version: Version::V1,
        subject: common_name(common_name_value)?,
        public_key: public_key.to_spki()?,
        attributes: SetOfVec::try_from(attributes).map_err(encoding)?,
    };
    let tbs = info.to_der().map_err(encoding)?;
    let hash = algorithm.hash();
    let signature = signer.sign(&hash.digest(&tbs), hash)?;

    CertReq {
        info,
        algorithm: signature_algorithm(algorithm),
        signature: BitString::from_bytes(&signature).map_err(encoding)?,
    }
    .to_der()
    .map_err(encoding)
}

fn signature_algorithm(algorithm: EccAlgorithm) -> AlgorithmIdentifierOwned {
    AlgorithmIdentifierOwned {
        oid: algorithm.signature_oid(),
        parameters: None,
    }
}

/// Decode a CSR and check its self-signature against its own SPKI.
pub fn verify_csr(der: &[u8]) -> Result<CertReq> {
    let csr = CertReq::from_der(der)
        .map_err(|e| Error::InvalidArgument(format!("invalid CSR: {e}")))?;
    let key = EcPublicKey::from_spki(&csr.info.public_key)?;
    if csr.algorithm != signature_algorithm(key.algorithm()) {
        return Err(Error::InvalidArgument(format!(
            "CSR signature algorithm {} does not match a {} key",
            csr.algorithm.oid,
            key.algorithm()
        )));
    }
    let tbs = csr.info.to_der().map_err(encoding)?;
    let signature = csr
        .signature
        .as_bytes()
        .ok_or_else(|| Error::InvalidArgument("CSR signature has unused bits".into()))?;
    key.verify_der(&key.algorithm().hash().digest(&tbs), signature)?;
    Ok(csr)
}
