// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! GetCACaps keywords and the algorithm choices they imply.

use tracing::debug;

use super::pkcs7::{ContentCipher, DigestAlgorithm};

/// Capabilities advertised by a SCEP server (RFC 8894 §3.5.2).
///
/// Only the keywords that change what the client sends are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub aes: bool,
    pub sha256: bool,
    pub post_pki_operation: bool,
    pub scep_standard: bool,
}

impl Capabilities {
    /// Parse the newline-separated keyword list. Keywords are matched
    /// case-insensitively; unknown ones are ignored.
    pub fn parse(text: &str) -> Self {
        let mut caps = Self::default();
        for keyword in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match keyword.to_ascii_uppercase().as_str() {
                "AES" => caps.aes = true,
                "SHA-256" => caps.sha256 = true,
                "POSTPKIOPERATION" => caps.post_pki_operation = true,
                "SCEPSTANDARD" => caps.scep_standard = true,
                // Fallbacks and operations this client never uses.
                "DES3" | "SHA-1" | "SHA-512" | "GETNEXTCACERT" | "RENEWAL" => {}
                _ => debug!(keyword, "ignoring unknown SCEP capability"),
            }
        }
        caps
    }

    /// SCEPStandard implies AES, SHA-256 and POSTPKIOperation.
    pub fn content_cipher(&self) -> ContentCipher {
        if self.aes || self.scep_standard {
            ContentCipher::Aes128Cbc
        } else {
            ContentCipher::DesEde3Cbc
        }
    }

    pub fn digest_algorithm(&self) -> DigestAlgorithm {
        if self.sha256 || self.scep_standard {
            DigestAlgorithm::Sha256
        } else {
            DigestAlgorithm::Sha1
        }
    }

    pub fn use_post(&self) -> bool {
        self.post_pki_operation || self.scep_standard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mixed_case_and_crlf() {
        let caps = Capabilities::parse("AES\r\nsha-256\r\nPOSTPKIOperation\r\nRenewal\r\nFoo\r\n");
        assert!(caps.aes && caps.sha256 && caps.post_pki_operation);
        assert!(!caps.scep_standard);
        assert_eq!(caps.content_cipher(), ContentCipher::Aes128Cbc);
        assert_eq!(caps.digest_algorithm(), DigestAlgorithm::Sha256);
        assert!(caps.use_post());
    }

    #[test]
    fn test_legacy_server_defaults() {
        assert_eq!(Capabilities::parse("DES3\nSHA-1\n"), Capabilities::default());
        let caps = Capabilities::parse("");
        assert_eq!(caps.content_cipher(), ContentCipher::DesEde3Cbc);
        assert_eq!(caps.digest_algorithm(), DigestAlgorithm::Sha1);
        assert!(!caps.use_post());
    }

    #[test]
    fn test_scep_standard_implies_modern_algorithms() {
        let caps = Capabilities::parse("SCEPStandard\n");
        assert_eq!(caps.content_cipher(), ContentCipher::Aes128Cbc);
        assert_eq!(caps.digest_algorithm(), DigestAlgorithm::Sha256);
        assert!(caps.use_post());
    }
}
