//! Security-policy parameter table: which hash, symmetric
//! cipher, nonce length, asymmetric padding and KDF a given policy URI
//! implies. Grounded on the teacher's `profile::StreamProfile::compile`,
//! which is the closest analogue in the pack to "validate a named
//! configuration and return its resolved parameters."

use crate::error::{Result, ServiceResultException, StatusCode};

/// One of the four UA-SC security policies this core negotiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityPolicy {
    None,
    Basic128Rsa15,
    Basic256,
    Basic256Sha256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymmetricAlgorithm {
    None,
    Aes128Cbc,
    Aes256Cbc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    None,
    Sha1,
    Sha256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsymmetricPadding {
    None,
    Pkcs1v15,
    OaepSha1,
}

impl SecurityPolicy {
    pub fn from_uri(uri: &str) -> Result<Self> {
        match uri {
            "http://opcfoundation.org/UA/SecurityPolicy#None" | "" => Ok(SecurityPolicy::None),
            "http://opcfoundation.org/UA/SecurityPolicy#Basic128Rsa15" => {
                Ok(SecurityPolicy::Basic128Rsa15)
            }
            "http://opcfoundation.org/UA/SecurityPolicy#Basic256" => Ok(SecurityPolicy::Basic256),
            "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256" => {
                Ok(SecurityPolicy::Basic256Sha256)
            }
            other => Err(ServiceResultException::new(
                StatusCode::BadSecurityChecksFailed,
                format!("unsupported security policy URI {other:?}"),
            )),
        }
    }

    pub fn uri(self) -> &'static str {
        match self {
            SecurityPolicy::None => "http://opcfoundation.org/UA/SecurityPolicy#None",
            SecurityPolicy::Basic128Rsa15 => {
                "http://opcfoundation.org/UA/SecurityPolicy#Basic128Rsa15"
            }
            SecurityPolicy::Basic256 => "http://opcfoundation.org/UA/SecurityPolicy#Basic256",
            SecurityPolicy::Basic256Sha256 => {
                "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256"
            }
        }
    }

    pub fn symmetric_algorithm(self) -> SymmetricAlgorithm {
        match self {
            SecurityPolicy::None => SymmetricAlgorithm::None,
            SecurityPolicy::Basic128Rsa15 => SymmetricAlgorithm::Aes128Cbc,
            SecurityPolicy::Basic256 | SecurityPolicy::Basic256Sha256 => SymmetricAlgorithm::Aes256Cbc,
        }
    }

    /// Hash used for the symmetric-key-derivation PRF (P_SHA-1/P_SHA-256)
    /// and for message signing.
    pub fn digest_algorithm(self) -> DigestAlgorithm {
        match self {
            SecurityPolicy::None => DigestAlgorithm::None,
            SecurityPolicy::Basic128Rsa15 | SecurityPolicy::Basic256 => DigestAlgorithm::Sha1,
            SecurityPolicy::Basic256Sha256 => DigestAlgorithm::Sha256,
        }
    }

    pub fn asymmetric_padding(self) -> AsymmetricPadding {
        match self {
            SecurityPolicy::None => AsymmetricPadding::None,
            SecurityPolicy::Basic128Rsa15 => AsymmetricPadding::Pkcs1v15,
            SecurityPolicy::Basic256 | SecurityPolicy::Basic256Sha256 => AsymmetricPadding::OaepSha1,
        }
    }

    /// Nonce length in bytes: 0 for `None`, 16 for the SHA-1 policies, 32 for
    /// `Basic256Sha256`.
    pub fn nonce_length(self) -> usize {
        match self {
            SecurityPolicy::None => 0,
            SecurityPolicy::Basic128Rsa15 | SecurityPolicy::Basic256 => 16,
            SecurityPolicy::Basic256Sha256 => 32,
        }
    }

    pub fn symmetric_key_length(self) -> usize {
        match self.symmetric_algorithm() {
            SymmetricAlgorithm::None => 0,
            SymmetricAlgorithm::Aes128Cbc => 16,
            SymmetricAlgorithm::Aes256Cbc => 32,
        }
    }

    pub fn signature_key_length(self) -> usize {
        match self.digest_algorithm() {
            DigestAlgorithm::None => 0,
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Sha256 => 32,
        }
    }

    pub const fn block_size(self) -> usize {
        16
    }

    /// URI for the client/server application signature and the X.509
    /// identity-token signature, per spec.md §4.5: SHA-1 for
    /// `Basic128Rsa15`/`Basic256`, SHA-256 for `Basic256Sha256`, always
    /// RSA PKCS#1 v1.5 signing regardless of the policy's asymmetric
    /// encryption padding.
    pub fn signature_algorithm_uri(self) -> Option<&'static str> {
        match self {
            SecurityPolicy::None => None,
            SecurityPolicy::Basic128Rsa15 | SecurityPolicy::Basic256 => {
                Some("http://www.w3.org/2000/09/xmldsig#rsa-sha1")
            }
            SecurityPolicy::Basic256Sha256 => {
                Some("http://www.w3.org/2001/04/xmldsig-more#rsa-sha256")
            }
        }
    }

    /// `UserNameIdentityToken.EncryptionAlgorithm`, per spec.md §4.5.
    pub fn identity_token_encryption_algorithm(self) -> Option<&'static str> {
        match self {
            SecurityPolicy::None => None,
            SecurityPolicy::Basic128Rsa15 => Some("http://www.w3.org/2001/04/xmlenc#rsa-1_5"),
            SecurityPolicy::Basic256 | SecurityPolicy::Basic256Sha256 => {
                Some("http://www.w3.org/2001/04/xmlenc#rsa-oaep")
            }
        }
    }

    pub fn is_none(self) -> bool {
        matches!(self, SecurityPolicy::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_uri() {
        for policy in [
            SecurityPolicy::None,
            SecurityPolicy::Basic128Rsa15,
            SecurityPolicy::Basic256,
            SecurityPolicy::Basic256Sha256,
        ] {
            assert_eq!(SecurityPolicy::from_uri(policy.uri()).unwrap(), policy);
        }
    }

    #[test]
    fn basic256sha256_uses_sha256_and_32_byte_nonce() {
        let policy = SecurityPolicy::Basic256Sha256;
        assert_eq!(policy.digest_algorithm(), DigestAlgorithm::Sha256);
        assert_eq!(policy.nonce_length(), 32);
        assert_eq!(policy.symmetric_algorithm(), SymmetricAlgorithm::Aes256Cbc);
        assert_eq!(
            policy.identity_token_encryption_algorithm(),
            Some("http://www.w3.org/2001/04/xmlenc#rsa-oaep")
        );
    }

    #[test]
    fn basic128rsa15_uses_sha1_and_pkcs1v15() {
        let policy = SecurityPolicy::Basic128Rsa15;
        assert_eq!(policy.digest_algorithm(), DigestAlgorithm::Sha1);
        assert_eq!(policy.asymmetric_padding(), AsymmetricPadding::Pkcs1v15);
        assert_eq!(policy.nonce_length(), 16);
    }

    #[test]
    fn unknown_uri_is_rejected() {
        assert!(SecurityPolicy::from_uri("http://example.com/bogus").is_err());
    }
}
