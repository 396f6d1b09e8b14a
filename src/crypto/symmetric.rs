//! Symmetric signing/encryption for `MSG`/`CLO` chunks under an active
//! security token: HMAC-SHA1/SHA256 signatures, AES-128/256
//! in CBC mode.
//!
//! No teacher analogue (ALPINE uses ChaCha20-Poly1305 AEAD, not a
//! sign-then-encrypt CBC construction); built from spec.md §4.2 directly,
//! using the `aes`/`cbc`/`hmac` crates named in `other_examples`'s
//! async-opcua manifest.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;

use crate::crypto::policy::{DigestAlgorithm, SecurityPolicy, SymmetricAlgorithm};
use crate::error::{Result, ServiceResultException, StatusCode};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// HMAC-signs `data` with `key`, returning a signature sized per the
/// policy's digest.
pub fn sign(policy: SecurityPolicy, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    match policy.digest_algorithm() {
        DigestAlgorithm::None => Ok(Vec::new()),
        DigestAlgorithm::Sha1 => Ok(hmac_sign::<Hmac<Sha1>>(key, data)),
        DigestAlgorithm::Sha256 => Ok(hmac_sign::<Hmac<Sha256>>(key, data)),
    }
}

pub fn verify(policy: SecurityPolicy, key: &[u8], data: &[u8], signature: &[u8]) -> Result<()> {
    let expected = sign(policy, key, data)?;
    if expected.is_empty() {
        return Ok(());
    }
    // Constant-time comparison, matching the symmetric-signature check the
    // conversation layer relies on to reject tampered chunks.
    let matches = expected.len() == signature.len()
        && expected
            .iter()
            .zip(signature.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0;
    if matches {
        Ok(())
    } else {
        Err(ServiceResultException::new(
            StatusCode::BadSecurityChecksFailed,
            "symmetric signature verification failed",
        ))
    }
}

fn hmac_sign<M: Mac + hmac::digest::KeyInit>(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = <M as hmac::digest::KeyInit>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Encrypts `plaintext` under AES-CBC with PKCS#7 padding, per the policy's
/// symmetric algorithm. `plaintext` is consumed and the padded ciphertext
/// returned.
pub fn encrypt(policy: SecurityPolicy, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    match policy.symmetric_algorithm() {
        SymmetricAlgorithm::None => Ok(plaintext.to_vec()),
        SymmetricAlgorithm::Aes128Cbc => {
            let cipher = Aes128CbcEnc::new_from_slices(key, iv)
                .map_err(|e| cipher_key_error("AES-128-CBC", e))?;
            Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
        }
        SymmetricAlgorithm::Aes256Cbc => {
            let cipher = Aes256CbcEnc::new_from_slices(key, iv)
                .map_err(|e| cipher_key_error("AES-256-CBC", e))?;
            Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
        }
    }
}

pub fn decrypt(policy: SecurityPolicy, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    match policy.symmetric_algorithm() {
        SymmetricAlgorithm::None => Ok(ciphertext.to_vec()),
        SymmetricAlgorithm::Aes128Cbc => {
            let cipher = Aes128CbcDec::new_from_slices(key, iv)
                .map_err(|e| cipher_key_error("AES-128-CBC", e))?;
            cipher
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|e| {
                    ServiceResultException::new(
                        StatusCode::BadSecurityChecksFailed,
                        format!("AES-128-CBC unpadding failed: {e}"),
                    )
                })
        }
        SymmetricAlgorithm::Aes256Cbc => {
            let cipher = Aes256CbcDec::new_from_slices(key, iv)
                .map_err(|e| cipher_key_error("AES-256-CBC", e))?;
            cipher
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|e| {
                    ServiceResultException::new(
                        StatusCode::BadSecurityChecksFailed,
                        format!("AES-256-CBC unpadding failed: {e}"),
                    )
                })
        }
    }
}

fn cipher_key_error(which: &str, error: impl std::fmt::Display) -> ServiceResultException {
    ServiceResultException::new(
        StatusCode::BadSecurityChecksFailed,
        format!("{which} key/IV rejected: {error}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes256_cbc_round_trips() {
        let key = vec![7u8; 32];
        let iv = vec![9u8; 16];
        let plaintext = b"a chunk body that is not block aligned";
        let ciphertext = encrypt(SecurityPolicy::Basic256Sha256, &key, &iv, plaintext).unwrap();
        assert_eq!(ciphertext.len() % 16, 0);
        let decoded = decrypt(SecurityPolicy::Basic256Sha256, &key, &iv, &ciphertext).unwrap();
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn aes128_cbc_round_trips_at_block_boundary() {
        let key = vec![1u8; 16];
        let iv = vec![2u8; 16];
        let plaintext = vec![0xABu8; 32];
        let ciphertext = encrypt(SecurityPolicy::Basic128Rsa15, &key, &iv, &plaintext).unwrap();
        let decoded = decrypt(SecurityPolicy::Basic128Rsa15, &key, &iv, &ciphertext).unwrap();
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn hmac_sha256_signature_verifies() {
        let key = vec![5u8; 32];
        let data = b"sequence header || encrypted body";
        let signature = sign(SecurityPolicy::Basic256Sha256, &key, data).unwrap();
        assert_eq!(signature.len(), 32);
        verify(SecurityPolicy::Basic256Sha256, &key, data, &signature).unwrap();
    }

    #[test]
    fn tampered_body_fails_signature_check() {
        let key = vec![5u8; 20];
        let signature = sign(SecurityPolicy::Basic256, &key, b"original").unwrap();
        assert!(verify(SecurityPolicy::Basic256, &key, b"tampered!", &signature).is_err());
    }
}
