//! Asymmetric crypto for the `OPN` handshake (spec.md §4.2/§4.5): RSA
//! encrypt/decrypt for the Open handshake body and for identity-token
//! password encryption, RSA sign/verify for application and client/server
//! signatures.
//!
//! Grounded on the `rsa`/`sha1`/`sha2` dependency set pulled from
//! `other_examples`'s async-opcua workspace manifest — the teacher has no
//! RSA usage at all (it's Ed25519/X25519 throughout), so this module is
//! built directly against the `rsa` crate's documented API rather than
//! adapted from teacher code.

use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{Oaep, Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::Sha256;

use crate::crypto::policy::{AsymmetricPadding, DigestAlgorithm, SecurityPolicy};
use crate::error::{Result, ServiceResultException, StatusCode};

fn map_rsa_err(context: &str) -> impl FnOnce(rsa::Error) -> ServiceResultException + '_ {
    move |e| {
        ServiceResultException::new(
            StatusCode::BadSecurityChecksFailed,
            format!("{context}: {e}"),
        )
    }
}

/// Encrypts `plaintext` with `public_key` per the policy's asymmetric
/// padding. Used for the `OPN` asymmetric body and for identity-token
/// password encryption.
pub fn encrypt(policy: SecurityPolicy, public_key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut rng = rand::thread_rng();
    match policy.asymmetric_padding() {
        AsymmetricPadding::None => Err(ServiceResultException::new(
            StatusCode::BadSecurityChecksFailed,
            "asymmetric encryption requested under the None security policy",
        )),
        AsymmetricPadding::Pkcs1v15 => public_key
            .encrypt(&mut rng, Pkcs1v15Encrypt, plaintext)
            .map_err(map_rsa_err("PKCS#1 v1.5 encryption failed")),
        AsymmetricPadding::OaepSha1 => public_key
            .encrypt(&mut rng, Oaep::new::<Sha1>(), plaintext)
            .map_err(map_rsa_err("RSA-OAEP encryption failed")),
    }
}

pub fn decrypt(policy: SecurityPolicy, private_key: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    match policy.asymmetric_padding() {
        AsymmetricPadding::None => Err(ServiceResultException::new(
            StatusCode::BadSecurityChecksFailed,
            "asymmetric decryption requested under the None security policy",
        )),
        AsymmetricPadding::Pkcs1v15 => private_key
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(map_rsa_err("PKCS#1 v1.5 decryption failed")),
        AsymmetricPadding::OaepSha1 => private_key
            .decrypt(Oaep::new::<Sha1>(), ciphertext)
            .map_err(map_rsa_err("RSA-OAEP decryption failed")),
    }
}

/// Signs `data` with `private_key` using the policy's digest, per spec.md
/// §4.5 (application signature, client signature, X.509 identity
/// signature — all share this construction).
pub fn sign(policy: SecurityPolicy, private_key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>> {
    let mut rng = rand::thread_rng();
    match policy.digest_algorithm() {
        DigestAlgorithm::None => Err(ServiceResultException::new(
            StatusCode::BadSecurityChecksFailed,
            "signing requested under the None security policy",
        )),
        DigestAlgorithm::Sha1 => {
            let key = SigningKey::<Sha1>::new(private_key.clone());
            Ok(key.sign_with_rng(&mut rng, data).to_vec())
        }
        DigestAlgorithm::Sha256 => {
            let key = SigningKey::<Sha256>::new(private_key.clone());
            Ok(key.sign_with_rng(&mut rng, data).to_vec())
        }
    }
}

/// Verifies a signature produced by [`sign`], returning
/// `BadApplicationSignatureInvalid` on mismatch per spec.md §4.5.
pub fn verify(
    policy: SecurityPolicy,
    public_key: &RsaPublicKey,
    data: &[u8],
    signature: &[u8],
) -> Result<()> {
    let invalid = |e: rsa::signature::Error| {
        ServiceResultException::new(
            StatusCode::BadApplicationSignatureInvalid,
            format!("signature verification failed: {e}"),
        )
    };
    match policy.digest_algorithm() {
        DigestAlgorithm::None => Err(ServiceResultException::new(
            StatusCode::BadSecurityChecksFailed,
            "verification requested under the None security policy",
        )),
        DigestAlgorithm::Sha1 => {
            let key = VerifyingKey::<Sha1>::new(public_key.clone());
            let sig = Signature::try_from(signature).map_err(invalid)?;
            key.verify(data, &sig).map_err(invalid)
        }
        DigestAlgorithm::Sha256 => {
            let key = VerifyingKey::<Sha256>::new(public_key.clone());
            let sig = Signature::try_from(signature).map_err(invalid)?;
            key.verify(data, &sig).map_err(invalid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPrivateKey;

    fn key_pair() -> (RsaPrivateKey, RsaPublicKey) {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let public = RsaPublicKey::from(&private);
        (private, public)
    }

    #[test]
    fn oaep_round_trips() {
        let (private, public) = key_pair();
        let plaintext = b"p@ss-and-a-nonce";
        let ciphertext = encrypt(SecurityPolicy::Basic256Sha256, &public, plaintext).unwrap();
        let decoded = decrypt(SecurityPolicy::Basic256Sha256, &private, &ciphertext).unwrap();
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn pkcs1v15_round_trips() {
        let (private, public) = key_pair();
        let plaintext = b"another secret";
        let ciphertext = encrypt(SecurityPolicy::Basic128Rsa15, &public, plaintext).unwrap();
        let decoded = decrypt(SecurityPolicy::Basic128Rsa15, &private, &ciphertext).unwrap();
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn sign_then_verify_succeeds() {
        let (private, public) = key_pair();
        let data = b"server_certificate || remote_nonce";
        let signature = sign(SecurityPolicy::Basic256Sha256, &private, data).unwrap();
        verify(SecurityPolicy::Basic256Sha256, &public, data, &signature).unwrap();
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let (private, public) = key_pair();
        let data = b"some signed bytes";
        let mut signature = sign(SecurityPolicy::Basic128Rsa15, &private, data).unwrap();
        signature[0] ^= 0xFF;
        assert!(verify(SecurityPolicy::Basic128Rsa15, &public, data, &signature).is_err());
    }
}
