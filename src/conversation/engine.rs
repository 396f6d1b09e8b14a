//! The `Conversation`: chunking, sequencing and cryptography for one secure
//! channel. Sits directly on top of whatever moves raw chunks (the transport
//! connection in production, a channel or fake in tests) — callers hand it
//! `send_fn`/`recv_fn` closures rather than a concrete transport:
//! `encrypt_message(..., send_fn, token)` / `decrypt_message(..., recv_fn,
//! token)`.
//!
//! The chunk-splitting and header layering follow an "encode then hand each
//! completed unit to a send callback" shape so callers never need to buffer
//! a whole message before it can start going out on the wire.

use std::future::Future;

use bytes::{Bytes, BytesMut};
use rand::RngCore;
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::crypto::{self, SecurityPolicy};
use crate::conversation::chunk::{
    AsymmetricSecurityHeader, SecureConversationHeader, SequenceHeader, SymmetricSecurityHeader,
};
use crate::conversation::token::TokenRing;
use crate::error::{Result, ServiceResultException, StatusCode};
use crate::transport::{ChunkKind, ChunkType, RawChunk};
use crate::types::{MessageSecurityMode, SecurityToken};

/// Sequence numbers wrap before reaching `u32::MAX`, per the OPC UA rule
/// that a wraparound resets to a small value rather than 0 or 1 landing on
/// a window the receiver has already seen.
const SEQUENCE_NUMBER_WRAP_THRESHOLD: u32 = u32::MAX - 1024;
const SEQUENCE_NUMBER_WRAP_RESET: u32 = 1;

const DEFAULT_MAX_CHUNK_SIZE: u32 = 64 * 1024;

/// Local identity plus the remote peer's certificate/public key, needed for
/// the asymmetric phase of the handshake. Supplied by the caller (session
/// layer, backed by the `CertificateStore` collaborator contract of §6) —
/// the conversation never parses X.509 itself.
#[derive(Clone)]
pub struct PeerCredentials {
    pub local_certificate: Vec<u8>,
    pub local_private_key: RsaPrivateKey,
    pub remote_certificate: Vec<u8>,
    pub remote_public_key: RsaPublicKey,
}

pub struct Conversation {
    policy: SecurityPolicy,
    security_mode: MessageSecurityMode,
    channel_id: u32,
    tokens: TokenRing,
    next_sequence_number: u32,
    max_chunk_size: u32,
    max_chunk_count: u32,
    credentials: Option<PeerCredentials>,
}

impl Conversation {
    pub fn new(policy: SecurityPolicy, security_mode: MessageSecurityMode, credentials: Option<PeerCredentials>) -> Self {
        Self {
            policy,
            security_mode,
            channel_id: 0,
            tokens: TokenRing::new(),
            next_sequence_number: 1,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            max_chunk_count: 0,
            credentials,
        }
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub fn set_channel_id(&mut self, channel_id: u32) {
        self.channel_id = channel_id;
    }

    pub fn configure_limits(&mut self, max_chunk_size: u32, max_chunk_count: u32) {
        if max_chunk_size > 0 {
            self.max_chunk_size = max_chunk_size;
        }
        self.max_chunk_count = max_chunk_count;
    }

    /// Cryptographically random bytes sized per the security policy's
    /// nonce length, used for both the secure-channel and `CreateSession`
    /// nonce exchanges.
    pub fn get_next_nonce(&self) -> Vec<u8> {
        let len = self.policy.nonce_length();
        let mut nonce = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut nonce);
        nonce
    }

    /// Adopts a freshly issued or renewed token and its derived keys,
    /// demoting the previous active token rather than discarding it
    /// outright, keeping at most two tokens live at once.
    pub fn install_token(&mut self, token: SecurityToken, local_nonce: &[u8], remote_nonce: &[u8]) -> Result<()> {
        if self.policy.is_none() {
            self.tokens.install(
                token,
                crypto::DerivedKeySet {
                    client: crypto::DirectionalKeys { signing_key: vec![], encryption_key: vec![], iv: vec![] },
                    server: crypto::DirectionalKeys { signing_key: vec![], encryption_key: vec![], iv: vec![] },
                },
            );
            return Ok(());
        }
        let keys = crypto::derive_keys(self.policy, local_nonce, remote_nonce)?;
        self.tokens.install(token, keys);
        Ok(())
    }

    pub fn is_due_for_renewal(&self) -> bool {
        self.tokens.is_due_for_renewal()
    }

    pub fn discard_previous_token(&mut self) {
        self.tokens.discard_previous();
    }

    fn allocate_sequence_number(&mut self) -> u32 {
        let current = self.next_sequence_number;
        self.next_sequence_number = if current >= SEQUENCE_NUMBER_WRAP_THRESHOLD {
            SEQUENCE_NUMBER_WRAP_RESET
        } else {
            current + 1
        };
        current
    }

    /// Chunks `body`, signs/encrypts each chunk per the active security
    /// mode, and hands the completed wire bytes to `send_fn` in order.
    pub async fn encrypt_message<F, Fut>(
        &mut self,
        body: &[u8],
        kind: ChunkKind,
        request_id: u32,
        mut send_fn: F,
    ) -> Result<()>
    where
        F: FnMut(RawChunk) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        match kind {
            ChunkKind::Open => self.encrypt_open_chunk(body, request_id, &mut send_fn).await,
            ChunkKind::Message | ChunkKind::Close => {
                self.encrypt_symmetric_chunks(body, kind, request_id, &mut send_fn).await
            }
        }
    }

    async fn encrypt_open_chunk<F, Fut>(&mut self, body: &[u8], request_id: u32, send_fn: &mut F) -> Result<()>
    where
        F: FnMut(RawChunk) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let credentials = if self.policy.is_none() {
            None
        } else {
            Some(self.credentials.as_ref().ok_or_else(|| {
                ServiceResultException::new(StatusCode::BadSecurityChecksFailed, "no peer credentials configured for OPN")
            })?)
        };

        let sequence_number = self.allocate_sequence_number();
        let sequence_header = SequenceHeader { sequence_number, request_id };

        let mut plaintext = BytesMut::new();
        sequence_header.encode(&mut plaintext);
        plaintext.extend_from_slice(body);

        let mut wire_body = BytesMut::new();
        let (sender_certificate, receiver_certificate_thumbprint) = if let Some(credentials) = credentials {
            let signature = crypto::asymmetric::sign(self.policy, &credentials.local_private_key, &plaintext)?;
            plaintext.extend_from_slice(&signature);
            let ciphertext = encrypt_in_rsa_blocks(self.policy, &credentials.remote_public_key, &plaintext)?;
            wire_body.extend_from_slice(&ciphertext);
            (credentials.local_certificate.clone(), sha1_thumbprint(&credentials.remote_certificate))
        } else {
            wire_body.extend_from_slice(&plaintext);
            (Vec::new(), Vec::new())
        };

        let mut frame = BytesMut::new();
        SecureConversationHeader { channel_id: self.channel_id }.encode(&mut frame);
        AsymmetricSecurityHeader {
            security_policy_uri: self.policy.uri().to_string(),
            sender_certificate,
            receiver_certificate_thumbprint,
        }
        .encode(&mut frame);
        frame.extend_from_slice(&wire_body);

        if self.max_chunk_size > 0 && frame.len() as u32 > self.max_chunk_size {
            return Err(ServiceResultException::new(
                StatusCode::BadResponseTooLarge,
                "OpenSecureChannel body exceeds negotiated max chunk size",
            ));
        }

        send_fn(RawChunk { kind: ChunkKind::Open, chunk_type: ChunkType::Final, body: frame.freeze() }).await
    }

    async fn encrypt_symmetric_chunks<F, Fut>(
        &mut self,
        body: &[u8],
        kind: ChunkKind,
        request_id: u32,
        send_fn: &mut F,
    ) -> Result<()>
    where
        F: FnMut(RawChunk) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let token = self
            .tokens
            .active()
            .ok_or_else(|| ServiceResultException::new(StatusCode::BadSecureChannelTokenUnknown, "no active security token"))?;
        let token_id = token.token.token_id;
        let signing_key = token.keys.client.signing_key.clone();
        let encryption_key = token.keys.client.encryption_key.clone();
        let iv = token.keys.client.iv.clone();

        let header_overhead = 4 /* SC header */ + 4 /* token id */ + 8 /* sequence header */;
        let signature_len = self.policy.signature_key_length();
        let block_size = self.policy.block_size().max(1);
        let budget = self.max_chunk_size.max(header_overhead + signature_len as u32 + block_size as u32);
        let available = (budget as usize)
            .saturating_sub(header_overhead as usize)
            .saturating_sub(signature_len)
            .saturating_sub(block_size);
        let available = available.max(1);

        let chunks: Vec<&[u8]> = if body.is_empty() {
            vec![&body[0..0]]
        } else {
            body.chunks(available).collect()
        };

        if self.max_chunk_count > 0 && chunks.len() as u32 > self.max_chunk_count {
            return Err(ServiceResultException::new(
                StatusCode::BadResponseTooLarge,
                format!("message requires {} chunks, exceeding max_chunk_count {}", chunks.len(), self.max_chunk_count),
            ));
        }

        let last = chunks.len() - 1;
        for (index, slice) in chunks.into_iter().enumerate() {
            let sequence_number = self.allocate_sequence_number();
            let sequence_header = SequenceHeader { sequence_number, request_id };

            let mut signed = BytesMut::new();
            sequence_header.encode(&mut signed);
            signed.extend_from_slice(slice);

            let mut wire_body = BytesMut::new();
            match self.security_mode {
                MessageSecurityMode::None => {
                    wire_body.extend_from_slice(&signed);
                }
                MessageSecurityMode::Sign => {
                    let signature = crypto::symmetric::sign(self.policy, &signing_key, &signed)?;
                    wire_body.extend_from_slice(&signed);
                    wire_body.extend_from_slice(&signature);
                }
                MessageSecurityMode::SignAndEncrypt => {
                    let signature = crypto::symmetric::sign(self.policy, &signing_key, &signed)?;
                    signed.extend_from_slice(&signature);
                    let ciphertext = crypto::symmetric::encrypt(self.policy, &encryption_key, &iv, &signed)?;
                    wire_body.extend_from_slice(&ciphertext);
                }
            }

            let mut frame = BytesMut::new();
            SecureConversationHeader { channel_id: self.channel_id }.encode(&mut frame);
            SymmetricSecurityHeader { token_id }.encode(&mut frame);
            frame.extend_from_slice(&wire_body);

            let chunk_type = if index == last { ChunkType::Final } else { ChunkType::Intermediate };
            send_fn(RawChunk { kind, chunk_type, body: frame.freeze() }).await?;
        }

        Ok(())
    }

    /// Pulls chunks via `recv_fn` until a final chunk is seen, verifying
    /// headers and sequencing, and returns the reassembled plaintext plus
    /// the channel/token id it arrived under. `(0, 0, …)` with an empty
    /// payload signals an orderly close.
    pub async fn decrypt_message<F, Fut>(&mut self, mut recv_fn: F) -> Result<(u32, u32, Vec<u8>)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<RawChunk>>,
    {
        let mut payload = Vec::new();
        let mut expected_request_id: Option<u32> = None;
        let mut last_sequence_number: Option<u32> = None;
        let mut channel_id = 0u32;
        let mut token_id = 0u32;

        loop {
            let raw = recv_fn().await?;
            if raw.chunk_type == ChunkType::Abort {
                return Ok((0, 0, Vec::new()));
            }

            let mut body = raw.body;
            let sc_header = SecureConversationHeader::decode(&mut body)?;
            channel_id = sc_header.channel_id;

            let (plaintext, seq_header) = match raw.kind {
                ChunkKind::Open => {
                    let _security_header = AsymmetricSecurityHeader::decode(&mut body)?;
                    let remaining: Bytes = body;
                    let mut plaintext = if self.policy.is_none() {
                        remaining.to_vec()
                    } else {
                        let credentials = self.credentials.as_ref().ok_or_else(|| {
                            ServiceResultException::new(StatusCode::BadSecurityChecksFailed, "no peer credentials configured for OPN")
                        })?;
                        decrypt_in_rsa_blocks(self.policy, &credentials.local_private_key, &remaining)?
                    };
                    if !self.policy.is_none() {
                        let credentials = self.credentials.as_ref().ok_or_else(|| {
                            ServiceResultException::new(StatusCode::BadSecurityChecksFailed, "no peer credentials configured for OPN")
                        })?;
                        // The asymmetric signature is a full RSA signature sized to the
                        // signer's modulus, not the policy's HMAC digest length — split on
                        // the remote key's modulus size, the same size `sign` produces.
                        use rsa::traits::PublicKeyParts;
                        let signature_len = credentials.remote_public_key.size();
                        if plaintext.len() < signature_len {
                            return Err(ServiceResultException::new(StatusCode::BadSecurityChecksFailed, "OPN plaintext shorter than signature"));
                        }
                        let split = plaintext.len() - signature_len;
                        let signature = plaintext.split_off(split);
                        crypto::asymmetric::verify(self.policy, &credentials.remote_public_key, &plaintext, &signature)?;
                    }
                    let mut view = Bytes::from(plaintext);
                    let seq_header = SequenceHeader::decode(&mut view)?;
                    (view.to_vec(), seq_header)
                }
                ChunkKind::Message | ChunkKind::Close => {
                    let security_header = SymmetricSecurityHeader::decode(&mut body)?;
                    token_id = security_header.token_id;
                    let installed = self.tokens.find(token_id).ok_or_else(|| {
                        ServiceResultException::new(StatusCode::BadSecureChannelTokenUnknown, format!("unknown token id {token_id}"))
                    })?;
                    let signature_len = self.policy.signature_key_length();
                    let signing_key = installed.keys.server.signing_key.clone();
                    let encryption_key = installed.keys.server.encryption_key.clone();
                    let iv = installed.keys.server.iv.clone();
                    let remaining: Bytes = body;

                    let mut signed = match self.security_mode {
                        MessageSecurityMode::None | MessageSecurityMode::Sign => remaining.to_vec(),
                        MessageSecurityMode::SignAndEncrypt => {
                            crypto::symmetric::decrypt(self.policy, &encryption_key, &iv, &remaining)?
                        }
                    };

                    if self.security_mode != MessageSecurityMode::None {
                        if signed.len() < signature_len {
                            return Err(ServiceResultException::new(StatusCode::BadSecurityChecksFailed, "chunk shorter than signature"));
                        }
                        let split = signed.len() - signature_len;
                        let signature = signed.split_off(split);
                        crypto::symmetric::verify(self.policy, &signing_key, &signed, &signature)?;
                    }

                    let mut view = Bytes::from(signed);
                    let seq_header = SequenceHeader::decode(&mut view)?;
                    (view.to_vec(), seq_header)
                }
            };

            if let Some(expected) = expected_request_id {
                if expected != seq_header.request_id {
                    return Err(ServiceResultException::new(
                        StatusCode::BadSecurityChecksFailed,
                        "request id changed mid-message across chunks",
                    ));
                }
            } else {
                expected_request_id = Some(seq_header.request_id);
            }

            if let Some(last) = last_sequence_number {
                if seq_header.sequence_number <= last {
                    return Err(ServiceResultException::new(
                        StatusCode::BadSecurityChecksFailed,
                        "sequence number did not strictly increase",
                    ));
                }
            }
            last_sequence_number = Some(seq_header.sequence_number);

            payload.extend_from_slice(&plaintext);

            if raw.chunk_type == ChunkType::Final {
                break;
            }
        }

        Ok((channel_id, token_id, payload))
    }
}

fn sha1_thumbprint(certificate: &[u8]) -> Vec<u8> {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(certificate);
    hasher.finalize().to_vec()
}

/// RSA has no native notion of multi-block messages; OPC UA's asymmetric
/// chunk body is the concatenation of independently encrypted fixed-size
/// blocks. `plain_block_len` is conservative (leaves room for the padding
/// scheme's overhead) rather than exact to the byte, since the `rsa` crate
/// computes the precise bound internally and returns an error if exceeded.
fn plain_block_len(policy: SecurityPolicy, public_key: &RsaPublicKey) -> usize {
    use rsa::traits::PublicKeyParts;
    let modulus_bytes = public_key.size();
    let overhead = match policy.asymmetric_padding() {
        crate::crypto::AsymmetricPadding::OaepSha1 => 2 * 20 + 2,
        crate::crypto::AsymmetricPadding::Pkcs1v15 => 11,
        crate::crypto::AsymmetricPadding::None => 0,
    };
    modulus_bytes.saturating_sub(overhead).max(1)
}

fn encrypt_in_rsa_blocks(policy: SecurityPolicy, public_key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let block_len = plain_block_len(policy, public_key);
    let mut out = Vec::new();
    if plaintext.is_empty() {
        return Ok(out);
    }
    for chunk in plaintext.chunks(block_len) {
        out.extend(crypto::asymmetric::encrypt(policy, public_key, chunk)?);
    }
    Ok(out)
}

fn decrypt_in_rsa_blocks(policy: SecurityPolicy, private_key: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    use rsa::traits::PublicKeyParts;
    let block_len = private_key.size();
    if ciphertext.len() % block_len != 0 {
        return Err(ServiceResultException::new(
            StatusCode::BadSecurityChecksFailed,
            "OPN ciphertext is not a multiple of the RSA block size",
        ));
    }
    let mut out = Vec::new();
    for chunk in ciphertext.chunks(block_len) {
        out.extend(crypto::asymmetric::decrypt(policy, private_key, chunk)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecurityPolicy;
    use rsa::RsaPrivateKey;
    use std::sync::{Arc, Mutex};
    use std::time::Duration as StdDuration;

    fn credentials() -> PeerCredentials {
        let local_private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let local_public = RsaPublicKey::from(&local_private_key);
        PeerCredentials {
            local_certificate: vec![1, 2, 3],
            local_private_key,
            remote_certificate: vec![4, 5, 6],
            remote_public_key: local_public,
        }
    }

    #[tokio::test]
    async fn open_chunk_round_trips_through_same_keypair() {
        let policy = SecurityPolicy::Basic256Sha256;
        let creds = credentials();

        let mut sender = Conversation::new(policy, MessageSecurityMode::SignAndEncrypt, Some(creds));
        sender.set_channel_id(7);

        let sent: Arc<Mutex<Vec<RawChunk>>> = Arc::new(Mutex::new(Vec::new()));
        let sent_clone = sent.clone();
        sender
            .encrypt_message(b"OpenSecureChannelRequest body", ChunkKind::Open, 1, |chunk| {
                let sent = sent_clone.clone();
                async move {
                    sent.lock().unwrap().push(chunk);
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    /// Regression test for the asymmetric OPN verify path: the signature
    /// trailer is sized to the signer's RSA modulus, not the policy's HMAC
    /// digest length, so this needs two distinct keypairs (matching the real
    /// client/server pairing) to catch a split computed at the wrong offset.
    #[tokio::test]
    async fn open_chunk_round_trips_and_verifies_across_distinct_keypairs() {
        let policy = SecurityPolicy::Basic256Sha256;
        let alice_private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let alice_public = RsaPublicKey::from(&alice_private);
        let bob_private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let bob_public = RsaPublicKey::from(&bob_private);

        let sender_creds = PeerCredentials {
            local_certificate: vec![1, 1, 1],
            local_private_key: alice_private,
            remote_certificate: vec![2, 2, 2],
            remote_public_key: bob_public,
        };
        let receiver_creds = PeerCredentials {
            local_certificate: vec![2, 2, 2],
            local_private_key: bob_private,
            remote_certificate: vec![1, 1, 1],
            remote_public_key: alice_public,
        };

        let mut sender = Conversation::new(policy, MessageSecurityMode::SignAndEncrypt, Some(sender_creds));
        sender.set_channel_id(9);

        let body = b"OpenSecureChannelRequest body from alice to bob";
        let sent: Arc<Mutex<Vec<RawChunk>>> = Arc::new(Mutex::new(Vec::new()));
        let sent_clone = sent.clone();
        sender
            .encrypt_message(body, ChunkKind::Open, 1, |chunk| {
                let sent = sent_clone.clone();
                async move {
                    sent.lock().unwrap().push(chunk);
                    Ok(())
                }
            })
            .await
            .unwrap();

        let mut receiver = Conversation::new(policy, MessageSecurityMode::SignAndEncrypt, Some(receiver_creds));
        receiver.set_channel_id(9);

        let queued = sent.lock().unwrap().clone();
        let mut iter = queued.into_iter();
        let (_channel_id, _token_id, payload) = receiver
            .decrypt_message(move || {
                let next = iter.next();
                async move {
                    next.ok_or_else(|| ServiceResultException::new(StatusCode::BadSecureChannelClosed, "no more chunks"))
                }
            })
            .await
            .unwrap();

        assert_eq!(payload, body);
    }

    #[tokio::test]
    async fn symmetric_message_round_trips() {
        let policy = SecurityPolicy::Basic256Sha256;
        let mut conversation = Conversation::new(policy, MessageSecurityMode::SignAndEncrypt, None);
        conversation.set_channel_id(42);
        let token = SecurityToken::new(42, 1, StdDuration::from_secs(3600));
        conversation.install_token(token, &[1u8; 32], &[2u8; 32]).unwrap();

        let body = b"ReadRequest body goes here, long enough to need padding";
        let sent: Arc<Mutex<Vec<RawChunk>>> = Arc::new(Mutex::new(Vec::new()));
        let sent_clone = sent.clone();
        conversation
            .encrypt_message(body, ChunkKind::Message, 5, |chunk| {
                let sent = sent_clone.clone();
                async move {
                    sent.lock().unwrap().push(chunk);
                    Ok(())
                }
            })
            .await
            .unwrap();

        let mut receiver = Conversation::new(policy, MessageSecurityMode::SignAndEncrypt, None);
        receiver.set_channel_id(42);
        let token = SecurityToken::new(42, 1, StdDuration::from_secs(3600));
        receiver.install_token(token, &[2u8; 32], &[1u8; 32]).unwrap();

        let queued = sent.lock().unwrap().clone();
        let mut iter = queued.into_iter();
        let (channel_id, token_id, payload) = receiver
            .decrypt_message(move || {
                let next = iter.next();
                async move {
                    next.ok_or_else(|| {
                        ServiceResultException::new(StatusCode::BadSecureChannelClosed, "no more chunks")
                    })
                }
            })
            .await
            .unwrap();

        assert_eq!(channel_id, 42);
        assert_eq!(token_id, 1);
        assert_eq!(payload, body);
    }

    #[test]
    fn sequence_number_wraps_before_u32_max() {
        let mut conversation = Conversation::new(SecurityPolicy::None, MessageSecurityMode::None, None);
        conversation.next_sequence_number = SEQUENCE_NUMBER_WRAP_THRESHOLD;
        let first = conversation.allocate_sequence_number();
        let second = conversation.allocate_sequence_number();
        assert_eq!(first, SEQUENCE_NUMBER_WRAP_THRESHOLD);
        assert_eq!(second, SEQUENCE_NUMBER_WRAP_RESET);
    }
}
