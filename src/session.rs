//! Client session lifecycle: `CreateSession`, server
//! certificate/signature verification, identity-token shaping per security
//! policy, `ActivateSession`, the `Server_NamespaceArray`/`Server_ServerArray`
//! reads that populate the encoding context, and `CloseSession`.
//!
//! Sits directly on [`ClientSecureChannel::request`]; it never touches the
//! transport or conversation itself, driving its handshake entirely through
//! the secure channel's request/response surface rather than a raw socket.
//! The RSA primitives it drives (encrypt/sign/verify) are
//! `crate::crypto::asymmetric`'s.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rsa::RsaPrivateKey;

use crate::conversation::engine::PeerCredentials;
use crate::crypto::asymmetric;
use crate::crypto::policy::SecurityPolicy;
use crate::dispatcher::channel::ClientSecureChannel;
use crate::error::{Result, ServiceResultException, StatusCode};
use crate::services::{
    ActivateSessionRequest, ActivateSessionResponse, CloseSessionRequest, CreateSessionRequest,
    CreateSessionResponse, ReadRequest, ReadResponse, ReadValueId, SignatureData,
    ATTRIBUTE_ID_VALUE, SERVER_NAMESPACE_ARRAY, SERVER_SERVER_ARRAY,
};
use crate::transport::codec::{write_byte_string, write_string};
use crate::types::{ApplicationDescription, EndpointDescription, NodeId, RequestHeader, UserTokenType};
use crate::config::ClientConfig;

/// `UserIdentityToken` sum type. The variant picks which of the
/// endpoint's advertised `UserTokenPolicy` entries activation binds to.
pub enum UserIdentity {
    Anonymous,
    UserName { name: String, password: String },
    X509 { certificate: Vec<u8>, private_key: RsaPrivateKey },
    Issued { token_data: Vec<u8> },
}

impl UserIdentity {
    fn token_type(&self) -> UserTokenType {
        match self {
            UserIdentity::Anonymous => UserTokenType::Anonymous,
            UserIdentity::UserName { .. } => UserTokenType::UserName,
            UserIdentity::X509 { .. } => UserTokenType::Certificate,
            UserIdentity::Issued { .. } => UserTokenType::Issued,
        }
    }
}

/// `ExtensionObject` binary type ids for the four identity token structs
/// (standard numeric NodeIds, ns=0), matching the real
/// `*IdentityToken_Encoding_DefaultBinary` values.
const ANONYMOUS_IDENTITY_TOKEN_ID: u32 = 319;
const USERNAME_IDENTITY_TOKEN_ID: u32 = 322;
const X509_IDENTITY_TOKEN_ID: u32 = 325;
const ISSUED_IDENTITY_TOKEN_ID: u32 = 938;

/// An authenticated logical context above one secure channel.
pub struct ClientSession {
    pub session_id: NodeId,
    pub authentication_token: NodeId,
    pub session_timeout: Duration,
    pub remote_nonce: Vec<u8>,
    /// `NamespaceUris`; index 0 is always `http://opcfoundation.org/UA/`
    /// (preserved here whether or not the server's own array happened to
    /// repeat it).
    pub namespace_uris: Vec<String>,
    pub server_uris: Vec<String>,
    channel: Arc<ClientSecureChannel>,
}

impl ClientSession {
    /// Runs `CreateSession` then `ActivateSession` over an already-opened
    /// channel, then reads the two `Server_*` arrays to populate the
    /// encoding context.
    ///
    /// `local_credentials` is `None` only under `SecurityPolicy::None`;
    /// every other policy requires it for the client signature and (for
    /// `UserName`/`Issued` identities) password/token encryption.
    pub async fn create_and_activate(
        channel: Arc<ClientSecureChannel>,
        app: &ApplicationDescription,
        endpoint: &EndpointDescription,
        policy: SecurityPolicy,
        local_credentials: Option<&PeerCredentials>,
        identity: &UserIdentity,
        config: &ClientConfig,
    ) -> Result<Self> {
        if !policy.is_none() && local_credentials.is_none() {
            return Err(ServiceResultException::new(
                StatusCode::BadSecurityChecksFailed,
                "a secured policy requires local certificate/key material to create a session",
            ));
        }

        let local_nonce = channel.next_nonce().await;

        let handle = channel.next_handle();
        let mut request = CreateSessionRequest {
            request_header: RequestHeader::new(NodeId::Null, handle, config.timeout_hint),
            client_application_uri: app.application_uri.clone(),
            server_uri: String::new(),
            endpoint_url: endpoint.endpoint_url.clone(),
            session_name: format!("{}-session", app.application_name),
            client_nonce: local_nonce.clone(),
            client_certificate: local_credentials
                .map(|c| c.local_certificate.clone())
                .unwrap_or_default(),
            requested_session_timeout_ms: config.session_timeout.as_secs_f64() * 1000.0,
        };
        // `requested_session_timeout_ms` above already carries whole
        // milliseconds; recomputed via as_millis to avoid float drift.
        request.requested_session_timeout_ms = config.session_timeout.as_millis() as f64;

        let mut body = BytesMut::new();
        request.encode(&mut body);
        let raw = channel.request(&body, handle, config.timeout_hint).await?;
        let response = CreateSessionResponse::decode(Bytes::from(raw))?;
        if response.response_header.service_result.is_bad() {
            return Err(ServiceResultException::new(
                response.response_header.service_result,
                "server rejected CreateSession",
            ));
        }

        verify_server_identity(endpoint, policy, local_credentials, &local_nonce, &response)?;

        let mut session = Self {
            session_id: response.session_id,
            authentication_token: response.authentication_token,
            session_timeout: Duration::from_millis(response.revised_session_timeout_ms.max(0.0) as u64),
            remote_nonce: response.server_nonce.clone(),
            namespace_uris: vec!["http://opcfoundation.org/UA/".to_string()],
            server_uris: Vec::new(),
            channel,
        };

        session
            .activate(
                endpoint,
                policy,
                local_credentials,
                identity,
                &response.server_certificate,
                config,
            )
            .await?;
        session.read_namespace_tables(config).await?;
        Ok(session)
    }

    async fn activate(
        &mut self,
        endpoint: &EndpointDescription,
        policy: SecurityPolicy,
        local_credentials: Option<&PeerCredentials>,
        identity: &UserIdentity,
        server_certificate: &[u8],
        config: &ClientConfig,
    ) -> Result<()> {
        let handle = self.channel.next_handle();

        let client_signature = if let Some(algorithm) = policy.signature_algorithm_uri() {
            let creds = local_credentials.expect("checked by create_and_activate");
            let mut signed = server_certificate.to_vec();
            signed.extend_from_slice(&self.remote_nonce);
            let signature = asymmetric::sign(policy, &creds.local_private_key, &signed)?;
            SignatureData { algorithm: Some(algorithm.to_string()), signature }
        } else {
            SignatureData { algorithm: None, signature: Vec::new() }
        };

        let (token_type_id, token_body, user_token_signature) = build_identity_token(
            endpoint,
            policy,
            local_credentials,
            identity,
            server_certificate,
            &self.remote_nonce,
        )?;

        let request = ActivateSessionRequest {
            request_header: RequestHeader::new(self.authentication_token.clone(), handle, config.timeout_hint),
            client_signature,
            user_identity_token_type_id: token_type_id,
            user_identity_token: token_body,
            user_token_signature,
        };
        let mut body = BytesMut::new();
        request.encode(&mut body);
        let raw = self.channel.request(&body, handle, config.timeout_hint).await?;
        let response = ActivateSessionResponse::decode(Bytes::from(raw))?;
        if response.response_header.service_result.is_bad() {
            return Err(ServiceResultException::new(
                response.response_header.service_result,
                "server rejected ActivateSession",
            ));
        }

        self.remote_nonce = response.server_nonce;
        Ok(())
    }

    /// `Read` of `Server_NamespaceArray` and `Server_ServerArray` to
    /// populate the encoding context.
    async fn read_namespace_tables(&mut self, config: &ClientConfig) -> Result<()> {
        let handle = self.channel.next_handle();
        let request = ReadRequest {
            request_header: RequestHeader::new(self.authentication_token.clone(), handle, config.timeout_hint),
            nodes_to_read: vec![
                ReadValueId { node_id: SERVER_NAMESPACE_ARRAY, attribute_id: ATTRIBUTE_ID_VALUE },
                ReadValueId { node_id: SERVER_SERVER_ARRAY, attribute_id: ATTRIBUTE_ID_VALUE },
            ],
        };
        let mut body = BytesMut::new();
        request.encode(&mut body);
        let raw = self.channel.request(&body, handle, config.timeout_hint).await?;
        let response = ReadResponse::decode(Bytes::from(raw))?;

        if let Some(values) = response.results.first().and_then(|v| v.string_array.as_ref()) {
            self.namespace_uris = values.clone();
        }
        if let Some(values) = response.results.get(1).and_then(|v| v.string_array.as_ref()) {
            self.server_uris = values.clone();
        }
        Ok(())
    }

    /// `CloseSession{DeleteSubscriptions=true}` then chain to the channel's
    /// own close.
    pub async fn close(&self, config: &ClientConfig) {
        let handle = self.channel.next_handle();
        let request = CloseSessionRequest {
            request_header: RequestHeader::new(self.authentication_token.clone(), handle, config.timeout_hint),
            delete_subscriptions: true,
        };
        let mut body = BytesMut::new();
        request.encode(&mut body);
        let _ = self.channel.request(&body, handle, config.timeout_hint).await;
        self.channel.close().await;
    }

    pub fn channel(&self) -> &Arc<ClientSecureChannel> {
        &self.channel
    }
}

fn no_signature() -> SignatureData {
    SignatureData { algorithm: None, signature: Vec::new() }
}

/// Shapes the `UserIdentityToken` using rules keyed by identity kind and
/// security policy, returning the `ExtensionObject` type id, the encoded
/// token body, and (for `X509`) the signature over
/// `server_certificate || remote_nonce`.
fn build_identity_token(
    endpoint: &EndpointDescription,
    channel_policy: SecurityPolicy,
    local_credentials: Option<&PeerCredentials>,
    identity: &UserIdentity,
    server_certificate: &[u8],
    remote_nonce: &[u8],
) -> Result<(u32, Vec<u8>, SignatureData)> {
    let token_policy = endpoint
        .user_identity_tokens
        .iter()
        .find(|p| p.token_type == identity.token_type())
        .ok_or_else(|| {
            ServiceResultException::new(
                StatusCode::BadIdentityTokenRejected,
                format!("endpoint advertises no {:?} user token policy", identity.token_type()),
            )
        })?;

    // A user-token policy may name its own security policy URI, overriding
    // the channel's for password/token encryption only.
    let token_policy_sec = match token_policy.security_policy_uri.as_deref() {
        Some(uri) if !uri.is_empty() => SecurityPolicy::from_uri(uri)?,
        _ => channel_policy,
    };

    let mut body = BytesMut::new();
    match identity {
        UserIdentity::Anonymous => {
            write_string(&mut body, &token_policy.policy_id);
            Ok((ANONYMOUS_IDENTITY_TOKEN_ID, body.to_vec(), no_signature()))
        }
        UserIdentity::UserName { name, password } => {
            write_string(&mut body, &token_policy.policy_id);
            write_string(&mut body, name);
            let (ciphertext, algorithm) =
                encrypt_identity_secret(token_policy_sec, local_credentials, password.as_bytes(), remote_nonce)?;
            write_byte_string(&mut body, &ciphertext);
            write_string(&mut body, algorithm.unwrap_or(""));
            Ok((USERNAME_IDENTITY_TOKEN_ID, body.to_vec(), no_signature()))
        }
        UserIdentity::Issued { token_data } => {
            write_string(&mut body, &token_policy.policy_id);
            let (ciphertext, algorithm) =
                encrypt_identity_secret(token_policy_sec, local_credentials, token_data, remote_nonce)?;
            write_byte_string(&mut body, &ciphertext);
            write_string(&mut body, algorithm.unwrap_or(""));
            Ok((ISSUED_IDENTITY_TOKEN_ID, body.to_vec(), no_signature()))
        }
        UserIdentity::X509 { certificate, private_key } => {
            write_string(&mut body, &token_policy.policy_id);
            write_byte_string(&mut body, certificate);
            let mut signed = server_certificate.to_vec();
            signed.extend_from_slice(remote_nonce);
            let signature = asymmetric::sign(token_policy_sec, private_key, &signed)?;
            let algorithm = token_policy_sec.signature_algorithm_uri().map(|a| a.to_string());
            Ok((X509_IDENTITY_TOKEN_ID, body.to_vec(), SignatureData { algorithm, signature }))
        }
    }
}

/// Verifies `CreateSessionResponse.server_certificate` matches the endpoint
/// and that `server_signature` covers `local_certificate || local_nonce`
///.
fn verify_server_identity(
    endpoint: &EndpointDescription,
    policy: SecurityPolicy,
    local_credentials: Option<&PeerCredentials>,
    local_nonce: &[u8],
    response: &CreateSessionResponse,
) -> Result<()> {
    if !endpoint.server_certificate.is_empty() && response.server_certificate != endpoint.server_certificate {
        return Err(ServiceResultException::new(
            StatusCode::BadCertificateInvalid,
            "server certificate in CreateSessionResponse does not match the endpoint's",
        ));
    }

    if policy.is_none() {
        return Ok(());
    }

    let creds = local_credentials.expect("checked by create_and_activate");
    let mut signed = creds.local_certificate.clone();
    signed.extend_from_slice(local_nonce);
    asymmetric::verify(policy, &creds.remote_public_key, &signed, &response.server_signature).map_err(|_| {
        ServiceResultException::new(
            StatusCode::BadApplicationSignatureInvalid,
            "server signature over local certificate || local nonce did not verify",
        )
    })
}

/// Encrypts a `UserNameIdentityToken`/`IssuedIdentityToken` secret: `None`
/// ships the plaintext secret with a null algorithm; every other policy
/// prepends a 4-byte little-endian length to the
/// plaintext, appends the remote nonce, then RSA-encrypts the whole thing
/// (PKCS#1 v1.5 for `Basic128Rsa15`, OAEP for `Basic256`/`Basic256Sha256`).
fn encrypt_identity_secret(
    policy: SecurityPolicy,
    local_credentials: Option<&PeerCredentials>,
    secret: &[u8],
    remote_nonce: &[u8],
) -> Result<(Vec<u8>, Option<&'static str>)> {
    if policy.is_none() {
        return Ok((secret.to_vec(), None));
    }
    let creds = local_credentials.ok_or_else(|| {
        ServiceResultException::new(
            StatusCode::BadSecurityChecksFailed,
            "identity token encryption requires local credentials carrying the server's public key",
        )
    })?;
    let mut plaintext = Vec::with_capacity(4 + secret.len() + remote_nonce.len());
    plaintext.extend_from_slice(&(secret.len() as u32).to_le_bytes());
    plaintext.extend_from_slice(secret);
    plaintext.extend_from_slice(remote_nonce);
    let ciphertext = asymmetric::encrypt(policy, &creds.remote_public_key, &plaintext)?;
    Ok((ciphertext, policy.identity_token_encryption_algorithm()))
}
