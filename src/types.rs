//! Plain data types from spec.md §3 that don't belong to any one component.
//!
//! These are deliberately minimal: the real OPC UA type system (hundreds of
//! generated structured types) is an external collaborator per §1/§6. Only
//! the fields this core actually reads or writes are represented.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Security mode negotiated for a secure channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageSecurityMode {
    None,
    Sign,
    SignAndEncrypt,
}

/// A node identifier. OPC UA supports four encodings; only the two this core
/// constructs or compares (numeric and GUID) are modeled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeId {
    Numeric { namespace_index: u16, value: u32 },
    Guid { namespace_index: u16, value: Uuid },
    Null,
}

impl Default for NodeId {
    fn default() -> Self {
        NodeId::Null
    }
}

impl NodeId {
    pub fn is_null(&self) -> bool {
        matches!(self, NodeId::Null)
    }
}

/// One entry of a user-token-policy list advertised by an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTokenPolicy {
    pub policy_id: String,
    pub token_type: UserTokenType,
    pub security_policy_uri: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserTokenType {
    Anonymous,
    UserName,
    Certificate,
    Issued,
}

/// Server endpoint metadata, supplied by the caller and immutable for the
/// life of the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointDescription {
    pub endpoint_url: String,
    pub security_policy_uri: String,
    pub security_mode: MessageSecurityMode,
    pub server_certificate: Vec<u8>,
    pub user_identity_tokens: Vec<UserTokenPolicy>,
}

/// Application metadata the client presents to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationDescription {
    pub application_uri: String,
    pub product_uri: String,
    pub application_name: String,
}

/// Transport-level negotiated buffer/message/chunk limits. A client has a
/// local set (what it asks for) and, once negotiated, the effective set
/// (the pairwise minimum with the remote's ACK).
#[derive(Debug, Clone, Copy)]
pub struct TransportConnectionOptions {
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
}

impl TransportConnectionOptions {
    /// Applies the OPC UA "0 means unlimited" rule when taking the pairwise
    /// minimum of a local and a remote-negotiated value.
    pub fn min_zero_infinite(local: u32, remote: u32) -> u32 {
        match (local, remote) {
            (0, r) => r,
            (l, 0) => l,
            (l, r) => l.min(r),
        }
    }
}

/// Channel-scoped symmetric key material, issued by OpenSecureChannel and
/// replaced wholesale by Renew.
#[derive(Debug, Clone)]
pub struct SecurityToken {
    pub channel_id: u32,
    pub token_id: u32,
    pub created_at: SystemTime,
    pub revised_lifetime: Duration,
}

impl SecurityToken {
    pub fn new(channel_id: u32, token_id: u32, revised_lifetime: Duration) -> Self {
        Self {
            channel_id,
            token_id,
            created_at: SystemTime::now(),
            revised_lifetime,
        }
    }

    /// The instant at which the sender should have rotated onto a fresh
    /// token: 80% of the revised lifetime past issuance, per spec.md §4.4.
    pub fn renewal_deadline(&self) -> SystemTime {
        let renew_after = Duration::from_secs_f64(self.revised_lifetime.as_secs_f64() * 0.8);
        self.created_at + renew_after
    }

    pub fn is_due_for_renewal(&self) -> bool {
        SystemTime::now() >= self.renewal_deadline()
    }
}

/// Per-request header fields a service call must populate.
#[derive(Debug, Clone)]
pub struct RequestHeader {
    pub authentication_token: NodeId,
    pub timestamp: SystemTime,
    pub request_handle: u32,
    pub timeout_hint: Duration,
    pub return_diagnostics: u32,
}

impl RequestHeader {
    pub fn new(authentication_token: NodeId, request_handle: u32, timeout_hint: Duration) -> Self {
        Self {
            authentication_token,
            timestamp: SystemTime::now(),
            request_handle,
            timeout_hint,
            return_diagnostics: 0,
        }
    }
}

/// Milliseconds since the UNIX epoch, the timestamp granularity services use
/// on the wire.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Which OPC UA service request/response a dispatched frame carries. The
/// structured payload itself is opaque to this core (§6 `EncodingProvider`
/// contract); we only need to recognize a handful of types by name to drive
/// the channel/session state machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    OpenSecureChannel,
    CloseSecureChannel,
    CreateSession,
    ActivateSession,
    CloseSession,
    Read,
    Other,
}
