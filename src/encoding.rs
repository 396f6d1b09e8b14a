//! Collaborator contracts for the binary encoder/decoder (§6).
//!
//! The structured-type encoder/decoder itself — the thing that knows how to
//! turn a `ReadRequest` into bytes keyed by its `NodeId` — is explicitly out
//! of scope (§1 Non-goals). This module only fixes the seam: the traits this
//! core calls into, and the context it threads through them.

use crate::error::Result;
use crate::types::NodeId;

/// Namespace/server URI tables and size limits threaded through every
/// encode/decode call, per §6.
#[derive(Debug, Clone, Default)]
pub struct EncodingContext {
    /// `NamespaceUris`; index 0 is always `http://opcfoundation.org/UA/`
    /// per spec.md §3's invariant.
    pub namespace_uris: Vec<String>,
    pub server_uris: Vec<String>,
    pub max_string_length: u32,
    pub max_array_length: u32,
}

impl EncodingContext {
    pub fn new() -> Self {
        Self {
            namespace_uris: vec!["http://opcfoundation.org/UA/".to_string()],
            server_uris: Vec::new(),
            max_string_length: 0,
            max_array_length: 0,
        }
    }
}

/// A decoded service request or response body, identified by its encoded
/// type id. This core never inspects the payload; it only routes it by
/// `ServiceType` (see `types::ServiceType`) and by the handle in the
/// sequence header.
#[derive(Debug, Clone)]
pub struct EncodedBody {
    pub type_node_id: NodeId,
    pub bytes: Vec<u8>,
}

/// Encodes an in-memory request body into the bytes that follow the
/// `ExpandedNodeId` type id in a chunk, per §6.
pub trait Encoder: Send {
    fn write_request(&mut self, body: &EncodedBody) -> Result<()>;
}

/// Decodes the bytes that follow the `ExpandedNodeId` type id in a chunk
/// back into a typed response.
pub trait Decoder: Send {
    fn read_response(&mut self) -> Result<EncodedBody>;
}

/// Stateless factory for encoders/decoders bound to a context, per §6.
pub trait EncodingProvider: Send + Sync {
    fn create_encoder(&self, context: &EncodingContext) -> Box<dyn Encoder>;
    fn create_decoder(&self, context: &EncodingContext) -> Box<dyn Decoder>;
}
