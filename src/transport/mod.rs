//! UA-TCP transport framing: the lowest layer, owning only
//! the 4-byte-type/4-byte-length envelope and the HELLO/ACK negotiation.

pub mod codec;
pub mod connection;

pub use codec::{AcknowledgeMessage, ChunkKind, ChunkType, ErrorMessage, Frame, HelloMessage, RawChunk, TcpCodec};
pub use connection::{TransportConnection, TransportReader, TransportWriter, PROTOCOL_VERSION};
