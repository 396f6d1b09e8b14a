//! Bit-exact UA-TCP framing: 4-byte ASCII type, 4-byte
//! little-endian length including the 8-byte header, then a type-specific
//! body. Grounded on the teacher's `handshake::transport::CborUdpTransport`
//! read/write shape and on `TcpCodec`/`FramedRead` in the reference
//! OPC UA server transport, adapted from CBOR-over-UDP framing to the
//! length-prefixed byte framing UA-TCP actually uses.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ServiceResultException, StatusCode};
use crate::types::TransportConnectionOptions;

/// Frames are capped well below `u32::MAX` to fail fast on garbage length
/// prefixes instead of trying to allocate gigabytes.
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;
const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Open,
    Message,
    Close,
}

impl ChunkKind {
    fn ascii(self) -> &'static [u8; 3] {
        match self {
            ChunkKind::Open => b"OPN",
            ChunkKind::Message => b"MSG",
            ChunkKind::Close => b"CLO",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    Final,
    Intermediate,
    Abort,
}

impl ChunkType {
    fn ascii(self) -> u8 {
        match self {
            ChunkType::Final => b'F',
            ChunkType::Intermediate => b'C',
            ChunkType::Abort => b'A',
        }
    }

    fn from_ascii(byte: u8) -> Result<Self, ServiceResultException> {
        match byte {
            b'F' => Ok(ChunkType::Final),
            b'C' => Ok(ChunkType::Intermediate),
            b'A' => Ok(ChunkType::Abort),
            other => Err(ServiceResultException::new(
                StatusCode::BadTcpMessageTypeInvalid,
                format!("unrecognized chunk type byte {:#x}", other),
            )),
        }
    }
}

/// A raw OPN/MSG/CLO chunk as it appears on the wire, minus the 8-byte
/// UA-TCP header. Everything past this point — SC header, security header,
/// sequence header, encrypted body — is the conversation layer's concern
/// (§4.2); the transport only frames it.
#[derive(Debug, Clone)]
pub struct RawChunk {
    pub kind: ChunkKind,
    pub chunk_type: ChunkType,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct HelloMessage {
    pub protocol_version: u32,
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
    pub endpoint_url: String,
}

#[derive(Debug, Clone)]
pub struct AcknowledgeMessage {
    pub protocol_version: u32,
    pub send_buffer_size: u32,
    pub receive_buffer_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
}

impl AcknowledgeMessage {
    pub fn as_connection_options(&self) -> TransportConnectionOptions {
        TransportConnectionOptions {
            receive_buffer_size: self.receive_buffer_size,
            send_buffer_size: self.send_buffer_size,
            max_message_size: self.max_message_size,
            max_chunk_count: self.max_chunk_count,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ErrorMessage {
    pub status_code: StatusCode,
    pub reason: String,
}

/// Everything a UA-TCP peer may send us before a secure channel exists, plus
/// the opaque chunk form used once it does.
#[derive(Debug, Clone)]
pub enum Frame {
    Hello(HelloMessage),
    Acknowledge(AcknowledgeMessage),
    Error(ErrorMessage),
    Chunk(RawChunk),
}

pub(crate) fn write_string(dst: &mut BytesMut, value: &str) {
    dst.put_i32_le(value.len() as i32);
    dst.put_slice(value.as_bytes());
}

pub(crate) fn write_byte_string(dst: &mut BytesMut, value: &[u8]) {
    dst.put_i32_le(value.len() as i32);
    dst.put_slice(value);
}

pub(crate) fn read_byte_string(src: &mut Bytes) -> Result<Vec<u8>, ServiceResultException> {
    if src.remaining() < 4 {
        return Err(truncated("byte string length"));
    }
    let len = src.get_i32_le();
    if len < 0 {
        return Ok(Vec::new());
    }
    let len = len as usize;
    if src.remaining() < len {
        return Err(truncated("byte string body"));
    }
    Ok(src.copy_to_bytes(len).to_vec())
}

pub(crate) fn read_string(src: &mut Bytes) -> Result<Option<String>, ServiceResultException> {
    if src.remaining() < 4 {
        return Err(truncated("string length"));
    }
    let len = src.get_i32_le();
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    if src.remaining() < len {
        return Err(truncated("string body"));
    }
    let bytes = src.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec())
        .map(Some)
        .map_err(|e| ServiceResultException::new(StatusCode::BadTcpMessageTypeInvalid, e.to_string()))
}

pub(crate) fn truncated(what: &str) -> ServiceResultException {
    ServiceResultException::new(
        StatusCode::BadTcpMessageTypeInvalid,
        format!("truncated frame while reading {what}"),
    )
}

/// `tokio_util::codec` pair framing the UA-TCP byte stream. Mirrors the
/// teacher's `CborUdpTransport`/`TimeoutTransport` layering: this codec owns
/// only the length-prefixed message boundary, nothing above it.
#[derive(Debug, Default, Clone)]
pub struct TcpCodec {
    max_message_size: u32,
}

impl TcpCodec {
    pub fn new(max_message_size: u32) -> Self {
        Self { max_message_size }
    }
}

impl Decoder for TcpCodec {
    type Item = Frame;
    type Error = ServiceResultException;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let message_type = [src[0], src[1], src[2]];
        let chunk_byte = src[3];
        let total_len = u32::from_le_bytes([src[4], src[5], src[6], src[7]]) as usize;

        if total_len < HEADER_LEN || total_len > MAX_FRAME_LEN {
            return Err(ServiceResultException::new(
                StatusCode::BadResponseTooLarge,
                format!("frame length {total_len} out of bounds"),
            ));
        }
        if self.max_message_size != 0 && total_len > self.max_message_size as usize {
            return Err(ServiceResultException::new(
                StatusCode::BadResponseTooLarge,
                format!(
                    "frame length {total_len} exceeds local max message size {}",
                    self.max_message_size
                ),
            ));
        }
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total_len).freeze();
        frame.advance(HEADER_LEN);

        let frame = match &message_type {
            b"HEL" => Frame::Hello(decode_hello(frame)?),
            b"ACK" => Frame::Acknowledge(decode_ack(frame)?),
            b"ERR" => Frame::Error(decode_err(frame)?),
            b"OPN" => Frame::Chunk(RawChunk {
                kind: ChunkKind::Open,
                chunk_type: ChunkType::from_ascii(chunk_byte)?,
                body: frame,
            }),
            b"MSG" => Frame::Chunk(RawChunk {
                kind: ChunkKind::Message,
                chunk_type: ChunkType::from_ascii(chunk_byte)?,
                body: frame,
            }),
            b"CLO" => Frame::Chunk(RawChunk {
                kind: ChunkKind::Close,
                chunk_type: ChunkType::from_ascii(chunk_byte)?,
                body: frame,
            }),
            other => {
                return Err(ServiceResultException::new(
                    StatusCode::BadTcpMessageTypeInvalid,
                    format!("unrecognized message type {:?}", String::from_utf8_lossy(other)),
                ))
            }
        };
        Ok(Some(frame))
    }
}

fn decode_hello(mut body: Bytes) -> Result<HelloMessage, ServiceResultException> {
    if body.remaining() < 20 {
        return Err(truncated("HELLO fixed fields"));
    }
    let protocol_version = body.get_u32_le();
    let receive_buffer_size = body.get_u32_le();
    let send_buffer_size = body.get_u32_le();
    let max_message_size = body.get_u32_le();
    let max_chunk_count = body.get_u32_le();
    let endpoint_url = read_string(&mut body)?.unwrap_or_default();
    Ok(HelloMessage {
        protocol_version,
        receive_buffer_size,
        send_buffer_size,
        max_message_size,
        max_chunk_count,
        endpoint_url,
    })
}

fn decode_ack(mut body: Bytes) -> Result<AcknowledgeMessage, ServiceResultException> {
    if body.remaining() < 20 {
        return Err(truncated("ACK fields"));
    }
    Ok(AcknowledgeMessage {
        protocol_version: body.get_u32_le(),
        send_buffer_size: body.get_u32_le(),
        receive_buffer_size: body.get_u32_le(),
        max_message_size: body.get_u32_le(),
        max_chunk_count: body.get_u32_le(),
    })
}

fn decode_err(mut body: Bytes) -> Result<ErrorMessage, ServiceResultException> {
    if body.remaining() < 4 {
        return Err(truncated("ERR status code"));
    }
    let status_code = StatusCode::from_u32(body.get_u32_le());
    let reason = read_string(&mut body)?.unwrap_or_default();
    Ok(ErrorMessage { status_code, reason })
}

impl Encoder<Frame> for TcpCodec {
    type Error = ServiceResultException;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Frame::Hello(hello) => {
                let mut body = BytesMut::new();
                body.put_u32_le(hello.protocol_version);
                body.put_u32_le(hello.receive_buffer_size);
                body.put_u32_le(hello.send_buffer_size);
                body.put_u32_le(hello.max_message_size);
                body.put_u32_le(hello.max_chunk_count);
                write_string(&mut body, &hello.endpoint_url);
                write_frame(dst, b"HEL", b'F', &body);
            }
            Frame::Acknowledge(ack) => {
                let mut body = BytesMut::new();
                body.put_u32_le(ack.protocol_version);
                body.put_u32_le(ack.send_buffer_size);
                body.put_u32_le(ack.receive_buffer_size);
                body.put_u32_le(ack.max_message_size);
                body.put_u32_le(ack.max_chunk_count);
                write_frame(dst, b"ACK", b'F', &body);
            }
            Frame::Error(err) => {
                let mut body = BytesMut::new();
                body.put_u32_le(err.status_code.as_u32());
                write_string(&mut body, &err.reason);
                write_frame(dst, b"ERR", b'F', &body);
            }
            Frame::Chunk(chunk) => {
                write_frame(dst, chunk.kind.ascii(), chunk.chunk_type.ascii(), &chunk.body);
            }
        }
        Ok(())
    }
}

fn write_frame(dst: &mut BytesMut, message_type: &[u8; 3], chunk_byte: u8, body: &[u8]) {
    dst.put_slice(message_type);
    dst.put_u8(chunk_byte);
    dst.put_u32_le((HEADER_LEN + body.len()) as u32);
    dst.put_slice(body);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_round_trips() {
        let mut codec = TcpCodec::new(0);
        let mut buf = BytesMut::new();
        let hello = HelloMessage {
            protocol_version: 0,
            receive_buffer_size: 65536,
            send_buffer_size: 65536,
            max_message_size: 16 * 1024 * 1024,
            max_chunk_count: 4096,
            endpoint_url: "opc.tcp://h:4840".to_string(),
        };
        codec.encode(Frame::Hello(hello.clone()), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        match decoded {
            Frame::Hello(got) => {
                assert_eq!(got.protocol_version, hello.protocol_version);
                assert_eq!(got.endpoint_url, hello.endpoint_url);
                assert_eq!(got.max_chunk_count, hello.max_chunk_count);
            }
            other => panic!("expected Hello, got {other:?}"),
        }
    }

    #[test]
    fn partial_frame_yields_none_until_complete() {
        let mut codec = TcpCodec::new(0);
        let mut full = BytesMut::new();
        codec
            .encode(
                Frame::Error(ErrorMessage {
                    status_code: StatusCode::BadProtocolVersionUnsupported,
                    reason: "unsupported".to_string(),
                }),
                &mut full,
            )
            .unwrap();
        let mut partial = full.split_to(full.len() - 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn err_frame_carries_status_and_reason() {
        let mut codec = TcpCodec::new(0);
        let mut buf = BytesMut::new();
        codec
            .encode(
                Frame::Error(ErrorMessage {
                    status_code: StatusCode::BadProtocolVersionUnsupported,
                    reason: "unsupported".to_string(),
                }),
                &mut buf,
            )
            .unwrap();
        match codec.decode(&mut buf).unwrap().unwrap() {
            Frame::Error(err) => {
                assert_eq!(err.status_code, StatusCode::BadProtocolVersionUnsupported);
                assert_eq!(err.reason, "unsupported");
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = TcpCodec::new(1024);
        let mut buf = BytesMut::new();
        buf.put_slice(b"MSGF");
        buf.put_u32_le(2048);
        buf.resize(2048, 0);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn chunk_preserves_kind_and_type() {
        let mut codec = TcpCodec::new(0);
        let mut buf = BytesMut::new();
        codec
            .encode(
                Frame::Chunk(RawChunk {
                    kind: ChunkKind::Message,
                    chunk_type: ChunkType::Intermediate,
                    body: Bytes::from_static(b"payload"),
                }),
                &mut buf,
            )
            .unwrap();
        match codec.decode(&mut buf).unwrap().unwrap() {
            Frame::Chunk(chunk) => {
                assert_eq!(chunk.kind, ChunkKind::Message);
                assert_eq!(chunk.chunk_type, ChunkType::Intermediate);
                assert_eq!(&chunk.body[..], b"payload");
            }
            other => panic!("expected Chunk, got {other:?}"),
        }
    }
}
