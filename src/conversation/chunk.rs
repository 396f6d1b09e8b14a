//! Secure Conversation headers carried inside every `OPN`/`MSG`/`CLO` chunk
//! body: SC header, security header (asymmetric or symmetric form),
//! sequence header.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Result;
use crate::transport::codec::{read_byte_string, read_string, truncated, write_byte_string, write_string};

/// `u32 channel_id`, present on every chunk regardless of message type.
#[derive(Debug, Clone, Copy)]
pub struct SecureConversationHeader {
    pub channel_id: u32,
}

impl SecureConversationHeader {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.channel_id);
    }

    pub fn decode(src: &mut Bytes) -> Result<Self> {
        if src.remaining() < 4 {
            return Err(truncated("secure conversation header"));
        }
        Ok(Self { channel_id: src.get_u32_le() })
    }
}

/// Security header on an `OPN` chunk: policy URI plus the sender's
/// certificate and a thumbprint identifying the receiver's certificate.
#[derive(Debug, Clone)]
pub struct AsymmetricSecurityHeader {
    pub security_policy_uri: String,
    pub sender_certificate: Vec<u8>,
    pub receiver_certificate_thumbprint: Vec<u8>,
}

impl AsymmetricSecurityHeader {
    pub fn encode(&self, dst: &mut BytesMut) {
        write_string(dst, &self.security_policy_uri);
        write_byte_string(dst, &self.sender_certificate);
        write_byte_string(dst, &self.receiver_certificate_thumbprint);
    }

    pub fn decode(src: &mut Bytes) -> Result<Self> {
        Ok(Self {
            security_policy_uri: read_string(src)?.unwrap_or_default(),
            sender_certificate: read_byte_string(src)?,
            receiver_certificate_thumbprint: read_byte_string(src)?,
        })
    }
}

/// Security header on a `MSG`/`CLO` chunk: just the token id identifying
/// which `SecurityToken` the symmetric keys were derived from.
#[derive(Debug, Clone, Copy)]
pub struct SymmetricSecurityHeader {
    pub token_id: u32,
}

impl SymmetricSecurityHeader {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.token_id);
    }

    pub fn decode(src: &mut Bytes) -> Result<Self> {
        if src.remaining() < 4 {
            return Err(truncated("symmetric security header"));
        }
        Ok(Self { token_id: src.get_u32_le() })
    }
}

/// `u32 sequence_number, u32 request_id`. `request_id` carries the
/// dispatcher's request handle across the wire so a multi-chunk message's
/// chunks can be validated as belonging to the same request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceHeader {
    pub sequence_number: u32,
    pub request_id: u32,
}

impl SequenceHeader {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.sequence_number);
        dst.put_u32_le(self.request_id);
    }

    pub fn decode(src: &mut Bytes) -> Result<Self> {
        if src.remaining() < 8 {
            return Err(truncated("sequence header"));
        }
        Ok(Self {
            sequence_number: src.get_u32_le(),
            request_id: src.get_u32_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asymmetric_header_round_trips() {
        let header = AsymmetricSecurityHeader {
            security_policy_uri: "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256".to_string(),
            sender_certificate: vec![1, 2, 3],
            receiver_certificate_thumbprint: vec![4, 5, 6, 7],
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        let mut bytes = buf.freeze();
        let decoded = AsymmetricSecurityHeader::decode(&mut bytes).unwrap();
        assert_eq!(decoded.security_policy_uri, header.security_policy_uri);
        assert_eq!(decoded.sender_certificate, header.sender_certificate);
        assert_eq!(
            decoded.receiver_certificate_thumbprint,
            header.receiver_certificate_thumbprint
        );
    }

    #[test]
    fn sequence_header_round_trips() {
        let header = SequenceHeader { sequence_number: 42, request_id: 7 };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        let mut bytes = buf.freeze();
        assert_eq!(SequenceHeader::decode(&mut bytes).unwrap(), header);
    }
}
