//! The transport connection: frames a TCP byte stream into UA messages and
//! runs the HELLO/ACK negotiation.
//!
//! Grounded on the teacher's `handshake::transport::{CborUdpTransport,
//! TimeoutTransport}` for the open/send/receive/dispose shape, and on
//! `TcpConnector`/`TcpTransport` in the reference OPC UA server transport for
//! the HEL/ACK negotiation itself and the `min_zero_infinite` pairwise-limit
//! rule (`types::TransportConnectionOptions::min_zero_infinite`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::error::{Result, ServiceResultException, StatusCode};
use crate::transport::codec::{
    AcknowledgeMessage, ChunkKind, ChunkType, Frame, HelloMessage, RawChunk, TcpCodec,
};
use crate::types::TransportConnectionOptions;

/// The UA-TCP protocol version this core speaks. Servers advertising a lower
/// version in their `ACK` are still accepted; spec.md §8 scenario (b) only
/// requires us to fail a server-side rejection, not to negotiate down
/// ourselves.
pub const PROTOCOL_VERSION: u32 = 0;

const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// A single open TCP connection framed per UA-TCP. Owns nothing above the
/// wire: no crypto, no chunk semantics beyond the header. The conversation
/// layer (§4.2) interprets `RawChunk::body`.
pub struct TransportConnection {
    framed: Framed<TcpStream, TcpCodec>,
    disposed: Arc<AtomicBool>,
}

impl TransportConnection {
    /// Establishes the TCP socket and leaves the connection in its
    /// pre-handshake state; call [`TransportConnection::open`] next.
    pub async fn connect(endpoint_url: &str) -> Result<Self> {
        let host_port = strip_opc_scheme(endpoint_url)?;
        let stream = TcpStream::connect(host_port).await.map_err(|e| {
            ServiceResultException::new(
                StatusCode::BadServerNotConnected,
                format!("failed to connect to {host_port}: {e}"),
            )
        })?;
        stream.set_nodelay(true).ok();
        Ok(Self::from_stream(stream))
    }

    /// Wraps an already-connected socket. Exposed for tests that drive both
    /// ends of a loopback pair.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            framed: Framed::new(stream, TcpCodec::new(0)),
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Splits into independent read/write halves sharing the disposed flag,
    /// so a dispatcher can run one task pumping outgoing chunks and another
    /// pumping incoming ones over the same full-duplex socket (spec.md
    /// §4.4's concurrency model).
    pub fn split(self) -> (TransportWriter, TransportReader) {
        let (sink, stream) = self.framed.split();
        (
            TransportWriter { sink, disposed: self.disposed.clone() },
            TransportReader { stream, disposed: self.disposed },
        )
    }

    /// Performs the HELLO/ACK handshake, per spec.md §4.1. Returns the
    /// negotiated options: the pairwise minimum of `local` and whatever the
    /// server's `ACK` carried, per `min_zero_infinite`.
    pub async fn open(
        &mut self,
        endpoint_url: &str,
        local: TransportConnectionOptions,
    ) -> Result<TransportConnectionOptions> {
        self.check_not_disposed()?;
        let hello = Frame::Hello(HelloMessage {
            protocol_version: PROTOCOL_VERSION,
            receive_buffer_size: local.receive_buffer_size,
            send_buffer_size: local.send_buffer_size,
            max_message_size: local.max_message_size,
            max_chunk_count: local.max_chunk_count,
            endpoint_url: endpoint_url.to_string(),
        });
        self.framed.send(hello).await?;

        let frame = timeout(HELLO_TIMEOUT, self.framed.next())
            .await
            .map_err(|_| {
                ServiceResultException::new(StatusCode::BadServerNotConnected, "HELLO timed out")
            })?
            .ok_or_else(|| {
                ServiceResultException::new(
                    StatusCode::BadServerNotConnected,
                    "connection closed before ACK",
                )
            })??;

        match frame {
            Frame::Acknowledge(ack) => {
                let remote = ack.as_connection_options();
                let negotiated = negotiate(local, &ack);
                self.framed
                    .codec_mut()
                    .clone_from(&TcpCodec::new(negotiated.max_message_size));
                debug!(?remote, ?negotiated, "HELLO negotiated");
                Ok(negotiated)
            }
            Frame::Error(err) => Err(ServiceResultException::new(err.status_code, err.reason)),
            other => Err(ServiceResultException::new(
                StatusCode::BadTcpMessageTypeInvalid,
                format!("expected ACK or ERR, got {other:?}"),
            )),
        }
    }

    pub async fn send_chunk(&mut self, kind: ChunkKind, chunk_type: ChunkType, body: Bytes) -> Result<()> {
        self.check_not_disposed()?;
        self.framed
            .send(Frame::Chunk(RawChunk { kind, chunk_type, body }))
            .await
    }

    pub async fn receive_chunk(&mut self) -> Result<RawChunk> {
        self.check_not_disposed()?;
        match self.framed.next().await {
            Some(Ok(Frame::Chunk(chunk))) => Ok(chunk),
            Some(Ok(Frame::Error(err))) => Err(ServiceResultException::new(err.status_code, err.reason)),
            Some(Ok(other)) => Err(ServiceResultException::new(
                StatusCode::BadTcpMessageTypeInvalid,
                format!("expected a chunk, got {other:?}"),
            )),
            Some(Err(e)) => Err(e),
            None => Err(ServiceResultException::new(
                StatusCode::BadSecureChannelClosed,
                "connection closed by peer",
            )),
        }
    }

    /// Idempotent: a second `dispose` is a no-op, and any send/receive after
    /// the first fails with `BadSecureChannelClosed`.
    pub async fn dispose(&mut self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.framed.get_mut().shutdown().await {
            warn!(error = %e, "error shutting down transport socket");
        }
    }

    fn check_not_disposed(&self) -> Result<()> {
        check_not_disposed(&self.disposed)
    }
}

/// Write half of a split [`TransportConnection`]. Owned exclusively by a
/// dispatcher's outgoing-chunk task.
pub struct TransportWriter {
    sink: SplitSink<Framed<TcpStream, TcpCodec>, Frame>,
    disposed: Arc<AtomicBool>,
}

impl TransportWriter {
    pub async fn send_chunk(&mut self, kind: ChunkKind, chunk_type: ChunkType, body: Bytes) -> Result<()> {
        check_not_disposed(&self.disposed)?;
        self.sink.send(Frame::Chunk(RawChunk { kind, chunk_type, body })).await
    }

    /// Marks the connection disposed and shuts down the socket. Idempotent;
    /// safe to call from either half since both share the flag.
    pub async fn dispose(&mut self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.sink.get_mut().get_mut().shutdown().await {
            warn!(error = %e, "error shutting down transport socket");
        }
    }
}

/// Read half of a split [`TransportConnection`]. Owned exclusively by a
/// dispatcher's incoming-chunk task.
pub struct TransportReader {
    stream: SplitStream<Framed<TcpStream, TcpCodec>>,
    disposed: Arc<AtomicBool>,
}

impl TransportReader {
    pub async fn receive_chunk(&mut self) -> Result<RawChunk> {
        check_not_disposed(&self.disposed)?;
        match self.stream.next().await {
            Some(Ok(Frame::Chunk(chunk))) => Ok(chunk),
            Some(Ok(Frame::Error(err))) => Err(ServiceResultException::new(err.status_code, err.reason)),
            Some(Ok(other)) => Err(ServiceResultException::new(
                StatusCode::BadTcpMessageTypeInvalid,
                format!("expected a chunk, got {other:?}"),
            )),
            Some(Err(e)) => Err(e),
            None => Err(ServiceResultException::new(
                StatusCode::BadSecureChannelClosed,
                "connection closed by peer",
            )),
        }
    }
}

fn check_not_disposed(disposed: &AtomicBool) -> Result<()> {
    if disposed.load(Ordering::SeqCst) {
        return Err(ServiceResultException::new(
            StatusCode::BadSecureChannelClosed,
            "transport connection already disposed",
        ));
    }
    Ok(())
}

fn negotiate(local: TransportConnectionOptions, ack: &AcknowledgeMessage) -> TransportConnectionOptions {
    TransportConnectionOptions {
        receive_buffer_size: TransportConnectionOptions::min_zero_infinite(
            local.receive_buffer_size,
            ack.receive_buffer_size,
        ),
        send_buffer_size: TransportConnectionOptions::min_zero_infinite(
            local.send_buffer_size,
            ack.send_buffer_size,
        ),
        max_message_size: TransportConnectionOptions::min_zero_infinite(
            local.max_message_size,
            ack.max_message_size,
        ),
        max_chunk_count: TransportConnectionOptions::min_zero_infinite(
            local.max_chunk_count,
            ack.max_chunk_count,
        ),
    }
}

fn strip_opc_scheme(endpoint_url: &str) -> Result<&str> {
    let rest = endpoint_url.strip_prefix("opc.tcp://").ok_or_else(|| {
        ServiceResultException::new(
            StatusCode::BadServerNotConnected,
            format!("endpoint URL {endpoint_url:?} is not an opc.tcp:// URL"),
        )
    })?;
    Ok(rest.split('/').next().unwrap_or(rest))
}
