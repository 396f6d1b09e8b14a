//! End-to-end exercise of secure-channel open, session creation/activation,
//! namespace-table population, and orderly close, against a hand-built
//! server loop standing in for a real OPC UA endpoint — the same shape
//! `dispatcher::channel`'s own loopback test uses one layer down.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_util::codec::Framed;

use opcua_client_core::config::ClientConfig;
use opcua_client_core::conversation::Conversation;
use opcua_client_core::crypto::SecurityPolicy;
use opcua_client_core::error::StatusCode;
use opcua_client_core::sdk::OpcUaClient;
use opcua_client_core::services::{
    ActivateSessionRequest, ActivateSessionResponse, CloseSessionRequest, CloseSessionResponse,
    CreateSessionRequest, CreateSessionResponse, DataValue, OpenSecureChannelResponse, ReadRequest,
    ReadResponse, ResponseHeader,
};
use opcua_client_core::session::UserIdentity;
use opcua_client_core::transport::{ChunkKind, Frame, TcpCodec};
use opcua_client_core::types::{
    ApplicationDescription, EndpointDescription, MessageSecurityMode, NodeId, SecurityToken,
    UserTokenPolicy, UserTokenType,
};
use opcua_client_core::ServiceResultException;

fn endpoint(url: String) -> EndpointDescription {
    EndpointDescription {
        endpoint_url: url,
        security_policy_uri: SecurityPolicy::None.uri().to_string(),
        security_mode: MessageSecurityMode::None,
        server_certificate: Vec::new(),
        user_identity_tokens: vec![UserTokenPolicy {
            policy_id: "anonymous".to_string(),
            token_type: UserTokenType::Anonymous,
            security_policy_uri: None,
        }],
    }
}

async fn recv_payload(framed: &mut Framed<tokio::net::TcpStream, TcpCodec>, conversation: &mut Conversation) -> Vec<u8> {
    let chunk = match framed.next().await.unwrap().unwrap() {
        Frame::Chunk(chunk) => chunk,
        other => panic!("expected a chunk, got {other:?}"),
    };
    let mut chunks = VecDeque::from([chunk]);
    let (_channel_id, _token_id, payload) = conversation
        .decrypt_message(|| {
            let next = chunks.pop_front();
            async move {
                next.ok_or_else(|| ServiceResultException::new(StatusCode::BadSecureChannelClosed, "no chunk"))
            }
        })
        .await
        .unwrap();
    payload
}

async fn send_payload(
    framed: &mut Framed<tokio::net::TcpStream, TcpCodec>,
    conversation: &mut Conversation,
    kind: ChunkKind,
    request_handle: u32,
    body: &[u8],
) {
    let sent = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sent_clone = sent.clone();
    conversation
        .encrypt_message(body, kind, request_handle, |chunk| {
            let sent = sent_clone.clone();
            async move {
                sent.lock().unwrap().push(chunk);
                Ok(())
            }
        })
        .await
        .unwrap();
    for chunk in sent.lock().unwrap().drain(..) {
        framed.send(Frame::Chunk(chunk)).await.unwrap();
    }
}

#[tokio::test]
async fn connect_creates_activates_and_closes_a_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server_task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, TcpCodec::new(0));

        match framed.next().await.unwrap().unwrap() {
            Frame::Hello(_) => {}
            other => panic!("expected HELLO, got {other:?}"),
        }
        framed
            .send(Frame::Acknowledge(opcua_client_core::transport::AcknowledgeMessage {
                protocol_version: 0,
                send_buffer_size: 65536,
                receive_buffer_size: 65536,
                max_message_size: 16 * 1024 * 1024,
                max_chunk_count: 4096,
            }))
            .await
            .unwrap();

        let mut conversation = Conversation::new(SecurityPolicy::None, MessageSecurityMode::None, None);

        // OpenSecureChannel
        let payload = recv_payload(&mut framed, &mut conversation).await;
        let opn_request = opcua_client_core::services::OpenSecureChannelRequest::decode(Bytes::from(payload)).unwrap();
        conversation.set_channel_id(4242);
        let token = SecurityToken::new(4242, 1, Duration::from_secs(3600));
        conversation.install_token(token.clone(), &[], &opn_request.client_nonce).unwrap();
        let opn_response = OpenSecureChannelResponse {
            response_header: ResponseHeader::good(opn_request.request_header.request_handle),
            server_protocol_version: 0,
            security_token: token,
            server_nonce: Vec::new(),
        };
        let mut body = BytesMut::new();
        opn_response.encode(&mut body);
        send_payload(&mut framed, &mut conversation, ChunkKind::Open, opn_request.request_header.request_handle, &body).await;

        // CreateSession
        let payload = recv_payload(&mut framed, &mut conversation).await;
        let create_request = CreateSessionRequest::decode(Bytes::from(payload)).unwrap();
        let create_response = CreateSessionResponse {
            response_header: ResponseHeader::good(create_request.request_header.request_handle),
            session_id: NodeId::Numeric { namespace_index: 1, value: 1000 },
            authentication_token: NodeId::Numeric { namespace_index: 1, value: 1001 },
            revised_session_timeout_ms: 60_000.0,
            server_nonce: vec![1, 2, 3, 4],
            server_certificate: Vec::new(),
            server_signature: Vec::new(),
        };
        let mut body = BytesMut::new();
        create_response.encode(&mut body);
        send_payload(&mut framed, &mut conversation, ChunkKind::Message, create_request.request_header.request_handle, &body).await;

        // ActivateSession
        let payload = recv_payload(&mut framed, &mut conversation).await;
        let activate_request = ActivateSessionRequest::decode(Bytes::from(payload)).unwrap();
        let activate_response = ActivateSessionResponse {
            response_header: ResponseHeader::good(activate_request.request_header.request_handle),
            server_nonce: vec![5, 6, 7, 8],
            results: vec![StatusCode::Good],
        };
        let mut body = BytesMut::new();
        activate_response.encode(&mut body);
        send_payload(&mut framed, &mut conversation, ChunkKind::Message, activate_request.request_header.request_handle, &body).await;

        // Read Server_NamespaceArray / Server_ServerArray
        let payload = recv_payload(&mut framed, &mut conversation).await;
        let read_request = ReadRequest::decode(Bytes::from(payload)).unwrap();
        assert_eq!(read_request.nodes_to_read.len(), 2);
        let read_response = ReadResponse {
            response_header: ResponseHeader::good(read_request.request_header.request_handle),
            results: vec![
                DataValue {
                    string_array: Some(vec![
                        "http://opcfoundation.org/UA/".to_string(),
                        "urn:test:namespace".to_string(),
                    ]),
                    status: StatusCode::Good,
                },
                DataValue {
                    string_array: Some(vec!["urn:test:server".to_string()]),
                    status: StatusCode::Good,
                },
            ],
        };
        let mut body = BytesMut::new();
        read_response.encode(&mut body);
        send_payload(&mut framed, &mut conversation, ChunkKind::Message, read_request.request_header.request_handle, &body).await;

        // CloseSession
        let payload = recv_payload(&mut framed, &mut conversation).await;
        let close_request = CloseSessionRequest::decode(Bytes::from(payload)).unwrap();
        assert!(close_request.delete_subscriptions);
        let close_response = CloseSessionResponse { response_header: ResponseHeader::good(close_request.request_header.request_handle) };
        let mut body = BytesMut::new();
        close_response.encode(&mut body);
        send_payload(&mut framed, &mut conversation, ChunkKind::Message, close_request.request_header.request_handle, &body).await;
    });

    let config = ClientConfig::default();
    let app = ApplicationDescription {
        application_uri: "urn:test:client".to_string(),
        product_uri: "urn:test:product".to_string(),
        application_name: "test-client".to_string(),
    };
    let client = OpcUaClient::connect(
        config,
        app,
        endpoint(format!("opc.tcp://{addr}")),
        SecurityPolicy::None,
        MessageSecurityMode::None,
        None,
        UserIdentity::Anonymous,
    )
    .await
    .unwrap();

    assert_eq!(
        client.namespace_uris(),
        &["http://opcfoundation.org/UA/".to_string(), "urn:test:namespace".to_string()]
    );
    assert_eq!(client.server_uris(), &["urn:test:server".to_string()]);

    client.close().await;
    server_task.await.unwrap();
}
