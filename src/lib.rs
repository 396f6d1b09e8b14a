//! OPC UA client secure-channel and session core.
//!
//! Implements the UA-TCP transport handshake, UA-SC secure conversation
//! (chunking, token issuance/renewal, symmetric and asymmetric security),
//! request/response dispatch, and the client session lifecycle
//! (`CreateSession`/`ActivateSession`/`CloseSession`). The general
//! structured-type encoding surface (arbitrary `Read`/`Write`/`Browse`
//! services, user-defined types) is an external collaborator contract
//! (see [`encoding`]), not reimplemented here.

pub mod config;
pub mod conversation;
pub mod crypto;
pub mod dispatcher;
pub mod encoding;
pub mod error;
pub mod sdk;
pub mod services;
pub mod session;
pub mod state;
pub mod transport;
pub mod types;

pub use config::ClientConfig;
pub use conversation::{Conversation, PeerCredentials};
pub use crypto::SecurityPolicy;
pub use dispatcher::ClientSecureChannel;
pub use error::{Result, ServiceResultException, StatusCode};
pub use sdk::OpcUaClient;
pub use session::{ClientSession, UserIdentity};
pub use state::{CommunicationState, Lifecycle};
pub use types::{
    ApplicationDescription, EndpointDescription, MessageSecurityMode, NodeId, RequestHeader,
    SecurityToken, UserTokenPolicy, UserTokenType,
};
