//! Top-level facade: wires a [`ClientSecureChannel`] and a
//! [`ClientSession`] together into the shape a caller actually wants —
//! connect, call services, disconnect — without hand-assembling the
//! dispatcher and session layers itself.

use std::sync::Arc;

use crate::config::ClientConfig;
use crate::conversation::engine::PeerCredentials;
use crate::crypto::policy::SecurityPolicy;
use crate::dispatcher::channel::ClientSecureChannel;
use crate::error::Result;
use crate::session::{ClientSession, UserIdentity};
use crate::state::CommunicationState;
use crate::types::{ApplicationDescription, EndpointDescription, MessageSecurityMode};

/// An open secure channel plus an activated session bound to it.
pub struct OpcUaClient {
    channel: Arc<ClientSecureChannel>,
    session: ClientSession,
    config: ClientConfig,
}

impl OpcUaClient {
    /// Opens a secure channel to `endpoint` under `policy`/`security_mode`,
    /// then creates and activates a session over it with `identity`.
    pub async fn connect(
        config: ClientConfig,
        app: ApplicationDescription,
        endpoint: EndpointDescription,
        policy: SecurityPolicy,
        security_mode: MessageSecurityMode,
        credentials: Option<PeerCredentials>,
        identity: UserIdentity,
    ) -> Result<Self> {
        let channel = ClientSecureChannel::new(
            config.clone(),
            endpoint.clone(),
            policy,
            security_mode,
            credentials.clone(),
        );
        channel.open().await?;

        let session = ClientSession::create_and_activate(
            channel.clone(),
            &app,
            &endpoint,
            policy,
            credentials.as_ref(),
            &identity,
            &config,
        )
        .await?;

        Ok(Self { channel, session, config })
    }

    pub fn state(&self) -> CommunicationState {
        self.channel.state()
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    pub fn channel(&self) -> &Arc<ClientSecureChannel> {
        &self.channel
    }

    /// The populated `Server_NamespaceArray`; index 0 is
    /// always `http://opcfoundation.org/UA/`.
    pub fn namespace_uris(&self) -> &[String] {
        &self.session.namespace_uris
    }

    pub fn server_uris(&self) -> &[String] {
        &self.session.server_uris
    }

    /// Closes the session (`CloseSession{DeleteSubscriptions=true}`), which
    /// in turn tears down the secure channel underneath it.
    pub async fn close(self) {
        self.session.close(&self.config).await;
    }
}
