//! Transport provider interface
//!
//! The orchestration layer never touches wire encoding or sockets: it drives
//! connection, session, and link primitives supplied by a transport provider
//! through the traits in this module. The traits exist to enable dependency
//! injection and testing: production providers wrap a real AMQP stack, and
//! [`crate::testing::mocks`] supplies scripted in-memory implementations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use url::Url;

use crate::auth::{AccessToken, AuthenticatorRef, SaslMechanism};
use crate::config::{ClientOptions, ReceiverLinkOptions, SenderLinkOptions, SessionOptions};
use crate::error::{AmqpClientError, AmqpError, ClientResult};
use crate::message::Message;

/// Shared handle to a connection. The mutex gives the transient
/// lock/release required around shared-connection reconfiguration and lets
/// the keep-alive task pump `work()` concurrently with the reactor.
pub type ConnectionRef = Arc<Mutex<dyn AmqpConnection>>;

/// Shared handle to a session.
pub type SessionRef = Arc<Mutex<dyn AmqpSession>>;

/// Sender settlement mode negotiated on link attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SenderSettleMode {
    #[default]
    Unsettled,
    Settled,
    Mixed,
}

/// Receiver settlement mode negotiated on link attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReceiverSettleMode {
    #[default]
    First,
    Second,
}

/// Observed state of a link endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkState {
    /// Attach sent, waiting for the peer.
    Pending,
    /// Attached and usable.
    Open,
    /// Detached cleanly.
    Closed,
    /// Detached with an error. Fatal for the owning client.
    Error(AmqpError),
}

/// Outcome of a sent delivery as reported by the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Accepted,
    Rejected(AmqpError),
    Released,
    Modified {
        delivery_failed: bool,
        undeliverable_here: bool,
    },
    /// The transport settled the delivery without reporting a state.
    Unknown,
}

/// Redirect information carried by a link-detach or connection-close
/// redirect error.
#[derive(Debug, Clone, PartialEq)]
pub struct RedirectInfo {
    pub hostname: String,
    pub port: u16,
    /// Full node address at the new host.
    pub address: String,
}

impl RedirectInfo {
    /// Parse a redirect address of the form `amqps://host:port/path`.
    pub fn from_address(address: &str) -> ClientResult<Self> {
        let url = Url::parse(address).map_err(|e| {
            AmqpClientError::invalid_argument(format!("invalid redirect address: {e}"))
        })?;
        let hostname = url
            .host_str()
            .ok_or_else(|| {
                AmqpClientError::invalid_argument("redirect address is missing a host")
            })?
            .to_string();
        let port = url.port().unwrap_or(5671);
        Ok(Self {
            hostname,
            port,
            address: address.to_string(),
        })
    }
}

/// Remote attach details handed to the configured attach observer.
#[derive(Debug, Clone)]
pub struct AttachProperties {
    pub link_name: String,
    pub handle: u32,
    pub properties: HashMap<String, serde_json::Value>,
}

/// Observer invoked when the remote attach frame arrives.
pub type AttachObserver = Arc<dyn Fn(&AttachProperties) + Send + Sync>;

/// CBS handshake state as seen by the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum CbsState {
    /// No CBS authenticator is attached to this connection.
    NoCbs,
    /// Token put in flight; handshake not yet confirmed.
    InProgress,
    /// The management node accepted the token.
    Open,
    /// The handshake failed terminally.
    Failed(AmqpError),
}

/// Where to aim a new connection.
#[derive(Debug, Clone)]
pub struct ConnectionTarget {
    pub hostname: String,
    pub port: u16,
    pub container_id: String,
    pub sasl: SaslMechanism,
}

/// Options for a management-node request/response exchange.
#[derive(Debug, Clone)]
pub struct MgmtOptions {
    /// Management node address.
    pub node: String,
    pub timeout: Duration,
}

impl Default for MgmtOptions {
    fn default() -> Self {
        Self {
            node: "$management".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// An AMQP connection supplied by the transport provider.
///
/// `work()` advances the connection's protocol state machine one step; the
/// reactor (and only the reactor, plus the keep-alive task) calls it.
#[async_trait::async_trait]
pub trait AmqpConnection: Send {
    fn container_id(&self) -> &str;

    fn hostname(&self) -> &str;

    /// Pump the connection state machine once.
    async fn work(&mut self) -> ClientResult<()>;

    /// Park the connection for the given duration (send-side backoff).
    async fn sleep(&mut self, duration: Duration);

    /// Build a plain session on this connection.
    async fn create_session(&mut self, options: &SessionOptions) -> ClientResult<SessionRef>;

    /// The CBS session, if a CBS authenticator has been attached.
    fn cbs_session(&self) -> Option<SessionRef>;

    fn cbs_state(&self) -> CbsState;

    /// Attach (or refresh) a CBS authenticator: creates the CBS session on
    /// first use and puts the token to the peer's management node.
    async fn attach_cbs(&mut self, audience: &str, token: AccessToken) -> ClientResult<()>;

    /// The authenticator owned by this connection, for clients opened over
    /// a shared external connection.
    fn authenticator(&self) -> Option<AuthenticatorRef>;

    /// Re-point the connection at a redirect target.
    async fn redirect(&mut self, info: &RedirectInfo) -> ClientResult<()>;

    async fn close(&mut self) -> ClientResult<()>;
}

/// A windowed multiplexing context over a connection.
#[async_trait::async_trait]
pub trait AmqpSession: Send {
    async fn create_sender(
        &mut self,
        options: &SenderLinkOptions,
    ) -> ClientResult<Box<dyn SenderLink>>;

    async fn create_receiver(
        &mut self,
        options: &ReceiverLinkOptions,
    ) -> ClientResult<Box<dyn ReceiverLink>>;

    /// Issue a request/response exchange against a management node.
    async fn mgmt_request(
        &mut self,
        request: Message,
        operation: &str,
        options: &MgmtOptions,
    ) -> ClientResult<Message>;

    async fn destroy(&mut self) -> ClientResult<()>;
}

/// Outbound half of a link pair.
#[async_trait::async_trait]
pub trait SenderLink: Send {
    fn name(&self) -> &str;

    async fn open(&mut self) -> ClientResult<()>;

    fn state(&self) -> LinkState;

    /// Pump the link state machine once.
    async fn work(&mut self) -> ClientResult<()>;

    /// Queue a transfer for the message with the remaining timeout budget
    /// (zero means no deadline) and return its delivery tag.
    fn send(&mut self, message: &Message, timeout: Duration) -> ClientResult<u64>;

    /// Drain delivery outcomes in the order the transport reported them.
    fn poll_outcomes(&mut self) -> Vec<(u64, DeliveryOutcome)>;

    async fn destroy(&mut self) -> ClientResult<()>;
}

/// Inbound half of a link pair.
#[async_trait::async_trait]
pub trait ReceiverLink: Send {
    fn name(&self) -> &str;

    async fn open(&mut self) -> ClientResult<()>;

    fn state(&self) -> LinkState;

    /// Pump the link state machine once.
    async fn work(&mut self) -> ClientResult<()>;

    /// Next delivery received since the last pump, in wire-arrival order.
    fn poll_delivery(&mut self) -> Option<Message>;

    /// Grant additional credit to the peer.
    fn flow(&mut self, credit: u32);

    /// Queue an accepted disposition. Settling an already-settled delivery
    /// is a no-op.
    fn accept(&mut self, delivery_tag: u64);

    /// Queue a released disposition, returning the delivery to the peer.
    fn release(&mut self, delivery_tag: u64);

    /// Queue a rejected disposition with an optional error.
    fn reject(&mut self, delivery_tag: u64, error: Option<AmqpError>);

    async fn destroy(&mut self) -> ClientResult<()>;
}

/// Factory building connections at `open()` time.
#[async_trait::async_trait]
pub trait TransportProvider: Send + Sync {
    async fn connect(
        &self,
        target: &ConnectionTarget,
        options: &ClientOptions,
    ) -> ClientResult<ConnectionRef>;
}

/// Ownership-tagged connection handle.
///
/// An `Owned` connection is destroyed when the client closes. An `External`
/// connection is borrowed: it is locked only transiently during open and
/// redirect reconfiguration and is never destroyed by this client.
#[derive(Clone)]
pub enum ConnectionHandle {
    Owned(ConnectionRef),
    External(ConnectionRef),
}

impl ConnectionHandle {
    pub fn is_external(&self) -> bool {
        matches!(self, ConnectionHandle::External(_))
    }

    pub fn connection(&self) -> &ConnectionRef {
        match self {
            ConnectionHandle::Owned(connection) => connection,
            ConnectionHandle::External(connection) => connection,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_info_parses_address() {
        let info = RedirectInfo::from_address("amqps://other.example.com:5671/hub/partition/0")
            .unwrap();
        assert_eq!(info.hostname, "other.example.com");
        assert_eq!(info.port, 5671);
        assert_eq!(info.address, "amqps://other.example.com:5671/hub/partition/0");
    }

    #[test]
    fn test_redirect_info_default_port() {
        let info = RedirectInfo::from_address("amqps://other.example.com/hub").unwrap();
        assert_eq!(info.port, 5671);
    }

    #[test]
    fn test_redirect_info_rejects_garbage() {
        assert!(RedirectInfo::from_address("not a url").is_err());
    }

    #[test]
    fn test_settle_mode_defaults() {
        assert_eq!(SenderSettleMode::default(), SenderSettleMode::Unsettled);
        assert_eq!(ReceiverSettleMode::default(), ReceiverSettleMode::First);
    }

    #[test]
    fn test_link_state_error_carries_condition() {
        let state = LinkState::Error(AmqpError::new(crate::error::ErrorCondition::DetachForced));
        match state {
            LinkState::Error(e) => {
                assert_eq!(e.condition.as_symbol(), "amqp:link:detach-forced")
            }
            other => panic!("unexpected state: {other:?}"),
        }
    }
}
