//! Client core: connection/session lifecycle and the reactor skeleton
//!
//! [`ClientCore`] owns exactly one connection handle and one session, drives
//! the CBS authentication state machine, runs the optional keep-alive task,
//! and performs redirect rebuilds. The [`AmqpClient`] trait supplies the
//! cooperative reactor skeleton (`do_work()`/`client_ready()`) and calls
//! the two hooks (`handler_ready`, `handler_run`) that the send and receive
//! clients implement.
//!
//! All protocol progress happens inside caller-driven `do_work()` calls.
//! The only background task is the keep-alive pump, which periodically
//! calls `connection.work()` and never touches message state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{AuthenticatorRef, SaslMechanism};
use crate::config::ClientOptions;
use crate::error::{AmqpClientError, ClientResult};
use crate::message::Message;
use crate::transport::{
    ConnectionHandle, ConnectionRef, ConnectionTarget, MgmtOptions, RedirectInfo, SessionRef,
    TransportProvider,
};

/// How the client's session relates to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionKind {
    /// Built by this client; destroyed on close unless the connection is
    /// external.
    Plain,
    /// The connection's CBS session, reused for link and management
    /// traffic; owned by the connection, never destroyed by the client.
    Cbs,
}

struct KeepAliveTask {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Shared state and lifecycle operations for send/receive clients.
pub struct ClientCore {
    hostname: String,
    port: u16,
    container_id: String,
    sasl: SaslMechanism,
    auth: Option<AuthenticatorRef>,
    provider: Arc<dyn TransportProvider>,
    options: ClientOptions,
    keep_alive_interval: Option<Duration>,
    connection: Option<ConnectionHandle>,
    session: Option<SessionRef>,
    session_kind: SessionKind,
    opened: bool,
    closed: bool,
    shutdown: bool,
    keep_alive: Option<KeepAliveTask>,
}

impl ClientCore {
    pub(crate) fn new(
        hostname: impl Into<String>,
        provider: Arc<dyn TransportProvider>,
        options: ClientOptions,
    ) -> ClientResult<Self> {
        options
            .validate()
            .map_err(|e| AmqpClientError::configuration(e.to_string()))?;
        Ok(Self {
            hostname: hostname.into(),
            port: 5671,
            container_id: format!("amqp-reactor-{}", Uuid::new_v4()),
            sasl: SaslMechanism::Anonymous,
            auth: None,
            provider,
            options,
            keep_alive_interval: None,
            connection: None,
            session: None,
            session_kind: SessionKind::Plain,
            opened: false,
            closed: false,
            shutdown: false,
            keep_alive: None,
        })
    }

    pub(crate) fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    pub(crate) fn set_sasl(&mut self, sasl: SaslMechanism) {
        self.sasl = sasl;
    }

    pub(crate) fn set_auth(&mut self, auth: AuthenticatorRef) {
        self.auth = Some(auth);
    }

    pub(crate) fn set_keep_alive_interval(&mut self, interval: Duration) {
        self.keep_alive_interval = (interval > Duration::ZERO).then_some(interval);
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    pub(crate) fn request_shutdown(&mut self) {
        self.shutdown = true;
    }

    pub(crate) fn clear_shutdown(&mut self) {
        self.shutdown = false;
    }

    /// Whether the connection is an externally supplied shared one.
    pub fn is_external(&self) -> bool {
        self.connection
            .as_ref()
            .map(ConnectionHandle::is_external)
            .unwrap_or(false)
    }

    pub(crate) fn session_ref(&self) -> ClientResult<SessionRef> {
        self.session
            .clone()
            .ok_or_else(|| AmqpClientError::invalid_argument("client is not open"))
    }

    /// Establish the connection and session. Idempotent: a second call on
    /// an already-open client is a no-op.
    pub(crate) async fn open(&mut self, external: Option<ConnectionRef>) -> ClientResult<()> {
        if self.closed {
            return Err(AmqpClientError::ClientClosed);
        }
        if self.opened {
            debug!(hostname = %self.hostname, "open called on an already-open client");
            return Ok(());
        }

        match external {
            Some(connection) => {
                let auth = connection.lock().await.authenticator();
                self.auth = auth;
                let handle = ConnectionHandle::External(connection);
                self.build_session(handle.connection()).await?;
                self.connection = Some(handle);
            }
            None => {
                let target = ConnectionTarget {
                    hostname: self.hostname.clone(),
                    port: self.port,
                    container_id: self.container_id.clone(),
                    sasl: self.sasl.clone(),
                };
                let connection = self.provider.connect(&target, &self.options).await?;
                let handle = ConnectionHandle::Owned(connection);
                self.build_session(handle.connection()).await?;
                self.connection = Some(handle);
            }
        }

        self.start_keep_alive();
        self.opened = true;
        info!(hostname = %self.hostname, container_id = %self.container_id, "client opened");
        Ok(())
    }

    /// Select or build the session for this client.
    ///
    /// Preference order: the connection's existing CBS session, then a CBS
    /// session created through this client's authenticator, then a plain
    /// session.
    async fn build_session(&mut self, connection: &ConnectionRef) -> ClientResult<()> {
        if let Some(session) = connection.lock().await.cbs_session() {
            self.session = Some(session);
            self.session_kind = SessionKind::Cbs;
            return Ok(());
        }

        if let Some(auth) = self.auth.clone() {
            if auth.lock().await.supports_cbs() {
                auth.lock().await.create_authenticator(connection).await?;
                let session = connection.lock().await.cbs_session().ok_or_else(|| {
                    AmqpClientError::configuration(
                        "transport did not expose a CBS session after authenticator creation",
                    )
                })?;
                self.session = Some(session);
                self.session_kind = SessionKind::Cbs;
                return Ok(());
            }
        }

        let session = connection
            .lock()
            .await
            .create_session(&self.options.session_options())
            .await?;
        self.session = Some(session);
        self.session_kind = SessionKind::Plain;
        Ok(())
    }

    /// Tear the client down. Idempotent; afterwards the client cannot be
    /// reopened.
    pub(crate) async fn close(&mut self) -> ClientResult<()> {
        if self.closed {
            debug!("close called on an already-closed client");
            return Ok(());
        }
        self.closed = true;
        self.shutdown = true;

        self.stop_keep_alive().await;

        let external = self.is_external();
        if let Some(session) = self.session.take() {
            if self.session_kind == SessionKind::Plain && !external {
                if let Err(error) = session.lock().await.destroy().await {
                    warn!(%error, "failed to destroy session during close");
                }
            }
        }

        if let Some(ConnectionHandle::Owned(connection)) = self.connection.take() {
            if let Err(error) = connection.lock().await.close().await {
                warn!(%error, "failed to close connection");
            }
        }

        self.opened = false;
        info!(hostname = %self.hostname, "client closed");
        Ok(())
    }

    /// Drive the CBS token state machine one step.
    ///
    /// Returns `false` while the handshake is in flight (pumping the
    /// connection once), `true` once no CBS is present or the handshake is
    /// complete. An expired handshake window is fatal.
    pub(crate) async fn auth_complete(&mut self) -> ClientResult<bool> {
        let Some(auth) = self.auth.clone() else {
            return Ok(true);
        };
        let flow = auth.lock().await.handle_token().await?;
        match flow {
            crate::auth::AuthFlow::Complete => Ok(true),
            crate::auth::AuthFlow::InProgress => {
                self.pump().await?;
                Ok(false)
            }
            crate::auth::AuthFlow::Expired => Err(AmqpClientError::AuthTimeout),
        }
    }

    /// Pump the connection state machine once.
    pub(crate) async fn pump(&mut self) -> ClientResult<()> {
        if let Some(handle) = &self.connection {
            handle.connection().lock().await.work().await?;
        }
        Ok(())
    }

    /// Park the connection for a backoff interval.
    pub(crate) async fn connection_sleep(&mut self, duration: Duration) {
        if let Some(handle) = &self.connection {
            handle.connection().lock().await.sleep(duration).await;
        }
    }

    /// Issue a management-node request once authentication has completed.
    pub(crate) async fn mgmt_request(
        &mut self,
        request: Message,
        operation: &str,
        options: MgmtOptions,
    ) -> ClientResult<Message> {
        if !self.opened {
            return Err(AmqpClientError::invalid_argument("client is not open"));
        }
        while !self.auth_complete().await? {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let session = self.session_ref()?;
        let response = session
            .lock()
            .await
            .mgmt_request(request, operation, &options)
            .await?;
        Ok(response)
    }

    /// Rebuild the client against a redirect target: tear down the plain
    /// session, swap hostname and credentials, re-point the connection, and
    /// rebuild the session through the same selection logic as `open()`.
    pub(crate) async fn redirect(
        &mut self,
        info: &RedirectInfo,
        auth: Option<AuthenticatorRef>,
    ) -> ClientResult<()> {
        let connection = match &self.connection {
            Some(handle) => handle.connection().clone(),
            None => return Err(AmqpClientError::invalid_argument("client is not open")),
        };

        if let Some(session) = self.session.take() {
            if self.session_kind == SessionKind::Plain {
                if let Err(error) = session.lock().await.destroy().await {
                    warn!(%error, "failed to destroy session during redirect");
                }
            }
        }

        self.hostname = info.hostname.clone();
        self.port = info.port;
        if let Some(auth) = auth {
            self.auth = Some(auth);
        }

        connection.lock().await.redirect(info).await?;
        self.build_session(&connection).await?;
        info!(hostname = %self.hostname, "client redirected");
        Ok(())
    }

    fn start_keep_alive(&mut self) {
        let Some(interval) = self.keep_alive_interval else {
            return;
        };
        let Some(handle) = &self.connection else {
            return;
        };
        let connection = handle.connection().clone();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            debug!("keep-alive task started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {
                        let mut guard = connection.lock().await;
                        if let Err(error) = guard.work().await {
                            warn!(%error, "keep-alive pump failed, stopping keep-alive");
                            break;
                        }
                    }
                }
            }
            debug!("keep-alive task stopped");
        });

        self.keep_alive = Some(KeepAliveTask {
            handle: task,
            shutdown_tx,
        });
    }

    async fn stop_keep_alive(&mut self) {
        let Some(mut task) = self.keep_alive.take() else {
            return;
        };
        let _ = task.shutdown_tx.send(true);

        match tokio::time::timeout(Duration::from_secs(2), &mut task.handle).await {
            Ok(Ok(())) => debug!("keep-alive task shut down gracefully"),
            Ok(Err(error)) if !error.is_cancelled() => {
                warn!(%error, "keep-alive task ended with error");
            }
            Err(_) => {
                warn!("keep-alive task did not shut down in time, aborting");
                task.handle.abort();
            }
            _ => {}
        }
    }
}

impl Drop for ClientCore {
    fn drop(&mut self) {
        // Callers should close() explicitly; this only stops the background
        // task when they did not.
        if let Some(task) = self.keep_alive.take() {
            let _ = task.shutdown_tx.send(true);
            task.handle.abort();
        }
    }
}

/// The cooperative reactor contract shared by send and receive clients.
///
/// Callers make protocol progress by calling [`do_work`](Self::do_work)
/// repeatedly. The default implementations hold the reactor skeleton in one
/// place; specializations supply the two hooks plus handler teardown.
#[async_trait::async_trait]
pub trait AmqpClient: Send {
    fn core(&self) -> &ClientCore;

    fn core_mut(&mut self) -> &mut ClientCore;

    /// Link construction / open-state check. Returns `false` until the
    /// link handler is usable.
    async fn handler_ready(&mut self) -> ClientResult<bool>;

    /// One iteration of link-specific work. Returns `false` once the
    /// client should stop.
    async fn handler_run(&mut self) -> ClientResult<bool>;

    /// Destroy the link handler, if any.
    async fn detach_handler(&mut self) -> ClientResult<()>;

    /// Open the client over a connection of its own.
    async fn open(&mut self) -> ClientResult<()> {
        self.core_mut().open(None).await
    }

    /// Open the client over an externally supplied shared connection. The
    /// connection is borrowed: it is never destroyed by this client, and
    /// authentication is taken from it.
    async fn open_with_connection(&mut self, connection: ConnectionRef) -> ClientResult<()> {
        self.core_mut().open(Some(connection)).await
    }

    /// Tear down the link, session, and (owned) connection. Idempotent.
    async fn close(&mut self) -> ClientResult<()> {
        self.detach_handler().await?;
        self.core_mut().close().await
    }

    /// One step of the authentication state machine.
    async fn auth_complete(&mut self) -> ClientResult<bool> {
        self.core_mut().auth_complete().await
    }

    /// True only once authentication is complete and the link handler is
    /// open; otherwise pumps the connection once and returns false.
    async fn client_ready(&mut self) -> ClientResult<bool> {
        if !self.core_mut().auth_complete().await? {
            return Ok(false);
        }
        if !self.handler_ready().await? {
            self.core_mut().pump().await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Advance the client one reactor tick. Returns `false` once the
    /// client has shut down; returns `true` without progressing while the
    /// client is not yet ready.
    async fn do_work(&mut self) -> ClientResult<bool> {
        if self.core().is_shutdown() {
            return Ok(false);
        }
        if !self.client_ready().await? {
            return Ok(true);
        }
        self.handler_run().await
    }

    /// Blocking management request; waits for authentication in 50 ms
    /// increments, then performs the exchange on the session.
    async fn mgmt_request(
        &mut self,
        request: Message,
        operation: &str,
        options: MgmtOptions,
    ) -> ClientResult<Message> {
        self.core_mut().mgmt_request(request, operation, options).await
    }
}
