//! Receive client: prefetch credit, delivery buffering, and idle shutdown
//!
//! The receiver link is created with the configured prefetch as its credit
//! window, the hard upper bound on in-flight deliveries. Arriving messages
//! pass through an optional user callback, are auto-settled unless the
//! client is streaming, and land in an internal FIFO buffer that the three
//! access patterns (one-shot batch, callback stream, pull iterator) drain.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{AuthenticatorRef, SaslMechanism};
use crate::client::core::{AmqpClient, ClientCore};
use crate::config::{ClientOptions, ReceiverLinkOptions};
use crate::error::{AmqpClientError, AmqpError, ClientResult};
use crate::message::{Message, MessageCallback};
use crate::transport::{LinkState, ReceiverLink, RedirectInfo, TransportProvider};

/// Sleep inserted under sustained idle load to cap CPU spin.
const IDLE_SLEEP: Duration = Duration::from_millis(50);

const DEFAULT_PREFETCH: u32 = 300;

/// Client that manages receiver link credit and delivers inbound messages.
pub struct ReceiveClient {
    core: ClientCore,
    source: String,
    link: Option<Box<dyn ReceiverLink>>,
    prefetch: u32,
    /// Settle deliveries automatically after the callback runs. Disabled
    /// while a pull iterator is outstanding.
    auto_complete: bool,
    streaming: bool,
    /// Whole-client idle deadline; zero disables it.
    timeout: Duration,
    max_message_size: Option<u64>,
    received: VecDeque<Message>,
    last_activity: Option<Instant>,
    on_message: Option<MessageCallback>,
}

impl ReceiveClient {
    pub fn new(
        hostname: impl Into<String>,
        source: impl Into<String>,
        provider: Arc<dyn TransportProvider>,
        options: ClientOptions,
    ) -> ClientResult<Self> {
        Ok(Self {
            core: ClientCore::new(hostname, provider, options)?,
            source: source.into(),
            link: None,
            prefetch: DEFAULT_PREFETCH,
            auto_complete: true,
            streaming: false,
            timeout: Duration::ZERO,
            max_message_size: None,
            received: VecDeque::new(),
            last_activity: None,
            on_message: None,
        })
    }

    pub fn with_sasl(mut self, sasl: SaslMechanism) -> Self {
        self.core.set_sasl(sasl);
        self
    }

    pub fn with_auth(mut self, auth: AuthenticatorRef) -> Self {
        self.core.set_auth(auth);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.core.set_port(port);
        self
    }

    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.core.set_keep_alive_interval(interval);
        self
    }

    /// Set the link credit window. Also the upper bound on batch sizes.
    pub fn with_prefetch(mut self, prefetch: u32) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_auto_complete(mut self, auto_complete: bool) -> Self {
        self.auto_complete = auto_complete;
        self
    }

    /// Set the whole-client idle timeout: once no delivery has arrived for
    /// this long, the client shuts itself down. Zero disables it.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_message_size(mut self, size: u64) -> Self {
        self.max_message_size = Some(size);
        self
    }

    pub fn prefetch(&self) -> u32 {
        self.prefetch
    }

    /// Number of buffered messages awaiting collection.
    pub fn buffered_message_count(&self) -> usize {
        self.received.len()
    }

    /// Queue an accepted disposition for a message.
    pub fn complete_message(&mut self, message: &mut Message) {
        if message.is_settled() {
            return;
        }
        if let (Some(tag), Some(link)) = (message.delivery_tag(), self.link.as_mut()) {
            link.accept(tag);
            message.settled = true;
        }
    }

    /// Queue a released disposition, returning the delivery to the peer.
    pub fn abandon_message(&mut self, message: &mut Message) {
        if message.is_settled() {
            return;
        }
        if let (Some(tag), Some(link)) = (message.delivery_tag(), self.link.as_mut()) {
            link.release(tag);
            message.settled = true;
        }
    }

    /// Queue a rejected disposition with an optional error.
    pub fn reject_message(&mut self, message: &mut Message, error: Option<AmqpError>) {
        if message.is_settled() {
            return;
        }
        if let (Some(tag), Some(link)) = (message.delivery_tag(), self.link.as_mut()) {
            link.reject(tag, error);
            message.settled = true;
        }
    }

    /// Collect up to `max_batch_size` messages (defaulting to the
    /// configured prefetch, which is also the hard upper bound).
    ///
    /// Buffered messages are drained first; if they satisfy the batch the
    /// call returns without a reactor tick. Otherwise the reactor runs
    /// until the batch fills, the optional deadline passes, or a tick
    /// yields nothing new while some messages are already in hand. That
    /// early return is a best-effort "drained for now" heuristic, not a
    /// guarantee that no more messages would arrive within the deadline;
    /// callers must not assume an exact batch size.
    pub async fn receive_message_batch(
        &mut self,
        max_batch_size: Option<usize>,
        on_message_received: Option<MessageCallback>,
        timeout: Duration,
    ) -> ClientResult<Vec<Message>> {
        let size = max_batch_size.unwrap_or(self.prefetch as usize);
        if size > self.prefetch as usize {
            return Err(AmqpClientError::invalid_argument(format!(
                "max_batch_size ({size}) cannot exceed the configured prefetch ({})",
                self.prefetch
            )));
        }
        if let Some(callback) = on_message_received {
            self.on_message = Some(callback);
        }
        self.open().await?;

        let mut batch = Vec::with_capacity(size);
        Self::drain_into(&mut self.received, &mut batch, size);
        if batch.len() == size {
            return Ok(batch);
        }

        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        loop {
            if self.core.is_shutdown() {
                break;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    break;
                }
            }
            let before = self.received.len() + batch.len();
            if !self.do_work().await? {
                break;
            }
            let got_new = self.received.len() + batch.len() > before;
            Self::drain_into(&mut self.received, &mut batch, size);
            if batch.len() == size {
                break;
            }
            if !got_new && !batch.is_empty() {
                break;
            }
        }
        Ok(batch)
    }

    /// Stream messages through the callback until shutdown, a fatal error,
    /// or idle timeout. The client is closed in every exit path.
    pub async fn receive_messages(
        &mut self,
        on_message_received: MessageCallback,
    ) -> ClientResult<()> {
        self.on_message = Some(on_message_received);
        self.streaming = true;
        let result = self.streaming_loop().await;
        self.streaming = false;
        let closed = self.close().await;
        result.and(closed)
    }

    async fn streaming_loop(&mut self) -> ClientResult<()> {
        self.open().await?;
        while self.do_work().await? {}
        Ok(())
    }

    /// Lazy, non-restartable pull sequence over inbound messages.
    ///
    /// While the iterator is outstanding, auto-completion is disabled: the
    /// consumer owns settlement and should accept/reject inside its loop.
    /// When the iterator is dropped, the previous auto-complete setting is
    /// restored and, if auto-completion was on, the most recently yielded
    /// message has an accepted disposition queued, flushed on the client's
    /// next reactor tick.
    pub fn receive_messages_iter(
        &mut self,
        on_message_received: Option<MessageCallback>,
    ) -> ReceiveIter<'_> {
        if let Some(callback) = on_message_received {
            self.on_message = Some(callback);
        }
        let saved_auto_complete = self.auto_complete;
        self.auto_complete = false;
        ReceiveIter {
            client: self,
            saved_auto_complete,
            last_tag: None,
            done: false,
        }
    }

    /// Redirect the client to a new endpoint. Not available over a shared
    /// external connection; buffered messages and activity state are
    /// discarded before the rebuild.
    pub async fn redirect(
        &mut self,
        info: &RedirectInfo,
        auth: Option<AuthenticatorRef>,
    ) -> ClientResult<()> {
        if self.core.is_external() {
            return Err(AmqpClientError::configuration(
                "redirect is not supported on a shared connection",
            ));
        }
        if let Some(mut link) = self.link.take() {
            if let Err(error) = link.destroy().await {
                warn!(%error, "failed to destroy receiver link during redirect");
            }
        }
        self.received.clear();
        self.last_activity = None;
        self.core.clear_shutdown();
        self.core.redirect(info, auth).await
    }

    fn drain_into(buffer: &mut VecDeque<Message>, batch: &mut Vec<Message>, size: usize) {
        while batch.len() < size {
            match buffer.pop_front() {
                Some(message) => batch.push(message),
                None => break,
            }
        }
    }
}

#[async_trait::async_trait]
impl AmqpClient for ReceiveClient {
    fn core(&self) -> &ClientCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ClientCore {
        &mut self.core
    }

    /// Lazily construct the receiver link with the prefetch credit window;
    /// afterwards report readiness from the link state, refreshing the
    /// activity timestamp while the link is still coming up.
    async fn handler_ready(&mut self) -> ClientResult<bool> {
        match &self.link {
            None => {
                let session = self.core.session_ref()?;
                let name = format!("receiver-{}", Uuid::new_v4());
                let options = ReceiverLinkOptions {
                    name: name.clone(),
                    source: self.source.clone(),
                    receive_settle_mode: self.core.options().receive_settle_mode,
                    prefetch: self.prefetch,
                    max_message_size: self.max_message_size,
                    desired_capabilities: self.core.options().desired_capabilities.clone(),
                    properties: self.core.options().properties.clone(),
                };
                let mut link = session.lock().await.create_receiver(&options).await?;
                link.open().await?;
                debug!(link = %name, source = %self.source, prefetch = self.prefetch, "receiver link created");
                self.link = Some(link);
                self.last_activity = Some(Instant::now());
                Ok(false)
            }
            Some(link) => match link.state() {
                LinkState::Open => Ok(true),
                LinkState::Error(error) => Err(AmqpClientError::Handler(error)),
                _ => {
                    self.last_activity = Some(Instant::now());
                    Ok(false)
                }
            },
        }
    }

    /// One receive tick: pump the link and connection, drain deliveries,
    /// and apply the idle-timeout bookkeeping.
    async fn handler_run(&mut self) -> ClientResult<bool> {
        let Some(link) = self.link.as_mut() else {
            return Ok(true);
        };
        link.work().await?;
        self.core.pump().await?;

        let mut arrived = 0u32;
        while let Some(mut message) = link.poll_delivery() {
            arrived += 1;
            if let Some(callback) = &self.on_message {
                callback(&mut message);
            }
            if !self.streaming {
                if self.auto_complete && !message.settled {
                    if let Some(tag) = message.delivery_tag {
                        link.accept(tag);
                        message.settled = true;
                    }
                }
                self.received.push_back(message);
            } else if !message.settled {
                debug!(
                    tag = ?message.delivery_tag,
                    "streaming message left unsettled by handler"
                );
            }
        }

        if arrived > 0 {
            // Replenish the credit window for what was consumed.
            link.flow(arrived);
            self.last_activity = Some(Instant::now());
        } else if self.last_activity.is_some() {
            tokio::time::sleep(IDLE_SLEEP).await;
            if !self.timeout.is_zero() {
                let elapsed = self
                    .last_activity
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.timeout {
                    info!(
                        idle_ms = elapsed.as_millis() as u64,
                        "idle timeout reached, shutting down receiver"
                    );
                    self.core.request_shutdown();
                    return Ok(false);
                }
            } else {
                self.last_activity = Some(Instant::now());
            }
        }

        Ok(true)
    }

    async fn detach_handler(&mut self) -> ClientResult<()> {
        if let Some(mut link) = self.link.take() {
            if let Err(error) = link.destroy().await {
                warn!(%error, "failed to destroy receiver link");
            }
        }
        Ok(())
    }
}

/// Pull iterator over inbound messages. Non-restartable; see
/// [`ReceiveClient::receive_messages_iter`].
pub struct ReceiveIter<'a> {
    client: &'a mut ReceiveClient,
    saved_auto_complete: bool,
    last_tag: Option<u64>,
    done: bool,
}

impl ReceiveIter<'_> {
    /// Pull the next message, opening the client on first use. Returns
    /// `None` once the client shuts down.
    pub async fn next(&mut self) -> ClientResult<Option<Message>> {
        if self.done {
            return Ok(None);
        }
        self.client.open().await?;
        loop {
            if let Some(message) = self.client.received.pop_front() {
                self.last_tag = if message.is_settled() {
                    None
                } else {
                    message.delivery_tag()
                };
                return Ok(Some(message));
            }
            if self.client.core.is_shutdown() {
                self.done = true;
                return Ok(None);
            }
            if !self.client.do_work().await? {
                self.done = true;
                return Ok(None);
            }
        }
    }
}

impl Drop for ReceiveIter<'_> {
    fn drop(&mut self) {
        self.client.auto_complete = self.saved_auto_complete;
        if self.saved_auto_complete {
            if let (Some(tag), Some(link)) = (self.last_tag, self.client.link.as_mut()) {
                link.accept(tag);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockProvider;

    #[test]
    fn test_receiver_defaults() {
        let provider = Arc::new(MockProvider::new());
        let client = ReceiveClient::new(
            "amqp.example.com",
            "hub/partition/0",
            provider,
            ClientOptions::default(),
        )
        .unwrap();
        assert_eq!(client.prefetch(), DEFAULT_PREFETCH);
        assert_eq!(client.buffered_message_count(), 0);
    }
}
