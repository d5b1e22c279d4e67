//! Send client: queued messages driven through a per-message retry engine
//!
//! Each queued message advances through the delivery state machine one
//! reactor tick at a time: pending sends are timed out locally or handed to
//! the sender link, delivery outcomes are drained in transport-report order
//! and classified through the error policy, and retryable failures re-arm
//! the message with a recorded backoff that parks the connection once no
//! delivery is awaiting acknowledgement.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{AuthenticatorRef, SaslMechanism};
use crate::client::core::{AmqpClient, ClientCore};
use crate::config::{ClientOptions, SenderLinkOptions};
use crate::error::{AmqpClientError, AmqpError, ClientResult, ErrorCondition};
use crate::message::{Message, MessageBatch, MessageState, SendOutcome};
use crate::policy::ErrorPolicy;
use crate::transport::{DeliveryOutcome, LinkState, RedirectInfo, SenderLink, TransportProvider};

/// Client that queues outbound messages and drives each to a terminal
/// state.
///
/// Messages never raise out of `do_work()`: failures are resolved into the
/// message's terminal outcome and surfaced in aggregate by the blocking
/// send APIs.
pub struct SendClient {
    core: ClientCore,
    target: String,
    link: Option<Box<dyn SenderLink>>,
    policy: ErrorPolicy,
    /// Per-message deadline measured from queue time; zero disables it.
    msg_timeout: Duration,
    max_message_size: Option<u64>,
    pending: Vec<Message>,
    backoff: Option<Duration>,
}

impl SendClient {
    pub fn new(
        hostname: impl Into<String>,
        target: impl Into<String>,
        provider: Arc<dyn TransportProvider>,
        options: ClientOptions,
    ) -> ClientResult<Self> {
        Ok(Self {
            core: ClientCore::new(hostname, provider, options)?,
            target: target.into(),
            link: None,
            policy: ErrorPolicy::default(),
            msg_timeout: Duration::ZERO,
            max_message_size: None,
            pending: Vec::new(),
            backoff: None,
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

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the per-message send deadline. Zero (the default) disables it.
    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.msg_timeout = timeout;
        self
    }

    pub fn with_max_message_size(mut self, size: u64) -> Self {
        self.max_message_size = Some(size);
        self
    }

    /// Queue a message for sending. Non-blocking; safe before `open()`.
    pub fn queue_message(&mut self, mut message: Message) {
        message.enqueue(Instant::now());
        self.pending.push(message);
    }

    /// Queue several messages at once.
    pub fn queue_messages(&mut self, messages: impl IntoIterator<Item = Message>) {
        for message in messages {
            self.queue_message(message);
        }
    }

    /// Expand a batch into its element messages and queue each.
    pub fn queue_batch(&mut self, batch: MessageBatch) {
        self.queue_messages(batch.into_messages());
    }

    /// Whether any queued message has not yet reached a terminal state.
    pub fn messages_pending(&self) -> bool {
        self.pending.iter().any(|m| !m.state().is_done())
    }

    /// All messages still held by the client, including terminal ones not
    /// yet collected.
    pub fn pending_messages(&self) -> &[Message] {
        &self.pending
    }

    /// Remove and return every message that has reached a terminal state.
    pub fn collect_completed(&mut self) -> Vec<Message> {
        let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|m| m.state().is_done());
        self.pending = pending;
        done
    }

    /// Drive `do_work()` until the pending queue drains or the client
    /// shuts down. Returns whether the client is still usable.
    pub async fn wait(&mut self) -> ClientResult<bool> {
        while self.messages_pending() {
            if !self.do_work().await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Synchronous convenience path: queue the given messages, open, and
    /// drive the reactor until every element of this batch is terminal.
    ///
    /// Returns the terminal messages on full success; fails with an
    /// aggregate [`AmqpClientError::SendFailed`] describing the failed
    /// subset otherwise.
    pub async fn send_message(
        &mut self,
        messages: impl IntoIterator<Item = Message>,
        close_on_done: bool,
    ) -> ClientResult<Vec<Message>> {
        let mut ids = Vec::new();
        for message in messages {
            ids.push(message.id());
            self.queue_message(message);
        }

        self.open().await?;
        loop {
            let batch_done = self
                .pending
                .iter()
                .filter(|m| ids.contains(&m.id()))
                .all(|m| m.state().is_done());
            if batch_done {
                break;
            }
            if !self.do_work().await? {
                break;
            }
        }

        let (batch, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|m| ids.contains(&m.id()));
        self.pending = rest;

        let errors: Vec<AmqpClientError> = batch
            .iter()
            .filter_map(|m| match m.outcome() {
                Some(SendOutcome::Failed(error)) => Some(error.clone()),
                Some(SendOutcome::Timeout) => Some(AmqpClientError::timeout(
                    "message expired before acknowledgement",
                )),
                Some(SendOutcome::Accepted) => None,
                // Shutdown mid-flight leaves messages unresolved.
                None => Some(AmqpClientError::ClientClosed),
            })
            .collect();

        if close_on_done {
            self.close().await?;
        }

        if errors.is_empty() {
            Ok(batch)
        } else {
            Err(AmqpClientError::SendFailed {
                total: batch.len(),
                failed: errors.len(),
                errors,
            })
        }
    }

    /// Open and wait for the entire pending queue (as of the call) to
    /// drain, then return the terminal state of each of those messages in
    /// queue order.
    pub async fn send_all_messages(
        &mut self,
        close_on_done: bool,
    ) -> ClientResult<Vec<MessageState>> {
        self.open().await?;
        let ids: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|m| !m.state().is_done())
            .map(Message::id)
            .collect();

        self.wait().await?;

        let (batch, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|m| ids.contains(&m.id()));
        self.pending = rest;
        let states = batch.iter().map(|m| m.state()).collect();

        if close_on_done {
            self.close().await?;
        }
        Ok(states)
    }

    /// Redirect the client to a new endpoint. Not available over a shared
    /// external connection. In-flight sends are re-queued for the new link.
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
                warn!(%error, "failed to destroy sender link during redirect");
            }
        }
        self.backoff = None;
        for message in self.pending.iter_mut() {
            if message.state() == MessageState::WaitingForSendAck {
                message.rearm(false);
            }
        }
        self.core.clear_shutdown();
        self.core.redirect(info, auth).await
    }

    /// Map a non-accepted delivery outcome onto the protocol error used
    /// for classification.
    fn failure_error(outcome: DeliveryOutcome) -> AmqpError {
        match outcome {
            DeliveryOutcome::Rejected(error) => error,
            DeliveryOutcome::Released => {
                AmqpError::new(ErrorCondition::Custom("delivery-released".to_string()))
                    .with_description("delivery released by peer")
            }
            DeliveryOutcome::Modified {
                delivery_failed,
                undeliverable_here,
            } => AmqpError::new(ErrorCondition::Custom("delivery-modified".to_string()))
                .with_description(format!(
                    "delivery modified by peer (delivery_failed={delivery_failed}, \
                     undeliverable_here={undeliverable_here})"
                )),
            DeliveryOutcome::Unknown => AmqpError::unknown(),
            DeliveryOutcome::Accepted => AmqpError::unknown(),
        }
    }

    /// Resolve one delivery outcome against its message.
    fn apply_outcome(
        policy: &ErrorPolicy,
        backoff: &mut Option<Duration>,
        message: &mut Message,
        outcome: DeliveryOutcome,
    ) {
        if outcome == DeliveryOutcome::Accepted {
            debug!(message_id = %message.id(), "message settled by peer");
            message.resolve(SendOutcome::Accepted);
            return;
        }
        Self::apply_failure(policy, backoff, message, Self::failure_error(outcome));
    }

    /// Classify a delivery failure and either re-arm the message or
    /// resolve it as failed.
    fn apply_failure(
        policy: &ErrorPolicy,
        backoff: &mut Option<Duration>,
        message: &mut Message,
        error: AmqpError,
    ) {
        let action = policy.classify(&error, message.retries());
        if action.retry && message.retries() < policy.max_retries {
            debug!(
                message_id = %message.id(),
                retries = message.retries(),
                condition = %error.condition,
                "retrying message after delivery failure"
            );
            message.rearm(action.increment_retries);
            *backoff = Some(match *backoff {
                Some(current) => current.max(action.backoff),
                None => action.backoff,
            });
        } else {
            info!(
                message_id = %message.id(),
                retries = message.retries(),
                condition = %error.condition,
                "message failed terminally"
            );
            message.resolve(SendOutcome::Failed(AmqpClientError::Amqp(error)));
        }
    }
}

#[async_trait::async_trait]
impl AmqpClient for SendClient {
    fn core(&self) -> &ClientCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ClientCore {
        &mut self.core
    }

    /// Lazily construct the sender link on first call; afterwards report
    /// readiness from the link state.
    async fn handler_ready(&mut self) -> ClientResult<bool> {
        match &self.link {
            None => {
                let session = self.core.session_ref()?;
                let name = format!("sender-{}", Uuid::new_v4());
                let options = SenderLinkOptions {
                    name: name.clone(),
                    target: self.target.clone(),
                    send_settle_mode: self.core.options().send_settle_mode,
                    max_message_size: self.max_message_size,
                    desired_capabilities: self.core.options().desired_capabilities.clone(),
                    properties: self.core.options().properties.clone(),
                };
                let mut link = session.lock().await.create_sender(&options).await?;
                link.open().await?;
                debug!(link = %name, target = %self.target, "sender link created");
                self.link = Some(link);
                // One more cycle before the link can report open.
                Ok(false)
            }
            Some(link) => match link.state() {
                LinkState::Open => Ok(true),
                LinkState::Error(error) => Err(AmqpClientError::Handler(error)),
                _ => Ok(false),
            },
        }
    }

    /// One tick of the retry/backoff engine.
    async fn handler_run(&mut self) -> ClientResult<bool> {
        let Some(link) = self.link.as_mut() else {
            return Ok(true);
        };
        link.work().await?;

        // Outcomes resolve in the order the transport reported them, not
        // enqueue order.
        for (tag, outcome) in link.poll_outcomes() {
            let found = self.pending.iter_mut().find(|m| {
                m.delivery_tag() == Some(tag) && m.state() == MessageState::WaitingForSendAck
            });
            match found {
                Some(message) => {
                    Self::apply_outcome(&self.policy, &mut self.backoff, message, outcome)
                }
                None => debug!(tag, "delivery outcome for an unknown or settled delivery"),
            }
        }

        let now = Instant::now();
        let mut waiting = 0usize;
        for message in self.pending.iter_mut() {
            match message.state() {
                MessageState::WaitingForSendAck => waiting += 1,
                MessageState::WaitingToBeSent => {
                    let mut remaining = Duration::ZERO;
                    if !self.msg_timeout.is_zero() {
                        let age = message.age(now);
                        if age >= self.msg_timeout {
                            debug!(message_id = %message.id(), "message expired before transmission");
                            message.resolve(SendOutcome::Timeout);
                            continue;
                        }
                        remaining = self.msg_timeout - age;
                    }
                    match link.send(message, remaining) {
                        Ok(tag) => {
                            message.delivery_tag = Some(tag);
                            message.state = MessageState::WaitingForSendAck;
                            waiting += 1;
                        }
                        Err(error) => {
                            let amqp = match error {
                                AmqpClientError::Amqp(e) => e,
                                other => AmqpError::unknown().with_description(other.to_string()),
                            };
                            Self::apply_failure(&self.policy, &mut self.backoff, message, amqp);
                        }
                    }
                }
                _ => {}
            }
        }

        if let Some(backoff) = self.backoff {
            if waiting == 0 {
                info!(backoff_ms = backoff.as_millis() as u64, "backing off before next attempt");
                self.core.connection_sleep(backoff).await;
                self.backoff = None;
            }
        }

        self.core.pump().await?;
        Ok(true)
    }

    async fn detach_handler(&mut self) -> ClientResult<()> {
        if let Some(mut link) = self.link.take() {
            if let Err(error) = link.destroy().await {
                warn!(%error, "failed to destroy sender link");
            }
        }
        Ok(())
    }
}
