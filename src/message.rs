//! Message types and the per-message delivery state machine
//!
//! A [`Message`] is the unit of work the send and receive clients operate
//! on. On the send side it moves through a monotonic state machine,
//! `WaitingToBeSent -> WaitingForSendAck -> {SendComplete | SendFailed}`,
//! with the single exception of a retry re-arm back to `WaitingToBeSent`.
//! On the receive side it additionally carries a delivery tag and settlement
//! flag used for accept/reject dispositions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::AmqpClientError;

/// Delivery state of a message on the send side.
///
/// A message occupies exactly one state at any time. `SendComplete` and
/// `SendFailed` are terminal ("done") states; a message only leaves
/// `WaitingForSendAck` backwards when a retryable failure re-arms it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    /// Queued locally, not yet handed to the transport.
    WaitingToBeSent,
    /// Handed to the transport, awaiting the delivery outcome.
    WaitingForSendAck,
    /// Settled successfully by the peer.
    SendComplete,
    /// Terminally failed (peer rejection, exhausted retries, or expiry).
    SendFailed,
}

impl MessageState {
    /// Whether this state is terminal.
    pub fn is_done(self) -> bool {
        matches!(self, MessageState::SendComplete | MessageState::SendFailed)
    }
}

/// Terminal outcome recorded on a message once it reaches a done state.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// The peer accepted and settled the delivery.
    Accepted,
    /// The client-side deadline expired before the message was settled.
    /// Expired messages are never retried and never consult the error
    /// policy: this is a local deadline, not a protocol error.
    Timeout,
    /// The delivery failed terminally with the recorded error.
    Failed(AmqpClientError),
}

impl SendOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SendOutcome::Accepted)
    }
}

/// Callback invoked when a message reaches a terminal state.
pub type SendCompleteCallback = Arc<dyn Fn(&Message, &SendOutcome) + Send + Sync>;

/// Callback invoked for each received message before buffering/settlement.
pub type MessageCallback = Arc<dyn Fn(&mut Message) + Send + Sync>;

/// Immutable message properties carried alongside the payload.
///
/// These map onto the AMQP properties section; the orchestration layer
/// treats them opaquely and hands them to the transport untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub subject: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
}

/// A unit of work: payload plus properties plus mutable delivery state.
#[derive(Clone)]
pub struct Message {
    id: Uuid,
    pub payload: Bytes,
    pub properties: MessageProperties,
    pub application_properties: HashMap<String, serde_json::Value>,
    pub(crate) state: MessageState,
    pub(crate) retries: u32,
    pub(crate) enqueued_at: Option<Instant>,
    pub(crate) outcome: Option<SendOutcome>,
    pub(crate) delivery_tag: Option<u64>,
    pub(crate) settled: bool,
    pub(crate) on_send_complete: Option<SendCompleteCallback>,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload: payload.into(),
            properties: MessageProperties {
                creation_time: Some(Utc::now()),
                ..Default::default()
            },
            application_properties: HashMap::new(),
            state: MessageState::WaitingToBeSent,
            retries: 0,
            enqueued_at: None,
            outcome: None,
            delivery_tag: None,
            settled: false,
            on_send_complete: None,
        }
    }

    pub fn with_properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_application_property(
        mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.application_properties.insert(key.into(), value);
        self
    }

    /// Register a callback fired once when the message reaches a terminal
    /// state.
    pub fn on_send_complete(mut self, callback: SendCompleteCallback) -> Self {
        self.on_send_complete = Some(callback);
        self
    }

    /// Internal identity, stable across retries.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> MessageState {
        self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// The terminal outcome, populated once `state().is_done()`.
    pub fn outcome(&self) -> Option<&SendOutcome> {
        self.outcome.as_ref()
    }

    /// Receive side: the transport delivery tag, if any.
    pub fn delivery_tag(&self) -> Option<u64> {
        self.delivery_tag
    }

    /// Receive side: whether a disposition has been queued for this
    /// delivery.
    pub fn is_settled(&self) -> bool {
        self.settled
    }

    /// Time since the message was queued, zero if it never was.
    pub fn age(&self, now: Instant) -> Duration {
        self.enqueued_at
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(Duration::ZERO)
    }

    /// Stamp the queue time and reset the message into the pending pool.
    pub(crate) fn enqueue(&mut self, now: Instant) {
        self.enqueued_at = Some(now);
        self.state = MessageState::WaitingToBeSent;
        self.outcome = None;
        self.delivery_tag = None;
    }

    /// Resolve the message into a terminal state and fire the completion
    /// callback.
    pub(crate) fn resolve(&mut self, outcome: SendOutcome) {
        self.state = if outcome.is_success() {
            MessageState::SendComplete
        } else {
            MessageState::SendFailed
        };
        self.outcome = Some(outcome);
        if let Some(callback) = self.on_send_complete.clone() {
            // outcome was just set above
            if let Some(outcome) = &self.outcome {
                callback(self, outcome);
            }
        }
    }

    /// Re-arm a retryable message back into the waiting pool.
    pub(crate) fn rearm(&mut self, increment_retries: bool) {
        if increment_retries {
            self.retries += 1;
        }
        self.state = MessageState::WaitingToBeSent;
        self.delivery_tag = None;
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("payload_len", &self.payload.len())
            .field("state", &self.state)
            .field("retries", &self.retries)
            .field("outcome", &self.outcome)
            .field("delivery_tag", &self.delivery_tag)
            .field("settled", &self.settled)
            .finish()
    }
}

/// A batch container: expands into its wire-level element messages at queue
/// time. The elements are tracked individually from then on.
#[derive(Debug, Default)]
pub struct MessageBatch {
    messages: Vec<Message>,
}

impl MessageBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Expand the batch into its element messages.
    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_new_message_starts_waiting() {
        let message = Message::new("hello");
        assert_eq!(message.state(), MessageState::WaitingToBeSent);
        assert_eq!(message.retries(), 0);
        assert!(message.outcome().is_none());
        assert!(!message.state().is_done());
    }

    #[test]
    fn test_done_states() {
        assert!(MessageState::SendComplete.is_done());
        assert!(MessageState::SendFailed.is_done());
        assert!(!MessageState::WaitingToBeSent.is_done());
        assert!(!MessageState::WaitingForSendAck.is_done());
    }

    #[test]
    fn test_resolve_success_sets_terminal_state() {
        let mut message = Message::new("hello");
        message.resolve(SendOutcome::Accepted);
        assert_eq!(message.state(), MessageState::SendComplete);
        assert_eq!(message.outcome(), Some(&SendOutcome::Accepted));
    }

    #[test]
    fn test_resolve_timeout_is_failure() {
        let mut message = Message::new("hello");
        message.resolve(SendOutcome::Timeout);
        assert_eq!(message.state(), MessageState::SendFailed);
    }

    #[test]
    fn test_rearm_increments_only_when_asked() {
        let mut message = Message::new("hello");
        message.state = MessageState::WaitingForSendAck;
        message.delivery_tag = Some(7);

        message.rearm(true);
        assert_eq!(message.state(), MessageState::WaitingToBeSent);
        assert_eq!(message.retries(), 1);
        assert_eq!(message.delivery_tag(), None);

        message.state = MessageState::WaitingForSendAck;
        message.rearm(false);
        assert_eq!(message.retries(), 1);
    }

    #[test]
    fn test_send_complete_callback_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let mut message = Message::new("hello").on_send_complete(Arc::new(move |_, outcome| {
            assert!(outcome.is_success());
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        message.resolve(SendOutcome::Accepted);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_batch_expansion() {
        let mut batch = MessageBatch::new();
        batch.push(Message::new("a"));
        batch.push(Message::new("b"));
        batch.push(Message::new("c"));
        assert_eq!(batch.len(), 3);

        let messages = batch.into_messages();
        assert_eq!(messages.len(), 3);
        assert!(messages
            .iter()
            .all(|m| m.state() == MessageState::WaitingToBeSent));
    }

    #[tokio::test]
    async fn test_message_age_tracks_enqueue_time() {
        let mut message = Message::new("hello");
        let start = Instant::now();
        assert_eq!(message.age(start), Duration::ZERO);

        message.enqueue(start);
        let later = start + Duration::from_millis(250);
        assert_eq!(message.age(later), Duration::from_millis(250));
    }
}
