//! Mock transport provider for testing
//!
//! A [`MockScript`] is a shared recorder-plus-script: tests configure
//! delivery outcomes, inbound deliveries, link delays, and failure
//! injection up front, then inspect what the client drove the transport to
//! do. All mock connections, sessions, and links created from one script
//! share its state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;

use crate::auth::{AccessToken, Authenticator, AuthenticatorRef, AuthFlow};
use crate::config::{ReceiverLinkOptions, SenderLinkOptions, SessionOptions};
use crate::error::{AmqpClientError, AmqpError, ClientResult};
use crate::message::Message;
use crate::transport::{
    AmqpConnection, AmqpSession, CbsState, ConnectionRef, ConnectionTarget, DeliveryOutcome,
    LinkState, MgmtOptions, ReceiverLink, RedirectInfo, SenderLink, SessionRef,
    TransportProvider,
};

struct ScriptState {
    // Connection
    connect_targets: Vec<ConnectionTarget>,
    connection_work_calls: usize,
    connection_sleeps: Vec<Duration>,
    connection_closed: bool,
    redirects: Vec<RedirectInfo>,
    sessions_created: usize,
    sessions_destroyed: usize,
    connection_work_error: Option<AmqpClientError>,
    // CBS
    cbs_state: CbsState,
    cbs_works_until_open: u32,
    tokens_put: Vec<(String, AccessToken)>,
    // Sender link
    sender_links_created: usize,
    sender_links_destroyed: usize,
    sender_open_delay: u32,
    sender_link_error: Option<AmqpError>,
    send_error: Option<AmqpError>,
    outcomes: VecDeque<DeliveryOutcome>,
    default_outcome: Option<DeliveryOutcome>,
    sends: Vec<Bytes>,
    send_timeouts: Vec<Duration>,
    pending_acks: VecDeque<u64>,
    ready_outcomes: Vec<(u64, DeliveryOutcome)>,
    next_tag: u64,
    // Receiver link
    receiver_links_created: usize,
    receiver_links_destroyed: usize,
    receiver_open_delay: u32,
    receiver_link_error: Option<AmqpError>,
    receiver_prefetch: Option<u32>,
    deliveries: VecDeque<Message>,
    deliveries_per_tick: usize,
    tick_budget: usize,
    accepted: Vec<u64>,
    released: Vec<u64>,
    rejected: Vec<u64>,
    flows: Vec<u32>,
    // Management
    mgmt_operations: Vec<String>,
    mgmt_responses: VecDeque<Message>,
}

impl Default for ScriptState {
    fn default() -> Self {
        Self {
            connect_targets: Vec::new(),
            connection_work_calls: 0,
            connection_sleeps: Vec::new(),
            connection_closed: false,
            redirects: Vec::new(),
            sessions_created: 0,
            sessions_destroyed: 0,
            connection_work_error: None,
            cbs_state: CbsState::NoCbs,
            cbs_works_until_open: 1,
            tokens_put: Vec::new(),
            sender_links_created: 0,
            sender_links_destroyed: 0,
            sender_open_delay: 0,
            sender_link_error: None,
            send_error: None,
            outcomes: VecDeque::new(),
            default_outcome: None,
            sends: Vec::new(),
            send_timeouts: Vec::new(),
            pending_acks: VecDeque::new(),
            ready_outcomes: Vec::new(),
            next_tag: 0,
            receiver_links_created: 0,
            receiver_links_destroyed: 0,
            receiver_open_delay: 0,
            receiver_link_error: None,
            receiver_prefetch: None,
            deliveries: VecDeque::new(),
            deliveries_per_tick: usize::MAX,
            tick_budget: 0,
            accepted: Vec::new(),
            released: Vec::new(),
            rejected: Vec::new(),
            flows: Vec::new(),
            mgmt_operations: Vec::new(),
            mgmt_responses: VecDeque::new(),
        }
    }
}

/// Shared script/recorder for one mock transport universe.
#[derive(Clone, Default)]
pub struct MockScript {
    inner: Arc<StdMutex<ScriptState>>,
}

impl MockScript {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut ScriptState) -> R) -> R {
        let mut state = self.inner.lock().expect("mock script poisoned");
        f(&mut state)
    }

    // --- scripting ---

    /// Queue one delivery outcome, consumed in FIFO order by sent
    /// deliveries.
    pub fn push_outcome(&self, outcome: DeliveryOutcome) {
        self.with(|s| s.outcomes.push_back(outcome));
    }

    /// Outcome applied whenever the queue is empty.
    pub fn set_default_outcome(&self, outcome: DeliveryOutcome) {
        self.with(|s| s.default_outcome = Some(outcome));
    }

    /// Fail every `send()` call with the given error.
    pub fn set_send_error(&self, error: AmqpError) {
        self.with(|s| s.send_error = Some(error));
    }

    /// Put the sender link into an error state.
    pub fn set_sender_link_error(&self, error: AmqpError) {
        self.with(|s| s.sender_link_error = Some(error));
    }

    /// Number of `state()` polls before links report `Open`.
    pub fn set_sender_open_delay(&self, polls: u32) {
        self.with(|s| s.sender_open_delay = polls);
    }

    pub fn set_receiver_open_delay(&self, polls: u32) {
        self.with(|s| s.receiver_open_delay = polls);
    }

    pub fn set_receiver_link_error(&self, error: AmqpError) {
        self.with(|s| s.receiver_link_error = Some(error));
    }

    /// Queue an inbound delivery.
    pub fn push_delivery(&self, message: Message) {
        self.with(|s| s.deliveries.push_back(message));
    }

    /// Cap how many queued deliveries surface per link `work()` call.
    pub fn set_deliveries_per_tick(&self, count: usize) {
        self.with(|s| s.deliveries_per_tick = count);
    }

    /// How many connection `work()` calls the CBS handshake needs before
    /// reporting open.
    pub fn set_cbs_works_until_open(&self, works: u32) {
        self.with(|s| s.cbs_works_until_open = works);
    }

    /// Fail every connection `work()` call with the given error.
    pub fn set_connection_work_error(&self, error: AmqpClientError) {
        self.with(|s| s.connection_work_error = Some(error));
    }

    pub fn push_mgmt_response(&self, response: Message) {
        self.with(|s| s.mgmt_responses.push_back(response));
    }

    // --- inspection ---

    pub fn connect_targets(&self) -> Vec<ConnectionTarget> {
        self.with(|s| s.connect_targets.clone())
    }

    pub fn connection_work_calls(&self) -> usize {
        self.with(|s| s.connection_work_calls)
    }

    pub fn connection_sleeps(&self) -> Vec<Duration> {
        self.with(|s| s.connection_sleeps.clone())
    }

    pub fn connection_closed(&self) -> bool {
        self.with(|s| s.connection_closed)
    }

    pub fn redirects(&self) -> Vec<RedirectInfo> {
        self.with(|s| s.redirects.clone())
    }

    pub fn sessions_created(&self) -> usize {
        self.with(|s| s.sessions_created)
    }

    pub fn sessions_destroyed(&self) -> usize {
        self.with(|s| s.sessions_destroyed)
    }

    pub fn tokens_put(&self) -> Vec<(String, AccessToken)> {
        self.with(|s| s.tokens_put.clone())
    }

    pub fn sender_links_created(&self) -> usize {
        self.with(|s| s.sender_links_created)
    }

    pub fn sender_links_destroyed(&self) -> usize {
        self.with(|s| s.sender_links_destroyed)
    }

    pub fn sends(&self) -> Vec<Bytes> {
        self.with(|s| s.sends.clone())
    }

    pub fn send_timeouts(&self) -> Vec<Duration> {
        self.with(|s| s.send_timeouts.clone())
    }

    pub fn receiver_links_created(&self) -> usize {
        self.with(|s| s.receiver_links_created)
    }

    pub fn receiver_links_destroyed(&self) -> usize {
        self.with(|s| s.receiver_links_destroyed)
    }

    pub fn receiver_prefetch(&self) -> Option<u32> {
        self.with(|s| s.receiver_prefetch)
    }

    pub fn accepted(&self) -> Vec<u64> {
        self.with(|s| s.accepted.clone())
    }

    pub fn released(&self) -> Vec<u64> {
        self.with(|s| s.released.clone())
    }

    pub fn rejected(&self) -> Vec<u64> {
        self.with(|s| s.rejected.clone())
    }

    pub fn flows(&self) -> Vec<u32> {
        self.with(|s| s.flows.clone())
    }

    pub fn mgmt_operations(&self) -> Vec<String> {
        self.with(|s| s.mgmt_operations.clone())
    }

    /// Build an external (shared) connection over this script.
    pub fn external_connection(&self, authenticator: Option<AuthenticatorRef>) -> ConnectionRef {
        let connection: ConnectionRef = Arc::new(Mutex::new(MockConnection {
            script: self.clone(),
            container_id: "external-container".to_string(),
            hostname: "external.example.com".to_string(),
            cbs_session: None,
            authenticator,
        }));
        connection
    }
}

/// Provider handing out mock connections bound to one script.
pub struct MockProvider {
    script: MockScript,
    fail_connect: Option<AmqpClientError>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            script: MockScript::new(),
            fail_connect: None,
        }
    }

    pub fn with_script(script: MockScript) -> Self {
        Self {
            script,
            fail_connect: None,
        }
    }

    pub fn failing(error: AmqpClientError) -> Self {
        Self {
            script: MockScript::new(),
            fail_connect: Some(error),
        }
    }

    pub fn script(&self) -> MockScript {
        self.script.clone()
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TransportProvider for MockProvider {
    async fn connect(
        &self,
        target: &ConnectionTarget,
        _options: &crate::config::ClientOptions,
    ) -> ClientResult<ConnectionRef> {
        if let Some(error) = &self.fail_connect {
            return Err(error.clone());
        }
        self.script.with(|s| s.connect_targets.push(target.clone()));
        let connection: ConnectionRef = Arc::new(Mutex::new(MockConnection {
            script: self.script.clone(),
            container_id: target.container_id.clone(),
            hostname: target.hostname.clone(),
            cbs_session: None,
            authenticator: None,
        }));
        Ok(connection)
    }
}

/// Scripted connection.
pub struct MockConnection {
    script: MockScript,
    container_id: String,
    hostname: String,
    cbs_session: Option<SessionRef>,
    authenticator: Option<AuthenticatorRef>,
}

#[async_trait::async_trait]
impl AmqpConnection for MockConnection {
    fn container_id(&self) -> &str {
        &self.container_id
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn work(&mut self) -> ClientResult<()> {
        self.script.with(|s| {
            if let Some(error) = &s.connection_work_error {
                return Err(error.clone());
            }
            s.connection_work_calls += 1;
            if s.cbs_state == CbsState::InProgress {
                if s.cbs_works_until_open <= 1 {
                    s.cbs_state = CbsState::Open;
                } else {
                    s.cbs_works_until_open -= 1;
                }
            }
            Ok(())
        })
    }

    async fn sleep(&mut self, duration: Duration) {
        self.script.with(|s| s.connection_sleeps.push(duration));
        tokio::time::sleep(duration).await;
    }

    async fn create_session(&mut self, _options: &SessionOptions) -> ClientResult<SessionRef> {
        self.script.with(|s| s.sessions_created += 1);
        let session: SessionRef = Arc::new(Mutex::new(MockSession {
            script: self.script.clone(),
        }));
        Ok(session)
    }

    fn cbs_session(&self) -> Option<SessionRef> {
        self.cbs_session.clone()
    }

    fn cbs_state(&self) -> CbsState {
        self.script.with(|s| s.cbs_state.clone())
    }

    async fn attach_cbs(&mut self, audience: &str, token: AccessToken) -> ClientResult<()> {
        self.script.with(|s| {
            s.tokens_put.push((audience.to_string(), token));
            s.cbs_state = CbsState::InProgress;
        });
        if self.cbs_session.is_none() {
            self.script.with(|s| s.sessions_created += 1);
            let session: SessionRef = Arc::new(Mutex::new(MockSession {
                script: self.script.clone(),
            }));
            self.cbs_session = Some(session);
        }
        Ok(())
    }

    fn authenticator(&self) -> Option<AuthenticatorRef> {
        self.authenticator.clone()
    }

    async fn redirect(&mut self, info: &RedirectInfo) -> ClientResult<()> {
        self.hostname = info.hostname.clone();
        self.script.with(|s| s.redirects.push(info.clone()));
        Ok(())
    }

    async fn close(&mut self) -> ClientResult<()> {
        self.script.with(|s| s.connection_closed = true);
        Ok(())
    }
}

/// Scripted session.
pub struct MockSession {
    script: MockScript,
}

#[async_trait::async_trait]
impl AmqpSession for MockSession {
    async fn create_sender(
        &mut self,
        _options: &SenderLinkOptions,
    ) -> ClientResult<Box<dyn SenderLink>> {
        let delay = self.script.with(|s| {
            s.sender_links_created += 1;
            s.sender_open_delay
        });
        let link: Box<dyn SenderLink> = Box::new(MockSenderLink {
            script: self.script.clone(),
            name: "mock-sender".to_string(),
            opened: false,
            remaining_delay: delay,
        });
        Ok(link)
    }

    async fn create_receiver(
        &mut self,
        options: &ReceiverLinkOptions,
    ) -> ClientResult<Box<dyn ReceiverLink>> {
        let delay = self.script.with(|s| {
            s.receiver_links_created += 1;
            s.receiver_prefetch = Some(options.prefetch);
            s.receiver_open_delay
        });
        let link: Box<dyn ReceiverLink> = Box::new(MockReceiverLink {
            script: self.script.clone(),
            name: "mock-receiver".to_string(),
            opened: false,
            remaining_delay: delay,
        });
        Ok(link)
    }

    async fn mgmt_request(
        &mut self,
        _request: Message,
        operation: &str,
        _options: &MgmtOptions,
    ) -> ClientResult<Message> {
        self.script
            .with(|s| s.mgmt_operations.push(operation.to_string()));
        let scripted = self.script.with(|s| s.mgmt_responses.pop_front());
        Ok(scripted.unwrap_or_else(|| Message::new(Bytes::new())))
    }

    async fn destroy(&mut self) -> ClientResult<()> {
        self.script.with(|s| s.sessions_destroyed += 1);
        Ok(())
    }
}

/// Scripted sender link.
pub struct MockSenderLink {
    script: MockScript,
    name: String,
    opened: bool,
    remaining_delay: u32,
}

#[async_trait::async_trait]
impl SenderLink for MockSenderLink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&mut self) -> ClientResult<()> {
        self.opened = true;
        Ok(())
    }

    fn state(&self) -> LinkState {
        if let Some(error) = self.script.with(|s| s.sender_link_error.clone()) {
            return LinkState::Error(error);
        }
        if !self.opened {
            return LinkState::Pending;
        }
        if self.remaining_delay > 0 {
            return LinkState::Pending;
        }
        LinkState::Open
    }

    async fn work(&mut self) -> ClientResult<()> {
        if self.remaining_delay > 0 {
            self.remaining_delay -= 1;
        }
        // Resolve pending deliveries against the scripted outcomes.
        self.script.with(|s| {
            while let Some(tag) = s.pending_acks.front().copied() {
                let outcome = match s.outcomes.pop_front() {
                    Some(outcome) => outcome,
                    None => match &s.default_outcome {
                        Some(outcome) => outcome.clone(),
                        None => break,
                    },
                };
                s.pending_acks.pop_front();
                s.ready_outcomes.push((tag, outcome));
            }
        });
        Ok(())
    }

    fn send(&mut self, message: &Message, timeout: Duration) -> ClientResult<u64> {
        self.script.with(|s| {
            if let Some(error) = &s.send_error {
                return Err(AmqpClientError::Amqp(error.clone()));
            }
            let tag = s.next_tag;
            s.next_tag += 1;
            s.sends.push(message.payload.clone());
            s.send_timeouts.push(timeout);
            s.pending_acks.push_back(tag);
            Ok(tag)
        })
    }

    fn poll_outcomes(&mut self) -> Vec<(u64, DeliveryOutcome)> {
        self.script.with(|s| std::mem::take(&mut s.ready_outcomes))
    }

    async fn destroy(&mut self) -> ClientResult<()> {
        self.script.with(|s| s.sender_links_destroyed += 1);
        Ok(())
    }
}

/// Scripted receiver link.
pub struct MockReceiverLink {
    script: MockScript,
    name: String,
    opened: bool,
    remaining_delay: u32,
}

#[async_trait::async_trait]
impl ReceiverLink for MockReceiverLink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&mut self) -> ClientResult<()> {
        self.opened = true;
        Ok(())
    }

    fn state(&self) -> LinkState {
        if let Some(error) = self.script.with(|s| s.receiver_link_error.clone()) {
            return LinkState::Error(error);
        }
        if !self.opened {
            return LinkState::Pending;
        }
        if self.remaining_delay > 0 {
            return LinkState::Pending;
        }
        LinkState::Open
    }

    async fn work(&mut self) -> ClientResult<()> {
        if self.remaining_delay > 0 {
            self.remaining_delay -= 1;
        }
        self.script.with(|s| s.tick_budget = s.deliveries_per_tick);
        Ok(())
    }

    fn poll_delivery(&mut self) -> Option<Message> {
        self.script.with(|s| {
            if s.tick_budget == 0 {
                return None;
            }
            let mut message = s.deliveries.pop_front()?;
            s.tick_budget -= 1;
            if message.delivery_tag().is_none() {
                message.delivery_tag = Some(s.next_tag);
                s.next_tag += 1;
            }
            Some(message)
        })
    }

    fn flow(&mut self, credit: u32) {
        self.script.with(|s| s.flows.push(credit));
    }

    fn accept(&mut self, delivery_tag: u64) {
        self.script.with(|s| s.accepted.push(delivery_tag));
    }

    fn release(&mut self, delivery_tag: u64) {
        self.script.with(|s| s.released.push(delivery_tag));
    }

    fn reject(&mut self, delivery_tag: u64, _error: Option<AmqpError>) {
        self.script.with(|s| s.rejected.push(delivery_tag));
    }

    async fn destroy(&mut self) -> ClientResult<()> {
        self.script.with(|s| s.receiver_links_destroyed += 1);
        Ok(())
    }
}

/// Authenticator with a scripted flow sequence; reports `Complete` once
/// the sequence is drained.
pub struct MockAuthenticator {
    supports_cbs: bool,
    flows: StdMutex<VecDeque<AuthFlow>>,
    create_calls: AtomicUsize,
}

impl MockAuthenticator {
    pub fn new(flows: Vec<AuthFlow>) -> Self {
        Self {
            supports_cbs: true,
            flows: StdMutex::new(flows.into_iter().collect()),
            create_calls: AtomicUsize::new(0),
        }
    }

    /// Authenticator that completes immediately.
    pub fn completing() -> Self {
        Self::new(vec![])
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Authenticator for MockAuthenticator {
    fn supports_cbs(&self) -> bool {
        self.supports_cbs
    }

    fn audience(&self) -> &str {
        "mock-audience"
    }

    async fn create_authenticator(&mut self, connection: &ConnectionRef) -> ClientResult<()> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let token = AccessToken {
            token: "mock-token".to_string(),
            expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        };
        connection
            .lock()
            .await
            .attach_cbs("mock-audience", token)
            .await
    }

    async fn handle_token(&mut self) -> ClientResult<AuthFlow> {
        let next = self.flows.lock().expect("mock poisoned").pop_front();
        Ok(next.unwrap_or(AuthFlow::Complete))
    }
}
