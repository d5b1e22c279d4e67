//! Authentication for AMQP connections
//!
//! SASL mechanisms are applied by the transport at connection construction
//! and need no ongoing work. CBS (claims-based security) authentication
//! instead runs a token handshake over a dedicated management-style session
//! and renews tokens before they lapse; the client core drives it one step
//! per reactor tick through the [`Authenticator`] trait.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{AmqpClientError, ClientResult};
use crate::transport::{CbsState, ConnectionRef};

/// Shared handle to an authenticator, so a client opened over an external
/// connection can drive the connection's own authenticator.
pub type AuthenticatorRef = Arc<Mutex<dyn Authenticator>>;

/// SASL mechanism applied at connection construction.
#[derive(Clone, PartialEq, Eq)]
pub enum SaslMechanism {
    Anonymous,
    Plain { username: String, password: String },
    External,
}

impl fmt::Debug for SaslMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaslMechanism::Anonymous => f.write_str("Anonymous"),
            // Never echo credentials into logs.
            SaslMechanism::Plain { username, .. } => f
                .debug_struct("Plain")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            SaslMechanism::External => f.write_str("External"),
        }
    }
}

/// A bearer token with its expiry, as put to the CBS node.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of driving the token handshake one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFlow {
    /// Handshake (or a token refresh) still in flight.
    InProgress,
    /// Tokens are current; the client may proceed.
    Complete,
    /// The handshake window expired before completion. Fatal.
    Expired,
}

/// Source of fresh tokens for CBS authentication.
pub type TokenProvider = Arc<dyn Fn() -> ClientResult<AccessToken> + Send + Sync>;

/// Drives authentication for a client.
///
/// `create_authenticator` is called once during `open()` (and again after a
/// redirect); `handle_token` is polled by `auth_complete()` every reactor
/// tick until it reports `Complete`.
#[async_trait::async_trait]
pub trait Authenticator: Send {
    /// Whether this mechanism runs a CBS handshake. Non-CBS mechanisms
    /// complete immediately.
    fn supports_cbs(&self) -> bool;

    /// The audience (node address) tokens are scoped to.
    fn audience(&self) -> &str;

    /// Bind to the connection and start the handshake.
    async fn create_authenticator(&mut self, connection: &ConnectionRef) -> ClientResult<()>;

    /// Advance the token state machine one step.
    async fn handle_token(&mut self) -> ClientResult<AuthFlow>;
}

/// Plain SASL authentication: everything happens at connection
/// construction, so the handshake is trivially complete.
#[derive(Debug, Clone)]
pub struct SaslAuth {
    audience: String,
}

impl SaslAuth {
    pub fn new(audience: impl Into<String>) -> Self {
        Self {
            audience: audience.into(),
        }
    }
}

#[async_trait::async_trait]
impl Authenticator for SaslAuth {
    fn supports_cbs(&self) -> bool {
        false
    }

    fn audience(&self) -> &str {
        &self.audience
    }

    async fn create_authenticator(&mut self, _connection: &ConnectionRef) -> ClientResult<()> {
        Ok(())
    }

    async fn handle_token(&mut self) -> ClientResult<AuthFlow> {
        Ok(AuthFlow::Complete)
    }
}

/// CBS token authentication with automatic renewal.
pub struct CbsTokenAuth {
    audience: String,
    provider: TokenProvider,
    /// How long the initial handshake may stay in flight before it is
    /// declared expired.
    auth_timeout: Duration,
    /// Renewal starts this long before the current token lapses.
    refresh_window: Duration,
    connection: Option<ConnectionRef>,
    handshake_started: Option<Instant>,
    current_expiry: Option<DateTime<Utc>>,
}

impl CbsTokenAuth {
    pub fn new(audience: impl Into<String>, provider: TokenProvider) -> Self {
        Self {
            audience: audience.into(),
            provider,
            auth_timeout: Duration::from_secs(60),
            refresh_window: Duration::from_secs(300),
            connection: None,
            handshake_started: None,
            current_expiry: None,
        }
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    pub fn with_refresh_window(mut self, window: Duration) -> Self {
        self.refresh_window = window;
        self
    }

    fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.current_expiry {
            Some(expiry) => {
                let window = chrono::Duration::seconds(self.refresh_window.as_secs() as i64);
                now + window >= expiry
            }
            None => true,
        }
    }

    async fn put_token(&mut self, connection: &ConnectionRef) -> ClientResult<()> {
        let token = (self.provider)()?;
        self.current_expiry = Some(token.expires_at);
        connection
            .lock()
            .await
            .attach_cbs(&self.audience, token)
            .await?;
        self.handshake_started = Some(Instant::now());
        Ok(())
    }
}

impl fmt::Debug for CbsTokenAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CbsTokenAuth")
            .field("audience", &self.audience)
            .field("auth_timeout", &self.auth_timeout)
            .field("refresh_window", &self.refresh_window)
            .field("current_expiry", &self.current_expiry)
            .finish()
    }
}

#[async_trait::async_trait]
impl Authenticator for CbsTokenAuth {
    fn supports_cbs(&self) -> bool {
        true
    }

    fn audience(&self) -> &str {
        &self.audience
    }

    async fn create_authenticator(&mut self, connection: &ConnectionRef) -> ClientResult<()> {
        self.connection = Some(connection.clone());
        let connection = connection.clone();
        self.put_token(&connection).await
    }

    async fn handle_token(&mut self) -> ClientResult<AuthFlow> {
        let connection = self.connection.clone().ok_or_else(|| {
            AmqpClientError::configuration("CBS authenticator is not bound to a connection")
        })?;

        let state = connection.lock().await.cbs_state();
        match state {
            CbsState::NoCbs => Err(AmqpClientError::configuration(
                "CBS authenticator was never created on the connection",
            )),
            CbsState::InProgress => {
                let expired = self
                    .handshake_started
                    .map(|started| started.elapsed() >= self.auth_timeout)
                    .unwrap_or(false);
                if expired {
                    Ok(AuthFlow::Expired)
                } else {
                    Ok(AuthFlow::InProgress)
                }
            }
            CbsState::Open => {
                if self.needs_refresh(Utc::now()) {
                    debug!(audience = %self.audience, "CBS token near expiry, renewing");
                    self.put_token(&connection).await?;
                    Ok(AuthFlow::InProgress)
                } else {
                    Ok(AuthFlow::Complete)
                }
            }
            CbsState::Failed(error) => Err(AmqpClientError::Amqp(error)),
        }
    }
}
