//! AMQP 1.0 client orchestration layer
//!
//! A protocol-level orchestrator for AMQP 1.0 messaging: it manages
//! connection/session/link lifecycle, drives a cooperative reactor loop,
//! and implements the message-send retry and message-receive flow-control
//! state machines. Wire framing and socket I/O are owned by a pluggable
//! transport provider.
//!
//! # Overview
//!
//! This crate provides:
//! - Send and receive clients built on a shared reactor core
//! - Per-message retry/backoff driven by a pluggable error policy
//! - Credit-based receive flow control with batch, stream, and iterator
//!   delivery
//! - CBS token authentication with automatic renewal
//! - Shared-connection support with ownership-tagged handles
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use amqp_reactor::message::{Message, MessageState};
//! use amqp_reactor::testing::mocks::MockProvider;
//! use amqp_reactor::transport::DeliveryOutcome;
//! use amqp_reactor::{ClientOptions, SendClient};
//!
//! # tokio_test::block_on(async {
//! // A scripted in-memory transport; production code supplies a real
//! // provider instead.
//! let provider = Arc::new(MockProvider::new());
//! let script = provider.script();
//! script.set_default_outcome(DeliveryOutcome::Accepted);
//!
//! let mut client = SendClient::new(
//!     "amqp.example.com",
//!     "hub/partition/0",
//!     provider,
//!     ClientOptions::default(),
//! )?;
//!
//! client.queue_message(Message::new("hello"));
//! client.queue_message(Message::new("world"));
//!
//! let states = client.send_all_messages(true).await?;
//! assert!(states.iter().all(|s| *s == MessageState::SendComplete));
//! # Ok::<(), amqp_reactor::AmqpClientError>(())
//! # });
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod policy;
pub mod testing;
pub mod transport;

// Re-export the primary client surface
pub use client::{AmqpClient, ClientCore, ReceiveClient, ReceiveIter, SendClient};
pub use config::{ClientOptions, ConfigError};
pub use error::{AmqpClientError, AmqpError, ClientResult, ErrorCondition};
pub use message::{Message, MessageBatch, MessageState, SendOutcome};
pub use policy::{ErrorAction, ErrorPolicy, RetryBehavior};
