//! AMQP client orchestrators
//!
//! The module is split into three parts:
//!
//! - [`core`] - connection/session lifecycle, authentication, keep-alive,
//!   and the [`core::AmqpClient`] reactor skeleton
//! - [`sender`] - the send client and its per-message retry engine
//! - [`receiver`] - the receive client, credit management, and delivery
//!   access patterns

pub mod core;
pub mod receiver;
pub mod sender;

pub use self::core::{AmqpClient, ClientCore};
pub use self::receiver::{ReceiveClient, ReceiveIter};
pub use self::sender::SendClient;
