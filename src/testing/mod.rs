//! Test support utilities
//!
//! Scripted in-memory transport implementations that stand in for a real
//! AMQP stack, so clients can be exercised without a broker.

pub mod mocks;
