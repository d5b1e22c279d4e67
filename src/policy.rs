//! Pure retry/backoff classification for delivery failures
//!
//! This module contains the pure decision logic that maps an AMQP error
//! condition onto a retry-or-fail action. The send client applies the
//! resulting [`ErrorAction`] to each message's state machine; nothing here
//! performs I/O.

use std::collections::HashMap;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::error::{AmqpError, ErrorCondition};

/// Per-condition retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBehavior {
    /// Retry with the scheduled backoff, counting against `max_retries`.
    RetryWithBackoff,
    /// Retry without consuming a retry slot (transient flow-control pushback).
    RetryNoCount,
    /// Fail the message immediately.
    Fatal,
}

/// Decision produced by classifying a delivery failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorAction {
    pub retry: bool,
    pub backoff: Duration,
    pub increment_retries: bool,
}

impl ErrorAction {
    pub fn fatal() -> Self {
        Self {
            retry: false,
            backoff: Duration::ZERO,
            increment_retries: false,
        }
    }

    pub fn retry_after(backoff: Duration, increment_retries: bool) -> Self {
        Self {
            retry: true,
            backoff,
            increment_retries,
        }
    }
}

/// Default classification for the standard condition symbols. Conditions
/// absent from this table fall back to the policy's `default_behavior`.
static DEFAULT_CONDITION_TABLE: Lazy<HashMap<ErrorCondition, RetryBehavior>> = Lazy::new(|| {
    use ErrorCondition::*;
    use RetryBehavior::*;
    HashMap::from([
        // Transient server-side trouble: worth another attempt.
        (InternalError, RetryWithBackoff),
        (ResourceLimitExceeded, RetryWithBackoff),
        (ResourceLocked, RetryWithBackoff),
        (ConnectionForced, RetryWithBackoff),
        (DetachForced, RetryWithBackoff),
        // Flow-control pushback is not the message's fault.
        (TransferLimitExceeded, RetryNoCount),
        (WindowViolation, RetryNoCount),
        // The peer told us this will never work.
        (NotFound, Fatal),
        (UnauthorizedAccess, Fatal),
        (DecodeError, Fatal),
        (NotAllowed, Fatal),
        (InvalidField, Fatal),
        (NotImplemented, Fatal),
        (PreconditionFailed, Fatal),
        (ResourceDeleted, Fatal),
        (IllegalState, Fatal),
        (FrameSizeTooSmall, Fatal),
        (FramingError, Fatal),
        (MessageSizeExceeded, Fatal),
        (Stolen, Fatal),
        // Redirects are handled at the link/connection layer, not by
        // re-sending the message.
        (LinkRedirect, Fatal),
        (ConnectionRedirect, Fatal),
    ])
});

/// Pluggable classifier mapping a protocol error to a retry/backoff
/// decision, bounded by `max_retries` re-arms per message.
#[derive(Debug, Clone)]
pub struct ErrorPolicy {
    /// Upper bound on retry re-arms per message. Enforced by the send
    /// client: once a message's retry count reaches this value it is forced
    /// to `SendFailed` regardless of classification.
    pub max_retries: u32,
    /// Backoff schedule indexed by attempt number; the last entry is
    /// sustained once the pattern is exhausted.
    backoff_pattern: Vec<Duration>,
    sustained_backoff: Duration,
    overrides: HashMap<ErrorCondition, RetryBehavior>,
    default_behavior: RetryBehavior,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_pattern: vec![
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_millis(1000),
            ],
            sustained_backoff: Duration::from_millis(2000),
            overrides: HashMap::new(),
            default_behavior: RetryBehavior::RetryWithBackoff,
        }
    }
}

impl ErrorPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Override the classification of a single condition.
    pub fn with_condition(mut self, condition: ErrorCondition, behavior: RetryBehavior) -> Self {
        self.overrides.insert(condition, behavior);
        self
    }

    /// Behavior applied to conditions absent from the table (including
    /// synthesized unknown-error conditions).
    pub fn with_default_behavior(mut self, behavior: RetryBehavior) -> Self {
        self.default_behavior = behavior;
        self
    }

    pub fn with_backoff_pattern(
        mut self,
        pattern: Vec<Duration>,
        sustained: Duration,
    ) -> Self {
        self.backoff_pattern = pattern;
        self.sustained_backoff = sustained;
        self
    }

    /// Look up the behavior for a condition: explicit override, then the
    /// built-in table, then the default.
    fn behavior(&self, condition: &ErrorCondition) -> RetryBehavior {
        self.overrides
            .get(condition)
            .or_else(|| DEFAULT_CONDITION_TABLE.get(condition))
            .copied()
            .unwrap_or(self.default_behavior)
    }

    /// Backoff delay for the given attempt (1-based).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_backoff)
    }

    /// Classify a delivery failure into an [`ErrorAction`].
    ///
    /// `current_retries` is the message's retry count so far; it selects the
    /// backoff step. The `max_retries` bound itself is enforced by the
    /// caller against the message state, not here.
    pub fn classify(&self, error: &AmqpError, current_retries: u32) -> ErrorAction {
        match self.behavior(&error.condition) {
            RetryBehavior::Fatal => ErrorAction::fatal(),
            RetryBehavior::RetryWithBackoff => {
                ErrorAction::retry_after(self.backoff_for_attempt(current_retries + 1), true)
            }
            RetryBehavior::RetryNoCount => {
                ErrorAction::retry_after(self.backoff_for_attempt(current_retries + 1), false)
            }
        }
    }
}
