// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error taxonomy for the loop, its timers/immediates, and its promises.

use std::sync::Arc;

use thiserror::Error;

/// Every distinct failure kind the loop surfaces to callers.
#[derive(Debug, Clone, Error)]
pub enum LoopError {
    #[error("loop is already running")]
    LoopAlreadyRunning,

    #[error("loop has terminated")]
    LoopTerminated,

    #[error("loop is not running")]
    LoopNotRunning,

    #[error("timer not found")]
    TimerNotFound,

    #[error("timer id space exhausted")]
    TimerIdExhausted,

    #[error("immediate id space exhausted")]
    ImmediateIdExhausted,

    #[error("interval id space exhausted")]
    IntervalIdExhausted,

    #[error("aborted: {reason}")]
    AbortError { reason: Reason },

    #[error("operation timed out")]
    TimeoutError,

    #[error("{message}")]
    AggregateError {
        errors: Vec<Reason>,
        message: String,
    },
}

/// A rejection/abort reason. Cheaply cloneable so it can be fanned out
/// to every subscriber and stored in the unhandled-rejection side table
/// without re-allocating per recipient.
pub type Reason = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Wrap a plain string as a `Reason`.
pub fn reason(msg: impl Into<String>) -> Reason {
    #[derive(Debug, Error)]
    #[error("{0}")]
    struct StringReason(String);
    Arc::new(StringReason(msg.into()))
}

/// The value a panicking callback becomes when recovered at a panic
/// barrier: wrapped as a `PanicError` carrying the recovered value.
#[derive(Debug, Error)]
#[error("panic: {message}")]
pub struct PanicError {
    pub message: String,
}

impl PanicError {
    pub fn from_payload(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        PanicError { message }
    }
}

impl LoopError {
    pub fn aggregate(errors: Vec<Reason>, message: impl Into<String>) -> Self {
        LoopError::AggregateError {
            errors,
            message: message.into(),
        }
    }
}
