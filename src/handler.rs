//! Handler trait and the closure adapters that wrap user functions

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::time::Duration;
use thiserror::Error;

use crate::message::Message;

/// Failure returned by a message handler.
///
/// `RetryAfter` carries an explicit redelivery delay; the consumer honors
/// it instead of its exponential backoff, and delays above one minute also
/// engage the automatic pause controller.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Failure with an explicit redelivery delay
    #[error("{reason} (retry after {delay:?})")]
    RetryAfter {
        /// Delay to apply when the message is released
        delay: Duration,
        /// Human-readable cause
        reason: String,
    },

    /// Any other failure
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    /// Build a failure carrying a redelivery delay
    pub fn retry_after(delay: Duration, reason: impl Into<String>) -> Self {
        Self::RetryAfter {
            delay,
            reason: reason.into(),
        }
    }

    /// Build an opaque failure from a message
    pub fn msg(reason: impl Into<String>) -> Self {
        Self::Other(anyhow::anyhow!(reason.into()))
    }

    /// The redelivery delay, if this failure carries one
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::RetryAfter { delay, .. } => Some(*delay),
            Self::Other(_) => None,
        }
    }
}

/// Processes a single message.
///
/// Implementations must be safe to call concurrently; the worker pool runs
/// many handler invocations in parallel.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle one message. An `Err` triggers release-or-delete depending on
    /// `reserved_count` vs the retry limit.
    async fn handle(&self, msg: &Message) -> Result<(), HandlerError>;
}

type HandlerClosure =
    Box<dyn Fn(&Message) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Adapter turning an async closure into a [`Handler`].
///
/// ```
/// use relayq::{HandlerFn, Message};
///
/// let handler = HandlerFn::new(|msg: &Message| {
///     let len = msg.payload.len();
///     async move {
///         tracing::debug!("payload bytes: {}", len);
///         Ok(())
///     }
/// });
/// # let _ = handler;
/// ```
pub struct HandlerFn {
    f: HandlerClosure,
}

impl HandlerFn {
    /// Wrap an async closure
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: for<'a> Fn(&'a Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self {
            f: Box::new(move |msg| Box::pin(f(msg))),
        }
    }
}

#[async_trait]
impl Handler for HandlerFn {
    async fn handle(&self, msg: &Message) -> Result<(), HandlerError> {
        (self.f)(msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handler_fn_adapts_closure() {
        let handler = HandlerFn::new(|msg: &Message| {
            let ok = msg.payload == b"ok";
            async move {
                if ok {
                    Ok(())
                } else {
                    Err(HandlerError::msg("unexpected payload"))
                }
            }
        });

        assert!(handler.handle(&Message::new(b"ok".to_vec())).await.is_ok());
        assert!(handler.handle(&Message::new(b"no".to_vec())).await.is_err());
    }

    #[test]
    fn test_retry_after_carries_delay() {
        let err = HandlerError::retry_after(Duration::from_secs(3), "calm down");
        assert_eq!(err.delay(), Some(Duration::from_secs(3)));

        let err = HandlerError::msg("boom");
        assert_eq!(err.delay(), None);
    }
}
