//! Transport boundary used by the dispatcher.

use std::sync::Arc;

use async_trait::async_trait;

use courier_core::StoredMessage;

/// Delivery failure reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The broker or peer could not be reached.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    /// The broker or peer refused the message.
    #[error("message rejected: {0}")]
    Rejected(String),
}

/// Delivers one message over the wire (broker publish, handler invocation, ...).
///
/// The dispatcher records `Succeeded` when this returns `Ok` and `Failed`
/// otherwise. A sender may see the same message more than once.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: &StoredMessage) -> Result<(), SendError>;
}

#[async_trait]
impl<T> MessageSender for Arc<T>
where
    T: MessageSender + ?Sized,
{
    async fn send(&self, message: &StoredMessage) -> Result<(), SendError> {
        (**self).send(message).await
    }
}
