//! Message handlers invoked by the dispatch loop.

use async_trait::async_trait;
use broker_driver::Message;
use std::future::Future;

/// A handler for messages of one topic.
///
/// Handlers see the message by shared reference only; retry bookkeeping on
/// the message belongs to the adapter. Returning an error sends the message
/// through the retry policy.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, message: &Message) -> anyhow::Result<()>;
}

/// Handler backed by an async closure.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure taking an owned copy of the message as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        (self.f)(message.clone()).await
    }
}
