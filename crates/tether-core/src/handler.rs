//! Command handlers.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::adapter::Adapter;
use crate::registry::Registry;

/// Command name the built-in subscription handler listens on.
pub const SUBSCRIBE: &str = "subscribe";

/// Reacts to one inbound frame.
///
/// Handlers for different frames run concurrently; handlers registered for
/// the same command run one after another, in registration order, for each
/// frame.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handle one frame.
    async fn handle(&self, adapter: Adapter);
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Adapter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, adapter: Adapter) {
        (self)(adapter).await;
    }
}

/// Command name to handlers, in registration order.
pub(crate) type Handlers = Registry<String, Vec<Arc<dyn Handler>>>;

/// Run every handler registered for the adapter's command.
pub(crate) async fn dispatch(handlers: &Handlers, adapter: Adapter) -> bool {
    let Some(list) = handlers.get(&adapter.command().to_owned()) else {
        return false;
    };
    for handler in list {
        handler.handle(adapter.clone()).await;
    }
    true
}
