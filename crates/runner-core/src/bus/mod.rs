pub mod event;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{trace, warn};

pub use event::Event;

const CHANNEL_CAPACITY: usize = 1024;

/// A handle used by components to publish events onto the bus and to
/// obtain their own subscription.
#[derive(Clone)]
pub struct Bus {
    sender: broadcast::Sender<Event>,
}

impl Bus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish an event. Lagging/closed receivers are not a dispatch error
    /// — every live component is driven from the single dispatcher loop
    /// (see `run_dispatcher`), not from independent subscriptions.
    pub fn publish(&self, event: Event) {
        trace!(?event, "publishing event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// A component registered with the dispatcher. Handlers run to completion
/// and may publish further events via the `Bus` they were constructed
/// with; the dispatcher does not fan those out itself, preserving a single
/// global order: fire order on the bus is preserved per originating
/// pipeline.
#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &Event, bus: &Bus);
}

/// Drive every registered component, in registration order, against every
/// event observed on the bus: a dispatch table keyed by event variant,
/// with explicit registration rather than reflective handler discovery.
pub async fn run_dispatcher(bus: Bus, components: Vec<Arc<dyn Component>>) {
    let mut receiver = bus.subscribe();
    loop {
        match receiver.recv().await {
            Ok(event) => {
                for component in &components {
                    component.handle(&event, &bus).await;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event bus dispatcher lagged; some events were dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
