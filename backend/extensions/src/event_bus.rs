//! Lifecycle Event Bus
//!
//! Broadcasts coordinator state changes and per-extension outcomes to any interested listener.

use modforge_core::ExtensionId;
use tokio::sync::broadcast;
use tracing::debug;

use crate::lifecycle::LifecycleState;

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    StateChanged {
        from: LifecycleState,
        to: LifecycleState,
    },
    ExtensionLoaded(ExtensionId),
    ExtensionDisabled {
        extension: ExtensionId,
        reason: String,
    },
    ActivationFailed {
        extension: ExtensionId,
        error: String,
    },
}

pub struct LifecycleEventBus {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleEventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { sender: tx }
    }

    /// Publish to current subscribers; events are dropped when nobody listens.
    pub fn publish(&self, event: LifecycleEvent) {
        debug!(?event, "Lifecycle event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }
}

impl Default for LifecycleEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = LifecycleEventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(LifecycleEvent::ExtensionLoaded("a".into()));
        assert_eq!(rx.recv().await.unwrap(), LifecycleEvent::ExtensionLoaded("a".into()));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = LifecycleEventBus::default();
        bus.publish(LifecycleEvent::ExtensionLoaded("nobody-listens".into()));
    }
}
