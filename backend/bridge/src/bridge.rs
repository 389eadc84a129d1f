use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use modforge_config::RuntimeConfig;
use modforge_core::Action;
use modforge_store::{Middleware, StateStore};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channel::{BridgeChannel, BridgeError, FrameHandler};

/// Relays actions between the local store and a peer process.
///
/// An action crosses the bridge at most once: received actions are marked
/// `from_bridge` and the forwarding middleware skips them.
pub struct ActionBridge {
    channel: Arc<dyn BridgeChannel>,
    origin_id: String,
    forwarded: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
}

impl ActionBridge {
    pub fn new(channel: Arc<dyn BridgeChannel>) -> Self {
        Self::with_origin_id(channel, Uuid::new_v4().to_string())
    }

    /// Tag outgoing actions with `host.processId`, or a random id when none is configured.
    pub fn from_config(channel: Arc<dyn BridgeChannel>, config: &RuntimeConfig) -> Self {
        match config.process_id() {
            Some(id) => Self::with_origin_id(channel, id),
            None => Self::new(channel),
        }
    }

    pub fn with_origin_id(channel: Arc<dyn BridgeChannel>, origin_id: impl Into<String>) -> Self {
        Self {
            channel,
            origin_id: origin_id.into(),
            forwarded: AtomicU64::new(0),
            received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn origin_id(&self) -> &str {
        &self.origin_id
    }

    /// Send a locally dispatched action to the peer.
    ///
    /// Returns `Ok(false)` for actions that themselves came over the bridge.
    pub fn forward(&self, action: &Action) -> Result<bool, BridgeError> {
        if action.is_from_bridge() {
            return Ok(false);
        }
        let mut outbound = action.clone();
        outbound
            .meta
            .origin_id
            .get_or_insert_with(|| self.origin_id.clone());
        let frame = serde_json::to_string(&outbound).map_err(|e| BridgeError::Encode(e.to_string()))?;
        self.channel.send(frame)?;
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        debug!(action = %action.action_type, "Action forwarded over bridge");
        Ok(true)
    }

    /// Decode a received frame into an action ready for local dispatch.
    pub fn decode(&self, frame: &str) -> Result<Action, BridgeError> {
        let mut action: Action = serde_json::from_str(frame).map_err(|e| BridgeError::Decode(e.to_string()))?;
        action.meta.from_bridge = true;
        Ok(action)
    }

    /// Wire the bridge to `store`: forward every local dispatch and dispatch
    /// every received action.
    pub fn attach(self: &Arc<Self>, store: &Arc<StateStore>) {
        store.add_middleware(Arc::new(ForwardMiddleware {
            bridge: Arc::downgrade(self),
        }));

        let bridge = Arc::downgrade(self);
        let target = Arc::downgrade(store);
        let handler: FrameHandler = Arc::new(move |frame: String| {
            let (Some(bridge), Some(store)) = (bridge.upgrade(), target.upgrade()) else {
                return;
            };
            bridge.receive(&store, &frame);
        });
        self.channel.on_receive(handler);
    }

    fn receive(&self, store: &StateStore, frame: &str) {
        let action = match self.decode(frame) {
            Ok(action) => action,
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Dropping malformed bridge frame");
                return;
            }
        };
        if action.meta.origin_id.as_deref() == Some(self.origin_id.as_str()) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(action = %action.action_type, "Ignoring echoed action");
            return;
        }
        self.received.fetch_add(1, Ordering::Relaxed);
        store.dispatch(action);
    }

    pub fn forwarded_count(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn received_count(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct ForwardMiddleware {
    bridge: Weak<ActionBridge>,
}

impl Middleware for ForwardMiddleware {
    fn after_dispatch(&self, action: &Action) {
        let Some(bridge) = self.bridge.upgrade() else {
            return;
        };
        if let Err(e) = bridge.forward(action) {
            warn!(action = %action.action_type, error = %e, "Failed to forward action over bridge");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use modforge_config::HostConfig;
    use modforge_core::StatePath;
    use modforge_store::{merge, ReducerRegistration, ReducerSpec};
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    use crate::channel::{MemoryChannel, StreamChannel};

    fn counter_store() -> Arc<StateStore> {
        let spec = ReducerSpec::new(json!(0)).on("ADD", |state, payload| {
            json!(state.as_i64().unwrap_or(0) + payload.as_i64().unwrap_or(0))
        });
        let reducer = merge(vec![ReducerRegistration::new(
            "counter",
            StatePath::parse("session.counter"),
            spec,
        )])
        .unwrap();
        Arc::new(StateStore::new(reducer))
    }

    fn counter(store: &StateStore) -> Value {
        store.get_state()["session"]["counter"].clone()
    }

    #[test]
    fn test_action_crosses_once_without_echo() {
        let (host_end, frontend_end) = MemoryChannel::pair();
        let host_end = Arc::new(host_end);
        let frontend_end = Arc::new(frontend_end);

        let host_store = counter_store();
        let frontend_store = counter_store();
        let host = Arc::new(ActionBridge::with_origin_id(host_end.clone(), "host"));
        let frontend = Arc::new(ActionBridge::with_origin_id(frontend_end.clone(), "frontend"));
        host.attach(&host_store);
        frontend.attach(&frontend_store);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        frontend_store.subscribe(move |_, action| sink.lock().push(action.clone()));

        host_store.dispatch(Action::new("ADD", json!(2)));

        assert_eq!(counter(&host_store), json!(2));
        assert_eq!(counter(&frontend_store), json!(2));
        assert_eq!(host_end.frames_sent(), 1);
        assert_eq!(frontend_end.frames_sent(), 0);
        assert_eq!((host.forwarded_count(), frontend.received_count()), (1, 1));
        assert_eq!((frontend.forwarded_count(), host.received_count()), (0, 0));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].meta.from_bridge);
        assert_eq!(seen[0].meta.origin_id.as_deref(), Some("host"));
    }

    #[test]
    fn test_origin_id_from_config() {
        let (end, _peer) = MemoryChannel::pair();
        let end: Arc<dyn BridgeChannel> = Arc::new(end);
        let config = RuntimeConfig {
            host: Some(HostConfig {
                process_id: Some("frontend-1".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(ActionBridge::from_config(end.clone(), &config).origin_id(), "frontend-1");

        let generated = ActionBridge::from_config(end, &RuntimeConfig::default());
        assert!(Uuid::parse_str(generated.origin_id()).is_ok());
    }

    #[test]
    fn test_bridged_actions_are_not_forwarded() {
        let (end, _peer) = MemoryChannel::pair();
        let bridge = ActionBridge::new(Arc::new(end));
        let mut action = Action::new("ADD", json!(1));
        action.meta.from_bridge = true;
        assert_eq!(bridge.forward(&action), Ok(false));
        assert_eq!(bridge.forwarded_count(), 0);
    }

    #[test]
    fn test_malformed_and_echoed_frames_dropped() {
        let (local_end, remote_end) = MemoryChannel::pair();
        let store = counter_store();
        let bridge = Arc::new(ActionBridge::with_origin_id(Arc::new(local_end), "host"));
        bridge.attach(&store);

        remote_end.send("{not json".into()).unwrap();
        remote_end
            .send(r#"{"type":"ADD","payload":5,"meta":{"originId":"host"}}"#.into())
            .unwrap();
        remote_end.send(r#"{"type":"ADD","payload":3}"#.into()).unwrap();

        assert_eq!(counter(&store), json!(3));
        assert_eq!(bridge.dropped_count(), 2);
        assert_eq!(bridge.received_count(), 1);
        // received actions never go back out
        assert_eq!(bridge.forwarded_count(), 0);
    }

    #[test]
    fn test_closed_channel_does_not_break_dispatch() {
        let (end, peer) = MemoryChannel::pair();
        let store = counter_store();
        let bridge = Arc::new(ActionBridge::new(Arc::new(end)));
        bridge.attach(&store);
        peer.close();

        store.dispatch(Action::new("ADD", json!(4)));
        assert_eq!(counter(&store), json!(4));
        assert_eq!(bridge.forwarded_count(), 0);
    }

    #[tokio::test]
    async fn test_bridge_over_stream() {
        let (a, b) = tokio::io::duplex(4096);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);

        let host_store = counter_store();
        let frontend_store = counter_store();
        let host = Arc::new(ActionBridge::new(Arc::new(StreamChannel::spawn(a_read, a_write))));
        let frontend = Arc::new(ActionBridge::new(Arc::new(StreamChannel::spawn(b_read, b_write))));
        host.attach(&host_store);
        frontend.attach(&frontend_store);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        frontend_store.subscribe(move |state, _| {
            let _ = tx.send(state["session"]["counter"].clone());
        });

        frontend_store.dispatch(Action::new("ADD", json!(1)));
        host_store.dispatch(Action::new("ADD", json!(10)));

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(first, Some(json!(1)));
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(second, Some(json!(11)));

        tokio::time::timeout(Duration::from_secs(2), async {
            while counter(&host_store) != json!(11) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(frontend.forwarded_count(), 1);
        assert_eq!(host.forwarded_count(), 1);
    }
}
