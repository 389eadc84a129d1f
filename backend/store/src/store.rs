//! Live application state store.
//!
//! Unidirectional data flow: `dispatch(action)` runs the composed reducer,
//! then notifies subscribers and middleware outside of any lock so they may
//! dispatch again.
//!
//! Two narrower hooks sit beside plain subscriptions. Action checks run
//! before the reducer for one action type and can reject the action. Path
//! watches fire only when the value at their path actually changed.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use modforge_core::{Action, ExtensionId, StatePath};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{trace, warn};

use crate::merger::ComposedReducer;

pub type SubscriptionId = u64;
pub type WatchId = u64;

/// Called after every dispatch with the new state and the action that produced it.
pub type Listener = Arc<dyn Fn(&Value, &Action) + Send + Sync>;

/// Called with `(previous, current)` when the value at a watched path changes.
/// `None` means the path did not exist.
pub type WatchCallback = Arc<dyn Fn(Option<&Value>, Option<&Value>) + Send + Sync>;

/// Pre-dispatch check for one action type. `Some(reason)` rejects the action.
pub type ActionCheck = Arc<dyn Fn(&Value, &Action) -> Option<String> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("action {action_type} rejected by check from {owner}: {reason}")]
pub struct ActionRejected {
    pub action_type: String,
    pub owner: ExtensionId,
    pub reason: String,
}

struct Watch {
    id: WatchId,
    owner: ExtensionId,
    path: StatePath,
    last: Option<Value>,
    callback: WatchCallback,
}

struct RegisteredCheck {
    action_type: String,
    owner: ExtensionId,
    check: ActionCheck,
}

/// Observes every action after it has been reduced.
pub trait Middleware: Send + Sync {
    fn after_dispatch(&self, action: &Action);
}

pub struct StateStore {
    reducer: ComposedReducer,
    state: RwLock<Value>,
    listeners: RwLock<Vec<(SubscriptionId, Listener)>>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    watches: RwLock<Vec<Watch>>,
    checks: RwLock<Vec<RegisteredCheck>>,
    next_subscription: AtomicU64,
}

impl StateStore {
    pub fn new(reducer: ComposedReducer) -> Self {
        let initial = reducer.initial_state();
        Self::with_state(reducer, initial)
    }

    /// Start from a previously persisted state instead of the reducer defaults.
    pub fn with_state(reducer: ComposedReducer, state: Value) -> Self {
        Self {
            reducer,
            state: RwLock::new(state),
            listeners: RwLock::new(Vec::new()),
            middleware: RwLock::new(Vec::new()),
            watches: RwLock::new(Vec::new()),
            checks: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Dispatch, logging and dropping the action if a check rejects it.
    pub fn dispatch(&self, action: Action) {
        let _ = self.try_dispatch(action);
    }

    /// Dispatch unless one of the action checks for this type rejects it.
    pub fn try_dispatch(&self, action: Action) -> Result<(), ActionRejected> {
        self.run_checks(&action)?;
        let next = {
            let mut state = self.state.write();
            let next = self.reducer.reduce(&state, &action);
            *state = next.clone();
            next
        };
        trace!(action = %action.action_type, from_bridge = action.meta.from_bridge, "Dispatched");

        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&next, &action))).is_err() {
                warn!(action = %action.action_type, "Store listener panicked");
            }
        }

        let middleware: Vec<Arc<dyn Middleware>> = self.middleware.read().clone();
        for hook in middleware {
            if catch_unwind(AssertUnwindSafe(|| hook.after_dispatch(&action))).is_err() {
                warn!(action = %action.action_type, "Store middleware panicked");
            }
        }

        self.notify_watches(&next);
        Ok(())
    }

    fn run_checks(&self, action: &Action) -> Result<(), ActionRejected> {
        let checks: Vec<(ExtensionId, ActionCheck)> = self
            .checks
            .read()
            .iter()
            .filter(|entry| entry.action_type == action.action_type)
            .map(|entry| (entry.owner.clone(), entry.check.clone()))
            .collect();
        if checks.is_empty() {
            return Ok(());
        }

        let state = self.get_state();
        for (owner, check) in checks {
            match catch_unwind(AssertUnwindSafe(|| check(&state, action))) {
                Ok(None) => {}
                Ok(Some(reason)) => {
                    let rejected = ActionRejected {
                        action_type: action.action_type.clone(),
                        owner,
                        reason,
                    };
                    warn!(error = %rejected, "An invalid state change was prevented");
                    return Err(rejected);
                }
                Err(_) => {
                    warn!(extension = %owner, action = %action.action_type, "Action check panicked; ignoring it");
                }
            }
        }
        Ok(())
    }

    fn notify_watches(&self, state: &Value) {
        let changed: Vec<(WatchCallback, Option<Value>, Option<Value>, ExtensionId, StatePath)> = {
            let mut watches = self.watches.write();
            watches
                .iter_mut()
                .filter_map(|watch| {
                    let current = watch.path.select(state).cloned();
                    if current == watch.last {
                        return None;
                    }
                    let previous = std::mem::replace(&mut watch.last, current.clone());
                    Some((watch.callback.clone(), previous, current, watch.owner.clone(), watch.path.clone()))
                })
                .collect()
        };

        for (callback, previous, current, owner, path) in changed {
            if catch_unwind(AssertUnwindSafe(|| callback(previous.as_ref(), current.as_ref()))).is_err() {
                warn!(extension = %owner, path = %path, "State change handler failed");
            }
        }
    }

    pub fn get_state(&self) -> Value {
        self.state.read().clone()
    }

    /// Sub-tree at `path`, if present.
    pub fn select(&self, path: &StatePath) -> Option<Value> {
        path.select(&self.state.read()).cloned()
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&Value, &Action) + Send + Sync + 'static,
    {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Call `callback` whenever the value at `path` changes.
    pub fn watch<F>(&self, owner: impl Into<ExtensionId>, path: StatePath, callback: F) -> WatchId
    where
        F: Fn(Option<&Value>, Option<&Value>) + Send + Sync + 'static,
    {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let last = self.select(&path);
        self.watches.write().push(Watch {
            id,
            owner: owner.into(),
            path,
            last,
            callback: Arc::new(callback),
        });
        id
    }

    pub fn unwatch(&self, id: WatchId) -> bool {
        let mut watches = self.watches.write();
        let before = watches.len();
        watches.retain(|watch| watch.id != id);
        watches.len() != before
    }

    /// Run `check` against the current state before every `action_type` action.
    pub fn add_action_check<F>(&self, action_type: impl Into<String>, owner: impl Into<ExtensionId>, check: F)
    where
        F: Fn(&Value, &Action) -> Option<String> + Send + Sync + 'static,
    {
        self.checks.write().push(RegisteredCheck {
            action_type: action_type.into(),
            owner: owner.into(),
            check: Arc::new(check),
        });
    }

    pub fn add_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middleware.write().push(middleware);
    }

    pub fn reducer(&self) -> &ComposedReducer {
        &self.reducer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merger::{merge, ReducerRegistration, ReducerSpec};
    use parking_lot::Mutex;
    use serde_json::json;

    fn counter_store() -> StateStore {
        let spec = ReducerSpec::new(json!(0)).on("ADD", |state, payload| {
            json!(state.as_i64().unwrap_or(0) + payload.as_i64().unwrap_or(0))
        });
        let reducer = merge(vec![ReducerRegistration::new(
            "counter",
            StatePath::parse("session.counter"),
            spec,
        )])
        .unwrap();
        StateStore::new(reducer)
    }

    #[test]
    fn test_dispatch_updates_state() {
        let store = counter_store();
        store.dispatch(Action::new("ADD", json!(2)));
        store.dispatch(Action::new("ADD", json!(3)));
        assert_eq!(store.select(&StatePath::parse("session.counter")), Some(json!(5)));
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let store = counter_store();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = store.subscribe(move |state, action| {
            sink.lock().push((action.action_type.clone(), state["session"]["counter"].clone()));
        });

        store.dispatch(Action::new("ADD", json!(1)));
        assert!(store.unsubscribe(id));
        store.dispatch(Action::new("ADD", json!(1)));

        assert_eq!(*seen.lock(), vec![("ADD".to_string(), json!(1))]);
        assert!(!store.unsubscribe(id));
    }

    #[test]
    fn test_listener_may_dispatch_again() {
        let store = Arc::new(counter_store());
        let inner = Arc::downgrade(&store);
        store.subscribe(move |state, action| {
            if action.action_type == "ADD" && state["session"]["counter"] == json!(1) {
                if let Some(store) = inner.upgrade() {
                    store.dispatch(Action::new("ADD", json!(10)));
                }
            }
        });
        store.dispatch(Action::new("ADD", json!(1)));
        assert_eq!(store.get_state()["session"]["counter"], json!(11));
    }

    #[test]
    fn test_middleware_sees_every_action() {
        struct Recorder(Mutex<Vec<String>>);
        impl Middleware for Recorder {
            fn after_dispatch(&self, action: &Action) {
                self.0.lock().push(action.action_type.clone());
            }
        }

        let store = counter_store();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        store.add_middleware(recorder.clone());
        store.dispatch(Action::new("ADD", json!(1)));
        store.dispatch(Action::new("NOOP", Value::Null));
        assert_eq!(*recorder.0.lock(), vec!["ADD", "NOOP"]);
    }

    #[test]
    fn test_watch_fires_only_on_change() {
        let store = counter_store();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = store.watch("counter-ui", StatePath::parse("session.counter"), move |prev, cur| {
            sink.lock().push((prev.cloned(), cur.cloned()));
        });

        store.dispatch(Action::new("ADD", json!(2)));
        store.dispatch(Action::new("ADD", json!(0)));
        store.dispatch(Action::new("NOOP", Value::Null));
        store.dispatch(Action::new("ADD", json!(1)));
        assert!(store.unwatch(id));
        store.dispatch(Action::new("ADD", json!(1)));

        assert_eq!(
            *seen.lock(),
            vec![(Some(json!(0)), Some(json!(2))), (Some(json!(2)), Some(json!(3)))]
        );
    }

    #[test]
    fn test_failing_watch_does_not_stop_others() {
        let store = counter_store();
        let hits = Arc::new(Mutex::new(0));
        store.watch("broken", StatePath::parse("session.counter"), |_, _| panic!("handler bug"));
        let sink = hits.clone();
        store.watch("sound", StatePath::parse("session.counter"), move |_, _| *sink.lock() += 1);

        store.dispatch(Action::new("ADD", json!(1)));
        store.dispatch(Action::new("ADD", json!(1)));
        assert_eq!(*hits.lock(), 2);
        assert_eq!(store.get_state()["session"]["counter"], json!(2));
    }

    #[test]
    fn test_watch_callback_may_dispatch() {
        let store = Arc::new(counter_store());
        let inner = Arc::downgrade(&store);
        store.watch("clamp", StatePath::parse("session.counter"), move |_, cur| {
            if cur.and_then(Value::as_i64).unwrap_or(0) > 10 {
                if let Some(store) = inner.upgrade() {
                    store.dispatch(Action::new("ADD", json!(-10)));
                }
            }
        });
        store.dispatch(Action::new("ADD", json!(15)));
        assert_eq!(store.get_state()["session"]["counter"], json!(5));
    }

    #[test]
    fn test_action_check_rejects_before_reducer() {
        let store = counter_store();
        store.add_action_check("ADD", "sanity", |_state, action| {
            (action.payload.as_i64().unwrap_or(0) < 0).then(|| "negative increment".to_string())
        });
        store.add_action_check("ADD", "careless", |_state, _action| panic!("check bug"));

        assert!(store.try_dispatch(Action::new("ADD", json!(4))).is_ok());
        let rejected = store.try_dispatch(Action::new("ADD", json!(-1))).unwrap_err();
        assert_eq!(rejected.owner, ExtensionId::from("sanity"));
        assert_eq!(rejected.reason, "negative increment");

        store.dispatch(Action::new("ADD", json!(-3)));
        assert_eq!(store.get_state()["session"]["counter"], json!(4));
    }
}
