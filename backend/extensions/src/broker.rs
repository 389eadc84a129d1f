//! Cross-extension API broker (`api.ext.<name>`).
//!
//! Calls to a registered method run immediately. Calls to an unknown method
//! are queued as [`PendingCall`]s and drained in FIFO order the moment the
//! method is registered. Methods are always invoked outside the broker lock.
//! A panicking method disables its owner; its methods then report unavailable.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use modforge_core::{CapabilityError, ExtensionId};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::fault::{panic_message, FaultLog};

pub type ApiMethod = Arc<dyn Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync>;

pub const API_KIND: &str = "api";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiCallError {
    #[error("api method '{method}' from {owner} failed: {message}")]
    Failed {
        method: String,
        owner: ExtensionId,
        message: String,
    },

    #[error("api method '{method}' from {owner} panicked")]
    Panicked { method: String, owner: ExtensionId },

    #[error("api method '{method}' is unavailable")]
    Unavailable { method: String },
}

type CallResult = Result<Value, ApiCallError>;

/// A queued call to a method nobody has registered yet.
pub struct PendingCall {
    pub caller: ExtensionId,
    pub method: String,
    pub args: Vec<Value>,
    resolve: oneshot::Sender<CallResult>,
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("caller", &self.caller)
            .field("method", &self.method)
            .field("args", &self.args)
            .finish()
    }
}

/// Summary of a call still waiting for its method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedCall {
    pub caller: ExtensionId,
    pub method: String,
}

struct RegisteredMethod {
    owner: ExtensionId,
    method: ApiMethod,
}

#[derive(Default)]
struct BrokerState {
    methods: HashMap<String, RegisteredMethod>,
    pending: VecDeque<PendingCall>,
    closed: bool,
}

/// Shared method map plus pending-call queue. Cloning shares the same broker.
#[derive(Clone, Default)]
pub struct ApiBroker {
    inner: Arc<Mutex<BrokerState>>,
    faults: FaultLog,
}

impl ApiBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker recording method panics in `faults`.
    pub fn with_faults(faults: FaultLog) -> Self {
        Self {
            inner: Arc::default(),
            faults,
        }
    }

    /// Publish `name`. Resolves every queued call for it, oldest first.
    pub fn register(
        &self,
        owner: ExtensionId,
        name: &str,
        method: ApiMethod,
    ) -> Result<(), CapabilityError> {
        let ready = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(CapabilityError::TableClosed { kind: API_KIND });
            }
            if let Some(existing) = state.methods.get(name) {
                return Err(CapabilityError::Duplicate {
                    kind: API_KIND,
                    key: name.to_string(),
                    owner,
                    existing_owner: existing.owner.clone(),
                });
            }
            state.methods.insert(
                name.to_string(),
                RegisteredMethod {
                    owner: owner.clone(),
                    method: method.clone(),
                },
            );

            let (ready, waiting): (VecDeque<_>, VecDeque<_>) =
                std::mem::take(&mut state.pending)
                    .into_iter()
                    .partition(|call| call.method == name);
            state.pending = waiting;
            ready
        };

        debug!(extension = %owner, method = name, resolved = ready.len(), "API method registered");
        for call in ready {
            let result = invoke(&self.faults, &owner, name, &method, call.args);
            if call.resolve.send(result).is_err() {
                debug!(caller = %call.caller, method = name, "Deferred call dropped by caller");
            }
        }
        Ok(())
    }

    /// Call `name` now if registered, otherwise queue the call.
    pub fn call(&self, caller: &ExtensionId, name: &str, args: Vec<Value>) -> ApiCall {
        let (owner, method) = {
            let mut state = self.inner.lock();
            match state.methods.get(name) {
                Some(registered) if self.faults.is_disabled(&registered.owner) => {
                    return ApiCall::ready(name, Err(unavailable(name)));
                }
                Some(registered) => (registered.owner.clone(), registered.method.clone()),
                None if state.closed => {
                    return ApiCall::ready(name, Err(unavailable(name)));
                }
                None => {
                    let (resolve, receiver) = oneshot::channel();
                    state.pending.push_back(PendingCall {
                        caller: caller.clone(),
                        method: name.to_string(),
                        args,
                        resolve,
                    });
                    debug!(caller = %caller, method = name, "API method not yet available; call queued");
                    return ApiCall::waiting(name, receiver);
                }
            }
        };
        ApiCall::ready(name, invoke(&self.faults, &owner, name, &method, args))
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.lock().methods.contains_key(name)
    }

    pub fn owner_of(&self, name: &str) -> Option<ExtensionId> {
        self.inner.lock().methods.get(name).map(|m| m.owner.clone())
    }

    pub fn unresolved(&self) -> Vec<UnresolvedCall> {
        self.inner
            .lock()
            .pending
            .iter()
            .map(|call| UnresolvedCall {
                caller: call.caller.clone(),
                method: call.method.clone(),
            })
            .collect()
    }

    /// Refuse new methods and fail every queued call as unavailable.
    pub fn close(&self) {
        let pending = {
            let mut state = self.inner.lock();
            state.closed = true;
            state.methods.clear();
            std::mem::take(&mut state.pending)
        };
        for call in pending {
            let _ = call.resolve.send(Err(unavailable(&call.method)));
        }
    }
}

fn unavailable(method: &str) -> ApiCallError {
    ApiCallError::Unavailable {
        method: method.to_string(),
    }
}

fn invoke(faults: &FaultLog, owner: &ExtensionId, name: &str, method: &ApiMethod, args: Vec<Value>) -> CallResult {
    let result = catch_unwind(AssertUnwindSafe(|| method(args)));
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            warn!(extension = %owner, method = name, error = %e, "API method failed");
            Err(ApiCallError::Failed {
                method: name.to_string(),
                owner: owner.clone(),
                message: format!("{e:#}"),
            })
        }
        Err(payload) => {
            faults.record(owner, API_KIND, name, panic_message(payload));
            Err(ApiCallError::Panicked {
                method: name.to_string(),
                owner: owner.clone(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Call handle
// ---------------------------------------------------------------------------

enum CallState {
    Ready(Option<CallResult>),
    Waiting(oneshot::Receiver<CallResult>),
}

/// Result of an `api.ext` call: resolved immediately or once the method appears.
///
/// Await it, or poll without blocking through [`ApiCall::try_result`].
pub struct ApiCall {
    method: String,
    state: CallState,
}

impl ApiCall {
    fn ready(method: &str, result: CallResult) -> Self {
        Self {
            method: method.to_string(),
            state: CallState::Ready(Some(result)),
        }
    }

    fn waiting(method: &str, receiver: oneshot::Receiver<CallResult>) -> Self {
        Self {
            method: method.to_string(),
            state: CallState::Waiting(receiver),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, CallState::Waiting(_))
    }

    /// Take the result if it is available; `None` while the call is still queued.
    pub fn try_result(&mut self) -> Option<CallResult> {
        let result = match &mut self.state {
            CallState::Ready(result) => result.take(),
            CallState::Waiting(receiver) => match receiver.try_recv() {
                Ok(result) => Some(result),
                Err(oneshot::error::TryRecvError::Empty) => return None,
                Err(oneshot::error::TryRecvError::Closed) => Some(Err(unavailable(&self.method))),
            },
        };
        self.state = CallState::Ready(None);
        result
    }
}

impl Future for ApiCall {
    type Output = CallResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let method = &this.method;
        match &mut this.state {
            CallState::Ready(result) => {
                Poll::Ready(result.take().unwrap_or_else(|| Err(unavailable(method))))
            }
            CallState::Waiting(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => Poll::Ready(Err(unavailable(method))),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl fmt::Debug for ApiCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCall")
            .field("method", &self.method)
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// The `api` handle given to one extension; calls are attributed to it.
#[derive(Clone)]
pub struct ExtensionApi {
    broker: ApiBroker,
    caller: ExtensionId,
}

impl ExtensionApi {
    pub fn new(broker: ApiBroker, caller: ExtensionId) -> Self {
        Self { broker, caller }
    }

    /// `api.ext.<name>(args)`.
    pub fn ext(&self, name: &str, args: Vec<Value>) -> ApiCall {
        self.broker.call(&self.caller, name, args)
    }

    pub fn has(&self, name: &str) -> bool {
        self.broker.has(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo(tag: &'static str) -> ApiMethod {
        Arc::new(move |args: Vec<Value>| -> anyhow::Result<Value> {
            Ok(json!({"tag": tag, "args": args}))
        })
    }

    #[tokio::test]
    async fn test_immediate_call() {
        let broker = ApiBroker::new();
        broker.register("d".into(), "doThing", echo("d")).unwrap();
        let mut call = broker.call(&"c".into(), "doThing", vec![json!(1)]);
        assert!(!call.is_pending());
        assert_eq!(call.try_result().unwrap().unwrap(), json!({"tag": "d", "args": [1]}));
    }

    #[tokio::test]
    async fn test_deferred_calls_resolve_in_fifo_order() {
        let broker = ApiBroker::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = broker.call(&"c".into(), "doThing", vec![json!("first")]);
        let other = broker.call(&"c".into(), "otherThing", vec![]);
        let second = broker.call(&"e".into(), "doThing", vec![json!("second")]);
        assert!(first.is_pending());
        assert_eq!(broker.unresolved().len(), 3);

        let seen = order.clone();
        broker
            .register(
                "d".into(),
                "doThing",
                Arc::new(move |args: Vec<Value>| -> anyhow::Result<Value> {
                    seen.lock().push(args[0].clone());
                    Ok(Value::Bool(true))
                }),
            )
            .unwrap();

        assert_eq!(first.await.unwrap(), json!(true));
        assert_eq!(second.await.unwrap(), json!(true));
        assert_eq!(*order.lock(), vec![json!("first"), json!("second")]);
        assert!(other.is_pending());
        assert_eq!(
            broker.unresolved(),
            vec![UnresolvedCall {
                caller: "c".into(),
                method: "otherThing".into()
            }]
        );
    }

    #[test]
    fn test_duplicate_method_keeps_first_owner() {
        let broker = ApiBroker::new();
        broker.register("a".into(), "shared", echo("a")).unwrap();
        let err = broker.register("b".into(), "shared", echo("b")).unwrap_err();
        assert!(matches!(err, CapabilityError::Duplicate { kind: API_KIND, .. }));
        assert_eq!(broker.owner_of("shared"), Some(ExtensionId::from("a")));
    }

    #[test]
    fn test_failing_and_panicking_methods_are_contained() {
        let broker = ApiBroker::new();
        broker
            .register("bad".into(), "fails", Arc::new(|_: Vec<Value>| -> anyhow::Result<Value> { anyhow::bail!("nope") }))
            .unwrap();
        broker
            .register("worse".into(), "panics", Arc::new(|_: Vec<Value>| -> anyhow::Result<Value> { panic!("boom") }))
            .unwrap();

        let mut failed = broker.call(&"c".into(), "fails", vec![]);
        assert!(matches!(failed.try_result(), Some(Err(ApiCallError::Failed { .. }))));
        let mut panicked = broker.call(&"c".into(), "panics", vec![]);
        assert!(matches!(panicked.try_result(), Some(Err(ApiCallError::Panicked { .. }))));
    }

    #[test]
    fn test_panicking_method_disables_its_owner() {
        let faults = FaultLog::new();
        let broker = ApiBroker::with_faults(faults.clone());
        broker
            .register("worse".into(), "panics", Arc::new(|_: Vec<Value>| -> anyhow::Result<Value> { panic!("boom") }))
            .unwrap();
        broker.register("worse".into(), "healthy", echo("worse")).unwrap();
        broker.register("fine".into(), "other", echo("fine")).unwrap();

        let mut first = broker.call(&"c".into(), "panics", vec![]);
        assert!(matches!(first.try_result(), Some(Err(ApiCallError::Panicked { .. }))));
        assert!(faults.is_disabled(&"worse".into()));

        let mut sibling = broker.call(&"c".into(), "healthy", vec![]);
        assert_eq!(
            sibling.try_result(),
            Some(Err(ApiCallError::Unavailable {
                method: "healthy".into()
            }))
        );
        let mut unaffected = broker.call(&"c".into(), "other", vec![]);
        assert!(matches!(unaffected.try_result(), Some(Ok(_))));
    }

    #[tokio::test]
    async fn test_close_fails_pending_calls() {
        let broker = ApiBroker::new();
        let call = broker.call(&"c".into(), "never", vec![]);
        broker.close();
        assert_eq!(
            call.await,
            Err(ApiCallError::Unavailable {
                method: "never".into()
            })
        );
        assert!(broker.register("late".into(), "never", echo("late")).is_err());
    }

    #[test]
    fn test_method_may_call_back_into_broker() {
        let broker = ApiBroker::new();
        broker.register("a".into(), "inner", echo("inner")).unwrap();
        let nested = broker.clone();
        broker
            .register(
                "b".into(),
                "outer",
                Arc::new(move |_: Vec<Value>| -> anyhow::Result<Value> {
                    let mut call = nested.call(&"b".into(), "inner", vec![]);
                    call.try_result().unwrap_or_else(|| Ok(Value::Null)).map_err(anyhow::Error::from)
                }),
            )
            .unwrap();
        let mut call = broker.call(&"c".into(), "outer", vec![]);
        assert_eq!(call.try_result().unwrap().unwrap()["tag"], "inner");
    }
}
