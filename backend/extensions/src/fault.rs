//! Runtime fault containment for extension code called after startup.
//!
//! Predicates, payload methods and API methods run on the host's call stack.
//! A panic in any of them is caught here, recorded against the owning
//! extension and turned into an `anyhow` error; from then on the owner's
//! records are skipped by every lookup.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use modforge_core::{ExtensionError, ExtensionId};
use modforge_logging::{ExtensionEvent, ExtensionEventLogger};
use parking_lot::RwLock;
use tracing::warn;

use crate::table::{CapabilityKind, CapabilityRecord};

#[derive(Default)]
struct FaultState {
    /// First fault per extension; it is what disables the extension.
    disabled: HashMap<ExtensionId, ExtensionError>,
    history: Vec<ExtensionError>,
}

/// Shared record of runtime faults. Cloning shares the same log.
#[derive(Clone, Default)]
pub struct FaultLog {
    inner: Arc<RwLock<FaultState>>,
}

impl FaultLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a panic in `owner`'s `kind` capability `key` and disable `owner`.
    pub fn record(&self, owner: &ExtensionId, kind: &str, key: &str, message: impl Into<String>) -> ExtensionError {
        let err = ExtensionError::Faulted {
            extension: owner.clone(),
            kind: kind.to_string(),
            key: key.to_string(),
            message: message.into(),
        };
        warn!(extension = %owner, kind, key, error = %err, "[Extensions] Extension code panicked at runtime; extension disabled");
        ExtensionEventLogger::log_event(owner.as_str(), ExtensionEvent::Failed { error: err.to_string() });

        let mut state = self.inner.write();
        state.history.push(err.clone());
        state.disabled.entry(owner.clone()).or_insert_with(|| err.clone());
        err
    }

    pub fn is_disabled(&self, owner: &ExtensionId) -> bool {
        self.inner.read().disabled.contains_key(owner)
    }

    /// The fault that disabled `owner`, if any.
    pub fn disabled_by(&self, owner: &ExtensionId) -> Option<ExtensionError> {
        self.inner.read().disabled.get(owner).cloned()
    }

    /// Every recorded fault, oldest first.
    pub fn history(&self) -> Vec<ExtensionError> {
        self.inner.read().history.clone()
    }

    pub fn for_extension(&self, owner: &ExtensionId) -> Vec<ExtensionError> {
        self.inner
            .read()
            .history
            .iter()
            .filter(|err| err.extension() == owner)
            .cloned()
            .collect()
    }

    /// Run extension code, turning a panic into an attributed error.
    ///
    /// Returned errors are passed through with the owner attached as context;
    /// only panics disable the owner.
    pub fn guard<T>(
        &self,
        owner: &ExtensionId,
        kind: &str,
        key: &str,
        call: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        match catch_unwind(AssertUnwindSafe(call)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.context(format!("{kind} '{key}' from {owner} failed"))),
            Err(payload) => Err(anyhow!(self.record(owner, kind, key, panic_message(payload)))),
        }
    }

    /// Evaluate a record's predicate; a panic is recorded and counts as "no match".
    pub(crate) fn matches<K: CapabilityKind>(&self, record: &CapabilityRecord<K>, input: &K::Input) -> bool {
        match record.try_matches(input) {
            Ok(matched) => matched,
            Err(message) => {
                self.record(&record.owner, K::NAME, &record.key, message);
                false
            }
        }
    }
}

impl std::fmt::Debug for FaultLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.read();
        f.debug_struct("FaultLog")
            .field("disabled", &state.disabled.len())
            .field("faults", &state.history.len())
            .finish()
    }
}

/// A record selected from a table. Calls into its payload go through the fault log.
pub struct Guarded<K: CapabilityKind> {
    record: CapabilityRecord<K>,
    faults: FaultLog,
}

impl<K: CapabilityKind> Guarded<K> {
    pub(crate) fn new(record: CapabilityRecord<K>, faults: FaultLog) -> Self {
        Self { record, faults }
    }

    pub fn owner(&self) -> &ExtensionId {
        &self.record.owner
    }

    pub fn key(&self) -> &str {
        &self.record.key
    }

    pub fn priority(&self) -> i32 {
        self.record.priority
    }

    pub fn record(&self) -> &CapabilityRecord<K> {
        &self.record
    }

    /// Call into the payload.
    pub fn call<T>(&self, f: impl FnOnce(&K::Payload) -> Result<T>) -> Result<T> {
        self.faults
            .guard(&self.record.owner, K::NAME, &self.record.key, || f(&*self.record.payload))
    }
}

impl<K: CapabilityKind> Clone for Guarded<K> {
    fn clone(&self) -> Self {
        Self {
            record: self.record.clone(),
            faults: self.faults.clone(),
        }
    }
}

impl<K: CapabilityKind> std::fmt::Debug for Guarded<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Guarded").field(&self.record).finish()
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "non-string panic payload".to_string()
}
