//! Capability tables: one priority-ordered registry per capability kind.
//!
//! Records are kept sorted by ascending priority; equal priorities keep
//! registration order, so the first registered record wins ties. Lookups
//! evaluate predicates outside the table lock, treat a panicking predicate
//! as a non-match and skip records whose owner has been disabled by a
//! runtime fault.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use modforge_core::{CapabilityError, ExtensionId};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::fault::{panic_message, FaultLog};

/// Describes one capability kind: what lookups are keyed on and what records carry.
pub trait CapabilityKind: Send + Sync + 'static {
    /// Value handed to predicates by `find` / `find_all`.
    type Input: ?Sized;
    /// Kind-specific payload.
    type Payload: ?Sized + Send + Sync;
    /// Kind name used in logs, errors and `extensions.hotTables`.
    const NAME: &'static str;
    /// Whether a key may be registered only once.
    const UNIQUE: bool;
}

pub type Predicate<I> = Arc<dyn Fn(&I) -> bool + Send + Sync>;

/// One declaration in a capability table.
pub struct CapabilityRecord<K: CapabilityKind> {
    pub owner: ExtensionId,
    pub key: String,
    pub priority: i32,
    pub predicate: Predicate<K::Input>,
    pub payload: Arc<K::Payload>,
    pub metadata: Value,
}

impl<K: CapabilityKind> CapabilityRecord<K> {
    pub fn new(
        owner: impl Into<ExtensionId>,
        key: impl Into<String>,
        priority: i32,
        predicate: Predicate<K::Input>,
        payload: Arc<K::Payload>,
    ) -> Self {
        Self {
            owner: owner.into(),
            key: key.into(),
            priority,
            predicate,
            payload,
            metadata: Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Evaluate the predicate; a panic counts as "does not match".
    pub fn matches(&self, input: &K::Input) -> bool {
        self.try_matches(input).unwrap_or_else(|message| {
            warn!(
                extension = %self.owner,
                kind = K::NAME,
                key = %self.key,
                error = %message,
                "Capability predicate panicked; treating as no match"
            );
            false
        })
    }

    /// Evaluate the predicate, returning the panic message if it panics.
    pub fn try_matches(&self, input: &K::Input) -> Result<bool, String> {
        catch_unwind(AssertUnwindSafe(|| (self.predicate)(input))).map_err(panic_message)
    }
}

impl<K: CapabilityKind> Clone for CapabilityRecord<K> {
    fn clone(&self) -> Self {
        Self {
            owner: self.owner.clone(),
            key: self.key.clone(),
            priority: self.priority,
            predicate: self.predicate.clone(),
            payload: self.payload.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

impl<K: CapabilityKind> fmt::Debug for CapabilityRecord<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRecord")
            .field("kind", &K::NAME)
            .field("owner", &self.owner)
            .field("key", &self.key)
            .field("priority", &self.priority)
            .field("metadata", &self.metadata)
            .finish()
    }
}

struct TableState<K: CapabilityKind> {
    records: Vec<CapabilityRecord<K>>,
    frozen: bool,
    closed: bool,
}

pub struct CapabilityTable<K: CapabilityKind> {
    hot: bool,
    faults: FaultLog,
    inner: RwLock<TableState<K>>,
}

impl<K: CapabilityKind> CapabilityTable<K> {
    pub fn new(hot: bool) -> Self {
        Self::with_faults(hot, FaultLog::new())
    }

    /// A table reporting predicate panics to a shared fault log.
    pub fn with_faults(hot: bool, faults: FaultLog) -> Self {
        Self {
            hot,
            faults,
            inner: RwLock::new(TableState {
                records: Vec::new(),
                frozen: false,
                closed: false,
            }),
        }
    }

    pub fn faults(&self) -> &FaultLog {
        &self.faults
    }

    pub fn kind(&self) -> &'static str {
        K::NAME
    }

    /// Hot tables keep accepting registrations after `freeze`.
    pub fn is_hot(&self) -> bool {
        self.hot
    }

    pub fn register(&self, record: CapabilityRecord<K>) -> Result<(), CapabilityError> {
        let mut state = self.inner.write();
        if state.closed {
            return Err(CapabilityError::TableClosed { kind: K::NAME });
        }
        if state.frozen && !self.hot {
            return Err(CapabilityError::TableFrozen {
                kind: K::NAME,
                key: record.key,
                owner: record.owner,
            });
        }
        if K::UNIQUE {
            if let Some(existing) = state.records.iter().find(|r| r.key == record.key) {
                return Err(CapabilityError::Duplicate {
                    kind: K::NAME,
                    key: record.key,
                    owner: record.owner,
                    existing_owner: existing.owner.clone(),
                });
            }
        }

        let position = state
            .records
            .iter()
            .position(|r| r.priority > record.priority)
            .unwrap_or(state.records.len());
        debug!(
            kind = K::NAME,
            extension = %record.owner,
            key = %record.key,
            priority = record.priority,
            "Capability registered"
        );
        state.records.insert(position, record);
        Ok(())
    }

    /// First record, in priority order, whose predicate accepts `input`.
    pub fn find(&self, input: &K::Input) -> Option<CapabilityRecord<K>> {
        self.live()
            .into_iter()
            .find(|record| self.faults.matches(record, input))
    }

    /// Every matching record, in priority order.
    pub fn find_all(&self, input: &K::Input) -> Vec<CapabilityRecord<K>> {
        self.live()
            .into_iter()
            .filter(|record| self.faults.matches(record, input))
            .collect()
    }

    /// Record registered under `key`, ignoring predicates.
    pub fn get(&self, key: &str) -> Option<CapabilityRecord<K>> {
        self.inner
            .read()
            .records
            .iter()
            .find(|r| r.key == key && !self.faults.is_disabled(&r.owner))
            .cloned()
    }

    fn live(&self) -> Vec<CapabilityRecord<K>> {
        let mut records = self.snapshot();
        records.retain(|record| !self.faults.is_disabled(&record.owner));
        records
    }

    /// All records in priority order.
    pub fn snapshot(&self) -> Vec<CapabilityRecord<K>> {
        self.inner.read().records.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn freeze(&self) {
        self.inner.write().frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.read().frozen
    }

    /// Discard every record and refuse further registration.
    pub fn close(&self) {
        let mut state = self.inner.write();
        state.closed = true;
        state.records.clear();
    }
}

impl<K: CapabilityKind> fmt::Debug for CapabilityTable<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.read();
        f.debug_struct("CapabilityTable")
            .field("kind", &K::NAME)
            .field("hot", &self.hot)
            .field("frozen", &state.frozen)
            .field("closed", &state.closed)
            .field("records", &state.records.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sample;
    impl CapabilityKind for Sample {
        type Input = str;
        type Payload = str;
        const NAME: &'static str = "sample";
        const UNIQUE: bool = false;
    }

    struct UniqueSample;
    impl CapabilityKind for UniqueSample {
        type Input = str;
        type Payload = str;
        const NAME: &'static str = "unique-sample";
        const UNIQUE: bool = true;
    }

    fn record<K: CapabilityKind<Input = str, Payload = str>>(
        owner: &str,
        key: &str,
        priority: i32,
    ) -> CapabilityRecord<K> {
        let payload: Arc<str> = Arc::from(owner);
        CapabilityRecord::new(owner, key, priority, Arc::new(|_: &str| true), payload)
    }

    #[test]
    fn test_lower_priority_wins() {
        let table = CapabilityTable::<Sample>::new(false);
        table.register(record("late", "x", 50)).unwrap();
        table.register(record("early", "x", 10)).unwrap();
        assert_eq!(table.find("anything").unwrap().owner.as_str(), "early");

        let ranked: Vec<_> = table.find_all("anything").into_iter().map(|r| r.owner).collect();
        assert_eq!(ranked, vec![ExtensionId::from("early"), ExtensionId::from("late")]);
    }

    #[test]
    fn test_equal_priority_first_registered_wins() {
        let forward = CapabilityTable::<Sample>::new(false);
        forward.register(record("a", "x", 20)).unwrap();
        forward.register(record("b", "x", 20)).unwrap();
        assert_eq!(forward.find("in").unwrap().owner.as_str(), "a");

        let swapped = CapabilityTable::<Sample>::new(false);
        swapped.register(record("b", "x", 20)).unwrap();
        swapped.register(record("a", "x", 20)).unwrap();
        assert_eq!(swapped.find("in").unwrap().owner.as_str(), "b");
    }

    #[test]
    fn test_distinct_priorities_survive_swap() {
        let forward = CapabilityTable::<Sample>::new(false);
        forward.register(record("a", "x", 5)).unwrap();
        forward.register(record("b", "x", 20)).unwrap();

        let swapped = CapabilityTable::<Sample>::new(false);
        swapped.register(record("b", "x", 20)).unwrap();
        swapped.register(record("a", "x", 5)).unwrap();

        assert_eq!(forward.find("in").unwrap().owner, swapped.find("in").unwrap().owner);
    }

    #[test]
    fn test_predicate_filters_candidates() {
        let table = CapabilityTable::<Sample>::new(false);
        let only_zip: Predicate<str> = Arc::new(|ext: &str| ext == "zip");
        table
            .register(CapabilityRecord::new("zipper", "zip", 0, only_zip, Arc::from("zipper")))
            .unwrap();
        table.register(record("fallback", "any", 100)).unwrap();

        assert_eq!(table.find("zip").unwrap().owner.as_str(), "zipper");
        assert_eq!(table.find("7z").unwrap().owner.as_str(), "fallback");
        assert_eq!(table.find_all("7z").len(), 1);
    }

    #[test]
    fn test_panicking_predicate_is_no_match() {
        let table = CapabilityTable::<Sample>::new(false);
        let broken: Predicate<str> = Arc::new(|_: &str| panic!("predicate bug"));
        table
            .register(CapabilityRecord::new("broken", "x", 0, broken, Arc::from("broken")))
            .unwrap();
        table.register(record("sound", "y", 10)).unwrap();
        table.register(record("broken", "z", 20)).unwrap();
        assert_eq!(table.find("in").unwrap().owner.as_str(), "sound");

        // the owner is disabled: its other records drop out of every lookup
        let owner = ExtensionId::from("broken");
        assert!(table.faults().is_disabled(&owner));
        assert!(matches!(
            table.faults().disabled_by(&owner),
            Some(modforge_core::ExtensionError::Faulted { ref message, .. }) if message == "predicate bug"
        ));
        let owners: Vec<_> = table.find_all("in").into_iter().map(|r| r.owner).collect();
        assert_eq!(owners, vec![ExtensionId::from("sound")]);
        assert!(table.get("z").is_none());
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_duplicate_key_keeps_first() {
        let table = CapabilityTable::<UniqueSample>::new(false);
        table.register(record("first", "skyrim", 0)).unwrap();
        let err = table.register(record("second", "skyrim", 0)).unwrap_err();
        assert_eq!(
            err,
            CapabilityError::Duplicate {
                kind: "unique-sample",
                key: "skyrim".into(),
                owner: "second".into(),
                existing_owner: "first".into(),
            }
        );
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("skyrim").unwrap().owner.as_str(), "first");
    }

    #[test]
    fn test_frozen_table_rejects_unless_hot() {
        let cold = CapabilityTable::<Sample>::new(false);
        cold.freeze();
        assert!(matches!(
            cold.register(record("late", "x", 0)),
            Err(CapabilityError::TableFrozen { .. })
        ));
        assert!(cold.is_empty());

        let hot = CapabilityTable::<Sample>::new(true);
        hot.freeze();
        hot.register(record("late", "x", 0)).unwrap();
        assert_eq!(hot.len(), 1);
    }

    #[test]
    fn test_closed_table_discards_records() {
        let table = CapabilityTable::<Sample>::new(true);
        table.register(record("a", "x", 0)).unwrap();
        table.close();
        assert!(table.is_empty());
        assert_eq!(
            table.register(record("b", "y", 0)),
            Err(CapabilityError::TableClosed { kind: "sample" })
        );
    }
}
