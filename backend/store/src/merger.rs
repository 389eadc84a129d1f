//! Reducer merger: composes per-extension reducers keyed by state path.
//!
//! Each registered path becomes a leaf of a key tree. A leaf reducer only
//! ever sees the sub-tree at its own path; keys no reducer owns pass through
//! untouched. Two registrations whose paths are equal, or where one is a
//! prefix of the other, are a [`StartupError::StatePathCollision`].

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use modforge_core::{Action, ExtensionId, StartupError, StatePath};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Handler for one action type: `(state, payload) -> state`.
pub type ActionReducer = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;

/// Catch-all handler: `(state, action) -> state`.
pub type StateReducer = Arc<dyn Fn(&Value, &Action) -> Value + Send + Sync>;

/// Reducer contributed by one extension for one state path.
#[derive(Clone)]
pub struct ReducerSpec {
    reducers: BTreeMap<String, ActionReducer>,
    fallback: Option<StateReducer>,
    defaults: Value,
}

impl ReducerSpec {
    /// An action-type keyed spec with the given default sub-tree.
    pub fn new(defaults: Value) -> Self {
        Self {
            reducers: BTreeMap::new(),
            fallback: None,
            defaults,
        }
    }

    /// A spec driven by a single function that sees every action.
    pub fn from_fn<F>(defaults: Value, reducer: F) -> Self
    where
        F: Fn(&Value, &Action) -> Value + Send + Sync + 'static,
    {
        Self {
            reducers: BTreeMap::new(),
            fallback: Some(Arc::new(reducer)),
            defaults,
        }
    }

    /// Handle `action_type` with `reducer(state, payload)`.
    pub fn on<F>(mut self, action_type: impl Into<String>, reducer: F) -> Self
    where
        F: Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    {
        self.reducers.insert(action_type.into(), Arc::new(reducer));
        self
    }

    pub fn defaults(&self) -> &Value {
        &self.defaults
    }

    pub fn handles(&self, action_type: &str) -> bool {
        self.fallback.is_some() || self.reducers.contains_key(action_type)
    }

    /// Apply this spec to its own sub-tree.
    pub fn reduce(&self, state: &Value, action: &Action) -> Value {
        if let Some(reducer) = self.reducers.get(&action.action_type) {
            return reducer(state, &action.payload);
        }
        match &self.fallback {
            Some(fallback) => fallback(state, action),
            None => state.clone(),
        }
    }
}

impl fmt::Debug for ReducerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReducerSpec")
            .field("action_types", &self.reducers.keys().collect::<Vec<_>>())
            .field("fallback", &self.fallback.is_some())
            .field("defaults", &self.defaults)
            .finish()
    }
}

/// A reducer spec together with its owner and the path it claims.
#[derive(Debug, Clone)]
pub struct ReducerRegistration {
    pub owner: ExtensionId,
    pub path: StatePath,
    pub spec: ReducerSpec,
}

impl ReducerRegistration {
    pub fn new(owner: impl Into<ExtensionId>, path: StatePath, spec: ReducerSpec) -> Self {
        Self {
            owner: owner.into(),
            path,
            spec,
        }
    }
}

// ---------------------------------------------------------------------------
// Key tree
// ---------------------------------------------------------------------------

enum Node {
    Branch(BTreeMap<String, Node>),
    Leaf(ReducerRegistration),
}

/// The single reducer built from every registered spec.
pub struct ComposedReducer {
    root: BTreeMap<String, Node>,
    owners: Vec<(StatePath, ExtensionId)>,
}

/// Build the composed reducer; fails on the first colliding pair of paths.
pub fn merge(specs: Vec<ReducerRegistration>) -> Result<ComposedReducer, StartupError> {
    let mut root = BTreeMap::new();
    let mut owners = Vec::with_capacity(specs.len());
    for registration in specs {
        owners.push((registration.path.clone(), registration.owner.clone()));
        insert(&mut root, registration)?;
    }
    debug!(reducers = owners.len(), "Merged reducers");
    Ok(ComposedReducer { root, owners })
}

fn insert(
    root: &mut BTreeMap<String, Node>,
    registration: ReducerRegistration,
) -> Result<(), StartupError> {
    let Some((last, parents)) = registration.path.segments().split_last() else {
        return Err(StartupError::EmptyStatePath {
            extension: registration.owner,
        });
    };

    let mut level = root;
    for key in parents {
        let node = level
            .entry(key.clone())
            .or_insert_with(|| Node::Branch(BTreeMap::new()));
        match node {
            Node::Branch(children) => level = children,
            Node::Leaf(existing) => return Err(collision(existing, &registration)),
        }
    }

    let conflict = match level.get(last) {
        Some(Node::Leaf(existing)) => Some(collision(existing, &registration)),
        Some(Node::Branch(children)) => {
            first_leaf(children).map(|existing| collision(existing, &registration))
        }
        None => None,
    };
    if let Some(err) = conflict {
        return Err(err);
    }

    let key = last.clone();
    level.insert(key, Node::Leaf(registration));
    Ok(())
}

fn first_leaf(children: &BTreeMap<String, Node>) -> Option<&ReducerRegistration> {
    children.values().find_map(|node| match node {
        Node::Leaf(leaf) => Some(leaf),
        Node::Branch(grandchildren) => first_leaf(grandchildren),
    })
}

fn collision(existing: &ReducerRegistration, incoming: &ReducerRegistration) -> StartupError {
    StartupError::StatePathCollision {
        first: existing.owner.clone(),
        first_path: existing.path.clone(),
        second: incoming.owner.clone(),
        second_path: incoming.path.clone(),
    }
}

impl ComposedReducer {
    /// Apply every leaf reducer to its own sub-tree and reassemble the state.
    pub fn reduce(&self, state: &Value, action: &Action) -> Value {
        reduce_branch(&self.root, state, action)
    }

    /// State tree assembled from every spec's defaults.
    pub fn initial_state(&self) -> Value {
        initial_branch(&self.root)
    }

    /// Registered paths with their owners, in registration order.
    pub fn paths(&self) -> &[(StatePath, ExtensionId)] {
        &self.owners
    }

    pub fn owner_of(&self, path: &StatePath) -> Option<&ExtensionId> {
        self.owners
            .iter()
            .find(|(registered, _)| registered == path)
            .map(|(_, owner)| owner)
    }
}

impl fmt::Debug for ComposedReducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComposedReducer")
            .field("paths", &self.owners)
            .finish()
    }
}

fn reduce_branch(children: &BTreeMap<String, Node>, state: &Value, action: &Action) -> Value {
    let mut next = match state {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    for (key, node) in children {
        let current = next.get(key);
        let updated = match node {
            Node::Branch(grandchildren) => {
                reduce_branch(grandchildren, current.unwrap_or(&Value::Null), action)
            }
            Node::Leaf(leaf) => apply_leaf(leaf, current, action),
        };
        next.insert(key.clone(), updated);
    }
    Value::Object(next)
}

fn apply_leaf(leaf: &ReducerRegistration, current: Option<&Value>, action: &Action) -> Value {
    let state = current.cloned().unwrap_or_else(|| leaf.spec.defaults.clone());
    match catch_unwind(AssertUnwindSafe(|| leaf.spec.reduce(&state, action))) {
        Ok(next) => next,
        Err(_) => {
            warn!(
                extension = %leaf.owner,
                path = %leaf.path,
                action = %action.action_type,
                "Reducer panicked; keeping previous state"
            );
            state
        }
    }
}

fn initial_branch(children: &BTreeMap<String, Node>) -> Value {
    let map = children
        .iter()
        .map(|(key, node)| {
            let value = match node {
                Node::Branch(grandchildren) => initial_branch(grandchildren),
                Node::Leaf(leaf) => leaf.spec.defaults.clone(),
            };
            (key.clone(), value)
        })
        .collect();
    Value::Object(map)
}
