//! `modforge-store` — composed reducers and the application state store.
//!
//! Extensions contribute reducers for disjoint state paths; the merger turns
//! them into one tree-shaped reducer and the store applies it to every
//! dispatched action.

pub mod merger;
pub mod store;

pub use merger::{merge, ComposedReducer, ReducerRegistration, ReducerSpec};
pub use store::{
    ActionCheck, ActionRejected, Listener, Middleware, StateStore, SubscriptionId, WatchCallback, WatchId,
};
