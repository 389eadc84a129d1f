use thiserror::Error;

use crate::types::{ExtensionId, StatePath};

/// Failure attributed to a single extension. The extension is disabled; the host continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtensionError {
    #[error("invalid {kind} registration by {extension}: {reason}")]
    InvalidRegistration {
        extension: ExtensionId,
        kind: String,
        reason: String,
    },

    #[error("extension {extension} requires {dependency}: {reason}")]
    MissingDependency {
        extension: ExtensionId,
        dependency: ExtensionId,
        reason: String,
    },

    #[error("extension {extension} requires host version {requirement}, running {host_version}")]
    UnsupportedHostVersion {
        extension: ExtensionId,
        requirement: String,
        host_version: String,
    },

    #[error("extension {extension} failed to initialize: {message}")]
    InitFailed {
        extension: ExtensionId,
        message: String,
    },

    #[error("extension {extension} panicked: {message}")]
    Panicked {
        extension: ExtensionId,
        message: String,
    },

    /// Extension code called after startup (predicate, payload, API method) panicked.
    #[error("extension {extension} disabled: {kind} '{key}' panicked: {message}")]
    Faulted {
        extension: ExtensionId,
        kind: String,
        key: String,
        message: String,
    },
}

impl ExtensionError {
    pub fn extension(&self) -> &ExtensionId {
        match self {
            ExtensionError::InvalidRegistration { extension, .. }
            | ExtensionError::MissingDependency { extension, .. }
            | ExtensionError::UnsupportedHostVersion { extension, .. }
            | ExtensionError::InitFailed { extension, .. }
            | ExtensionError::Panicked { extension, .. }
            | ExtensionError::Faulted { extension, .. } => extension,
        }
    }
}

/// Rejected capability registration. Logged; never fatal to startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("{kind} '{key}' from {owner} ignored: already registered by {existing_owner}")]
    Duplicate {
        kind: &'static str,
        key: String,
        owner: ExtensionId,
        existing_owner: ExtensionId,
    },

    #[error("{kind} table is frozen; '{key}' from {owner} dropped")]
    TableFrozen {
        kind: &'static str,
        key: String,
        owner: ExtensionId,
    },

    #[error("{kind} table is closed")]
    TableClosed { kind: &'static str },
}

/// Structural failure that aborts startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartupError {
    #[error("dependency cycle between extensions: {}", join_ids(.cycle))]
    DependencyCycle { cycle: Vec<ExtensionId> },

    #[error("state path collision: {first} claims '{first_path}', {second} claims '{second_path}'")]
    StatePathCollision {
        first: ExtensionId,
        first_path: StatePath,
        second: ExtensionId,
        second_path: StatePath,
    },

    #[error("reducer from {extension} has an empty state path")]
    EmptyStatePath { extension: ExtensionId },

    #[error("lifecycle is {current}, expected {expected}")]
    InvalidState { current: String, expected: String },
}

fn join_ids(ids: &[ExtensionId]) -> String {
    ids.iter().map(ExtensionId::as_str).collect::<Vec<_>>().join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_every_extension() {
        let err = StartupError::DependencyCycle {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle between extensions: a -> b -> a");
    }

    #[test]
    fn test_collision_message_names_both_owners() {
        let err = StartupError::StatePathCollision {
            first: "ext-a".into(),
            first_path: StatePath::parse("settings.profiles"),
            second: "ext-b".into(),
            second_path: StatePath::parse("settings.profiles"),
        };
        let msg = err.to_string();
        assert!(msg.contains("ext-a"));
        assert!(msg.contains("ext-b"));
    }

    #[test]
    fn test_extension_accessor() {
        let err = ExtensionError::InitFailed {
            extension: "broken".into(),
            message: "boom".into(),
        };
        assert_eq!(err.extension().as_str(), "broken");
    }
}
