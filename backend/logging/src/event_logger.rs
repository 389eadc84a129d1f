//! Extension Event Logger
//!
//! Per-extension outcomes (discovered, loaded, disabled, rejected
//! registrations) emitted on the `extension_events` target so the JSON file
//! layer keeps an audit trail of every startup.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExtensionEvent {
    Discovered {
        origin_path: String,
        version: String,
        dynamic: bool,
    },
    Skipped {
        origin_path: String,
        reason: String,
    },
    Loaded {
        registrations: usize,
    },
    SelfDisabled,
    Failed {
        error: String,
    },
    ActivationFailed {
        error: String,
    },
    RegistrationRejected {
        kind: String,
        error: String,
    },
}

#[derive(Debug, Serialize)]
pub struct ExtensionEventEntry {
    pub extension_id: String,
    pub timestamp: DateTime<Utc>,
    pub event: ExtensionEvent,
}

pub struct ExtensionEventLogger;

impl ExtensionEventLogger {
    pub fn entry(extension_id: &str, event: ExtensionEvent) -> ExtensionEventEntry {
        ExtensionEventEntry {
            extension_id: extension_id.into(),
            timestamp: Utc::now(),
            event,
        }
    }

    pub fn log_event(extension_id: &str, event: ExtensionEvent) {
        let entry = Self::entry(extension_id, event);
        info!(target: "extension_events", event = ?entry, "Extension event");
    }
}
