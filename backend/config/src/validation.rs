//! Config validation with path-qualified messages.

use std::collections::HashSet;

use thiserror::Error;

use crate::schema::RuntimeConfig;

/// Capability kinds that may be listed in `extensions.hotTables`.
pub const CAPABILITY_KINDS: &[&str] = &[
    "game",
    "installer",
    "archive-handler",
    "deployment-method",
    "mod-type",
    "interpreter",
    "ui-hook",
];

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Error)]
#[error("Config validation error at '{path}': {message}")]
pub struct ConfigValidationError {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }
}

/// Validate the config and return every error and warning found.
pub fn validate(config: &RuntimeConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    validate_extensions(config, &mut report);
    validate_host(config, &mut report);
    validate_logging(config, &mut report);
    report
}

fn validate_extensions(config: &RuntimeConfig, report: &mut ValidationReport) {
    let Some(extensions) = &config.extensions else { return };

    let mut seen = HashSet::new();
    for (i, root) in extensions.source_roots.iter().enumerate() {
        let path = format!("extensions.sourceRoots[{i}].path");
        if root.path.trim().is_empty() {
            report.error(path, "Source root path cannot be empty");
        } else if !seen.insert(root.path.as_str()) {
            report.warn(path, format!("'{}' is listed more than once", root.path));
        }
    }

    for (i, id) in extensions.disabled.iter().enumerate() {
        if id.trim().is_empty() {
            report.error(format!("extensions.disabled[{i}]"), "Extension id cannot be empty");
        }
    }

    for (i, kind) in extensions.hot_tables.iter().flatten().enumerate() {
        if !CAPABILITY_KINDS.contains(&kind.as_str()) {
            report.error(
                format!("extensions.hotTables[{i}]"),
                format!("Unknown capability kind '{kind}'"),
            );
        } else if kind == "game" || kind == "mod-type" {
            report.warn(
                format!("extensions.hotTables[{i}]"),
                format!("'{kind}' registrations after startup are not seen by already-activated extensions"),
            );
        }
    }
}

fn validate_host(config: &RuntimeConfig, report: &mut ValidationReport) {
    let Some(host) = &config.host else { return };
    if let Some(version) = &host.version {
        if let Err(e) = semver::Version::parse(version) {
            report.error("host.version", format!("'{version}' is not a semver version: {e}"));
        }
    }
    if let Some(process_id) = &host.process_id {
        if process_id.trim().is_empty() {
            report.error("host.processId", "Process id cannot be empty; omit it to generate one");
        }
    }
}

fn validate_logging(config: &RuntimeConfig, report: &mut ValidationReport) {
    let Some(logging) = &config.logging else { return };
    if let Some(level) = &logging.level {
        if !LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
            report.warn("logging.level", format!("Unknown level '{level}'; RUST_LOG syntax is passed through"));
        }
    }
}
