//! `modforge-config` — runtime configuration.
//!
//! Provides:
//! - Typed config schema (extension roots, host identity, logging)
//! - YAML read/write with atomic backup rotation
//! - `${ENV_VAR}` substitution
//! - Default value application
//! - Validation

pub mod defaults;
pub mod env;
pub mod io;
pub mod schema;
pub mod validation;

pub use defaults::apply_all_defaults;
pub use env::{collect_referenced_vars, resolve_env_vars, resolve_env_vars_with, MissingEnvVarError};
pub use io::{config_dir, config_file_path, load_config, write_config};
pub use schema::{ExtensionsConfig, HostConfig, LoggingConfig, RuntimeConfig, SourceRootConfig};
pub use validation::{validate, ConfigValidationError, ValidationReport, CAPABILITY_KINDS};

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;

/// Load, substitute env vars, apply defaults and validate a config file.
///
/// Validation problems are logged; callers that must refuse an invalid
/// config call [`validate`] on the result.
pub async fn load_and_prepare(path: &Path) -> Result<RuntimeConfig> {
    let (config, report) = load_with_report(path).await?;
    log_report(&report);
    Ok(config)
}

/// Like [`load_and_prepare`], returning the validation report instead of logging it.
pub async fn load_with_report(path: &Path) -> Result<(RuntimeConfig, ValidationReport)> {
    let raw_config = load_config(path).await?;
    let config = prepare(&raw_config, resolve_env_vars)?;
    let report = validate(&config);
    Ok((config, report))
}

pub fn log_report(report: &ValidationReport) {
    for warning in &report.warnings {
        tracing::warn!(path = %warning.path, message = %warning.message, "Config warning");
    }
    for error in &report.errors {
        tracing::error!(path = %error.path, message = %error.message, "Config error");
    }
}

fn prepare(raw: &RuntimeConfig, substitute: impl Fn(&Value) -> Result<Value>) -> Result<RuntimeConfig> {
    let value = serde_json::to_value(raw).context("Failed to serialize config for processing")?;
    let value = substitute(&value).context("Failed to resolve env vars in config")?;
    let config: RuntimeConfig =
        serde_json::from_value(value).context("Failed to deserialize config after processing")?;
    Ok(apply_all_defaults(config))
}
