//! Runtime configuration schema (`config.yaml`, camelCase keys).

use std::path::{Path, PathBuf};

use modforge_core::ProcessRole;
use serde::{Deserialize, Serialize};

use crate::defaults::{DEFAULT_HOST_VERSION, DEFAULT_LOG_DIR, DEFAULT_LOG_LEVEL};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Where extension bundles live and which ones to skip
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<ExtensionsConfig>,

    /// Identity of this process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<HostConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionsConfig {
    /// Scanned in order; an id found in an earlier root shadows later ones.
    #[serde(default)]
    pub source_roots: Vec<SourceRootConfig>,
    #[serde(default)]
    pub disabled: Vec<String>,
    /// Capability kinds that keep accepting registrations after startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hot_tables: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRootConfig {
    /// Relative paths are resolved against the config directory.
    pub path: String,
    /// Ships with the application (namespace falls back to the directory name).
    #[serde(default)]
    pub bundled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    /// Semver version extensions are checked against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<ProcessRole>,
    /// Bridge origin id; random per process when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>, // "trace" | "debug" | "info" | "warn" | "error"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

// ---------------------------------------------------------------------------
// Accessors
// ---------------------------------------------------------------------------

impl RuntimeConfig {
    /// Source roots with relative paths joined onto `base`.
    pub fn source_roots(&self, base: &Path) -> Vec<(PathBuf, bool)> {
        self.extensions
            .as_ref()
            .map(|ext| {
                ext.source_roots
                    .iter()
                    .map(|root| (resolve(base, &root.path), root.bundled))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn disabled(&self) -> &[String] {
        self.extensions
            .as_ref()
            .map(|ext| ext.disabled.as_slice())
            .unwrap_or_default()
    }

    pub fn hot_tables(&self) -> &[String] {
        self.extensions
            .as_ref()
            .and_then(|ext| ext.hot_tables.as_deref())
            .unwrap_or_default()
    }

    pub fn host_version(&self) -> Result<semver::Version, semver::Error> {
        let raw = self
            .host
            .as_ref()
            .and_then(|host| host.version.as_deref())
            .unwrap_or(DEFAULT_HOST_VERSION);
        semver::Version::parse(raw)
    }

    pub fn role(&self) -> ProcessRole {
        self.host.as_ref().and_then(|host| host.role).unwrap_or_default()
    }

    pub fn process_id(&self) -> Option<&str> {
        self.host.as_ref().and_then(|host| host.process_id.as_deref())
    }

    pub fn log_level(&self) -> &str {
        self.logging
            .as_ref()
            .and_then(|logging| logging.level.as_deref())
            .unwrap_or(DEFAULT_LOG_LEVEL)
    }

    pub fn log_dir(&self, base: &Path) -> PathBuf {
        let dir = self
            .logging
            .as_ref()
            .and_then(|logging| logging.dir.as_deref())
            .unwrap_or(DEFAULT_LOG_DIR);
        resolve(base, dir)
    }
}

fn resolve(base: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
