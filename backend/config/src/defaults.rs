//! Config defaults applied after parsing.

use crate::schema::{ExtensionsConfig, HostConfig, LoggingConfig, RuntimeConfig, SourceRootConfig};

pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Relative to the config directory.
pub const DEFAULT_LOG_DIR: &str = "logs";

/// Relative to the config directory.
pub const DEFAULT_SOURCE_ROOT: &str = "extensions";

pub const DEFAULT_HOST_VERSION: &str = "0.1.0";

pub const DEFAULT_HOT_TABLES: &[&str] = &["interpreter"];

/// Apply all defaults to a freshly loaded config.
pub fn apply_all_defaults(config: RuntimeConfig) -> RuntimeConfig {
    let config = apply_extension_defaults(config);
    let config = apply_host_defaults(config);
    apply_logging_defaults(config)
}

fn apply_extension_defaults(mut config: RuntimeConfig) -> RuntimeConfig {
    let extensions = config.extensions.get_or_insert_with(ExtensionsConfig::default);
    if extensions.source_roots.is_empty() {
        extensions.source_roots.push(SourceRootConfig {
            path: DEFAULT_SOURCE_ROOT.to_string(),
            bundled: false,
        });
    }
    if extensions.hot_tables.is_none() {
        extensions.hot_tables = Some(DEFAULT_HOT_TABLES.iter().map(|kind| kind.to_string()).collect());
    }
    config
}

fn apply_host_defaults(mut config: RuntimeConfig) -> RuntimeConfig {
    let host = config.host.get_or_insert_with(HostConfig::default);
    if host.version.is_none() {
        host.version = Some(DEFAULT_HOST_VERSION.to_string());
    }
    if host.role.is_none() {
        host.role = Some(Default::default());
    }
    config
}

fn apply_logging_defaults(mut config: RuntimeConfig) -> RuntimeConfig {
    let logging = config.logging.get_or_insert_with(LoggingConfig::default);
    if logging.level.is_none() {
        logging.level = Some(DEFAULT_LOG_LEVEL.to_string());
    }
    if logging.dir.is_none() {
        logging.dir = Some(DEFAULT_LOG_DIR.to_string());
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_gaps_only() {
        let mut config = RuntimeConfig::default();
        config.extensions = Some(ExtensionsConfig {
            hot_tables: Some(Vec::new()),
            ..Default::default()
        });
        let config = apply_all_defaults(config);

        assert!(config.hot_tables().is_empty());
        assert_eq!(config.extensions.as_ref().unwrap().source_roots.len(), 1);
        assert_eq!(config.host.as_ref().unwrap().version.as_deref(), Some(DEFAULT_HOST_VERSION));
        assert_eq!(config.logging.as_ref().unwrap().level.as_deref(), Some("info"));
    }

    #[test]
    fn test_default_hot_tables() {
        let config = apply_all_defaults(RuntimeConfig::default());
        assert_eq!(config.hot_tables(), ["interpreter"]);
    }
}
