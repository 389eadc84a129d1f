//! `modforge config`: show, validate and initialize the runtime config.

use std::path::Path;

use anyhow::{bail, Result};
use modforge_config::{apply_all_defaults, validate, write_config, RuntimeConfig};

use crate::output::{note_error, note_success, note_warn};

pub fn show(config: &RuntimeConfig) -> Result<()> {
    print!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

pub fn check(config: &RuntimeConfig, path: &Path) -> Result<()> {
    let report = validate(config);
    for warning in &report.warnings {
        note_warn(&format!("{}: {}", warning.path, warning.message));
    }
    for error in &report.errors {
        note_error(&format!("{}: {}", error.path, error.message));
    }
    if !report.is_valid() {
        bail!("{} has {} error(s)", path.display(), report.errors.len());
    }
    note_success(&format!("{} is valid", path.display()));
    Ok(())
}

pub async fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists; pass --force to overwrite", path.display());
    }
    let config = apply_all_defaults(RuntimeConfig::default());
    write_config(&config, path).await?;
    note_success(&format!("Wrote {}", path.display()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        init(&path, false).await.unwrap();
        assert!(init(&path, false).await.is_err());
        init(&path, true).await.unwrap();

        let written = modforge_config::load_config(&path).await.unwrap();
        assert!(check(&written, &path).is_ok());
    }
}
