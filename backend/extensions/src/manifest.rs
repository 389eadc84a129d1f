/// Extension bundle manifest (`info.json` at the bundle root).
use std::path::Path;

use anyhow::{bail, Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};

pub const MANIFEST_FILE: &str = "info.json";

/// Entry module used when the manifest names none.
pub const DEFAULT_ENTRY: &str = "index";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Entry module relative to the bundle root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    /// Ids that must be initialized before this bundle.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl BundleManifest {
    /// Read the manifest in `dir`; `Ok(None)` when the bundle has none.
    pub fn read(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("read manifest at {}", path.display()))?;
        let manifest: BundleManifest =
            serde_json::from_str(&raw).with_context(|| format!("parse manifest at {}", path.display()))?;
        manifest.validate()?;
        Ok(Some(manifest))
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(id) = &self.id {
            if id.trim().is_empty() {
                bail!("Bundle manifest has an empty 'id'");
            }
        }
        if let Some(main) = &self.main {
            if main.trim().is_empty() {
                bail!("Bundle manifest has an empty 'main'");
            }
        }
        if let Some(version) = &self.version {
            Version::parse(version).with_context(|| format!("invalid version '{version}'"))?;
        }
        if self.dependencies.iter().any(|dep| dep.trim().is_empty()) {
            bail!("Bundle manifest lists an empty dependency id");
        }
        Ok(())
    }

    /// Declared version, `0.0.0` when absent.
    pub fn parsed_version(&self) -> Version {
        self.version
            .as_deref()
            .and_then(|v| Version::parse(v).ok())
            .unwrap_or_else(|| Version::new(0, 0, 0))
    }

    pub fn entry(&self) -> &str {
        self.main.as_deref().unwrap_or(DEFAULT_ENTRY)
    }
}

/// Turn a display name into an id: lowercase, `:` and `'` dropped, spaces and underscores to `-`.
pub fn idify(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, ':' | '\''))
        .map(|c| match c {
            ' ' | '_' => '-',
            other => other,
        })
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idify() {
        assert_eq!(idify("Gamebryo Plugin_Management"), "gamebryo-plugin-management");
        assert_eq!(idify("Fallout: New Vegas' Support"), "fallout-new-vegas-support");
    }

    #[test]
    fn test_read_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert!(BundleManifest::read(dir.path()).unwrap().is_none());

        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{"name": "Sample", "version": "1.2.3", "dependencies": ["base"]}"#,
        )
        .unwrap();
        let manifest = BundleManifest::read(dir.path()).unwrap().unwrap();
        assert_eq!(manifest.parsed_version(), Version::new(1, 2, 3));
        assert_eq!(manifest.entry(), DEFAULT_ENTRY);
        assert_eq!(manifest.dependencies, vec!["base"]);
    }

    #[test]
    fn test_invalid_manifest_rejected() {
        let bad_version = BundleManifest {
            version: Some("one".into()),
            ..Default::default()
        };
        assert!(bad_version.validate().is_err());

        let empty_dep = BundleManifest {
            dependencies: vec![" ".into()],
            ..Default::default()
        };
        assert!(empty_dep.validate().is_err());
    }
}
