//! Extension discovery.
//!
//! Walks the configured source roots in order, reads each bundle's manifest
//! and resolves its entry point. Earlier sources win id collisions; inside a
//! single root the newer copy of a bundle wins. No extension code runs here.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use modforge_core::ExtensionId;
use modforge_logging::{ExtensionEvent, ExtensionEventLogger};
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::entry::{normalize, EntryPoint, EntryResolver, InitFn};
use crate::manifest::{idify, BundleManifest};

/// A directory scanned for extension bundles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRoot {
    pub path: PathBuf,
    /// Shipped with the host; bundle namespaces fall back to the directory name.
    #[serde(default)]
    pub bundled: bool,
}

impl SourceRoot {
    pub fn bundled(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            bundled: true,
        }
    }

    pub fn user(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            bundled: false,
        }
    }
}

/// A bundle directory and its manifest, before entry resolution.
#[derive(Debug, Clone)]
pub struct BundleInfo {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub dir_name: String,
    pub path: PathBuf,
    pub version: Version,
    pub bundled: bool,
    pub manifest: BundleManifest,
}

impl BundleInfo {
    pub fn from_dir(path: &Path, bundled: bool) -> Result<Self> {
        let dir_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .with_context(|| format!("bundle directory has no usable name: {}", path.display()))?;

        let manifest = match BundleManifest::read(path) {
            Ok(Some(manifest)) => manifest,
            Ok(None) => {
                debug!(bundle = %dir_name, "No manifest; using directory name");
                BundleManifest::default()
            }
            Err(e) => {
                warn!(bundle = %dir_name, error = %format!("{e:#}"), "Unreadable manifest; using directory name");
                BundleManifest::default()
            }
        };

        let id = manifest.id.clone().unwrap_or_else(|| dir_name.clone());
        let name = if manifest.name.is_empty() {
            dir_name.clone()
        } else {
            manifest.name.clone()
        };
        let namespace = manifest
            .namespace
            .clone()
            .or_else(|| manifest.id.clone())
            .unwrap_or_else(|| if bundled { dir_name.clone() } else { idify(&name) });

        Ok(Self {
            id,
            name,
            namespace,
            version: manifest.parsed_version(),
            dir_name,
            path: path.to_path_buf(),
            bundled,
            manifest,
        })
    }

    /// Entry module name (`main`, default `index`).
    pub fn main(&self) -> &str {
        self.manifest.entry()
    }
}

/// Result of scanning one root, before entry resolution.
#[derive(Debug, Default)]
pub struct RootScan {
    pub bundles: Vec<BundleInfo>,
    /// Older duplicate copies that lost to a newer one in the same root.
    pub outdated: Vec<PathBuf>,
    pub failures: Vec<DiscoveryFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Scan one root. A missing root yields an empty scan.
pub fn scan_root(root: &SourceRoot) -> Result<RootScan> {
    let mut scan = RootScan::default();
    if !root.path.exists() {
        info!(root = %root.path.display(), "[Extensions] Source root does not exist; skipping");
        return Ok(scan);
    }

    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(&root.path)
        .with_context(|| format!("read extension root {}", root.path.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();

    let mut index_by_id: HashMap<String, usize> = HashMap::new();
    for dir in dirs {
        let bundle = match BundleInfo::from_dir(&dir, root.bundled) {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "[Extensions] Failed to read bundle");
                scan.failures.push(DiscoveryFailure {
                    path: dir,
                    error: format!("{e:#}"),
                });
                continue;
            }
        };

        match index_by_id.get(&bundle.id) {
            Some(&index) => {
                let existing = &scan.bundles[index];
                if bundle.version > existing.version {
                    warn!(
                        extension = %bundle.id,
                        kept = %bundle.path.display(),
                        outdated = %existing.path.display(),
                        "[Extensions] Duplicate bundle; keeping newer version"
                    );
                    let older = std::mem::replace(&mut scan.bundles[index], bundle);
                    scan.outdated.push(older.path);
                } else {
                    warn!(
                        extension = %bundle.id,
                        kept = %existing.path.display(),
                        outdated = %bundle.path.display(),
                        "[Extensions] Duplicate bundle; keeping newer version"
                    );
                    scan.outdated.push(bundle.path);
                }
            }
            None => {
                index_by_id.insert(bundle.id.clone(), scan.bundles.len());
                scan.bundles.push(bundle);
            }
        }
    }
    Ok(scan)
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// An extension ready for the coordinator. Immutable once discovered.
#[derive(Clone)]
pub struct ExtensionDescriptor {
    pub id: ExtensionId,
    pub name: String,
    pub namespace: String,
    pub origin_path: PathBuf,
    /// Loaded from a source root rather than compiled in.
    pub is_dynamic: bool,
    pub version: Version,
    /// Ids whose init must run first.
    pub dependencies: BTreeSet<ExtensionId>,
    pub init: InitFn,
}

impl ExtensionDescriptor {
    /// A compiled-in extension.
    pub fn builtin(id: &str, entry: EntryPoint) -> Self {
        Self {
            id: ExtensionId::from(id),
            name: id.to_string(),
            namespace: id.to_string(),
            origin_path: PathBuf::from("builtin").join(id),
            is_dynamic: false,
            version: Version::new(0, 0, 0),
            dependencies: BTreeSet::new(),
            init: normalize(entry),
        }
    }

    pub fn from_bundle(bundle: &BundleInfo, entry: EntryPoint) -> Self {
        Self {
            id: ExtensionId::from(bundle.id.as_str()),
            name: bundle.name.clone(),
            namespace: bundle.namespace.clone(),
            origin_path: bundle.path.clone(),
            is_dynamic: true,
            version: bundle.version.clone(),
            dependencies: bundle
                .manifest
                .dependencies
                .iter()
                .map(|dep| ExtensionId::from(dep.as_str()))
                .collect(),
            init: normalize(entry),
        }
    }

    pub fn depends_on(mut self, id: &str) -> Self {
        self.dependencies.insert(ExtensionId::from(id));
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }
}

impl fmt::Debug for ExtensionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionDescriptor")
            .field("id", &self.id)
            .field("namespace", &self.namespace)
            .field("origin_path", &self.origin_path)
            .field("is_dynamic", &self.is_dynamic)
            .field("version", &self.version.to_string())
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    ShadowedBy(PathBuf),
    NoEntryPoint,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Disabled => f.write_str("disabled"),
            SkipReason::ShadowedBy(path) => write!(f, "shadowed by {}", path.display()),
            SkipReason::NoEntryPoint => f.write_str("no entry point"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedBundle {
    pub id: String,
    pub path: PathBuf,
    pub reason: SkipReason,
}

#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// In discovery order: built-ins, then each root's bundles sorted by directory name.
    pub descriptors: Vec<ExtensionDescriptor>,
    pub skipped: Vec<SkippedBundle>,
    pub outdated: Vec<PathBuf>,
    pub failures: Vec<DiscoveryFailure>,
}

pub struct ExtensionLoader {
    resolver: Arc<dyn EntryResolver>,
    builtins: Vec<ExtensionDescriptor>,
    disabled: BTreeSet<String>,
}

impl ExtensionLoader {
    pub fn new(resolver: impl EntryResolver + 'static) -> Self {
        Self {
            resolver: Arc::new(resolver),
            builtins: Vec::new(),
            disabled: BTreeSet::new(),
        }
    }

    /// Compiled-in extensions are discovered before every source root.
    pub fn with_builtin(mut self, descriptor: ExtensionDescriptor) -> Self {
        self.builtins.push(descriptor);
        self
    }

    pub fn with_disabled<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disabled.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn discover(&self, roots: &[SourceRoot]) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        let mut claimed: HashMap<String, PathBuf> = HashMap::new();

        for builtin in &self.builtins {
            let id = builtin.id.as_str();
            if let Some(reason) = self.skip_reason(id, &claimed) {
                report.skip(id, &builtin.origin_path, reason);
                continue;
            }
            claimed.insert(id.to_string(), builtin.origin_path.clone());
            report.accept(builtin.clone());
        }

        for root in roots {
            let scan = match scan_root(root) {
                Ok(scan) => scan,
                Err(e) => {
                    warn!(root = %root.path.display(), error = %format!("{e:#}"), "[Extensions] Failed to scan root");
                    report.failures.push(DiscoveryFailure {
                        path: root.path.clone(),
                        error: format!("{e:#}"),
                    });
                    continue;
                }
            };
            report.outdated.extend(scan.outdated);
            report.failures.extend(scan.failures);

            for bundle in scan.bundles {
                if let Some(reason) = self.skip_reason(&bundle.id, &claimed) {
                    report.skip(&bundle.id, &bundle.path, reason);
                    continue;
                }
                let Some(entry) = self.resolver.resolve(&bundle) else {
                    report.skip(&bundle.id, &bundle.path, SkipReason::NoEntryPoint);
                    continue;
                };
                debug!(extension = %bundle.id, shape = entry.shape(), "[Extensions] Entry resolved");
                claimed.insert(bundle.id.clone(), bundle.path.clone());
                report.accept(ExtensionDescriptor::from_bundle(&bundle, entry));
            }
        }

        info!(
            discovered = report.descriptors.len(),
            skipped = report.skipped.len(),
            outdated = report.outdated.len(),
            "[Extensions] Discovery complete"
        );
        report
    }

    fn skip_reason(&self, id: &str, claimed: &HashMap<String, PathBuf>) -> Option<SkipReason> {
        if self.disabled.contains(id) {
            return Some(SkipReason::Disabled);
        }
        claimed.get(id).map(|winner| SkipReason::ShadowedBy(winner.clone()))
    }
}

impl DiscoveryReport {
    fn accept(&mut self, descriptor: ExtensionDescriptor) {
        ExtensionEventLogger::log_event(
            descriptor.id.as_str(),
            ExtensionEvent::Discovered {
                origin_path: descriptor.origin_path.display().to_string(),
                version: descriptor.version.to_string(),
                dynamic: descriptor.is_dynamic,
            },
        );
        self.descriptors.push(descriptor);
    }

    fn skip(&mut self, id: &str, path: &Path, reason: SkipReason) {
        match &reason {
            SkipReason::ShadowedBy(winner) => warn!(
                extension = id,
                path = %path.display(),
                winner = %winner.display(),
                "[Extensions] Id already provided by an earlier source; skipping"
            ),
            SkipReason::Disabled | SkipReason::NoEntryPoint => {
                debug!(extension = id, path = %path.display(), reason = %reason, "[Extensions] Skipping bundle")
            }
        }
        ExtensionEventLogger::log_event(
            id,
            ExtensionEvent::Skipped {
                origin_path: path.display().to_string(),
                reason: reason.to_string(),
            },
        );
        self.skipped.push(SkippedBundle {
            id: id.to_string(),
            path: path.to_path_buf(),
            reason,
        });
    }
}
