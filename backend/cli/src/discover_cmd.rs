//! `modforge discover`: dry-run discovery over the configured source roots.

use std::path::Path;

use anyhow::{bail, Context, Result};
use modforge_config::RuntimeConfig;
use modforge_extensions::{
    resolve_load_order, BundleInfo, CoordinatorOptions, DiscoveryReport, EntryPoint, EntryResolver, ExtensionLoader, SourceRoot,
    MANIFEST_FILE,
};
use serde_json::json;

use crate::output::{dim, note_error, note_info, note_success, note_warn, render_table};

/// Treats every bundle with a manifest as loadable, without running anything.
struct ManifestResolver;

impl EntryResolver for ManifestResolver {
    fn resolve(&self, bundle: &BundleInfo) -> Option<EntryPoint> {
        bundle
            .path
            .join(MANIFEST_FILE)
            .is_file()
            .then(|| EntryPoint::bare(|_ctx| Ok(())))
    }
}

pub fn discover(config: &RuntimeConfig, base: &Path) -> DiscoveryReport {
    let roots: Vec<SourceRoot> = config
        .source_roots(base)
        .into_iter()
        .map(|(path, bundled)| {
            if bundled {
                SourceRoot::bundled(path)
            } else {
                SourceRoot::user(path)
            }
        })
        .collect();
    ExtensionLoader::new(ManifestResolver)
        .with_disabled(config.disabled().iter().cloned())
        .discover(&roots)
}

pub fn run(config: &RuntimeConfig, base: &Path, as_json: bool) -> Result<()> {
    let options = CoordinatorOptions::from_config(config).context("invalid host configuration")?;
    let report = discover(config, base);
    let order = resolve_load_order(report.descriptors.clone());

    if as_json {
        let value = json!({
            "host": {
                "version": options.host_version.to_string(),
                "role": options.role.to_string(),
                "hotTables": options.hot_tables.kinds(),
            },
            "extensions": report.descriptors.iter().map(|d| json!({
                "id": d.id.as_str(),
                "name": d.name,
                "namespace": d.namespace,
                "version": d.version.to_string(),
                "path": d.origin_path.display().to_string(),
                "dependencies": d.dependencies.iter().map(|dep| dep.as_str()).collect::<Vec<_>>(),
            })).collect::<Vec<_>>(),
            "skipped": report.skipped.iter().map(|s| json!({
                "id": s.id,
                "path": s.path.display().to_string(),
                "reason": s.reason.to_string(),
            })).collect::<Vec<_>>(),
            "outdated": report.outdated.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
            "failures": report.failures.iter().map(|f| json!({
                "path": f.path.display().to_string(),
                "error": f.error,
            })).collect::<Vec<_>>(),
            "loadOrder": order.as_ref().ok().map(|o| o.iter().map(|d| d.id.as_str()).collect::<Vec<_>>()),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        note_info(&format!(
            "Host {} ({}), hot tables: {}",
            options.host_version,
            options.role,
            options.hot_tables.kinds().join(", ")
        ));
        print_report(&report);
    }

    match order {
        Ok(order) => {
            if !as_json {
                let ids: Vec<&str> = order.iter().map(|d| d.id.as_str()).collect();
                note_success(&format!("Load order: {}", ids.join(" -> ")));
            }
            Ok(())
        }
        Err(e) => {
            note_error(&e.to_string());
            bail!("extension set cannot start: {e}")
        }
    }
}

fn print_report(report: &DiscoveryReport) {
    if report.descriptors.is_empty() {
        note_info("No extensions found");
    } else {
        let rows: Vec<Vec<String>> = report
            .descriptors
            .iter()
            .map(|d| {
                vec![
                    d.id.to_string(),
                    d.version.to_string(),
                    d.namespace.clone(),
                    dim(&d.origin_path.display().to_string()),
                ]
            })
            .collect();
        print!("{}", render_table(&["ID", "VERSION", "NAMESPACE", "PATH"], &rows));
    }

    let discovered: Vec<&str> = report.descriptors.iter().map(|d| d.id.as_str()).collect();
    for descriptor in &report.descriptors {
        for dependency in &descriptor.dependencies {
            if !discovered.contains(&dependency.as_str()) {
                note_warn(&format!(
                    "{} depends on {}, which was not discovered",
                    descriptor.id, dependency
                ));
            }
        }
    }
    for skipped in &report.skipped {
        note_info(&format!("Skipped {} ({}): {}", skipped.id, skipped.path.display(), skipped.reason));
    }
    for path in &report.outdated {
        note_warn(&format!("Outdated copy ignored: {}", path.display()));
    }
    for failure in &report.failures {
        note_error(&format!("{}: {}", failure.path.display(), failure.error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modforge_config::{ExtensionsConfig, HostConfig, SourceRootConfig};

    fn bundle(root: &Path, dir: &str, manifest: Option<&str>) {
        let path = root.join(dir);
        std::fs::create_dir_all(&path).unwrap();
        if let Some(manifest) = manifest {
            std::fs::write(path.join(MANIFEST_FILE), manifest).unwrap();
        }
    }

    fn config_with(disabled: &[&str]) -> RuntimeConfig {
        RuntimeConfig {
            extensions: Some(ExtensionsConfig {
                source_roots: vec![SourceRootConfig {
                    path: "extensions".into(),
                    bundled: false,
                }],
                disabled: disabled.iter().map(|s| s.to_string()).collect(),
                hot_tables: None,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_manifest_bundles_discovered_in_dependency_order() {
        let base = tempfile::tempdir().unwrap();
        let root = base.path().join("extensions");
        bundle(&root, "a-profiles", Some(r#"{"id": "profiles", "dependencies": ["zeta-base"]}"#));
        bundle(&root, "assets-only", None);
        bundle(&root, "legacy", Some(r#"{"id": "legacy"}"#));
        bundle(&root, "zeta", Some(r#"{"id": "zeta-base", "version": "2.0.0"}"#));

        let report = discover(&config_with(&["legacy"]), base.path());
        let ids: Vec<&str> = report.descriptors.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["profiles", "zeta-base"]);
        assert_eq!(report.skipped.len(), 2);

        let order = resolve_load_order(report.descriptors).unwrap();
        let ordered: Vec<&str> = order.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ordered, vec!["zeta-base", "profiles"]);
    }

    #[test]
    fn test_cycle_fails_run() {
        let base = tempfile::tempdir().unwrap();
        let root = base.path().join("extensions");
        bundle(&root, "one", Some(r#"{"id": "one", "dependencies": ["two"]}"#));
        bundle(&root, "two", Some(r#"{"id": "two", "dependencies": ["one"]}"#));
        assert!(run(&config_with(&[]), base.path(), true).is_err());
    }

    #[test]
    fn test_invalid_host_version_fails_run() {
        let base = tempfile::tempdir().unwrap();
        let mut config = config_with(&[]);
        config.host = Some(HostConfig {
            version: Some("next".into()),
            ..Default::default()
        });
        let err = run(&config, base.path(), true).unwrap_err();
        assert!(format!("{err:#}").contains("host.version"));
    }
}
