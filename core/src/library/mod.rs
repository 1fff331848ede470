pub mod cache;

pub use cache::{LibraryCache, LibraryCacheEntry};

use anyhow::{bail, Context};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::process::Command;

use crate::config::StagingConfig;
use crate::files;
use crate::metadata::{base_name, MetadataStore};

const SOURCE_DIR: &str = "src";
const SOURCE_ARCHIVE: &str = "src.7z";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedLibrary {
    pub id: String,
    pub target_names: Vec<String>,
    pub cached: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub id: String,
    pub error: String,
    /// What an earlier batch staged for this library, when known.
    pub previous_names: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct StageReport {
    pub staged: Vec<StagedLibrary>,
    pub failures: Vec<StageFailure>,
}

impl StageReport {
    /// Every sandbox directory name produced by this batch.
    pub fn names(&self) -> BTreeSet<String> {
        self.staged
            .iter()
            .flat_map(|lib| lib.target_names.iter().cloned())
            .collect()
    }

    /// Names eviction has to leave alone: this batch's names plus whatever
    /// failed libraries staged before. `None` when a failed library's
    /// directories are unknown, so nothing can safely be evicted.
    pub fn retained_names(&self) -> Option<BTreeSet<String>> {
        let mut names = self.names();
        for failure in &self.failures {
            names.extend(failure.previous_names.clone()?);
        }
        Some(names)
    }

    pub fn warning(&self) -> Option<String> {
        if self.failures.is_empty() {
            return None;
        }
        let lines: Vec<String> = self
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.id, f.error))
            .collect();
        Some(format!(
            "{} librar{} failed to stage:\n{}",
            self.failures.len(),
            if self.failures.len() == 1 { "y" } else { "ies" },
            lines.join("\n")
        ))
    }
}

/// Copies declared libraries into the build sandbox, one task per library.
#[derive(Debug, Clone)]
pub struct LibraryStager {
    cache: LibraryCache,
    seven_zip: String,
    development_mode: bool,
}

impl LibraryStager {
    pub fn new(config: &StagingConfig) -> Self {
        Self {
            cache: LibraryCache::new(),
            seven_zip: config.seven_zip.clone(),
            development_mode: config.development_mode,
        }
    }

    /// Stages every library and waits for all of them. A failing library is
    /// reported and never stops the others.
    pub async fn stage_all(
        &self,
        store: &dyn MetadataStore,
        library_ids: &[String],
        target_dir: &Path,
    ) -> StageReport {
        let mut handles = Vec::with_capacity(library_ids.len());

        for id in library_ids {
            let stager = self.clone();
            let id = id.clone();
            let source_root = store.package_dir(&id);
            let target_dir = target_dir.to_path_buf();

            let handle = tokio::spawn(async move {
                let result = stager.stage_one(&id, &source_root, &target_dir).await;
                (id, result)
            });
            handles.push(handle);
        }

        let mut report = StageReport::default();
        for (handle, id) in handles.into_iter().zip(library_ids) {
            match handle.await {
                Ok((_, Ok(staged))) => report.staged.push(staged),
                Ok((id, Err(err))) => report.failures.push(StageFailure {
                    previous_names: self.cache.target_names(&id),
                    id,
                    error: format!("{:#}", err),
                }),
                Err(err) => report.failures.push(StageFailure {
                    id: id.clone(),
                    error: format!("staging task failed: {}", err),
                    previous_names: self.cache.target_names(id),
                }),
            }
        }

        report
    }

    async fn stage_one(
        &self,
        id: &str,
        source_root: &Path,
        target_dir: &Path,
    ) -> anyhow::Result<StagedLibrary> {
        let modified = files::modified(source_root)
            .await
            .with_context(|| format!("Library {} is not installed", id))?;

        if let Some(entry) = self.cache.lookup(id, modified) {
            return Ok(StagedLibrary {
                id: id.to_string(),
                target_names: entry.target_names,
                cached: true,
            });
        }

        let Some(mut source) = self.resolve_source(source_root).await? else {
            self.remember(id, false, Vec::new());
            return Ok(StagedLibrary {
                id: id.to_string(),
                target_names: Vec::new(),
                cached: false,
            });
        };

        let children = files::list_dir(&source).await?;
        if let [only] = children.as_slice() {
            if only.file_name().is_some_and(|n| n == SOURCE_DIR) && files::is_dir(only).await {
                source = only.clone();
            }
        }

        let has_header_files = has_headers(&source).await?;
        let mut target_names = Vec::new();

        if has_header_files {
            let name = base_name(id).to_string();
            self.copy_into(&source, &target_dir.join(&name)).await?;
            target_names.push(name);
        } else {
            for child in files::list_dir(&source).await? {
                if !files::is_dir(&child).await {
                    continue;
                }
                let Some(name) = child.file_name().map(|n| n.to_string_lossy().to_string())
                else {
                    continue;
                };
                self.copy_into(&child, &target_dir.join(&name)).await?;
                target_names.push(name);
            }
        }

        self.remember(id, has_header_files, target_names.clone());

        Ok(StagedLibrary {
            id: id.to_string(),
            target_names,
            cached: false,
        })
    }

    /// `src/`, else `src.7z` extracted in place, else nothing to stage.
    async fn resolve_source(&self, source_root: &Path) -> anyhow::Result<Option<PathBuf>> {
        let source = source_root.join(SOURCE_DIR);
        if files::is_dir(&source).await {
            return Ok(Some(source));
        }

        let archive = source_root.join(SOURCE_ARCHIVE);
        if tokio::fs::metadata(&archive).await.is_err() {
            return Ok(None);
        }

        self.extract(&archive, source_root).await?;
        if !files::is_dir(&source).await {
            bail!("{} did not contain a src directory", archive.display());
        }
        Ok(Some(source))
    }

    async fn extract(&self, archive: &Path, dest: &Path) -> anyhow::Result<()> {
        let output = Command::new(&self.seven_zip)
            .arg("x")
            .arg("-y")
            .arg(format!("-o{}", dest.display()))
            .arg(archive)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.seven_zip))?;

        if !output.status.success() {
            bail!(
                "Failed to extract {}: {}",
                archive.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    /// Existing targets are kept, except in development mode where they are
    /// replaced.
    async fn copy_into(&self, source: &Path, target: &Path) -> anyhow::Result<()> {
        if tokio::fs::metadata(target).await.is_ok() {
            if !self.development_mode {
                return Ok(());
            }
            files::remove_dir(target).await?;
        }
        files::copy_dir(source.to_path_buf(), target.to_path_buf()).await
    }

    fn remember(&self, id: &str, has_header_files: bool, target_names: Vec<String>) {
        self.cache.store(
            id,
            LibraryCacheEntry {
                timestamp: SystemTime::now(),
                has_header_files,
                target_names,
            },
        );
    }
}

/// Removes staged directories that belong to no declared library. Returns
/// the removed names.
pub async fn evict_stale(
    target_dir: &Path,
    staged: &BTreeSet<String>,
    library_ids: &[String],
) -> anyhow::Result<Vec<String>> {
    if !files::is_dir(target_dir).await {
        return Ok(Vec::new());
    }

    let prefixes: Vec<&str> = library_ids.iter().map(|id| base_name(id)).collect();
    let mut removed = Vec::new();

    for entry in files::list_dir(target_dir).await? {
        let Some(name) = entry.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        if staged.contains(&name) || prefixes.iter().any(|p| name.starts_with(p)) {
            continue;
        }
        if files::is_dir(&entry).await {
            files::remove_dir(&entry).await?;
        } else {
            tokio::fs::remove_file(&entry).await?;
        }
        removed.push(name);
    }

    Ok(removed)
}

async fn has_headers(dir: &Path) -> anyhow::Result<bool> {
    for entry in files::list_dir(dir).await? {
        let is_header = entry.extension().is_some_and(|ext| ext == "h");
        if is_header && !files::is_dir(&entry).await {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{BoardMetadata, PackageMetadata};
    use std::fs;

    fn stager(development_mode: bool) -> LibraryStager {
        LibraryStager::new(&StagingConfig {
            development_mode,
            seven_zip: "/nonexistent/kiln-7z".to_string(),
        })
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    /// Packages installed under `vendor/` instead of `node_modules/`.
    struct VendorStore {
        root: PathBuf,
    }

    impl MetadataStore for VendorStore {
        fn package_metadata(&self) -> anyhow::Result<PackageMetadata> {
            bail!("no package.json in fixture")
        }

        fn board_metadata(&self, _board_package: &str) -> anyhow::Result<Option<BoardMetadata>> {
            Ok(None)
        }

        fn package_dir(&self, package: &str) -> PathBuf {
            package.split('/').fold(self.root.clone(), |dir, part| dir.join(part))
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        store: VendorStore,
        target: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = VendorStore {
                root: dir.path().join("vendor"),
            };
            let target = dir.path().join(".temp").join("libraries");
            fs::create_dir_all(&store.root).unwrap();
            fs::create_dir_all(&target).unwrap();
            Self { dir, store, target }
        }

        fn library(&self, id: &str) -> PathBuf {
            let root = self.store.package_dir(id);
            fs::create_dir_all(&root).unwrap();
            root
        }

        fn write(&self, path: PathBuf, content: &str) {
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
    }

    #[tokio::test]
    async fn test_header_library_copied_whole() {
        let fx = Fixture::new();
        let root = fx.library("@kiln/lib-servo");
        fx.write(root.join("src").join("Servo.h"), "#pragma once");
        fx.write(root.join("src").join("Servo.cpp"), "");

        let report = stager(false)
            .stage_all(&fx.store, &ids(&["@kiln/lib-servo"]), &fx.target)
            .await;

        assert!(report.failures.is_empty());
        assert_eq!(report.staged[0].target_names, vec!["lib-servo"]);
        assert!(fx.target.join("lib-servo").join("Servo.h").exists());
        assert!(fx.target.join("lib-servo").join("Servo.cpp").exists());
    }

    #[tokio::test]
    async fn test_headerless_library_copies_each_subdirectory() {
        let fx = Fixture::new();
        let root = fx.library("@kiln/lib-sensors");
        fx.write(root.join("src").join("DHT").join("DHT.h"), "");
        fx.write(root.join("src").join("Adafruit_Sensor").join("Sensor.h"), "");
        fx.write(root.join("src").join("README.md"), "");

        let report = stager(false)
            .stage_all(&fx.store, &ids(&["@kiln/lib-sensors"]), &fx.target)
            .await;

        assert_eq!(report.staged[0].target_names, vec!["Adafruit_Sensor", "DHT"]);
        assert!(fx.target.join("DHT").join("DHT.h").exists());
        assert!(!fx.target.join("README.md").exists());
    }

    #[tokio::test]
    async fn test_nested_src_is_descended() {
        let fx = Fixture::new();
        let root = fx.library("@kiln/lib-nested");
        fx.write(root.join("src").join("src").join("Nested.h"), "");

        let report = stager(false)
            .stage_all(&fx.store, &ids(&["@kiln/lib-nested"]), &fx.target)
            .await;

        assert_eq!(report.staged[0].target_names, vec!["lib-nested"]);
        assert!(fx.target.join("lib-nested").join("Nested.h").exists());
    }

    #[tokio::test]
    async fn test_library_without_sources_contributes_nothing() {
        let fx = Fixture::new();
        let root = fx.library("@kiln/lib-docs");
        fx.write(root.join("README.md"), "docs only");

        let report = stager(false)
            .stage_all(&fx.store, &ids(&["@kiln/lib-docs"]), &fx.target)
            .await;

        assert!(report.failures.is_empty());
        assert!(report.staged[0].target_names.is_empty());
        assert!(report.names().is_empty());
        assert_eq!(fs::read_dir(&fx.target).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_second_stage_hits_cache_without_copying() {
        let fx = Fixture::new();
        let root = fx.library("@kiln/lib-servo");
        fx.write(root.join("src").join("Servo.h"), "");
        let stager = stager(false);
        let libs = ids(&["@kiln/lib-servo"]);

        let first = stager.stage_all(&fx.store, &libs, &fx.target).await;
        assert!(!first.staged[0].cached);

        fs::remove_dir_all(fx.target.join("lib-servo")).unwrap();
        let second = stager.stage_all(&fx.store, &libs, &fx.target).await;

        assert!(second.staged[0].cached);
        assert_eq!(second.names(), first.names());
        assert!(!fx.target.join("lib-servo").exists());
    }

    #[tokio::test]
    async fn test_existing_target_kept_unless_development_mode() {
        let fx = Fixture::new();
        let root = fx.library("@kiln/lib-servo");
        fx.write(root.join("src").join("Servo.h"), "new");
        fx.write(fx.target.join("lib-servo").join("Servo.h"), "old");
        let libs = ids(&["@kiln/lib-servo"]);

        stager(false).stage_all(&fx.store, &libs, &fx.target).await;
        let staged = fx.target.join("lib-servo").join("Servo.h");
        assert_eq!(fs::read_to_string(&staged).unwrap(), "old");

        stager(true).stage_all(&fx.store, &libs, &fx.target).await;
        assert_eq!(fs::read_to_string(&staged).unwrap(), "new");
    }

    #[tokio::test]
    async fn test_failing_library_does_not_stop_others() {
        let fx = Fixture::new();
        let good = fx.library("@kiln/lib-servo");
        fx.write(good.join("src").join("Servo.h"), "");
        let broken = fx.library("@kiln/lib-archived");
        fx.write(broken.join("src.7z"), "not an archive");

        let report = stager(false)
            .stage_all(
                &fx.store,
                &ids(&["@kiln/lib-archived", "@kiln/lib-servo", "@kiln/lib-missing"]),
                &fx.target,
            )
            .await;

        assert_eq!(report.staged.len(), 1);
        assert_eq!(report.staged[0].id, "@kiln/lib-servo");
        let failed: Vec<_> = report.failures.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(failed, vec!["@kiln/lib-archived", "@kiln/lib-missing"]);
        assert!(report.warning().unwrap().starts_with("2 libraries failed"));
        assert!(fx.target.join("lib-servo").exists());
    }

    #[tokio::test]
    async fn test_evict_stale_keeps_staged_and_declared() {
        let fx = Fixture::new();
        for name in ["lib-servo", "DHT", "lib-servo-extra", "OldLib"] {
            fs::create_dir_all(fx.target.join(name)).unwrap();
        }
        let staged: BTreeSet<String> = ["lib-servo", "DHT"].iter().map(|s| s.to_string()).collect();

        let removed = evict_stale(&fx.target, &staged, &ids(&["@kiln/lib-servo"]))
            .await
            .unwrap();

        assert_eq!(removed, vec!["OldLib"]);
        assert!(fx.target.join("lib-servo-extra").exists());
        assert!(fx.target.join("DHT").exists());
    }

    #[tokio::test]
    async fn test_sources_come_from_metadata_store() {
        let fx = Fixture::new();
        let vendored = fx.library("@kiln/lib-servo");
        fx.write(vendored.join("src").join("Servo.h"), "");
        let elsewhere = fx.dir.path().join("node_modules").join("@kiln").join("lib-dht");
        fx.write(elsewhere.join("src").join("DHT.h"), "");

        let report = stager(false)
            .stage_all(&fx.store, &ids(&["@kiln/lib-servo", "@kiln/lib-dht"]), &fx.target)
            .await;

        assert_eq!(report.staged.len(), 1);
        assert_eq!(report.staged[0].id, "@kiln/lib-servo");
        assert_eq!(report.failures[0].id, "@kiln/lib-dht");
        assert!(report.failures[0].error.contains("not installed"));
    }

    #[tokio::test]
    async fn test_failed_library_keeps_its_earlier_directories() {
        let fx = Fixture::new();
        let root = fx.library("@kiln/lib-sensors");
        fx.write(root.join("src").join("DHT").join("DHT.h"), "");
        fs::create_dir_all(fx.target.join("OldLib")).unwrap();
        let stager = stager(false);
        let libs = ids(&["@kiln/lib-sensors"]);

        let first = stager.stage_all(&fx.store, &libs, &fx.target).await;
        assert_eq!(first.staged[0].target_names, vec!["DHT"]);

        fs::remove_dir_all(&root).unwrap();
        let second = stager.stage_all(&fx.store, &libs, &fx.target).await;
        assert_eq!(second.failures.len(), 1);
        assert_eq!(second.failures[0].previous_names, Some(vec!["DHT".to_string()]));

        let keep = second.retained_names().unwrap();
        let removed = evict_stale(&fx.target, &keep, &libs).await.unwrap();
        assert_eq!(removed, vec!["OldLib"]);
        assert!(fx.target.join("DHT").join("DHT.h").exists());
    }

    #[test]
    fn test_unknown_failure_blocks_eviction() {
        let report = StageReport {
            staged: vec![StagedLibrary {
                id: "@kiln/lib-servo".to_string(),
                target_names: vec!["lib-servo".to_string()],
                cached: false,
            }],
            failures: vec![StageFailure {
                id: "@kiln/lib-sensors".to_string(),
                error: "Library @kiln/lib-sensors is not installed".to_string(),
                previous_names: None,
            }],
        };
        assert!(report.retained_names().is_none());
        assert_eq!(report.names().len(), 1);
    }
}
