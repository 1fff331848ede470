use anyhow::Context;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// Copies `src` into `dst` recursively, creating `dst` as needed.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> anyhow::Result<()> {
    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("Unexpected path outside {}", src.display()))?;
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            std::fs::copy(entry.path(), &target).with_context(|| {
                format!(
                    "Failed to copy {} to {}",
                    entry.path().display(),
                    target.display()
                )
            })?;
        }
    }

    Ok(())
}

/// Async wrapper running the copy on the blocking pool.
pub async fn copy_dir(src: PathBuf, dst: PathBuf) -> anyhow::Result<()> {
    tokio::task::spawn_blocking(move || copy_dir_recursive(&src, &dst))
        .await
        .context("copy task panicked")?
}

pub async fn remove_dir(path: &Path) -> anyhow::Result<()> {
    tokio::fs::remove_dir_all(path)
        .await
        .with_context(|| format!("Failed to remove {}", path.display()))
}

pub async fn modified(path: &Path) -> anyhow::Result<SystemTime> {
    tokio::fs::metadata(path)
        .await
        .and_then(|m| m.modified())
        .with_context(|| format!("Failed to read modification time of {}", path.display()))
}

pub async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// Immediate children of `dir`, sorted by name.
pub async fn list_dir(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read directory {}", dir.display()))?;

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}
