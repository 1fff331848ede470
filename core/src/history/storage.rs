use super::HistoryEntry;
use anyhow::Context;
use std::fs;
use std::path::Path;

/// Missing file means no history yet.
pub fn load_history(path: &Path) -> anyhow::Result<Vec<HistoryEntry>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("Failed to read history file: {}", path.display()))
        }
    };

    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse history file: {}", path.display()))
}

/// Writes through a sibling temp file so an interrupted save keeps the old file.
pub fn save_history(path: &Path, entries: &[HistoryEntry]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create history directory: {}", parent.display())
        })?;
    }

    let content =
        serde_json::to_string_pretty(entries).context("Failed to serialize history entries")?;

    let staging = path.with_extension("json.tmp");
    fs::write(&staging, content)
        .with_context(|| format!("Failed to write history file: {}", staging.display()))?;
    fs::rename(&staging, path)
        .with_context(|| format!("Failed to replace history file: {}", path.display()))?;

    Ok(())
}
