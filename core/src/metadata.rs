use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const PACKAGE_FILE: &str = "package.json";
pub const BOARD_FILE: &str = "board.json";
pub const PACKAGES_DIR: &str = "node_modules";

const LIBRARY_PREFIX: &str = "lib-";
const BOARD_PREFIX: &str = "board-";

/// The project's `package.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub project_config: Value,
}

impl PackageMetadata {
    pub fn library_ids(&self) -> Vec<String> {
        self.dependencies
            .keys()
            .filter(|id| base_name(id).starts_with(LIBRARY_PREFIX))
            .cloned()
            .collect()
    }

    pub fn board_package(&self) -> Option<&str> {
        self.dependencies
            .keys()
            .find(|id| base_name(id).starts_with(BOARD_PREFIX))
            .map(String::as_str)
    }
}

/// A board package's `board.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardMetadata {
    #[serde(default)]
    pub name: String,
    /// Compiler tool name, versioned through `tool_dependencies`.
    pub compiler: Option<String>,
    /// Compiler command template, e.g. `compile -b arduino:avr:uno -v`.
    pub compiler_param: Option<String>,
    /// Flash command template; its first token picks the flashing tool.
    pub upload_param: Option<String>,
    /// SDK / core name, versioned through `tool_dependencies`.
    pub core: Option<String>,
    pub upload_speed: Option<u32>,
    #[serde(default, rename = "use1200bpsTouch")]
    pub use_1200bps_touch: bool,
    #[serde(default)]
    pub tool_dependencies: BTreeMap<String, String>,
}

impl BoardMetadata {
    pub fn tool_version(&self, tool: &str) -> Option<&str> {
        self.tool_dependencies
            .get(tool)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

pub trait MetadataStore: Send + Sync {
    fn package_metadata(&self) -> anyhow::Result<PackageMetadata>;

    /// `Ok(None)` when the board package ships no `board.json`.
    fn board_metadata(&self, board_package: &str) -> anyhow::Result<Option<BoardMetadata>>;

    fn package_dir(&self, package: &str) -> PathBuf;
}

/// Reads metadata straight from the project directory.
#[derive(Debug, Clone)]
pub struct ProjectMetadataStore {
    project: PathBuf,
}

impl ProjectMetadataStore {
    pub fn new(project: impl Into<PathBuf>) -> Self {
        Self {
            project: project.into(),
        }
    }
}

impl MetadataStore for ProjectMetadataStore {
    fn package_metadata(&self) -> anyhow::Result<PackageMetadata> {
        read_json(&self.project.join(PACKAGE_FILE))
    }

    fn board_metadata(&self, board_package: &str) -> anyhow::Result<Option<BoardMetadata>> {
        let path = self.package_dir(board_package).join(BOARD_FILE);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    fn package_dir(&self, package: &str) -> PathBuf {
        let mut dir = self.project.join(PACKAGES_DIR);
        for segment in package.split('/') {
            dir.push(segment);
        }
        dir
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Final path segment of a package id: `@scope/lib-servo` → `lib-servo`.
pub fn base_name(id: &str) -> &str {
    id.rsplit('/').next().unwrap_or(id)
}
