use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "kiln.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub toolchain: ToolchainConfig,
    #[serde(default)]
    pub staging: StagingConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub patterns: PatternsConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainConfig {
    /// Holds `compiler/`, `sdk/` and `tools/`, each entry named `<name>@<version>`.
    #[serde(default = "default_toolchain_root")]
    pub root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Replace already staged libraries instead of reusing them.
    #[serde(default)]
    pub development_mode: bool,
    #[serde(default = "default_seven_zip")]
    pub seven_zip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default = "default_option_flag")]
    pub option_flag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_touch_baud_rate")]
    pub touch_baud_rate: u32,
    #[serde(default = "default_touch_settle_ms")]
    pub touch_settle_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternsConfig {
    #[serde(default = "default_build_text_marker")]
    pub build_text_marker: String,
    #[serde(default = "default_size_summary_marker")]
    pub size_summary_marker: String,
    /// Case-insensitive regexes; a matching stderr line fails the session.
    #[serde(default = "default_error_tags")]
    pub error_tags: Vec<String>,
    #[serde(default = "default_upload_error_tags")]
    pub upload_error_tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_storage_path")]
    pub storage_path: String,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            root: default_toolchain_root(),
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            development_mode: false,
            seven_zip: default_seven_zip(),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            option_flag: default_option_flag(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            touch_baud_rate: default_touch_baud_rate(),
            touch_settle_ms: default_touch_settle_ms(),
        }
    }
}

impl Default for PatternsConfig {
    fn default() -> Self {
        Self {
            build_text_marker: default_build_text_marker(),
            size_summary_marker: default_size_summary_marker(),
            error_tags: default_error_tags(),
            upload_error_tags: default_upload_error_tags(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            storage_path: default_storage_path(),
        }
    }
}

fn default_toolchain_root() -> String {
    "~/.kiln".to_string()
}

fn default_seven_zip() -> String {
    "7z".to_string()
}

fn default_option_flag() -> String {
    "--board-options".to_string()
}

fn default_baud_rate() -> u32 {
    115200
}

fn default_touch_baud_rate() -> u32 {
    1200
}

fn default_touch_settle_ms() -> u64 {
    1500
}

fn default_build_text_marker() -> String {
    "BuildText:".to_string()
}

fn default_size_summary_marker() -> String {
    "Global variables use".to_string()
}

fn default_error_tags() -> Vec<String> {
    vec![
        r"\berror\s*:".to_string(),
        r"\[error\]".to_string(),
        r"\bfailed\b".to_string(),
        r"fatal error".to_string(),
    ]
}

fn default_upload_error_tags() -> Vec<String> {
    vec![
        "not in sync".to_string(),
        "not responding".to_string(),
        "no device found".to_string(),
        "could not open port".to_string(),
        "no dfu capable usb device".to_string(),
        "verification error".to_string(),
    ]
}

fn default_max_entries() -> usize {
    50
}

fn default_storage_path() -> String {
    "~/.kiln/history.json".to_string()
}

impl Config {
    /// Project `kiln.toml` (or `explicit`) merged over the global file.
    pub fn load(project_dir: &Path, explicit: Option<&Path>) -> anyhow::Result<Self> {
        let global = Config::load_from_file(Config::global_path())?;
        let local_path = explicit
            .map(Path::to_path_buf)
            .unwrap_or_else(|| project_dir.join(CONFIG_FILE));

        if !Config::expand_path(&local_path.display().to_string()).exists() {
            return Ok(global);
        }

        let content = std::fs::read_to_string(&local_path)
            .with_context(|| format!("Failed to read config file: {}", local_path.display()))?;
        let local: toml::Value = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", local_path.display()))?;

        global.merge_with(local)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = Config::expand_path(&path.as_ref().display().to_string());

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Overlays the keys present in `other` onto `self`, table by table.
    pub fn merge_with(self, other: toml::Value) -> anyhow::Result<Self> {
        let mut base = toml::Value::try_from(&self).context("Failed to serialize config")?;
        merge_tables(&mut base, other);
        base.try_into().context("Failed to merge config")
    }

    pub fn global_path() -> PathBuf {
        Self::expand_path("~/.config/kiln/kiln.toml")
    }

    pub fn expand_path(path: &str) -> PathBuf {
        let expanded = shellexpand::tilde(path);
        PathBuf::from(expanded.as_ref())
    }

    pub fn toolchain_root(&self) -> PathBuf {
        Self::expand_path(&self.toolchain.root)
    }

    pub fn storage_path(&self) -> PathBuf {
        Self::expand_path(&self.history.storage_path)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }
}

fn merge_tables(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_tables(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config: Config = toml::from_str("[staging]\ndevelopment_mode = true\n").unwrap();
        assert!(config.staging.development_mode);
        assert_eq!(config.staging.seven_zip, "7z");
        assert_eq!(config.build.option_flag, "--board-options");
        assert_eq!(config.patterns.build_text_marker, "BuildText:");
    }

    #[test]
    fn test_merge_overrides_only_given_keys() {
        let base = Config::default();
        let overlay: toml::Value = toml::from_str("[upload]\nbaud_rate = 921600\n").unwrap();
        let merged = base.merge_with(overlay).unwrap();
        assert_eq!(merged.upload.baud_rate, 921600);
        assert_eq!(merged.upload.touch_baud_rate, 1200);
    }

    #[test]
    fn test_load_reads_project_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[toolchain]\nroot = \"/opt/kiln\"\n",
        )
        .unwrap();

        let config = Config::load(dir.path(), None).unwrap();
        assert_eq!(config.toolchain_root(), PathBuf::from("/opt/kiln"));
    }

    #[test]
    fn test_save_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut config = Config::default();
        config.staging.development_mode = true;
        config.save_to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert!(loaded.staging.development_mode);
    }
}
