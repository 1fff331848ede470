use anyhow::Context;
use std::path::PathBuf;

/// Produces the sketch source for the current state of the visual program.
pub trait SourceGenerator: Send + Sync {
    fn generate(&self) -> anyhow::Result<String>;
}

/// Uses source the editor already generated and saved to disk.
#[derive(Debug, Clone)]
pub struct FileSourceGenerator {
    path: PathBuf,
}

impl FileSourceGenerator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SourceGenerator for FileSourceGenerator {
    fn generate(&self) -> anyhow::Result<String> {
        std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read sketch source: {}", self.path.display()))
    }
}

