use std::path::{Path, PathBuf};

use crate::error::{KilnError, Result};
use crate::files;
use crate::metadata::BoardMetadata;

pub const SANDBOX_DIR: &str = ".temp";
pub const SKETCH_FILE: &str = "sketch.ino";
pub const PARTITIONS_FILE: &str = "partitions.csv";

/// Per-project build sandbox under `{project}/.temp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
    pub root: PathBuf,
}

impl Sandbox {
    pub fn new(project: &Path) -> Self {
        Self {
            root: project.join(SANDBOX_DIR),
        }
    }

    pub fn sketch_dir(&self) -> PathBuf {
        self.root.join("sketch")
    }

    pub fn sketch_file(&self) -> PathBuf {
        self.sketch_dir().join(SKETCH_FILE)
    }

    pub fn libraries_dir(&self) -> PathBuf {
        self.root.join("libraries")
    }

    pub fn build_dir(&self) -> PathBuf {
        self.root.join("build")
    }

    pub fn partitions_file(&self) -> PathBuf {
        self.sketch_dir().join(PARTITIONS_FILE)
    }

    /// Compiled artifact `sketch.ino.<ext>` in the build directory.
    pub fn artifact(&self, extension: &str) -> PathBuf {
        self.build_dir().join(format!("{}.{}", SKETCH_FILE, extension))
    }

    pub async fn create(&self) -> Result<()> {
        for dir in [self.sketch_dir(), self.libraries_dir()] {
            tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                KilnError::Io(anyhow::anyhow!("Failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }
}

/// Installed toolchain locations for one board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub root: PathBuf,
    pub compiler_dir: PathBuf,
    pub compiler: PathBuf,
    pub sdk: PathBuf,
}

impl Toolchain {
    /// Resolves compiler and SDK from board metadata. Every missing field is
    /// a configuration error.
    pub fn resolve(root: &Path, board: &BoardMetadata) -> Result<Self> {
        let compiler_name = board
            .compiler
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| KilnError::config("missing compiler tool in board config"))?;
        let compiler_version = board.tool_version(compiler_name).ok_or_else(|| {
            KilnError::config(format!("missing version for compiler {}", compiler_name))
        })?;

        let core = board
            .core
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| KilnError::config("missing board core in board config"))?;
        let sdk_version = board
            .tool_version(core)
            .ok_or_else(|| KilnError::config(format!("missing SDK version for {}", core)))?;

        let compiler_dir = root
            .join("compiler")
            .join(versioned(compiler_name, compiler_version));
        let compiler = compiler_dir.join(executable(compiler_name));
        let sdk = root.join("sdk").join(versioned(&core.replace(':', "_"), sdk_version));

        Ok(Self {
            root: root.to_path_buf(),
            compiler_dir,
            compiler,
            sdk,
        })
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.root.join("tools")
    }

    /// Directory of an external tool pinned by the board, e.g. `tools/avrdude@6.3.0`.
    pub fn tool_dir(&self, board: &BoardMetadata, tool: &str) -> Result<PathBuf> {
        let version = board
            .tool_version(tool)
            .ok_or_else(|| KilnError::config(format!("missing version for tool {}", tool)))?;
        Ok(self.tools_dir().join(versioned(tool, version)))
    }

    pub fn tool_binary(&self, board: &BoardMetadata, tool: &str) -> Result<PathBuf> {
        Ok(self.tool_dir(board, tool)?.join(executable(tool)))
    }

    /// Copies every entry of the compiler's bundled `tools/` that the shared
    /// tools directory lacks. Returns how many entries were copied.
    pub async fn sync_tools(&self) -> Result<usize> {
        let bundled = self.compiler_dir.join("tools");
        if !files::is_dir(&bundled).await {
            return Ok(0);
        }

        let shared = self.tools_dir();
        tokio::fs::create_dir_all(&shared).await?;

        let mut copied = 0;
        for entry in files::list_dir(&bundled).await? {
            let Some(name) = entry.file_name() else {
                continue;
            };
            let target = shared.join(name);
            if tokio::fs::metadata(&target).await.is_ok() {
                continue;
            }
            if files::is_dir(&entry).await {
                files::copy_dir(entry.clone(), target).await?;
            } else {
                tokio::fs::copy(&entry, &target).await?;
            }
            copied += 1;
        }

        Ok(copied)
    }
}

fn versioned(name: &str, version: &str) -> String {
    format!("{}@{}", name, version)
}

pub fn executable(name: &str) -> String {
    format!("{}{}", name, std::env::consts::EXE_SUFFIX)
}
