use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::Config;
use crate::history::{History, HistoryEntry};
use crate::library::LibraryStager;
use crate::metadata::MetadataStore;
use crate::notify::NotificationSink;
use crate::process::ProcessRunner;
use crate::serial::SerialTouch;
use crate::session::{Activity, ActivityGuards};
use crate::source::SourceGenerator;
use crate::toolchain::Sandbox;

/// External seams the orchestrators talk through.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn SourceGenerator>,
    pub metadata: Arc<dyn MetadataStore>,
    pub runner: Arc<dyn ProcessRunner>,
    pub sink: Arc<dyn NotificationSink>,
    pub serial: Arc<dyn SerialTouch>,
}

/// State shared by the build and upload orchestrators of one project.
pub struct ProjectContext {
    project: PathBuf,
    config: Config,
    collaborators: Collaborators,
    guards: Arc<ActivityGuards>,
    stager: LibraryStager,
    history: Option<Mutex<History>>,
}

impl ProjectContext {
    pub fn new(project: impl Into<PathBuf>, config: Config, collaborators: Collaborators) -> Self {
        let stager = LibraryStager::new(&config.staging);
        Self {
            project: project.into(),
            config,
            collaborators,
            guards: ActivityGuards::new(),
            stager,
            history: None,
        }
    }

    pub fn with_history(mut self, history: History) -> Self {
        self.history = Some(Mutex::new(history));
        self
    }

    pub fn project(&self) -> &Path {
        &self.project
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sandbox(&self) -> Sandbox {
        Sandbox::new(&self.project)
    }

    pub fn guards(&self) -> &Arc<ActivityGuards> {
        &self.guards
    }

    pub fn stager(&self) -> &LibraryStager {
        &self.stager
    }

    pub fn source(&self) -> &dyn SourceGenerator {
        self.collaborators.source.as_ref()
    }

    pub fn metadata(&self) -> &dyn MetadataStore {
        self.collaborators.metadata.as_ref()
    }

    pub fn runner(&self) -> &dyn ProcessRunner {
        self.collaborators.runner.as_ref()
    }

    pub fn sink(&self) -> &dyn NotificationSink {
        self.collaborators.sink.as_ref()
    }

    pub fn serial(&self) -> Arc<dyn SerialTouch> {
        Arc::clone(&self.collaborators.serial)
    }

    /// Marks a dependency install as running; builds and uploads are
    /// rejected meanwhile.
    pub fn set_installing(&self, installing: bool) {
        self.guards.set(Activity::Install, installing);
    }

    pub fn record(&self, entry: HistoryEntry) -> anyhow::Result<()> {
        match &self.history {
            Some(history) => history
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .add_entry(entry),
            None => Ok(()),
        }
    }

    pub fn history_entries(&self) -> Vec<HistoryEntry> {
        self.history
            .as_ref()
            .map(|h| {
                h.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entries()
                    .to_vec()
            })
            .unwrap_or_default()
    }
}
