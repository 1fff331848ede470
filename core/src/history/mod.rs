pub mod storage;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::session::{Outcome, OutcomeState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Build,
    Upload,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Build => write!(f, "build"),
            SessionKind::Upload => write!(f, "upload"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Succeeded,
    Failed,
    Cancelled,
}

impl From<OutcomeState> for EntryState {
    fn from(state: OutcomeState) -> Self {
        match state {
            OutcomeState::Done => EntryState::Succeeded,
            OutcomeState::Error => EntryState::Failed,
            OutcomeState::Cancelled => EntryState::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Local>,
    pub kind: SessionKind,
    pub project: String,
    pub board: Option<String>,
    #[serde(default)]
    pub port: Option<String>,
    pub state: EntryState,
    /// Seconds.
    pub duration: f64,
    pub summary: String,
}

impl HistoryEntry {
    pub fn new(kind: SessionKind, project: &std::path::Path, outcome: &Outcome) -> Self {
        Self {
            timestamp: Local::now(),
            kind,
            project: project.display().to_string(),
            board: None,
            port: None,
            state: outcome.state.into(),
            duration: 0.0,
            summary: outcome.text.clone(),
        }
    }

    pub fn board(mut self, board: Option<String>) -> Self {
        self.board = board;
        self
    }

    pub fn port(mut self, port: Option<String>) -> Self {
        self.port = port;
        self
    }

    pub fn finalize(mut self, elapsed: Duration) -> Self {
        self.duration = elapsed.as_secs_f64();
        self
    }
}

pub struct History {
    entries: Vec<HistoryEntry>,
    storage_path: PathBuf,
    max_entries: usize,
}

impl History {
    pub fn new(storage_path: PathBuf, max_entries: usize) -> anyhow::Result<Self> {
        let entries = storage::load_history(&storage_path)?;
        Ok(Self {
            entries,
            storage_path,
            max_entries,
        })
    }

    pub fn add_entry(&mut self, entry: HistoryEntry) -> anyhow::Result<()> {
        self.entries.push(entry);

        if self.entries.len() > self.max_entries {
            let excess = self.entries.len() - self.max_entries;
            self.entries.drain(..excess);
        }

        storage::save_history(&self.storage_path, &self.entries)
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn last_entry(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }

    /// Removes entries of `kind`, or everything when `None`.
    pub fn clear(&mut self, kind: Option<SessionKind>) -> anyhow::Result<()> {
        match kind {
            Some(kind) => self.entries.retain(|e| e.kind != kind),
            None => self.entries.clear(),
        }
        storage::save_history(&self.storage_path, &self.entries)
    }
}
