use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::command::CommandLine;
use crate::error::{KilnError, Result};
use crate::flash::ToolKind;
use crate::parser::RegionState;
use crate::process::ProcessId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Preparing,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Succeeded | SessionState::Failed | SessionState::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Preparing | SessionState::Running)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Preparing => "preparing",
            SessionState::Running => "running",
            SessionState::Succeeded => "succeeded",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeState {
    Done,
    Error,
    Cancelled,
}

/// Result handed back to the caller of `build()` / `upload()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub state: OutcomeState,
    pub text: String,
    pub detail: Option<String>,
}

impl Outcome {
    pub fn new(state: OutcomeState, text: impl Into<String>) -> Self {
        Self {
            state,
            text: text.into(),
            detail: None,
        }
    }

    pub fn done(text: impl Into<String>) -> Self {
        Self::new(OutcomeState::Done, text)
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if !detail.is_empty() {
            self.detail = Some(detail);
        }
        self
    }

    pub fn is_done(&self) -> bool {
        self.state == OutcomeState::Done
    }
}

impl From<Result<Outcome>> for Outcome {
    fn from(result: Result<Outcome>) -> Self {
        result.unwrap_or_else(KilnError::into_outcome)
    }
}

/// Busy flags shared by the orchestrators of one project session. All checks
/// and updates happen under one lock.
#[derive(Debug, Default)]
pub struct ActivityGuards {
    active: Mutex<ActiveSet>,
}

#[derive(Debug, Default)]
struct ActiveSet {
    building: bool,
    uploading: bool,
    installing: bool,
}

impl ActiveSet {
    fn flag(&mut self, activity: Activity) -> &mut bool {
        match activity {
            Activity::Build => &mut self.building,
            Activity::Upload => &mut self.uploading,
            Activity::Install => &mut self.installing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Build,
    Upload,
    Install,
}

impl ActivityGuards {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, ActiveSet> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self, activity: Activity) -> bool {
        *self.lock().flag(activity)
    }

    /// Marks `activity` as running unless one of `blockers`, or `activity`
    /// itself, already is. Blockers are checked in order and the first busy
    /// one is returned. The lease clears the flag when dropped.
    pub fn acquire(
        self: &Arc<Self>,
        activity: Activity,
        blockers: &[Activity],
    ) -> std::result::Result<ActivityLease, Activity> {
        let mut active = self.lock();
        if let Some(blocker) = blockers.iter().copied().find(|b| *active.flag(*b)) {
            return Err(blocker);
        }
        let flag = active.flag(activity);
        if *flag {
            return Err(activity);
        }
        *flag = true;

        Ok(ActivityLease {
            guards: Arc::clone(self),
            activity,
        })
    }

    pub fn set(&self, activity: Activity, active: bool) {
        *self.lock().flag(activity) = active;
    }
}

#[derive(Debug)]
pub struct ActivityLease {
    guards: Arc<ActivityGuards>,
    activity: Activity,
}

impl Drop for ActivityLease {
    fn drop(&mut self) {
        self.guards.set(self.activity, false);
    }
}

/// Session-scoped cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(KilnError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildSession {
    pub project_path: PathBuf,
    pub board_type: Option<String>,
    pub command_line: Option<CommandLine>,
    pub state: SessionState,
    pub progress_percent: u8,
    pub process_id: Option<ProcessId>,
    pub cancel: CancelToken,
}

impl BuildSession {
    pub fn new(project_path: PathBuf) -> Self {
        Self {
            project_path,
            board_type: None,
            command_line: None,
            state: SessionState::Preparing,
            progress_percent: 0,
            process_id: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn advance(&mut self, percent: u8) {
        self.progress_percent = self.progress_percent.max(percent.min(100));
    }

    pub fn finish(&mut self, state: SessionState) {
        self.state = state;
        self.process_id = None;
    }
}

#[derive(Debug, Clone)]
pub struct UploadSession {
    pub project_path: PathBuf,
    pub port: String,
    pub tool_kind: Option<ToolKind>,
    pub command_line: Option<CommandLine>,
    pub state: SessionState,
    pub progress_percent: u8,
    pub region_state: RegionState,
    pub process_id: Option<ProcessId>,
    pub cancel: CancelToken,
}

impl UploadSession {
    pub fn new(project_path: PathBuf, port: String) -> Self {
        Self {
            project_path,
            port,
            tool_kind: None,
            command_line: None,
            state: SessionState::Preparing,
            progress_percent: 0,
            region_state: RegionState::default(),
            process_id: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn advance(&mut self, percent: u8) {
        self.progress_percent = self.progress_percent.max(percent.min(100));
    }

    pub fn finish(&mut self, state: SessionState) {
        self.state = state;
        self.process_id = None;
    }
}
