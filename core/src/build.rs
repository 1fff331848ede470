use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::command::{board_options, CommandLine, CompilerTemplate};
use crate::context::ProjectContext;
use crate::error::{KilnError, Result};
use crate::history::{HistoryEntry, SessionKind};
use crate::library::evict_stale;
use crate::metadata::{BoardMetadata, PackageMetadata};
use crate::monitor::watch_process;
use crate::notify::{Notification, NotifyState};
use crate::parser::{OutputParser, ParserProfile};
use crate::process::ProcessId;
use crate::session::{Activity, BuildSession, CancelToken, Outcome, OutcomeState, SessionState};
use crate::step::Step;
use crate::toolchain::{Toolchain, PARTITIONS_FILE};

const TITLE: &str = "Build";

#[derive(Default)]
struct BuildState {
    session: Option<BuildSession>,
    last_generated_source: Option<String>,
    last_successful_source: Option<String>,
    last_successful_project: Option<PathBuf>,
    tools_synced: bool,
}

/// Resolved compile invocation.
struct CompilePlan {
    command: CommandLine,
    toolchain: Toolchain,
    board: BoardMetadata,
}

/// Runs the compile pipeline for one project, one build at a time.
pub struct BuildOrchestrator {
    ctx: Arc<ProjectContext>,
    state: Mutex<BuildState>,
}

impl BuildOrchestrator {
    pub fn new(ctx: Arc<ProjectContext>) -> Self {
        Self {
            ctx,
            state: Mutex::new(BuildState::default()),
        }
    }

    pub fn context(&self) -> &Arc<ProjectContext> {
        &self.ctx
    }

    fn lock(&self) -> MutexGuard<'_, BuildState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn build_in_progress(&self) -> bool {
        self.ctx.guards().is_active(Activity::Build)
    }

    pub fn set_installing(&self, installing: bool) {
        self.ctx.set_installing(installing);
    }

    /// Snapshot of the current or most recent session.
    pub fn session(&self) -> Option<BuildSession> {
        self.lock().session.clone()
    }

    pub fn last_successful_source(&self) -> Option<String> {
        self.lock().last_successful_source.clone()
    }

    /// True unless the last successful build compiled exactly `source` for
    /// this project.
    pub fn needs_rebuild(&self, source: &str) -> bool {
        let state = self.lock();
        state.last_successful_source.as_deref() != Some(source)
            || state.last_successful_project.as_deref() != Some(self.ctx.project())
    }

    /// Requests cancellation of the running build. Returns false when no
    /// build is active.
    pub fn cancel_build(&self) -> bool {
        let target = {
            let state = self.lock();
            state
                .session
                .as_ref()
                .filter(|s| s.state.is_active())
                .map(|s| (s.cancel.clone(), s.process_id))
        };

        match target {
            Some((token, process)) => {
                token.cancel();
                if let Some(id) = process {
                    self.ctx.runner().kill(id);
                }
                true
            }
            None => false,
        }
    }

    /// Cancels anything running and forgets every cached result.
    pub fn destroy(&self) {
        self.cancel_build();
        *self.lock() = BuildState::default();
    }

    pub async fn build(&self) -> Outcome {
        self.run_build(&[Activity::Install, Activity::Upload]).await
    }

    /// Build started by an upload, which already holds the upload flag.
    pub(crate) async fn build_for_upload(&self) -> Outcome {
        self.run_build(&[Activity::Install]).await
    }

    async fn run_build(&self, blockers: &[Activity]) -> Outcome {
        let _lease = match self.ctx.guards().acquire(Activity::Build, blockers) {
            Ok(lease) => lease,
            Err(blocker) => return KilnError::blocked(Activity::Build, blocker).into_outcome(),
        };

        let started = Instant::now();
        let session = BuildSession::new(self.ctx.project().to_path_buf());
        let cancel = session.cancel.clone();
        self.lock().session = Some(session);

        let outcome = Outcome::from(self.pipeline(&cancel).await);
        self.finish(outcome, started)
    }

    async fn pipeline(&self, cancel: &CancelToken) -> Result<Outcome> {
        let sandbox = self.ctx.sandbox();

        self.step(Step::PrepareSandbox, cancel)?;
        sandbox.create().await?;

        self.step(Step::GenerateSource, cancel)?;
        let source = self.ctx.source().generate()?;
        tokio::fs::write(sandbox.sketch_file(), &source).await?;
        self.lock().last_generated_source = Some(source);

        self.step(Step::StageLibraries, cancel)?;
        let package = self
            .ctx
            .metadata()
            .package_metadata()
            .map_err(|e| KilnError::config(format!("{:#}", e)))?;
        self.stage_libraries(&package).await?;

        self.step(Step::ResolveToolchain, cancel)?;
        let plan = self.plan(&package).await?;
        {
            let mut state = self.lock();
            if let Some(session) = state.session.as_mut() {
                session.board_type = Some(plan.board.name.clone());
                session.command_line = Some(plan.command.clone());
            }
        }

        self.step(Step::SyncTools, cancel)?;
        let synced = self.lock().tools_synced;
        if !synced {
            plan.toolchain.sync_tools().await?;
            self.lock().tools_synced = true;
        }

        self.step(Step::Compile, cancel)?;
        let profile = ParserProfile::build(&self.ctx.config().patterns)
            .map_err(|e| KilnError::config(format!("invalid output pattern: {}", e)))?;
        let mut parser = OutputParser::new(profile);

        let handle = self.ctx.runner().run(&plan.command, Some(self.ctx.project()))?;
        self.attach(handle.id, cancel);

        let report = watch_process(handle, &mut parser, self.ctx.sink(), TITLE, |percent| {
            let mut state = self.lock();
            if let Some(session) = state.session.as_mut() {
                session.advance(percent);
            }
        })
        .await;

        if parser.completed() {
            return Ok(Outcome::done(format!("Build succeeded for {}", plan.board.name)));
        }
        if parser.errored() {
            return Err(KilnError::Process {
                summary: parser.last_error().unwrap_or("compile error").to_string(),
                detail: parser.error_log(),
            });
        }
        if cancel.is_cancelled() {
            return Err(KilnError::Cancelled);
        }
        if let Some(message) = report.spawn_error {
            return Err(KilnError::Process {
                summary: message,
                detail: parser.error_log(),
            });
        }

        let code = report
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string());
        Err(KilnError::Process {
            summary: format!("compiler exited before completing (exit code {})", code),
            detail: parser.error_log(),
        })
    }

    fn step(&self, step: Step, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        self.ctx.sink().publish(Notification::new(
            TITLE,
            step.to_string(),
            NotifyState::Doing,
        ));
        Ok(())
    }

    /// Records the spawned process, killing it at once if a cancel raced in.
    fn attach(&self, id: ProcessId, cancel: &CancelToken) {
        {
            let mut state = self.lock();
            if let Some(session) = state.session.as_mut() {
                session.process_id = Some(id);
                session.state = SessionState::Running;
            }
        }
        if cancel.is_cancelled() {
            self.ctx.runner().kill(id);
        }
    }

    async fn stage_libraries(&self, package: &PackageMetadata) -> Result<()> {
        let sandbox = self.ctx.sandbox();
        let library_ids = package.library_ids();

        let report = self
            .ctx
            .stager()
            .stage_all(self.ctx.metadata(), &library_ids, &sandbox.libraries_dir())
            .await;

        if let Some(warning) = report.warning() {
            let headline = warning.lines().next().unwrap_or_default().to_string();
            self.ctx.sink().publish(
                Notification::new(TITLE, headline, NotifyState::Doing).with_detail(Some(warning)),
            );
        }

        if let Some(keep) = report.retained_names() {
            evict_stale(&sandbox.libraries_dir(), &keep, &library_ids).await?;
        }
        Ok(())
    }

    async fn plan(&self, package: &PackageMetadata) -> Result<CompilePlan> {
        let config = self.ctx.config();
        let sandbox = self.ctx.sandbox();

        let board_package = package
            .board_package()
            .ok_or_else(|| KilnError::config("missing board package in package.json"))?;
        let board = self
            .ctx
            .metadata()
            .board_metadata(board_package)
            .map_err(|e| KilnError::config(format!("{:#}", e)))?
            .ok_or_else(|| KilnError::config(format!("missing board config for {}", board_package)))?;

        let template = board
            .compiler_param
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| KilnError::config("missing compiler command"))?;
        let toolchain = Toolchain::resolve(&config.toolchain_root(), &board)?;

        let template = CompilerTemplate::parse(template);
        let board_id = template
            .board
            .clone()
            .ok_or_else(|| KilnError::config("missing board identifier in compiler command"))?;

        let options = board_options(&package.project_config);
        if options
            .iter()
            .any(|(key, value)| key == "PartitionScheme" && value == "custom")
        {
            self.stage_partitions(board_package).await?;
        }

        let mut command = CommandLine::new(toolchain.compiler.display().to_string())
            .args(template.args)
            .path_arg(&sandbox.sketch_file())
            .arg("--board")
            .arg(board_id)
            .arg("--sdk-path")
            .path_arg(&toolchain.sdk)
            .arg("--tools-path")
            .path_arg(&toolchain.tools_dir())
            .arg("--libraries-path")
            .path_arg(&sandbox.libraries_dir())
            .arg("--build-path")
            .path_arg(&sandbox.build_dir());

        for (key, value) in options {
            command = command
                .arg(config.build.option_flag.as_str())
                .arg(format!("{}={}", key, value));
        }

        Ok(CompilePlan {
            command,
            toolchain,
            board,
        })
    }

    /// A custom partition scheme needs `partitions.csv` from the project or
    /// the board package.
    async fn stage_partitions(&self, board_package: &str) -> Result<()> {
        let candidates = [
            self.ctx.project().join(PARTITIONS_FILE),
            self.ctx.metadata().package_dir(board_package).join(PARTITIONS_FILE),
        ];

        for candidate in &candidates {
            if is_file(candidate).await {
                tokio::fs::copy(candidate, self.ctx.sandbox().partitions_file()).await?;
                return Ok(());
            }
        }

        Err(KilnError::config(
            "custom partition scheme requires a partitions.csv in the project or board package",
        ))
    }

    fn finish(&self, outcome: Outcome, started: Instant) -> Outcome {
        let elapsed = started.elapsed();
        let board = {
            let mut state = self.lock();
            let session_state = match outcome.state {
                OutcomeState::Done => SessionState::Succeeded,
                OutcomeState::Error => SessionState::Failed,
                OutcomeState::Cancelled => SessionState::Cancelled,
            };
            if outcome.is_done() {
                state.last_successful_source = state.last_generated_source.clone();
                state.last_successful_project = Some(self.ctx.project().to_path_buf());
            }
            state.session.as_mut().and_then(|session| {
                if outcome.is_done() {
                    session.advance(100);
                }
                session.finish(session_state);
                session.board_type.clone()
            })
        };

        let entry = HistoryEntry::new(SessionKind::Build, self.ctx.project(), &outcome)
            .board(board)
            .finalize(elapsed);
        if let Err(err) = self.ctx.record(entry) {
            self.ctx.sink().publish(Notification::new(
                TITLE,
                format!("Failed to record history: {:#}", err),
                NotifyState::Doing,
            ));
        }

        let notification = match outcome.state {
            OutcomeState::Done => {
                Notification::new(TITLE, outcome.text.clone(), NotifyState::Done).with_progress(100)
            }
            OutcomeState::Error => Notification::new(TITLE, outcome.text.clone(), NotifyState::Error)
                .with_detail(outcome.detail.clone()),
            OutcomeState::Cancelled => {
                Notification::new(TITLE, "Build cancelled", NotifyState::Warn)
            }
        };
        self.ctx.sink().publish(notification.with_elapsed(elapsed));

        outcome
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}
