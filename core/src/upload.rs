use anyhow::Context;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::build::BuildOrchestrator;
use crate::context::ProjectContext;
use crate::error::{KilnError, Result};
use crate::flash::{FlashRecipe, FlashTarget};
use crate::history::{HistoryEntry, SessionKind};
use crate::metadata::BoardMetadata;
use crate::monitor::watch_process;
use crate::notify::{Notification, NotifyState};
use crate::parser::{OutputParser, ParserProfile};
use crate::process::ProcessId;
use crate::session::{Activity, CancelToken, Outcome, OutcomeState, SessionState, UploadSession};
use crate::step::Step;
use crate::toolchain::Toolchain;

const TITLE: &str = "Upload";

#[derive(Default)]
struct UploadState {
    port: Option<String>,
    session: Option<UploadSession>,
}

/// Flashes the project's firmware, rebuilding first when the source moved on.
pub struct UploadOrchestrator {
    ctx: Arc<ProjectContext>,
    builder: Arc<BuildOrchestrator>,
    state: Mutex<UploadState>,
}

impl UploadOrchestrator {
    pub fn new(builder: Arc<BuildOrchestrator>) -> Self {
        Self {
            ctx: Arc::clone(builder.context()),
            builder,
            state: Mutex::new(UploadState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, UploadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn select_port(&self, port: impl Into<String>) {
        let port = port.into();
        self.lock().port = Some(port).filter(|p| !p.trim().is_empty());
    }

    pub fn selected_port(&self) -> Option<String> {
        self.lock().port.clone()
    }

    pub fn is_uploading(&self) -> bool {
        self.ctx.guards().is_active(Activity::Upload)
    }

    pub fn session(&self) -> Option<UploadSession> {
        self.lock().session.clone()
    }

    /// Cancels the running upload, including a build it started.
    pub fn cancel_upload(&self) -> bool {
        let target = {
            let state = self.lock();
            state
                .session
                .as_ref()
                .filter(|s| s.state.is_active())
                .map(|s| (s.cancel.clone(), s.process_id))
        };

        let Some((token, process)) = target else {
            return false;
        };

        token.cancel();
        if let Some(id) = process {
            self.ctx.runner().kill(id);
        }
        self.builder.cancel_build();
        true
    }

    pub fn destroy(&self) {
        self.cancel_upload();
        *self.lock() = UploadState::default();
    }

    pub async fn upload(&self) -> Outcome {
        let Some(port) = self.selected_port() else {
            return KilnError::busy("select a device port before uploading").into_outcome();
        };

        let blockers = [Activity::Install, Activity::Build];
        let _lease = match self.ctx.guards().acquire(Activity::Upload, &blockers) {
            Ok(lease) => lease,
            Err(blocker) => return KilnError::blocked(Activity::Upload, blocker).into_outcome(),
        };

        let started = Instant::now();
        let session = UploadSession::new(self.ctx.project().to_path_buf(), port.clone());
        let cancel = session.cancel.clone();
        self.lock().session = Some(session);

        let outcome = Outcome::from(self.pipeline(&port, &cancel).await);
        self.finish(outcome, &port, started)
    }

    async fn pipeline(&self, port: &str, cancel: &CancelToken) -> Result<Outcome> {
        self.step(Step::Rebuild, cancel)?;
        let source = self.ctx.source().generate()?;
        if self.builder.needs_rebuild(&source) {
            let built = self.builder.build_for_upload().await;
            match built.state {
                OutcomeState::Done => {}
                OutcomeState::Cancelled => return Err(KilnError::Cancelled),
                OutcomeState::Error => {
                    return Err(KilnError::Process {
                        summary: format!("build failed: {}", built.text),
                        detail: built.detail.unwrap_or_default(),
                    })
                }
            }
        }

        self.step(Step::ResolveRecipe, cancel)?;
        let package = self
            .ctx
            .metadata()
            .package_metadata()
            .map_err(|e| KilnError::config(format!("{:#}", e)))?;
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
            .upload_param
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| KilnError::config("missing upload command"))?;

        let toolchain = Toolchain::resolve(&self.ctx.config().toolchain_root(), &board)?;
        let recipe = FlashRecipe::from_template(template, &board)?;
        let sandbox = self.ctx.sandbox();
        let command = recipe.command_line(&FlashTarget {
            port,
            baud: self.baud_rate(&package.project_config, &board),
            sandbox: &sandbox,
            toolchain: &toolchain,
            board: &board,
        })?;

        {
            let mut state = self.lock();
            if let Some(session) = state.session.as_mut() {
                session.tool_kind = Some(recipe.kind());
                session.command_line = Some(command.clone());
            }
        }

        if recipe.needs_touch() {
            self.step(Step::TouchPort, cancel)?;
            self.touch(port).await;
        }

        self.step(Step::Flash, cancel)?;
        let profile = ParserProfile::upload(&self.ctx.config().patterns, recipe.kind())
            .map_err(|e| KilnError::config(format!("invalid output pattern: {}", e)))?;
        let mut parser = OutputParser::new(profile);

        let handle = self.ctx.runner().run(&command, Some(self.ctx.project()))?;
        self.attach(handle.id, cancel);

        let report = watch_process(handle, &mut parser, self.ctx.sink(), TITLE, |percent| {
            let mut state = self.lock();
            if let Some(session) = state.session.as_mut() {
                session.advance(percent);
            }
        })
        .await;

        {
            let mut state = self.lock();
            if let Some(session) = state.session.as_mut() {
                session.region_state = parser.region_state();
            }
        }

        // an error line plus a failing exit outweighs a full bar
        let failed_exit = report.exit_code.is_some_and(|code| code != 0);
        if parser.reached_full_progress() && !(parser.errored() && failed_exit) {
            return Ok(Outcome::done(format!("Uploaded to {}", port)));
        }
        if parser.errored() {
            return Err(KilnError::Process {
                summary: parser.last_error().unwrap_or("upload error").to_string(),
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

        Err(KilnError::Incomplete(format!(
            "upload incomplete: {} stopped at {}%",
            recipe.kind(),
            parser.progress()
        )))
    }

    /// Project `UploadSpeed`, then the board's speed, then the configured default.
    fn baud_rate(&self, project_config: &Value, board: &BoardMetadata) -> u32 {
        let from_project = match project_config.get("UploadSpeed") {
            Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };
        from_project
            .or(board.upload_speed)
            .unwrap_or(self.ctx.config().upload.baud_rate)
    }

    /// Bootloader reset. A failed touch is reported and the flash still runs.
    async fn touch(&self, port: &str) {
        let serial = self.ctx.serial();
        let owned = port.to_string();
        let baud = self.ctx.config().upload.touch_baud_rate;

        let result = tokio::task::spawn_blocking(move || serial.touch(&owned, baud))
            .await
            .context("serial touch task panicked")
            .and_then(|r| r);

        if let Err(err) = result {
            self.ctx.sink().publish(Notification::new(
                TITLE,
                format!("Bootloader reset failed: {:#}", err),
                NotifyState::Doing,
            ));
        }

        let settle = self.ctx.config().upload.touch_settle_ms;
        if settle > 0 {
            tokio::time::sleep(Duration::from_millis(settle)).await;
        }
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

    fn finish(&self, outcome: Outcome, port: &str, started: Instant) -> Outcome {
        let elapsed = started.elapsed();
        {
            let mut state = self.lock();
            if let Some(session) = state.session.as_mut() {
                session.finish(match outcome.state {
                    OutcomeState::Done => SessionState::Succeeded,
                    OutcomeState::Error => SessionState::Failed,
                    OutcomeState::Cancelled => SessionState::Cancelled,
                });
            }
        }

        let board = self.builder.session().and_then(|s| s.board_type);
        let entry = HistoryEntry::new(SessionKind::Upload, self.ctx.project(), &outcome)
            .board(board)
            .port(Some(port.to_string()))
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
                Notification::new(TITLE, "Upload cancelled", NotifyState::Warn)
            }
        };
        self.ctx.sink().publish(notification.with_elapsed(elapsed));

        outcome
    }
}
