//! In-memory collaborators for orchestrator tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::command::CommandLine;
use crate::config::Config;
use crate::context::{Collaborators, ProjectContext};
use crate::metadata::{BoardMetadata, MetadataStore, PackageMetadata, PACKAGES_DIR};
use crate::notify::RecordingSink;
use crate::process::{ProcessEvent, ProcessHandle, ProcessId, ProcessRunner};
use crate::serial::SerialTouch;
use crate::source::SourceGenerator;

pub enum Script {
    /// Events delivered at once; the process is already finished.
    Finish(Vec<ProcessEvent>),
    /// Events delivered at once; the process then runs until killed.
    Hang(Vec<ProcessEvent>),
}

#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<VecDeque<Script>>,
    calls: Mutex<Vec<CommandLine>>,
    killed: Mutex<Vec<ProcessId>>,
    live: Mutex<HashMap<ProcessId, mpsc::UnboundedSender<ProcessEvent>>>,
}

impl ScriptedRunner {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            ..Default::default()
        })
    }

    pub fn calls(&self) -> Vec<CommandLine> {
        self.calls.lock().unwrap().clone()
    }

    pub fn killed(&self) -> Vec<ProcessId> {
        self.killed.lock().unwrap().clone()
    }

    pub async fn wait_for_calls(&self, count: usize) {
        for _ in 0..500 {
            if self.calls.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("runner was never called {} times", count);
    }
}

impl ProcessRunner for ScriptedRunner {
    fn run(&self, command: &CommandLine, _cwd: Option<&Path>) -> anyhow::Result<ProcessHandle> {
        let mut calls = self.calls.lock().unwrap();
        calls.push(command.clone());
        let id = ProcessId(calls.len() as u64);

        let (tx, rx) = mpsc::unbounded_channel();
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::Finish(vec![ProcessEvent::Closed(Some(0))]));

        match script {
            Script::Finish(events) => {
                for event in events {
                    tx.send(event).unwrap();
                }
            }
            Script::Hang(events) => {
                for event in events {
                    tx.send(event).unwrap();
                }
                self.live.lock().unwrap().insert(id, tx);
            }
        }

        Ok(ProcessHandle { id, events: rx })
    }

    fn kill(&self, id: ProcessId) {
        self.killed.lock().unwrap().push(id);
        if let Some(tx) = self.live.lock().unwrap().remove(&id) {
            let _ = tx.send(ProcessEvent::Closed(None));
        }
    }
}

/// Source text that tests can change between runs.
#[derive(Clone, Default)]
pub struct SharedSource(Arc<Mutex<String>>);

impl SharedSource {
    pub fn new(text: &str) -> Self {
        Self(Arc::new(Mutex::new(text.to_string())))
    }

    pub fn set(&self, text: &str) {
        *self.0.lock().unwrap() = text.to_string();
    }
}

impl SourceGenerator for SharedSource {
    fn generate(&self) -> anyhow::Result<String> {
        Ok(self.0.lock().unwrap().clone())
    }
}

/// Callback a test installs to act from inside a collaborator call.
#[derive(Clone, Default)]
pub struct Hook(Arc<Mutex<Option<Box<dyn Fn() + Send>>>>);

impl Hook {
    pub fn set(&self, f: impl Fn() + Send + 'static) {
        *self.0.lock().unwrap() = Some(Box::new(f));
    }

    fn fire(&self) {
        if let Some(f) = self.0.lock().unwrap().as_ref() {
            f();
        }
    }
}

pub struct MemoryMetadata {
    pub package: PackageMetadata,
    pub board: Option<BoardMetadata>,
    pub project: PathBuf,
    pub on_package: Hook,
}

impl MetadataStore for MemoryMetadata {
    fn package_metadata(&self) -> anyhow::Result<PackageMetadata> {
        self.on_package.fire();
        Ok(self.package.clone())
    }

    fn board_metadata(&self, _board_package: &str) -> anyhow::Result<Option<BoardMetadata>> {
        Ok(self.board.clone())
    }

    fn package_dir(&self, package: &str) -> PathBuf {
        self.project.join(PACKAGES_DIR).join(package)
    }
}

#[derive(Default)]
pub struct RecordingTouch {
    pub touches: Mutex<Vec<(String, u32)>>,
}

impl SerialTouch for RecordingTouch {
    fn touch(&self, port: &str, baud: u32) -> anyhow::Result<()> {
        self.touches.lock().unwrap().push((port.to_string(), baud));
        Ok(())
    }
}

pub fn package() -> PackageMetadata {
    let mut dependencies = BTreeMap::new();
    dependencies.insert("@kiln/board-uno".to_string(), "1.0.0".to_string());
    PackageMetadata {
        name: "blink".to_string(),
        dependencies,
        project_config: serde_json::json!({}),
    }
}

pub fn board(upload: &str) -> BoardMetadata {
    let mut tools = BTreeMap::new();
    for (name, version) in [
        ("aily-builder", "1.0.0"),
        ("arduino:avr", "1.8.6"),
        ("avrdude", "6.3.0"),
        ("esptool", "4.6"),
        ("bossac", "1.7.0"),
    ] {
        tools.insert(name.to_string(), version.to_string());
    }
    BoardMetadata {
        name: "Arduino UNO".to_string(),
        compiler: Some("aily-builder".to_string()),
        compiler_param: Some("compile -b arduino:avr:uno -v".to_string()),
        upload_param: Some(upload.to_string()),
        core: Some("arduino:avr".to_string()),
        upload_speed: Some(115200),
        use_1200bps_touch: false,
        tool_dependencies: tools,
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub runner: Arc<ScriptedRunner>,
    pub sink: RecordingSink,
    pub source: SharedSource,
    pub touch: Arc<RecordingTouch>,
    /// Fires whenever the orchestrators read package metadata.
    pub on_package: Hook,
}

impl Harness {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            runner: ScriptedRunner::new(scripts),
            sink: RecordingSink::new(),
            source: SharedSource::new("void setup() {}\nvoid loop() {}\n"),
            touch: Arc::new(RecordingTouch::default()),
            on_package: Hook::default(),
        }
    }

    pub fn project(&self) -> &Path {
        self.dir.path()
    }

    pub fn context(&self, package: PackageMetadata, board: Option<BoardMetadata>) -> ProjectContext {
        let mut config = Config::default();
        config.toolchain.root = self.project().join("toolchain").display().to_string();
        config.upload.touch_settle_ms = 0;

        let collaborators = Collaborators {
            source: Arc::new(self.source.clone()),
            metadata: Arc::new(MemoryMetadata {
                package,
                board,
                project: self.project().to_path_buf(),
                on_package: self.on_package.clone(),
            }),
            runner: self.runner.clone(),
            sink: Arc::new(self.sink.clone()),
            serial: self.touch.clone(),
        };

        ProjectContext::new(self.project(), config, collaborators)
    }
}

pub fn out(text: &str) -> ProcessEvent {
    ProcessEvent::Stdout(text.to_string())
}

pub fn err(text: &str) -> ProcessEvent {
    ProcessEvent::Stderr(text.to_string())
}

/// A compiler run that completes normally.
pub fn successful_build() -> Script {
    Script::Finish(vec![
        out("BuildText: Compiling sketch\n[#####     ] 50%\n"),
        out("Sketch uses 924 bytes (2%) of program storage space.\n"),
        out("Global variables use 9 bytes (0%) of dynamic memory.\n"),
        ProcessEvent::Closed(Some(0)),
    ])
}
