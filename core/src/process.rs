use anyhow::Context;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::command::CommandLine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Everything a running process reports back, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout(String),
    Stderr(String),
    Closed(Option<i32>),
    SpawnError(String),
}

pub struct ProcessHandle {
    pub id: ProcessId,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

pub trait ProcessRunner: Send + Sync {
    fn run(&self, command: &CommandLine, cwd: Option<&Path>) -> anyhow::Result<ProcessHandle>;

    fn kill(&self, id: ProcessId);
}

/// Runs commands with tokio, streaming raw output chunks.
#[derive(Default)]
pub struct TokioProcessRunner {
    next_id: AtomicU64,
    running: Arc<Mutex<HashMap<ProcessId, oneshot::Sender<()>>>>,
}

impl TokioProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessRunner for TokioProcessRunner {
    fn run(&self, command: &CommandLine, cwd: Option<&Path>) -> anyhow::Result<ProcessHandle> {
        let id = ProcessId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        // Own process group so a kill also reaches the compiler's children.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                let _ = tx.send(ProcessEvent::SpawnError(format!(
                    "Failed to spawn command: {}: {}",
                    command.program, err
                )));
                return Ok(ProcessHandle { id, events: rx });
            }
        };

        let stdout = child.stdout.take().context("Failed to capture stdout")?;
        let stderr = child.stderr.take().context("Failed to capture stderr")?;

        let (kill_tx, kill_rx) = oneshot::channel();
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, kill_tx);

        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            let stdout_task = tokio::spawn(forward_chunks(stdout, tx.clone(), ProcessEvent::Stdout));
            let stderr_task = tokio::spawn(forward_chunks(stderr, tx.clone(), ProcessEvent::Stderr));

            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    terminate(&mut child);
                    child.wait().await
                }
            };

            let _ = stdout_task.await;
            let _ = stderr_task.await;

            running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);

            let event = match status {
                Ok(status) => ProcessEvent::Closed(status.code()),
                Err(err) => ProcessEvent::SpawnError(format!("Failed to wait for child process: {}", err)),
            };
            let _ = tx.send(event);
        });

        Ok(ProcessHandle { id, events: rx })
    }

    fn kill(&self, id: ProcessId) {
        let sender = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);

        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }
}

async fn forward_chunks<R, F>(mut reader: R, tx: mpsc::UnboundedSender<ProcessEvent>, wrap: F)
where
    R: AsyncRead + Unpin,
    F: Fn(String) -> ProcessEvent,
{
    let mut buf = vec![0u8; 8192];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let valid = utf8_prefix_len(&pending);
                if valid == 0 {
                    continue;
                }
                let chunk = String::from_utf8_lossy(&pending[..valid]).into_owned();
                pending.drain(..valid);
                if tx.send(wrap(chunk)).is_err() {
                    break;
                }
            }
        }
    }

    if !pending.is_empty() {
        let _ = tx.send(wrap(String::from_utf8_lossy(&pending).into_owned()));
    }
}

/// Length of the longest prefix that does not end inside a multi-byte
/// character, so chunks never split a UTF-8 sequence.
fn utf8_prefix_len(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(err) if err.error_len().is_none() => err.valid_up_to(),
        Err(_) => bytes.len(),
    }
}

fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if killpg(Pid::from_raw(pid as i32), Signal::SIGKILL).is_ok() {
                return;
            }
        }
    }

    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(mut handle: ProcessHandle) -> Vec<ProcessEvent> {
        let mut events = Vec::new();
        while let Some(event) = handle.events.recv().await {
            let last = matches!(event, ProcessEvent::Closed(_) | ProcessEvent::SpawnError(_));
            events.push(event);
            if last {
                break;
            }
        }
        events
    }

    #[test]
    fn test_utf8_prefix_len_stops_before_partial_char() {
        let bytes = "é".as_bytes();
        assert_eq!(utf8_prefix_len(&bytes[..1]), 0);
        assert_eq!(utf8_prefix_len(bytes), 2);
    }

    #[tokio::test]
    async fn test_spawn_error_is_reported_as_event() {
        let runner = TokioProcessRunner::new();
        let handle = runner
            .run(&CommandLine::new("/definitely/not/a/real/binary"), None)
            .unwrap();
        let events = collect(handle).await;
        assert!(matches!(events.last(), Some(ProcessEvent::SpawnError(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_streams_stdout_and_exit_code() {
        let runner = TokioProcessRunner::new();
        let cmd = CommandLine::new("sh").arg("-c").arg("echo hello; echo oops 1>&2; exit 3");
        let events = collect(runner.run(&cmd, None).unwrap()).await;

        let stdout: String = events
            .iter()
            .filter_map(|e| match e {
                ProcessEvent::Stdout(s) => Some(s.as_str()),
                _ => None,
            })
            .collect();
        let stderr: String = events
            .iter()
            .filter_map(|e| match e {
                ProcessEvent::Stderr(s) => Some(s.as_str()),
                _ => None,
            })
            .collect();

        assert_eq!(stdout, "hello\n");
        assert_eq!(stderr, "oops\n");
        assert_eq!(events.last(), Some(&ProcessEvent::Closed(Some(3))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_terminates_process() {
        let runner = TokioProcessRunner::new();
        let handle = runner
            .run(&CommandLine::new("sh").arg("-c").arg("sleep 30"), None)
            .unwrap();
        let id = handle.id;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        runner.kill(id);

        let events = tokio::time::timeout(std::time::Duration::from_secs(5), collect(handle))
            .await
            .expect("process was not killed");
        assert_eq!(events.last(), Some(&ProcessEvent::Closed(None)));
    }
}
