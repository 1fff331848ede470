use crate::notify::{Notification, NotificationSink, NotifyState};
use crate::parser::{OutputParser, ParsedEvent, StreamKind};
use crate::process::{ProcessEvent, ProcessHandle};

/// How a watched process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub exit_code: Option<i32>,
    pub spawn_error: Option<String>,
}

/// Feeds a process's output through `parser` until it closes, publishing a
/// `Doing` notification for every progress step and summary line.
pub async fn watch_process(
    handle: ProcessHandle,
    parser: &mut OutputParser,
    sink: &dyn NotificationSink,
    title: &str,
    mut on_progress: impl FnMut(u8),
) -> ProcessReport {
    let ProcessHandle { mut events, .. } = handle;
    let mut report = ProcessReport::default();

    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Stdout(chunk) => {
                let parsed = parser.feed(&chunk, StreamKind::Stdout);
                dispatch(parsed, StreamKind::Stdout, parser, sink, title, &mut on_progress);
            }
            ProcessEvent::Stderr(chunk) => {
                let parsed = parser.feed(&chunk, StreamKind::Stderr);
                dispatch(parsed, StreamKind::Stderr, parser, sink, title, &mut on_progress);
            }
            ProcessEvent::Closed(code) => {
                report.exit_code = code;
                break;
            }
            ProcessEvent::SpawnError(message) => {
                report.spawn_error = Some(message);
                break;
            }
        }
    }

    let rest = parser.finish();
    dispatch(rest, StreamKind::Stdout, parser, sink, title, &mut on_progress);

    report
}

fn dispatch(
    events: Vec<ParsedEvent>,
    stream: StreamKind,
    parser: &OutputParser,
    sink: &dyn NotificationSink,
    title: &str,
    on_progress: &mut impl FnMut(u8),
) {
    for event in events {
        sink.tool_output(stream, &event);

        match &event {
            ParsedEvent::Progress { percent, caption } => {
                on_progress(*percent);
                let text = caption
                    .clone()
                    .or_else(|| parser.caption().map(str::to_string))
                    .unwrap_or_else(|| title.to_string());
                sink.publish(
                    Notification::new(title, text, NotifyState::Doing).with_progress(*percent),
                );
            }
            ParsedEvent::Summary(line) => {
                sink.publish(Notification::new(title, line.clone(), NotifyState::Doing));
            }
            ParsedEvent::Status(_) | ParsedEvent::Error(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PatternsConfig;
    use crate::notify::RecordingSink;
    use crate::parser::ParserProfile;
    use crate::process::ProcessId;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_watch_publishes_progress_and_exit() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(ProcessEvent::Stdout("BuildText: Compiling core\n".into())).unwrap();
        tx.send(ProcessEvent::Stdout("[#####     ] 50%\r[##########] 100%".into())).unwrap();
        tx.send(ProcessEvent::Stdout("\n".into())).unwrap();
        tx.send(ProcessEvent::Closed(Some(0))).unwrap();

        let sink = RecordingSink::new();
        let mut parser = OutputParser::new(ParserProfile::build(&PatternsConfig::default()).unwrap());
        let mut seen = Vec::new();

        let report = watch_process(
            ProcessHandle {
                id: ProcessId(1),
                events: rx,
            },
            &mut parser,
            &sink,
            "Build",
            |p| seen.push(p),
        )
        .await;

        assert_eq!(report.exit_code, Some(0));
        assert!(report.spawn_error.is_none());
        assert_eq!(seen, vec![50, 100]);
        let published = sink.notifications();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].text, "Compiling core");
        assert_eq!(published[1].progress, Some(100));
    }

    #[tokio::test]
    async fn test_watch_reports_spawn_error() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(ProcessEvent::SpawnError("no such file".into())).unwrap();

        let sink = RecordingSink::new();
        let mut parser = OutputParser::new(ParserProfile::build(&PatternsConfig::default()).unwrap());
        let report = watch_process(
            ProcessHandle {
                id: ProcessId(1),
                events: rx,
            },
            &mut parser,
            &sink,
            "Build",
            |_| {},
        )
        .await;

        assert_eq!(report.exit_code, None);
        assert_eq!(report.spawn_error.as_deref(), Some("no such file"));
    }
}
