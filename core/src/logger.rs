use chrono::Local;
use std::io::Write;

use crate::notify::{format_elapsed, Notification, NotificationSink, NotifyState};
use crate::parser::{ParsedEvent, StreamKind};

/// Console notification sink, colored when stdout is a terminal.
pub struct Logger {
    use_colors: bool,
    verbose: bool,
}

impl Logger {
    pub fn new() -> Self {
        Self {
            use_colors: atty::is(atty::Stream::Stdout),
            verbose: false,
        }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn log(&self, state: NotifyState, message: &str) {
        if self.use_colors {
            println!("{}{}\x1b[0m", color(state), message);
        } else {
            println!("{}", message);
        }
    }

    /// Echo of one parsed tool line, only in verbose mode.
    pub fn log_event(&self, stream: StreamKind, event: &ParsedEvent) {
        if !self.verbose {
            return;
        }
        let (state, text) = match event {
            ParsedEvent::Status(text) => (NotifyState::Doing, text.clone()),
            ParsedEvent::Progress { percent, .. } => (NotifyState::Doing, format!("{}%", percent)),
            ParsedEvent::Summary(text) => (NotifyState::Done, text.clone()),
            ParsedEvent::Error(text) => (NotifyState::Error, text.clone()),
        };
        let prefix = match stream {
            StreamKind::Stdout => "out",
            StreamKind::Stderr => "err",
        };
        self.log(state, &format!("  [{}] {}", prefix, text));
    }

    fn render(&self, notification: &Notification) -> String {
        let mut line = format!("{}: {}", notification.title, notification.text);
        if let Some(progress) = notification.progress {
            line.push_str(&format!(" ({}%)", progress));
        }
        if let Some(elapsed) = notification.elapsed {
            line.push_str(&format!(" in {}", format_elapsed(elapsed)));
        }
        line
    }
}

fn color(state: NotifyState) -> &'static str {
    match state {
        NotifyState::Doing => "\x1b[37m",
        NotifyState::Done => "\x1b[32m",
        NotifyState::Warn => "\x1b[33m",
        NotifyState::Error => "\x1b[31m",
    }
}

impl NotificationSink for Logger {
    fn publish(&self, notification: Notification) {
        let timestamp = Local::now().format("%H:%M:%S");
        let body = self.render(&notification);

        if self.use_colors {
            println!(
                "\x1b[90m[{}]\x1b[0m {}{}\x1b[0m",
                timestamp,
                color(notification.state),
                body
            );
        } else {
            println!("[{}] {}", timestamp, body);
        }

        if let Some(detail) = notification.detail.as_deref() {
            if notification.state == NotifyState::Error || self.verbose {
                for line in detail.lines() {
                    println!("    {}", line);
                }
            }
        }

        let _ = std::io::stdout().flush();
    }

    fn tool_output(&self, stream: StreamKind, event: &ParsedEvent) {
        self.log_event(stream, event);
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}
