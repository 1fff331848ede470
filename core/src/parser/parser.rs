use once_cell::sync::Lazy;
use regex::Regex;

use super::event::{ParsedEvent, StreamKind};
use super::profile::{ParserProfile, ProgressMatcher};
use super::regions::{RegionState, RegionTracker};

static LINE_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\r\n|\n|\r").unwrap());
static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").unwrap());

/// Per-session parser state. Each stream keeps its own unterminated tail so
/// interleaved stdout/stderr chunks never splice into one line.
#[derive(Debug, Clone, Default)]
pub struct ProgressState {
    pub last_progress_percent: u8,
    pub partial_stdout: String,
    pub partial_stderr: String,
    pub errored: bool,
}

impl ProgressState {
    fn partial_mut(&mut self, stream: StreamKind) -> &mut String {
        match stream {
            StreamKind::Stdout => &mut self.partial_stdout,
            StreamKind::Stderr => &mut self.partial_stderr,
        }
    }
}

/// Reassembles chunked tool output into lines and classifies each one.
#[derive(Debug, Clone)]
pub struct OutputParser {
    profile: ParserProfile,
    state: ProgressState,
    regions: RegionTracker,
    caption: Option<String>,
    output_complete: bool,
    completed: bool,
    last_error: Option<String>,
    error_log: Vec<String>,
}

impl OutputParser {
    pub fn new(profile: ParserProfile) -> Self {
        Self {
            profile,
            state: ProgressState::default(),
            regions: RegionTracker::new(),
            caption: None,
            output_complete: false,
            completed: false,
            last_error: None,
            error_log: Vec::new(),
        }
    }

    pub fn feed(&mut self, chunk: &str, stream: StreamKind) -> Vec<ParsedEvent> {
        let mut events = Vec::new();

        let buffer = self.state.partial_mut(stream);
        buffer.push_str(chunk);

        if !buffer.contains(['\n', '\r']) {
            return events;
        }

        let combined = std::mem::take(buffer);
        let mut lines: Vec<&str> = LINE_BREAK.split(&combined).collect();
        let tail = lines.pop().unwrap_or_default();
        *self.state.partial_mut(stream) = tail.to_string();

        for line in lines {
            self.classify(line, stream, &mut events);
        }

        events
    }

    /// Classifies whatever is still buffered, as if each stream had ended
    /// with a line terminator.
    pub fn finish(&mut self) -> Vec<ParsedEvent> {
        let mut events = Vec::new();
        for stream in [StreamKind::Stdout, StreamKind::Stderr] {
            let tail = std::mem::take(self.state.partial_mut(stream));
            if !tail.is_empty() {
                self.classify(&tail, stream, &mut events);
            }
        }
        events
    }

    fn classify(&mut self, raw: &str, stream: StreamKind, events: &mut Vec<ParsedEvent>) {
        let stripped = strip_ansi(raw);
        let line = stripped.trim();
        if line.is_empty() {
            return;
        }

        if stream == StreamKind::Stderr {
            self.error_log.push(line.to_string());
        }

        if let Some(caption) = line.strip_prefix(self.profile.build_text_marker.as_str()) {
            let caption = caption.trim().to_string();
            self.caption = Some(caption.clone());
            events.push(ParsedEvent::Status(caption));
            return;
        }

        if let Some(percent) = self.progress_of(line) {
            self.advance(percent, events);
            return;
        }

        if let Some(marker) = &self.profile.size_marker {
            if line.contains(marker.as_str()) {
                self.output_complete = true;
                self.completed = true;
                events.push(ParsedEvent::Summary(line.to_string()));
                return;
            }
        }

        match stream {
            StreamKind::Stderr => {
                if self.profile.is_error(line) {
                    self.state.errored = true;
                    self.last_error = Some(line.to_string());
                    events.push(ParsedEvent::Error(line.to_string()));
                }
            }
            StreamKind::Stdout => {
                if self.state.errored {
                    self.error_log.push(line.to_string());
                } else if !self.output_complete {
                    events.push(ParsedEvent::Status(line.to_string()));
                }
            }
        }
    }

    fn progress_of(&mut self, line: &str) -> Option<u8> {
        match &self.profile.progress {
            ProgressMatcher::Regions => {
                if let Some(percent) = self.regions.observe(line) {
                    return Some(percent);
                }
                // swallow repeated in-region lines that did not move the total
                if RegionTracker::is_progress_line(line) {
                    return Some(self.state.last_progress_percent);
                }
                None
            }
            matcher => matcher.percent_of(line),
        }
    }

    fn advance(&mut self, percent: u8, events: &mut Vec<ParsedEvent>) {
        if percent <= self.state.last_progress_percent {
            return;
        }
        self.state.last_progress_percent = percent;
        if percent >= 100 {
            self.completed = true;
        }
        events.push(ParsedEvent::Progress {
            percent,
            caption: self.caption.clone(),
        });
    }

    pub fn progress(&self) -> u8 {
        self.state.last_progress_percent
    }

    /// Set by a 100% progress line or a firmware-size summary.
    pub fn completed(&self) -> bool {
        self.completed
    }

    pub fn reached_full_progress(&self) -> bool {
        self.state.last_progress_percent >= 100
    }

    pub fn errored(&self) -> bool {
        self.state.errored
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn caption(&self) -> Option<&str> {
        self.caption.as_deref()
    }

    pub fn error_log(&self) -> String {
        self.error_log.join("\n")
    }

    pub fn region_state(&self) -> RegionState {
        self.regions.state()
    }
}

pub fn strip_ansi(s: &str) -> String {
    ANSI_ESCAPE.replace_all(s, "").to_string()
}
