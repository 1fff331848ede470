use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One classified line of tool output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParsedEvent {
    /// Human-readable status text, or a new caption from a build-text marker.
    Status(String),
    Progress {
        percent: u8,
        caption: Option<String>,
    },
    /// Firmware-size line; the build output is complete after this.
    Summary(String),
    Error(String),
}

impl ParsedEvent {
    pub fn percent(&self) -> Option<u8> {
        match self {
            ParsedEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ParsedEvent::Error(_))
    }
}
