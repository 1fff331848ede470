use thiserror::Error;

use crate::session::{Activity, Outcome, OutcomeState};

/// Why a build or upload stopped short of success.
#[derive(Debug, Error)]
pub enum KilnError {
    #[error("{0}")]
    Busy(String),

    #[error("{0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{summary}")]
    Process { summary: String, detail: String },

    #[error("{0}")]
    Incomplete(String),

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl KilnError {
    pub fn config(message: impl Into<String>) -> Self {
        KilnError::Config(message.into())
    }

    pub fn busy(message: impl Into<String>) -> Self {
        KilnError::Busy(message.into())
    }

    /// Rejection for `requested` while `blocker` is running.
    pub fn blocked(requested: Activity, blocker: Activity) -> Self {
        let message = match blocker {
            Activity::Install => "dependencies are being installed",
            Activity::Build if requested == Activity::Build => "a build is already in progress",
            Activity::Build => "a build is in progress",
            Activity::Upload if requested == Activity::Upload => "an upload is already in progress",
            Activity::Upload => "an upload is in progress",
        };
        KilnError::busy(message)
    }

    pub fn into_outcome(self) -> Outcome {
        match self {
            KilnError::Cancelled => Outcome::new(OutcomeState::Cancelled, "cancelled"),
            KilnError::Process { summary, detail } => {
                Outcome::new(OutcomeState::Error, summary).with_detail(detail)
            }
            KilnError::Io(err) => Outcome::new(OutcomeState::Error, format!("{:#}", err)),
            other => Outcome::new(OutcomeState::Error, other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, KilnError>;

impl From<std::io::Error> for KilnError {
    fn from(err: std::io::Error) -> Self {
        KilnError::Io(err.into())
    }
}
