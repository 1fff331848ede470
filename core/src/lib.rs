pub mod build;
pub mod cli;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod files;
pub mod flash;
pub mod history;
pub mod library;
pub mod logger;
pub mod metadata;
pub mod monitor;
pub mod notify;
pub mod parser;
pub mod process;
pub mod serial;
pub mod session;
pub mod source;
pub mod step;
pub mod toolchain;
pub mod upload;

#[cfg(test)]
pub(crate) mod testing;

pub use build::BuildOrchestrator;
pub use cli::{Cli, Commands, HistoryCommands, HistoryType};
pub use command::{CommandLine, CompilerTemplate};
pub use config::Config;
pub use context::{Collaborators, ProjectContext};
pub use error::KilnError;
pub use flash::{FlashRecipe, ToolKind};
pub use history::{History, HistoryEntry, SessionKind};
pub use library::{LibraryCache, LibraryStager, StageReport};
pub use metadata::{BoardMetadata, MetadataStore, PackageMetadata, ProjectMetadataStore};
pub use notify::{Notification, NotificationSink, NotifyState};
pub use process::{ProcessEvent, ProcessRunner, TokioProcessRunner};
pub use serial::{SerialPortTouch, SerialTouch};
pub use session::{Outcome, OutcomeState};
pub use source::{FileSourceGenerator, SourceGenerator};
pub use upload::UploadOrchestrator;
