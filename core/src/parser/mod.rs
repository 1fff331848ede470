pub mod event;
pub mod parser;
pub mod profile;
pub mod regions;

pub use event::{ParsedEvent, StreamKind};
pub use parser::{strip_ansi, OutputParser, ProgressState};
pub use profile::{ParserProfile, ProgressMatcher};
pub use regions::{RegionState, RegionTracker};
