use std::fmt;

/// Pipeline steps. Cancellation is checked on entry to each one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    PrepareSandbox,
    GenerateSource,
    StageLibraries,
    ResolveToolchain,
    SyncTools,
    Compile,
    Rebuild,
    ResolveRecipe,
    TouchPort,
    Flash,
}

impl Step {
    pub fn caption(&self) -> &'static str {
        match self {
            Step::PrepareSandbox => "Preparing build sandbox",
            Step::GenerateSource => "Generating sketch source",
            Step::StageLibraries => "Staging libraries",
            Step::ResolveToolchain => "Resolving toolchain",
            Step::SyncTools => "Synchronizing compiler tools",
            Step::Compile => "Compiling",
            Step::Rebuild => "Building before upload",
            Step::ResolveRecipe => "Preparing flash command",
            Step::TouchPort => "Resetting board into bootloader",
            Step::Flash => "Flashing",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.caption())
    }
}
