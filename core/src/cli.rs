use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::history::SessionKind;

#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[arg(
        short = 'C',
        long = "directory",
        value_name = "DIR",
        help = "Project directory"
    )]
    pub project_dir: Option<PathBuf>,

    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, help = "Echo every parsed tool line")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum HistoryType {
    Build,
    Upload,
    All,
}

impl HistoryType {
    pub fn kind(&self) -> Option<SessionKind> {
        match self {
            HistoryType::Build => Some(SessionKind::Build),
            HistoryType::Upload => Some(SessionKind::Upload),
            HistoryType::All => None,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum HistoryCommands {
    #[command(about = "Show history")]
    Show {
        #[arg(short = 'n', long, help = "Number of entries to show")]
        count: Option<usize>,
    },

    #[command(about = "Clear history")]
    Clear {
        #[arg(
            long,
            value_enum,
            default_value = "all",
            help = "History type to clear"
        )]
        r#type: HistoryType,
    },
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Compile the project's sketch")]
    Build {
        #[arg(long, value_name = "FILE", help = "Generated sketch source (default: sketch.ino)")]
        source: Option<PathBuf>,
    },

    #[command(about = "Build if needed, then flash the board")]
    Upload {
        #[arg(short, long, value_name = "PORT", help = "Serial port of the board")]
        port: String,

        #[arg(long, value_name = "FILE", help = "Generated sketch source (default: sketch.ino)")]
        source: Option<PathBuf>,
    },

    #[command(about = "List serial ports")]
    Ports,

    #[command(about = "Manage history")]
    History {
        #[command(subcommand)]
        command: HistoryCommands,
    },

    #[command(about = "Initialize a new kiln.toml configuration")]
    Init,
}

impl Cli {
    pub fn project_directory(&self) -> anyhow::Result<PathBuf> {
        match &self.project_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(std::env::current_dir()?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_upload() {
        let cli = Cli::try_parse_from(["kiln", "-C", "/p", "-v", "upload", "--port", "/dev/ttyUSB0"])
            .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.project_directory().unwrap(), PathBuf::from("/p"));
        match cli.command {
            Commands::Upload { port, source } => {
                assert_eq!(port, "/dev/ttyUSB0");
                assert!(source.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_history_clear() {
        let cli = Cli::try_parse_from(["kiln", "history", "clear", "--type", "upload"]).unwrap();
        match cli.command {
            Commands::History {
                command: HistoryCommands::Clear { r#type },
            } => assert_eq!(r#type.kind(), Some(SessionKind::Upload)),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_upload_requires_port() {
        assert!(Cli::try_parse_from(["kiln", "upload"]).is_err());
    }
}
