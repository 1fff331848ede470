use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_core::config::CONFIG_FILE;
use kiln_core::logger::Logger;
use kiln_core::notify::NotifyState;
use kiln_core::{
    BuildOrchestrator, Cli, Collaborators, Commands, Config, FileSourceGenerator, History,
    HistoryCommands, HistoryType, Outcome, ProjectContext, ProjectMetadataStore, SerialPortTouch,
    TokioProcessRunner, UploadOrchestrator,
};

fn context(cli: &Cli, project: &Path, config: Config, source: Option<PathBuf>) -> Result<ProjectContext> {
    let source = source.unwrap_or_else(|| project.join("sketch.ino"));
    let history = History::new(config.storage_path(), config.history.max_entries)
        .context("Failed to load history")?;

    let collaborators = Collaborators {
        source: Arc::new(FileSourceGenerator::new(source)),
        metadata: Arc::new(ProjectMetadataStore::new(project)),
        runner: Arc::new(TokioProcessRunner::new()),
        sink: Arc::new(Logger::new().verbose(cli.verbose)),
        serial: Arc::new(SerialPortTouch),
    };

    Ok(ProjectContext::new(project, config, collaborators).with_history(history))
}

fn exit_with(outcome: &Outcome) -> ! {
    std::process::exit(if outcome.is_done() { 0 } else { 1 })
}

async fn run_build(ctx: ProjectContext) -> Outcome {
    let builder = Arc::new(BuildOrchestrator::new(Arc::new(ctx)));

    let on_interrupt = Arc::clone(&builder);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel_build();
        }
    });

    builder.build().await
}

async fn run_upload(ctx: ProjectContext, port: String) -> Outcome {
    let builder = Arc::new(BuildOrchestrator::new(Arc::new(ctx)));
    let uploader = Arc::new(UploadOrchestrator::new(builder));
    uploader.select_port(port);

    let on_interrupt = Arc::clone(&uploader);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel_upload();
        }
    });

    uploader.upload().await
}

fn list_ports() -> Result<()> {
    let logger = Logger::new();
    let ports = kiln_core::serial::available_ports()?;

    if ports.is_empty() {
        logger.log(NotifyState::Warn, "No serial ports found.");
        return Ok(());
    }

    for port in ports {
        logger.log(NotifyState::Doing, &format!("  - {}", port));
    }
    Ok(())
}

fn show_history(config: &Config, count: Option<usize>) -> Result<()> {
    let logger = Logger::new();
    let history = History::new(config.storage_path(), config.history.max_entries)
        .context("Failed to load history")?;

    let entries = history.entries();
    if entries.is_empty() {
        logger.log(NotifyState::Doing, "No history found.");
        return Ok(());
    }

    let count = count.unwrap_or(10).min(entries.len());
    logger.log(NotifyState::Doing, &format!("History (last {} entries):", count));

    for entry in entries.iter().rev().take(count) {
        let state = match entry.state {
            kiln_core::history::EntryState::Succeeded => NotifyState::Done,
            kiln_core::history::EntryState::Failed => NotifyState::Error,
            kiln_core::history::EntryState::Cancelled => NotifyState::Warn,
        };
        logger.log(
            state,
            &format!(
                "{} | {} | {} | {} | {:.1}s | {}",
                entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                entry.kind,
                entry.board.as_deref().unwrap_or("-"),
                entry.project,
                entry.duration,
                entry.summary
            ),
        );
    }

    Ok(())
}

fn clear_history(config: &Config, history_type: HistoryType) -> Result<()> {
    let mut history = History::new(config.storage_path(), config.history.max_entries)
        .context("Failed to load history")?;
    history.clear(history_type.kind())?;

    match history_type.kind() {
        Some(kind) => println!("{} history cleared.", kind),
        None => println!("All history cleared."),
    }
    Ok(())
}

fn init_config(project: &Path) -> Result<()> {
    let config_path = project.join(CONFIG_FILE);

    if config_path.exists() {
        anyhow::bail!(
            "{} already exists at {}. Remove it first if you want to reinitialize.",
            CONFIG_FILE,
            config_path.display()
        );
    }

    Config::default()
        .save_to_file(&config_path)
        .with_context(|| format!("Failed to save {}", CONFIG_FILE))?;

    println!("Created {} at {}", CONFIG_FILE, config_path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project = cli.project_directory()?;
    let load_config = || Config::load(&project, cli.config.as_deref());

    match &cli.command {
        Commands::Init => init_config(&project),
        Commands::Ports => list_ports(),
        Commands::History { command } => {
            let config = load_config()?;
            match command {
                HistoryCommands::Show { count } => show_history(&config, *count),
                HistoryCommands::Clear { r#type } => clear_history(&config, *r#type),
            }
        }
        Commands::Build { source } => {
            let ctx = context(&cli, &project, load_config()?, source.clone())?;
            let outcome = run_build(ctx).await;
            exit_with(&outcome)
        }
        Commands::Upload { port, source } => {
            let ctx = context(&cli, &project, load_config()?, source.clone())?;
            let outcome = run_upload(ctx, port.clone()).await;
            exit_with(&outcome)
        }
    }
}
