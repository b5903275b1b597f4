//! Desai CLI
//!
//! Headless front end for the job engine: submit files for enhancement or
//! transcription, inspect and manage stored jobs, and resume polling for
//! jobs left unfinished by an earlier run.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use desai_lib::core::engine::JobEngine;
use desai_lib::core::events::JobEvent;
use desai_lib::core::settings::{EngineSettings, SettingsManager};
use desai_lib::core::submission::{EnhanceOptions, SubmitRequest};
use desai_lib::core::{MediaKind, Operation};

#[derive(Parser, Debug)]
#[command(name = "desai-cli", version, about = "Remote media enhancement and transcription jobs")]
struct Cli {
    /// Directory holding settings.json
    #[arg(long, global = true, env = "DESAI_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Overrides the data directory from settings
    #[arg(long, global = true, env = "DESAI_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file and create a job
    Submit {
        file: PathBuf,

        /// audio or video; inferred from the extension when omitted
        #[arg(long, value_parser = parse_media_kind)]
        kind: Option<MediaKind>,

        /// enhance or transcribe
        #[arg(long, value_parser = parse_operation, default_value = "enhance")]
        operation: Operation,

        /// Skip studio sound processing
        #[arg(long)]
        no_sound_studio: bool,

        /// Trim long pauses
        #[arg(long)]
        trim_pauses: bool,

        /// Keep filler words
        #[arg(long)]
        keep_filler_words: bool,

        /// Keep polling until the job reaches a terminal state
        #[arg(long)]
        wait: bool,
    },
    /// List jobs, newest first
    List {
        #[arg(long, value_parser = parse_operation)]
        operation: Option<Operation>,
    },
    /// Show one job
    Show { id: String },
    /// Change the display name of a job
    Rename { id: String, name: String },
    /// Delete a finished job and its file
    Delete { id: String },
    /// Print the local file of a finished job
    Open { id: String },
    /// Resume polling for unfinished jobs and wait for them
    Resume,
    /// Inspect or reset settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
    /// Print the effective settings
    Show,
    /// Print the settings file path
    Path,
    /// Delete the settings file
    Reset,
}

fn parse_media_kind(value: &str) -> Result<MediaKind, String> {
    MediaKind::parse(value).ok_or_else(|| format!("unknown media kind: {value}"))
}

fn parse_operation(value: &str) -> Result<Operation, String> {
    Operation::parse(value).ok_or_else(|| format!("unknown operation: {value}"))
}

fn infer_media_kind(path: &Path) -> Option<MediaKind> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "mp3" | "m4a" | "wav" | "aac" | "flac" | "ogg" | "opus" => Some(MediaKind::Audio),
        "mp4" | "mov" | "m4v" | "mkv" | "webm" | "avi" => Some(MediaKind::Video),
        _ => None,
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let manager = match &cli.config_dir {
        Some(dir) => SettingsManager::new(dir.clone()),
        None => SettingsManager::with_default_dir(),
    };
    let data_dir = cli.data_dir;

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let logs_dir = effective_settings(&manager, data_dir.clone())
        .storage
        .logs_dir();
    desai_lib::init_logging(&logs_dir, level);

    match cli.command {
        Command::Submit {
            file,
            kind,
            operation,
            no_sound_studio,
            trim_pauses,
            keep_filler_words,
            wait,
        } => {
            let kind = match kind.or_else(|| infer_media_kind(&file)) {
                Some(kind) => kind,
                None => bail!(
                    "Cannot tell whether {} is audio or video, pass --kind",
                    file.display()
                ),
            };
            let request = SubmitRequest::new(&file, kind, operation).with_options(EnhanceOptions {
                sound_studio: !no_sound_studio,
                remove_dead_air: trim_pauses,
                remove_filler_words: !keep_filler_words,
            });
            submit(&open_engine(&manager, data_dir)?, request, wait).await?;
        }
        Command::List { operation } => {
            let engine = open_engine(&manager, data_dir)?;
            let jobs = match operation {
                Some(operation) => engine.list_by_operation(operation)?,
                None => engine.list()?,
            };
            print_json(&jobs)?;
        }
        Command::Show { id } => print_json(&open_engine(&manager, data_dir)?.get(&id)?)?,
        Command::Rename { id, name } => {
            print_json(&open_engine(&manager, data_dir)?.rename(&id, &name)?)?
        }
        Command::Delete { id } => {
            open_engine(&manager, data_dir)?.delete(&id).await?;
            info!("Deleted job {}", id);
        }
        Command::Open { id } => {
            let path = open_engine(&manager, data_dir)?.open_artifact(&id)?;
            println!("{}", path.display());
        }
        Command::Resume => {
            let engine = open_engine(&manager, data_dir)?;
            let resumed = engine.resume_unfinished()?;
            info!("Waiting for {} jobs", resumed);
            engine.wait_idle().await;
            print_json(&engine.list()?)?;
        }
        Command::Settings { action } => run_settings(&manager, &action, data_dir)?,
    }

    Ok(())
}

fn effective_settings(manager: &SettingsManager, data_dir: Option<PathBuf>) -> EngineSettings {
    let mut settings = manager.load();
    if let Some(dir) = data_dir {
        settings.storage.data_dir = dir;
    }
    settings
}

fn open_engine(manager: &SettingsManager, data_dir: Option<PathBuf>) -> Result<JobEngine> {
    JobEngine::open(effective_settings(manager, data_dir)).context("Failed to open job engine")
}

fn run_settings(
    manager: &SettingsManager,
    action: &SettingsAction,
    data_dir: Option<PathBuf>,
) -> Result<()> {
    match action {
        SettingsAction::Show => print_json(&effective_settings(manager, data_dir)),
        SettingsAction::Path => {
            println!("{}", manager.settings_path().display());
            Ok(())
        }
        SettingsAction::Reset => {
            let settings = manager.reset().context("Failed to reset settings")?;
            print_json(&settings)
        }
    }
}

async fn submit(engine: &JobEngine, request: SubmitRequest, wait: bool) -> Result<()> {
    let mut events = engine.subscribe();
    let job = engine
        .submit(request)
        .await
        .context("Submission failed")?;
    print_json(&job)?;

    if !wait {
        info!(
            "Job {} queued; run `desai-cli resume` to keep tracking it",
            job.id
        );
        return Ok(());
    }

    let outcome = loop {
        match events.recv().await {
            Ok(event) if event.is_terminal() && event.job_id() == Some(job.id.as_str()) => {
                break event;
            }
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Missed {} events while waiting", skipped);
                continue;
            }
            Err(RecvError::Closed) => bail!("Event stream closed before job {} ended", job.id),
        }
    };

    engine.shutdown();
    engine.wait_idle().await;
    print_json(&outcome)?;

    match outcome {
        JobEvent::Finished { id } => {
            println!("{}", engine.open_artifact(&id)?.display());
            Ok(())
        }
        JobEvent::Cancelled { id, reason } => bail!("Job {} was cancelled: {:?}", id, reason),
        JobEvent::Failed { id, error } => bail!("Job {} failed: {}", id, error),
        JobEvent::StoreChanged => Ok(()),
    }
}
