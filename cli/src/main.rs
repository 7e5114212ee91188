//! mnemo CLI - runs one chat turn against the local conversation store.
//!
//! ```text
//! main() -> MnemoConfig -> SqliteStore + OpenAiGenerator
//!        -> Pipeline::run_turn() --fragments--> stdout
//!                 |
//!                 v
//!        distillation worker (drained before exit)
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::{
    fs::{self, OpenOptions},
    io::{Write, stdout},
    path::PathBuf,
    process::ExitCode,
    sync::{Arc, Mutex},
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use mnemo_engine::{
    ConversationKey, DeliveryStatus, Distiller, IdempotencyLock, MnemoConfig, OpenAiConfig,
    OpenAiGenerator, Pipeline, SqliteStore, Store, TransportEvent, TransportSink, TurnRequest,
    spawn_worker,
};

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (log_file, init_warnings) = open_mnemo_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // stdout carries the reply and stderr the error, so no file means no logs.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_mnemo_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in mnemo_log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn mnemo_log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.mnemo/logs/mnemo.log
    if let Some(home) = mnemo_engine::mnemo_home() {
        candidates.push(home.join("logs").join("mnemo.log"));
    }

    // Fallback: ./.mnemo/logs/mnemo.log
    candidates.push(PathBuf::from(".mnemo").join("logs").join("mnemo.log"));

    candidates
}

#[derive(Debug, Parser)]
#[command(name = "mnemo", version)]
#[command(about = "Chat with a token-budgeted rolling memory that learns about its user")]
struct Cli {
    /// Account id
    #[arg(long, default_value = "local")]
    account: String,
    /// User id
    #[arg(long, env = "USER", default_value = "default")]
    user: String,
    /// Assistant id
    #[arg(long, default_value = "mnemo")]
    assistant: String,
    /// Config file (default: ~/.mnemo/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Distill the analysis window this turn; the message may be empty
    #[arg(long)]
    force: bool,
    /// Message to send; words are joined with spaces
    message: Vec<String>,
}

impl Cli {
    fn text(&self) -> String {
        self.message.join(" ")
    }
}

/// Prints fragments to stdout as they arrive.
struct StdoutSink;

impl TransportSink for StdoutSink {
    fn deliver(&mut self, event: TransportEvent) {
        let mut out = stdout().lock();
        let written = match event.status {
            DeliveryStatus::Partial => out.write_all(event.fragment.as_bytes()),
            DeliveryStatus::Complete => out.write_all(b"\n"),
        };
        if let Err(e) = written.and_then(|()| out.flush()) {
            tracing::warn!("Failed to write reply to stdout: {e}");
        }
    }
}

fn openai_config(config: &MnemoConfig, api_key: &str, model: &str) -> OpenAiConfig {
    let openai = OpenAiConfig::new(api_key, model);
    match config.base_url() {
        Some(base_url) => openai.with_base_url(base_url),
        None => openai,
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Cli::parse();
    init_tracing();

    let config = match &args.config {
        Some(path) => MnemoConfig::load_from(path)?,
        None => MnemoConfig::load()?.unwrap_or_default(),
    };
    let budgets = config.budgets().context("invalid window budgets")?;
    let api_key = config
        .openai_api_key()
        .context("no OpenAI API key; set [api_keys].openai or OPENAI_API_KEY")?;
    let db_path = config
        .database_path()
        .context("could not determine the database path")?;
    let text = args.text();
    let conversation = ConversationKey::new(args.account, args.user, args.assistant)?;

    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("failed to open store at {}", db_path.display()))?,
    );
    let chat = OpenAiGenerator::new(openai_config(&config, &api_key, config.model()))?;
    let distill = OpenAiGenerator::new(openai_config(&config, &api_key, config.distill_model()))?;

    let (jobs, worker) = spawn_worker(Distiller::new(Arc::clone(&store), Arc::new(distill)));
    let pipeline = Pipeline::new(store, Arc::new(chat), budgets, jobs)
        .with_lock(IdempotencyLock::new(config.lease()));

    let response = pipeline
        .run_turn(
            TurnRequest {
                conversation,
                text,
                force_distill: args.force,
            },
            &mut StdoutSink,
        )
        .await;

    // Dropping the pipeline closes the job queue; wait for pending distillation.
    drop(pipeline);
    if let Err(e) = worker.await {
        tracing::error!("Distillation worker panicked: {e}");
    }

    if response.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("Error ({}): {}", response.status, response.message);
        Ok(ExitCode::FAILURE)
    }
}
