mod chat;
mod config_cmd;
mod ipc;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::{ConfigStore, EnvDefaults};
use core_types::ProviderName;
use providers::ProviderFactory;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "app_host", version, about = "vChat provider relay host")]
struct Cli {
    /// Settings directory; defaults to `<config_dir>/vchat`.
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Data directory for logs and the conversation database.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Relay chat requests over newline-delimited JSON on stdin/stdout.
    Serve,

    /// Send one prompt and stream the answer to the terminal.
    Chat {
        #[arg(long)]
        provider: ProviderName,
        #[arg(long)]
        model: String,
        #[arg(long)]
        system: Option<String>,
        #[arg(long)]
        image: Option<PathBuf>,
        /// Persist the question and answer as a new conversation.
        #[arg(long, default_value_t = false)]
        save: bool,
        prompt: String,
    },

    /// Inspect or edit the settings file.
    Config {
        #[command(subcommand)]
        command: config_cmd::ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir(),
    };
    if let Err(err) = fs::create_dir_all(&data_dir) {
        eprintln!("failed to prepare data dir: {err}");
    }
    let _log_guard = init_local_logger(&data_dir.join("logs"));

    let store = match cli.config_dir {
        Some(dir) => ConfigStore::from_dir(dir),
        None => ConfigStore::from_default_location()?,
    };
    info!(settings = %store.path().display(), "app_host starting");

    match cli.command {
        Commands::Serve => {
            let config = store.load_or_init()?;
            info!(configured = config.is_configured(), "settings loaded");
            let factory = build_factory(store);
            ipc::serve(factory, tokio::io::stdin(), tokio::io::stdout()).await?;
        }
        Commands::Chat {
            provider,
            model,
            system,
            image,
            save,
            prompt,
        } => {
            let factory = build_factory(store);
            let options = chat::ChatOptions {
                provider,
                model,
                system,
                image,
                prompt,
                database: save.then(|| data_dir.join("vchat.db")),
            };
            let report = chat::run_chat(factory, options, tokio::io::stdout()).await?;
            info!(
                correlation_id = report.outcome.correlation_id,
                chars = report.text.chars().count(),
                "answer received"
            );
            if let Some(answer_id) = report.answer_id {
                eprintln!("saved as message {answer_id}");
            }
        }
        Commands::Config { command } => {
            let output = config_cmd::run(&store, command)?;
            println!("{output}");
        }
    }
    Ok(())
}

fn build_factory(store: ConfigStore) -> Arc<ProviderFactory> {
    Arc::new(ProviderFactory::new(
        Arc::new(store),
        EnvDefaults::from_process(),
    ))
}

fn default_data_dir() -> PathBuf {
    let mut data_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    data_dir.push("vchat");
    data_dir
}

/// Logs go to a daily file because stdout carries IPC traffic.
fn init_local_logger(log_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    if let Err(err) = fs::create_dir_all(log_dir) {
        eprintln!("failed to create log dir `{}`: {err}", log_dir.display());
    }
    let file_appender = tracing_appender::rolling::daily(log_dir, "vchat.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,app_host=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_writer(writer)
        .init();

    guard
}
