use anyhow::{Context, Result, anyhow};
use arbor::config::{EngineConfig, load_config_from_yaml};
use arbor::dsl::loader::load_definition_from_yaml;
use arbor::participants::builtin::TraceParticipant;
use arbor::runtime::engine::Engine;
use arbor::runtime::redis_storage::{RedisExpressionStore, RedisMessageQueue};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const QUEUE_KEY: &str = "arbor:messages";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Engine config YAML
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a process definition in memory until it terminates
    Run {
        /// Path to the definition YAML file
        #[arg(long, short)]
        file: PathBuf,

        /// Initial workitem fields (key=value)
        #[arg(long, short = 'D', value_parser = parse_key_val)]
        vars: Vec<(String, Value)>,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },

    /// Start a worker against Redis (Distributed Mode)
    Worker {
        /// Redis connection URL
        #[arg(long, default_value = "redis://127.0.0.1:6379/0")]
        redis: String,

        /// Worker Name (for logging)
        #[arg(long, default_value = "worker")]
        name: String,

        /// Directory of definitions usable by `subprocess`, by file stem
        #[arg(long)]
        definitions: Option<PathBuf>,

        /// Recover stored instances before starting
        #[arg(long)]
        recover: bool,
    },

    /// Launch a process through Redis for workers to execute (Client Mode)
    Launch {
        /// Path to the definition YAML file
        #[arg(long, short)]
        file: PathBuf,

        /// Redis connection URL
        #[arg(long, default_value = "redis://127.0.0.1:6379/0")]
        redis: String,

        /// Initial workitem fields (key=value)
        #[arg(long, short = 'D', value_parser = parse_key_val)]
        vars: Vec<(String, Value)>,
    },
}

fn parse_key_val(s: &str) -> Result<(String, Value), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=value: no `=` found in `{}`", s))?;
    let key = s[..pos].to_string();
    let val_str = &s[pos + 1..];
    // JSON if it parses, plain string otherwise
    let val = serde_json::from_str(val_str).unwrap_or_else(|_| Value::String(val_str.to_string()));
    Ok((key, val))
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("Path {} is not valid UTF-8", path.display()))
}

fn redis_engine(config: EngineConfig, url: &str) -> Result<Engine> {
    let client = redis::Client::open(url).with_context(|| format!("Invalid Redis URL {}", url))?;
    let store = Arc::new(RedisExpressionStore::new(client.clone()));
    let queue = Arc::new(RedisMessageQueue::new(client, QUEUE_KEY.to_string()));
    Ok(Engine::new_with_storage(config, store, queue))
}

fn register_definitions(engine: &Engine, dir: &Path) {
    info!("Loading definitions from: {:?}", dir);
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            error!("Failed to read {}: {}", dir.display(), e);
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let is_yaml = matches!(
            path.extension().and_then(|s| s.to_str()),
            Some("yaml") | Some("yml")
        );
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if !is_yaml {
            continue;
        }

        match path_str(&path).and_then(load_definition_from_yaml) {
            Ok(tree) => {
                info!("Loaded definition: {}", stem);
                engine.register_definition(stem, tree);
            }
            Err(e) => error!("Failed to load {}: {:#}", path.display(), e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config_from_yaml(path_str(path)?)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Run { file, vars, timeout } => {
            info!("Running in Standalone Memory Mode");
            let engine = Arc::new(Engine::with_config(config));
            let trace = Arc::new(TraceParticipant::new());
            engine.register_participant(".+", trace.clone())?;

            if let Some(dir) = file.parent() {
                register_definitions(&engine, dir);
            }
            let tree = load_definition_from_yaml(path_str(&file)?)?;

            let mut waiter = engine.subscribe();
            let workers = engine.start_workers();

            let fields: Map<String, Value> = vars.into_iter().collect();
            let wfid = engine.launch(tree, fields).await?;
            info!("Process launched: {}", wfid);

            let event = waiter.wait_for(&wfid, Duration::from_secs(timeout)).await;
            engine.shutdown();
            for worker in workers {
                let _ = worker.await;
            }

            let event = event?;
            info!(action = ?event.action, "Process {} finished", wfid);
            info!("Participants visited: {:?}", trace.trace());
            if let Some(workitem) = event.workitem {
                println!("{}", serde_json::to_string_pretty(&workitem.fields)?);
            }
        }

        Commands::Worker {
            redis,
            name,
            definitions,
            recover,
        } => {
            info!("[{}] Starting Worker... Redis: {}", name, redis);
            let engine = Arc::new(redis_engine(config, &redis)?);
            engine.register_participant(".+", Arc::new(TraceParticipant::new()))?;

            if let Some(dir) = definitions {
                register_definitions(&engine, &dir);
            }
            if recover {
                let report = engine.recover().await?;
                info!(?report, "[{}] Recovered", name);
            }

            info!("Worker ready.");
            for worker in engine.start_workers() {
                worker.await?;
            }
        }

        Commands::Launch { file, redis, vars } => {
            info!("Launching through Redis: {}", redis);
            let engine = redis_engine(config, &redis)?;

            let tree = load_definition_from_yaml(path_str(&file)?)?;
            let fields: Map<String, Value> = vars.into_iter().collect();
            let wfid = engine.launch(tree, fields).await?;

            info!("Process launched successfully! wfid: {}", wfid);
            println!("{}", wfid);
        }
    }

    Ok(())
}
