use std::{
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use core_model::{MessageKind, MessageStore};
use events::{Delivery, RecvError};
use ingest::{Engine, EngineConfig};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sms_import::ImportPhase;
use store_sqlite::{NewMessage, SqliteStore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod ui;

#[derive(Parser)]
#[command(name = "smsguard")]
#[command(about = "Inbound SMS/MMS ingestion with phishing-risk thread views")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Store file; overrides --tenant and the config file.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Selects <data_dir>/smsguard/<tenant>.db
    #[arg(long, global = true)]
    tenant: Option<String>,
    /// Risk threshold for thread flags.
    #[arg(long, global = true)]
    threshold: Option<f64>,
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    Init,
    /// Load a JSONL export (file or directory) into the store.
    Import {
        path: PathBuf,
    },
    /// Persist a message the way the platform SMS app would.
    Deliver(DeliverArgs),
    Messages {
        #[arg(long)]
        thread: Option<String>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    Threads {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    Thread {
        key: String,
    },
    MarkRead {
        id: String,
    },
    Delete {
        id: String,
    },
    /// Read JSON commands from stdin and stream engine events to stdout.
    Watch,
    Doctor,
}

#[derive(Args)]
struct DeliverArgs {
    #[arg(long)]
    sender: String,
    #[arg(long)]
    body: String,
    /// Milliseconds since the epoch; defaults to now.
    #[arg(long)]
    timestamp: Option<i64>,
    #[arg(long, value_enum, default_value_t = KindOpt::Sms)]
    kind: KindOpt,
    #[arg(long, default_value_t = false)]
    read: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindOpt {
    Sms,
    Mms,
}

impl From<KindOpt> for MessageKind {
    fn from(kind: KindOpt) -> Self {
        match kind {
            KindOpt::Sms => MessageKind::Sms,
            KindOpt::Mms => MessageKind::Mms,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let config = config::Config::load()?;
    let engine_config = config.engine_config()?;
    let threshold = cli.threshold.unwrap_or(config.risk.threshold);
    if !(0.0..=1.0).contains(&threshold) {
        anyhow::bail!("--threshold must be within [0.0, 1.0]");
    }
    let db_path = resolve_db_path(&cli, &config);
    let t = Instant::now();

    match cli.command {
        Commands::Init => {
            SqliteStore::create(&db_path)?;
            info!(path = %db_path.display(), elapsed = ?t.elapsed(), "initialized");
        }
        Commands::Import { path } => {
            let mut store = open_store(&db_path)?;
            let report = import_with_timing(&path, &mut store)?;
            info!(
                files = report.files,
                parsed = report.parsed,
                skipped = report.skipped,
                inserted = report.inserted,
                elapsed = ?t.elapsed(),
                "imported"
            );
            println!("inserted={} skipped={}", report.inserted, report.skipped);
        }
        Commands::Deliver(args) => {
            let store = open_store(&db_path)?;
            let message = store.insert(&NewMessage {
                sender: Some(args.sender),
                body: Some(args.body),
                timestamp: args
                    .timestamp
                    .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
                kind: args.kind.into(),
                is_read: args.read,
            })?;
            println!("{}", serde_json::to_string(&message)?);
        }
        Commands::Messages { thread, json } => {
            let engine = open_engine(&db_path, engine_config)?;
            let messages = match thread {
                Some(key) => engine.load_thread(&key)?,
                None => engine.load_all()?,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&messages)?);
            } else {
                ui::print_messages(&messages);
            }
        }
        Commands::Threads { json } => {
            let engine = open_engine(&db_path, engine_config)?;
            engine.load_all()?;
            let threads = engine.threads(threshold);
            if json {
                println!("{}", serde_json::to_string_pretty(&threads)?);
            } else {
                ui::print_thread_list(&threads);
            }
            info!(threads = threads.len(), elapsed = ?t.elapsed(), "listed threads");
        }
        Commands::Thread { key } => {
            let engine = open_engine(&db_path, engine_config)?;
            engine.load_all()?;
            let Some(summary) = engine.thread(&key, threshold) else {
                anyhow::bail!("thread {key} not found");
            };
            ui::print_thread_list(std::slice::from_ref(&summary));
            ui::print_messages(&engine.load_thread(&key)?);
        }
        Commands::MarkRead { id } => {
            let engine = open_engine(&db_path, engine_config)?;
            engine.load_all()?;
            let found = engine.mark_read(&id)?;
            println!("found={found}");
        }
        Commands::Delete { id } => {
            let engine = open_engine(&db_path, engine_config)?;
            engine.load_all()?;
            let found = engine.delete(&id)?;
            println!("found={found}");
        }
        Commands::Watch => {
            let interval = config.refresh_interval()?;
            let engine = Arc::new(open_engine(&db_path, engine_config)?);
            watch(engine, interval, threshold)?;
            info!(elapsed = ?t.elapsed(), "watch ended");
        }
        Commands::Doctor => {
            info!("running integrity check");
            let store = open_store(&db_path)?;
            let check = store.integrity_check()?;
            let count = store.message_count()?;
            let threads = store.load_all().map(|all| threads_in(&all))?;
            info!(elapsed = ?t.elapsed(), "integrity check done");
            println!("db={}", db_path.display());
            println!("config={}", config::Config::path().display());
            println!("integrity_check={check}");
            println!("messages={count}");
            println!("threads={threads}");
        }
    }

    Ok(())
}

fn resolve_db_path(cli: &Cli, config: &config::Config) -> PathBuf {
    if let Some(db) = &cli.db {
        return db.clone();
    }
    if let Some(tenant) = &cli.tenant {
        return SqliteStore::default_path(tenant);
    }
    config
        .db_path
        .clone()
        .unwrap_or_else(|| SqliteStore::default_path("default"))
}

fn open_store(path: &Path) -> anyhow::Result<SqliteStore> {
    info!(path = %path.display(), "opening database");
    SqliteStore::open_existing(path).with_context(|| "run `smsguard init` first?")
}

fn open_engine(path: &Path, config: EngineConfig) -> anyhow::Result<Engine<SqliteStore>> {
    Ok(Engine::new(open_store(path)?, config))
}

fn threads_in(messages: &[core_model::Message]) -> usize {
    let mut keys: Vec<&str> = messages.iter().map(|m| m.thread_key.as_str()).collect();
    keys.sort_unstable();
    keys.dedup();
    keys.len()
}

fn import_with_timing(
    path: &Path,
    store: &mut SqliteStore,
) -> anyhow::Result<sms_import::ImportReport> {
    let started = Instant::now();
    sms_import::import_path(path, store, |phase| match phase {
        ImportPhase::Discovering => {
            info!(path = %path.display(), elapsed = ?started.elapsed(), "discovering export files");
        }
        ImportPhase::Parsing { file_count } => {
            info!(file_count, elapsed = ?started.elapsed(), "parsing files");
        }
        ImportPhase::Saving { row_count } => {
            info!(row_count, elapsed = ?started.elapsed(), "saving rows");
        }
        ImportPhase::Done { inserted } => {
            info!(inserted, elapsed = ?started.elapsed(), "import done");
        }
    })
}

#[derive(Deserialize)]
struct AnnotateCommand {
    id: String,
    score: f64,
    #[serde(default)]
    reason: String,
}

#[derive(Deserialize)]
struct IdCommand {
    id: String,
}

#[derive(Deserialize)]
struct ThreadsCommand {
    threshold: Option<f64>,
}

fn emit(value: &impl Serialize) {
    let line = match serde_json::to_string(value) {
        Ok(line) => line,
        Err(err) => {
            warn!(error = %err, "could not encode output line");
            return;
        }
    };
    let mut out = io::stdout().lock();
    if let Err(err) = writeln!(out, "{line}").and_then(|_| out.flush()) {
        warn!(error = %err, "stdout write failed");
    }
}

fn handle_command(
    engine: &Engine<SqliteStore>,
    line: &str,
    threshold: f64,
) -> anyhow::Result<Value> {
    let value: Value = serde_json::from_str(line).context("command is not JSON")?;
    let op = value
        .get("op")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let reply = match op.as_str() {
        "push" => {
            let message = engine.handle_push_value(&value);
            json!({ "reply": op, "id": message.id })
        }
        "annotate" => {
            let cmd: AnnotateCommand = serde_json::from_value(value)?;
            let found = engine.annotate(&cmd.id, cmd.score, cmd.reason)?;
            json!({ "reply": op, "id": cmd.id, "found": found })
        }
        "mark_read" => {
            let cmd: IdCommand = serde_json::from_value(value)?;
            let found = engine.mark_read(&cmd.id)?;
            json!({ "reply": op, "id": cmd.id, "found": found })
        }
        "delete" => {
            let cmd: IdCommand = serde_json::from_value(value)?;
            let found = engine.delete(&cmd.id)?;
            json!({ "reply": op, "id": cmd.id, "found": found })
        }
        "threads" => {
            let cmd: ThreadsCommand = serde_json::from_value(value)?;
            let threads = engine.threads(cmd.threshold.unwrap_or(threshold));
            json!({ "reply": op, "threads": threads })
        }
        "flagged" => {
            let cmd: ThreadsCommand = serde_json::from_value(value)?;
            let messages = engine.flagged(cmd.threshold.unwrap_or(threshold));
            json!({ "reply": op, "messages": messages })
        }
        "scoring_inputs" => {
            json!({ "reply": op, "messages": engine.scoring_inputs() })
        }
        "refresh" => {
            let report = engine.refresh()?;
            json!({ "reply": op, "report": report })
        }
        other => anyhow::bail!("unknown op {other:?}"),
    };
    Ok(reply)
}

fn watch(
    engine: Arc<Engine<SqliteStore>>,
    interval: Duration,
    threshold: f64,
) -> anyhow::Result<()> {
    let subscription = engine.subscribe();
    // Nothing can be shown without the store; fail before reading commands.
    let report = engine.refresh()?;
    info!(loaded = report.loaded, "watching");

    let stop = Arc::new(AtomicBool::new(false));
    let printer = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            loop {
                match subscription.recv_timeout(Duration::from_millis(200)) {
                    Ok(Delivery::Event(event)) => emit(&event),
                    Ok(Delivery::Lagged(missed)) => {
                        emit(&json!({ "event": "lagged", "missed": missed }))
                    }
                    Err(RecvError::Timeout) if stop.load(Ordering::SeqCst) => break,
                    Err(RecvError::Timeout) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let refresher = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            while let Err(mpsc::RecvTimeoutError::Timeout) = stop_rx.recv_timeout(interval) {
                if let Err(err) = engine.refresh() {
                    warn!(error = %err, "background refresh failed");
                }
            }
        })
    };

    for line in io::stdin().lock().lines() {
        let line = line.context("reading stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        match handle_command(&engine, &line, threshold) {
            Ok(reply) => emit(&reply),
            Err(err) => {
                warn!(error = %err, "command failed");
                emit(&json!({ "reply": "error", "message": format!("{err:#}") }));
            }
        }
    }

    drop(stop_tx);
    stop.store(true, Ordering::SeqCst);
    if refresher.join().is_err() {
        warn!("refresh thread panicked");
    }
    if printer.join().is_err() {
        warn!("event printer panicked");
    }
    Ok(())
}
