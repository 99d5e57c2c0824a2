use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use clap::Parser;
use serde_json::{Map, Value};
use tabsync_core::TabId;
use tabsync_tab::{
    BroadcastTransport, CommitOutcome, CoordinatorConfig, CoordinatorHandle, FileFlagStore,
    JsonStateStore, NoopTransport, TabCoordinator, WsTransport, load_config_from_path,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::MakeWriter;

#[derive(Parser, Debug)]
#[command(name = "tabsync-tab")]
struct TabArgs {
    #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
    hub_url: String,
    #[arg(long, default_value = "default")]
    origin: String,
    /// Directory shared by every tab of the origin for the election flags.
    #[arg(long)]
    store_dir: Option<PathBuf>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    single_active_tab: bool,
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Clone)]
struct FileMakeWriter {
    file: Arc<Mutex<File>>,
}

struct FileWriterGuard {
    file: Arc<Mutex<File>>,
}

impl Write for FileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.flush()
    }
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriterGuard {
            file: Arc::clone(&self.file),
        }
    }
}

fn init_logging(log_file: Option<&Path>) {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();

    let Some(log_path) = log_file else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        return;
    };
    let file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", log_path.display());
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
            return;
        }
    };

    let make_writer = FileMakeWriter {
        file: Arc::new(Mutex::new(file)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(make_writer)
        .init();
}

fn default_store_dir(origin: &str) -> PathBuf {
    let safe: String = origin
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    std::env::temp_dir().join("tabsync").join(safe)
}

#[tokio::main]
async fn main() {
    let args = TabArgs::parse();
    init_logging(args.log_file.as_deref());

    let mut config = match &args.config {
        Some(path) => match load_config_from_path(path) {
            Ok(config) => config,
            Err(err) => {
                error!("failed to load config {}: {}", path.display(), err);
                std::process::exit(1);
            }
        },
        None => CoordinatorConfig::default(),
    };
    config.single_active_tab |= args.single_active_tab;

    let store_dir = args
        .store_dir
        .clone()
        .unwrap_or_else(|| default_store_dir(&args.origin));
    let flags = match FileFlagStore::open(&store_dir) {
        Ok(flags) => flags,
        Err(err) => {
            error!("failed to open flag store {}: {}", store_dir.display(), err);
            std::process::exit(1);
        }
    };

    let tab_id = TabId::generate();
    let transport: Arc<dyn BroadcastTransport> =
        match WsTransport::connect(&args.hub_url, &args.origin, &tab_id).await {
            Ok(transport) => Arc::new(transport),
            Err(err) => {
                warn!("{err}; continuing as a single tab");
                Arc::new(NoopTransport)
            }
        };

    let state = JsonStateStore::new();
    let handle = match TabCoordinator::new(config, transport, Arc::new(flags))
        .with_tab_id(tab_id)
        .with_state_store(state.clone())
        .spawn()
    {
        Ok(handle) => handle,
        Err(err) => {
            error!("failed to start coordinator: {}", err);
            std::process::exit(1);
        }
    };

    info!(tab_id = %handle.tab_id(), origin = %args.origin, "tab started");
    let role_listener = handle.on_role_change(|from, to| {
        println!("role: {from} -> {to}");
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !run_command(line.trim(), &handle, &state).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!("stdin read failed: {}", err);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    role_listener.abort();
    handle.shutdown().await;
}

async fn run_command(line: &str, handle: &CoordinatorHandle, state: &JsonStateStore) -> bool {
    let mut parts = line.splitn(3, ' ');
    match parts.next().unwrap_or_default() {
        "" => {}
        "focus" | "blur" => {
            if let Err(err) = handle.set_window_active(line == "focus") {
                println!("error: {err}");
            }
        }
        "set" => {
            let (Some(key), Some(raw)) = (parts.next(), parts.next()) else {
                println!("usage: set <key> <json>");
                return true;
            };
            let value: Value = match serde_json::from_str(raw) {
                Ok(value) => value,
                Err(err) => {
                    println!("invalid json: {err}");
                    return true;
                }
            };
            let mut patch = Map::new();
            patch.insert(key.to_owned(), value);
            match handle.commit(Value::Object(patch)).await {
                Ok(CommitOutcome::Applied { version }) => println!("applied at version {version}"),
                Ok(CommitOutcome::Forwarded) => println!("forwarded to master"),
                Err(err) => println!("error: {err}"),
            }
        }
        "status" => {
            let status = handle.status();
            let master = status
                .master
                .as_ref()
                .map_or_else(|| "-".to_owned(), ToString::to_string);
            println!(
                "role={} phase={:?} term={} master={} version={:?} peers={} multi_tab={}",
                status.role,
                status.phase,
                status.term,
                master,
                status.version,
                status.peers.len(),
                handle.is_multi_tab_capable()
            );
            println!("state={}", state.current().state);
        }
        "quit" | "exit" => return false,
        other => println!("unknown command {other:?}; try focus, blur, set, status, quit"),
    }
    true
}
