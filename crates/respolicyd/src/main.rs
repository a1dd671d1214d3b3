//! respolicyd, the node-local resource policy daemon.
//!
//! Startup order: logger, CLI, topology discovery (fatal on error), config
//! load, cache restore, engine wiring, worker threads, pipeline loop. The
//! pipeline worker is the only thread touching cache and policy; the
//! threadpool runs the config watcher, the metrics poller and the optional
//! test-API socket.

use std::io::{BufRead, BufReader};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use clap::Parser;
use log::{error, info, warn};
use sugars::{rc, refcell};
use threadpool::ThreadPool;

use respolicy_core::{EventSender, Id, Pipeline, Shutdown};
use respolicy_engine::controllers::HostPaths;
use respolicy_engine::core::config::DaemonConfig;
use respolicy_engine::core::errors::ConfigError;
use respolicy_engine::core::events::config::ConfigUpdated;
use respolicy_engine::core::events::policy::ExportMetrics;
use respolicy_engine::engine::Engine;
use respolicy_engine::runtime::{LogSink, RuntimeRequest};
use respolicy_topology::SysFs;

const CONFIG_POLL_PERIOD: Duration = Duration::from_secs(5);
const METRICS_PERIOD: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[clap(name = "respolicyd", about = "Node-local resource policy daemon")]
struct Args {
    /// Path prefix under which the host's /sys and /sys/fs/cgroup live.
    #[clap(long, default_value = "/")]
    host_root: PathBuf,

    /// Use exactly this config file and ignore the config directory.
    #[clap(long)]
    force_config: Option<PathBuf>,

    /// Directory of config files, merged in lexical order and watched for
    /// changes.
    #[clap(long, default_value = "/etc/respolicyd/config.d")]
    config_dir: PathBuf,

    /// Location of the persisted cache blob.
    #[clap(long, default_value = "/var/lib/respolicyd/cache")]
    cache_file: PathBuf,

    /// Write the daemon pid here.
    #[clap(long)]
    pid_file: Option<PathBuf>,

    /// Serve newline-delimited JSON lifecycle requests on a unix socket.
    /// Testing only.
    #[clap(long)]
    enable_test_apis: bool,

    /// Unix socket path for the test APIs.
    #[clap(long, default_value = "/run/respolicyd/test.sock")]
    test_api_socket: PathBuf,
}

fn init_logger() {
    use env_logger::Builder;
    use std::io::Write;
    Builder::from_default_env()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .init();
}

// The config's logLevel caps verbosity below whatever RUST_LOG allows.
fn apply_log_level(config: &DaemonConfig) {
    let level = match config.log_level.as_deref() {
        Some("error") => log::LevelFilter::Error,
        Some("warn") => log::LevelFilter::Warn,
        Some("info") => log::LevelFilter::Info,
        Some("debug") => log::LevelFilter::Debug,
        Some("trace") => log::LevelFilter::Trace,
        Some(other) => {
            warn!("unknown logLevel {:?}, leaving verbosity unchanged", other);
            return;
        }
        None => return,
    };
    log::set_max_level(level);
}

fn load_config(force_config: &Option<PathBuf>, config_dir: &Path) -> Result<DaemonConfig, ConfigError> {
    match force_config {
        Some(path) => DaemonConfig::from_file(path),
        None if config_dir.is_dir() => DaemonConfig::from_dir(config_dir),
        None => Ok(DaemonConfig::default_config()),
    }
}

// Watches config mtimes and pushes reloads into the pipeline. A config
// that fails to load is reported and the previous one stays active.
fn watch_config(config_dir: PathBuf, force_config: Option<PathBuf>, sender: EventSender, engine: Id) {
    let mut last_seen = newest_mtime(&force_config, &config_dir);
    loop {
        std::thread::sleep(CONFIG_POLL_PERIOD);
        let newest = newest_mtime(&force_config, &config_dir);
        if newest == last_seen {
            continue;
        }
        last_seen = newest;
        match load_config(&force_config, &config_dir) {
            Ok(config) => {
                info!("configuration changed, reloading");
                sender.emit(ConfigUpdated { config }, engine);
            }
            Err(e) => error!("ignoring config change: {}", e),
        }
    }
}

fn newest_mtime(force_config: &Option<PathBuf>, config_dir: &Path) -> Option<SystemTime> {
    match force_config {
        Some(path) => std::fs::metadata(path).and_then(|m| m.modified()).ok(),
        None => std::fs::read_dir(config_dir)
            .ok()?
            .flatten()
            .filter_map(|entry| entry.metadata().ok()?.modified().ok())
            .max(),
    }
}

// Accepts newline-delimited JSON RuntimeRequests; the line "shutdown"
// stops the daemon.
fn serve_test_api(socket: PathBuf, sender: EventSender, engine: Id) {
    if let Some(parent) = socket.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = std::fs::remove_file(&socket);
    let listener = match UnixListener::bind(&socket) {
        Ok(listener) => listener,
        Err(e) => {
            error!("test API socket {:?} failed: {}", socket, e);
            return;
        }
    };
    info!("test APIs listening on {:?}", socket);
    for stream in listener.incoming().flatten() {
        let reader = BufReader::new(stream);
        for line in reader.lines().flatten() {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            if line == "shutdown" {
                sender.emit(Shutdown {}, engine);
                return;
            }
            match serde_json::from_str::<RuntimeRequest>(&line) {
                Ok(request) => request.dispatch(&sender, engine, None),
                Err(e) => error!("malformed test request: {}", e),
            }
        }
    }
}

fn run() -> i32 {
    init_logger();
    let args = Args::parse();

    if let Some(pid_file) = &args.pid_file {
        if let Err(e) = std::fs::write(pid_file, format!("{}\n", std::process::id())) {
            warn!("cannot write pid file {:?}: {}", pid_file, e);
        }
    }

    let system = match SysFs::new(args.host_root.join("sys")).discover() {
        Ok(system) => system,
        Err(e) => {
            error!("topology discovery failed: {}", e);
            return 2;
        }
    };
    info!(
        "discovered {} cpus across {} memory nodes",
        system.cpu_ids().len(),
        system.node_ids().len()
    );

    let config = match load_config(&args.force_config, &args.config_dir) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration failed: {}", e);
            return 1;
        }
    };
    apply_log_level(&config);

    let mut pipeline = Pipeline::new();
    let ctx = pipeline.create_context("engine");
    let sink = rc!(refcell!(LogSink::new()));
    let engine = match Engine::new(
        system,
        config,
        HostPaths::new(&args.host_root),
        sink,
        Some(args.cache_file.clone()),
        ctx,
    ) {
        Ok(engine) => rc!(refcell!(engine)),
        Err(e) => {
            error!("engine startup failed: {}", e);
            return 1;
        }
    };
    let engine_id = pipeline.add_handler("engine", engine);

    let workers = ThreadPool::new(3);
    {
        let sender = pipeline.sender("config-watcher");
        let config_dir = args.config_dir.clone();
        let force_config = args.force_config.clone();
        workers.execute(move || watch_config(config_dir, force_config, sender, engine_id));
    }
    {
        let sender = pipeline.sender("metrics-poller");
        workers.execute(move || loop {
            std::thread::sleep(METRICS_PERIOD);
            sender.emit(ExportMetrics {}, engine_id);
        });
    }
    if args.enable_test_apis {
        let sender = pipeline.sender("test-api");
        let socket = args.test_api_socket.clone();
        workers.execute(move || serve_test_api(socket, sender, engine_id));
    }

    info!("entering the pipeline loop");
    pipeline.run();
    info!("shutting down");

    if let Some(pid_file) = &args.pid_file {
        let _ = std::fs::remove_file(pid_file);
    }
    0
}

fn main() {
    std::process::exit(run());
}
