//! NanoMQ broker binary
//!
//! `nanomq start` runs a broker instance (refusing to start when the PID
//! file names a live process), `nanomq stop` signals it with SIGTERM, and
//! `nanomq restart` escalates to SIGKILL when SIGTERM does not take
//! effect. Configuration precedence: CLI flags > environment > config
//! files > built-in defaults.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::FmtSubscriber;

use nanomq::auth::StaticAuth;
use nanomq::broker::{Broker, BrokerConfig};
use nanomq::config::{parse_auth_file, BridgeSettings, Settings};

/// The only persisted state: the decimal ASCII pid of the running instance
const PID_FILE: &str = "/tmp/nanomq/nanomq.pid";

#[derive(Parser)]
#[command(name = "nanomq", version)]
#[command(about = "Lightweight MQTT broker for edge and IoT deployments")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new broker instance
    Start(StartArgs),
    /// Stop the running instance
    Stop,
    /// Restart: stop the running instance, then start a new one
    Restart(StartArgs),
}

#[derive(Args, Clone)]
struct StartArgs {
    /// Listener url, e.g. broker+tcp://0.0.0.0:1883
    #[arg(long)]
    url: Option<String>,

    /// Broker configuration file
    #[arg(long, value_name = "path")]
    conf: Option<PathBuf>,

    /// Bridge configuration file
    #[arg(long, value_name = "path")]
    bridge: Option<PathBuf>,

    /// Authorization configuration file
    #[arg(long, value_name = "path")]
    auth: Option<PathBuf>,

    /// Run as daemon (delegated to the service manager)
    #[arg(short = 'd', long)]
    daemon: bool,

    /// Number of taskq threads
    #[arg(short = 't', long = "tq_thread", value_parser = clap::value_parser!(u16).range(1..=255))]
    tq_thread: Option<u16>,

    /// Maximum number of taskq threads
    #[arg(short = 'T', long = "max_tq_thread", value_parser = clap::value_parser!(u16).range(1..=255))]
    max_tq_thread: Option<u16>,

    /// Maximum number of outstanding work items
    #[arg(short = 'n', long)]
    parallel: Option<usize>,

    /// Maximum size of an MQTT user property
    #[arg(short = 's', long = "property_size")]
    property_size: Option<usize>,

    /// Queue length for resending messages
    #[arg(short = 'S', long = "msq_len")]
    msq_len: Option<usize>,

    /// Interval of the qos timer, in seconds
    #[arg(short = 'D', long = "qos_duration")]
    qos_duration: Option<u64>,

    /// Enable the http admin endpoint
    #[arg(long)]
    http: bool,

    /// Port of the http admin endpoint
    #[arg(short = 'p', long)]
    port: Option<u16>,
}

fn main() -> ExitCode {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .compact()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let cli = Cli::parse();
    match cli.command {
        Command::Start(args) => cmd_start(args),
        Command::Stop => cmd_stop(),
        Command::Restart(args) => cmd_restart(args),
    }
}

fn cmd_start(args: StartArgs) -> ExitCode {
    if let Some(pid) = read_live_pid() {
        eprintln!(
            "One NanoMQ instance is already running (pid {}); stop it before starting a new one.",
            pid
        );
        return ExitCode::FAILURE;
    }

    let settings = match build_settings(&args) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let broker_config = match BrokerConfig::from_settings(&settings) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let bridge_settings = {
        let path = args
            .bridge
            .clone()
            .or_else(|| std::env::var("NANOMQ_BRIDGE_CONF_PATH").ok().map(PathBuf::from));
        match path {
            Some(path) => match BridgeSettings::load(&path) {
                Ok(settings) => Some(settings),
                Err(e) => {
                    eprintln!("bridge configuration error ({}): {}", path.display(), e);
                    return ExitCode::FAILURE;
                }
            },
            None => None,
        }
    };

    let authenticator = {
        let path = args
            .auth
            .clone()
            .or_else(|| std::env::var("NANOMQ_AUTH_CONF_PATH").ok().map(PathBuf::from));
        match path {
            Some(path) => match parse_auth_file(&path) {
                Ok(users) => Arc::new(StaticAuth::new(settings.allow_anonymous, users)),
                Err(e) => {
                    eprintln!("auth configuration error ({}): {}", path.display(), e);
                    return ExitCode::FAILURE;
                }
            },
            None => Arc::new(StaticAuth::new(settings.allow_anonymous, [])),
        }
    };

    if settings.daemon {
        warn!("daemon mode requested; process supervision is left to the service manager");
    }
    if settings.http_server.enable {
        info!(
            "http admin endpoint configured on port {} (served by the admin component)",
            settings.http_server.port
        );
    }

    if let Err(e) = write_pid_file() {
        eprintln!("cannot write pid file {}: {}", PID_FILE, e);
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(settings.taskq_threads())
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("cannot start runtime: {}", e);
            remove_pid_file();
            return ExitCode::FAILURE;
        }
    };

    info!("starting NanoMQ broker on {}", settings.url);
    info!("  taskq threads: {}", settings.taskq_threads());
    info!("  parallel: {}", settings.parallel);
    info!("  msq_len: {}", settings.msq_len);
    info!("  qos_duration: {}s", settings.qos_duration);
    if settings.websocket.enable {
        info!("  websocket: {}", settings.websocket.url);
    }

    let result = runtime.block_on(async move {
        let broker = Broker::with_authenticator(broker_config, authenticator);

        if let Some(bridge_settings) = bridge_settings {
            info!("  bridge: {} (parallel {})", bridge_settings.address, bridge_settings.parallel);
            broker.attach_bridge(bridge_settings);
        }

        tokio::select! {
            result = broker.run() => result,
            _ = shutdown_signal() => {
                info!("shutdown signal received");
                broker.shutdown();
                Ok(())
            }
        }
    });

    remove_pid_file();

    match result {
        Ok(()) => {
            info!("NanoMQ stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("fatal: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn cmd_stop() -> ExitCode {
    match read_live_pid() {
        Some(pid) => {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            eprintln!("NanoMQ stopped.");
            ExitCode::SUCCESS
        }
        None => {
            eprintln!("There is no running NanoMQ instance.");
            ExitCode::FAILURE
        }
    }
}

fn cmd_restart(args: StartArgs) -> ExitCode {
    if let Some(pid) = read_live_pid() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        // escalate when SIGTERM does not take effect
        for _ in 0..50 {
            if read_live_pid().is_none() {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        if read_live_pid().is_some() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
            while read_live_pid().is_some() {
                std::thread::sleep(Duration::from_millis(50));
            }
        }
        eprintln!("Previous NanoMQ instance stopped.");
    } else {
        eprintln!("There is no running NanoMQ instance.");
    }

    cmd_start(args)
}

/// Settings assembled in precedence order
fn build_settings(args: &StartArgs) -> Result<Settings, nanomq::config::ConfigError> {
    let mut settings = Settings::default();

    let conf_path = args
        .conf
        .clone()
        .or_else(|| std::env::var("NANOMQ_CONF_PATH").ok().map(PathBuf::from));
    if let Some(path) = conf_path {
        settings.apply_file(&path)?;
    }

    settings.apply_env()?;

    if let Some(ref url) = args.url {
        settings.url = url.clone();
    }
    if args.daemon {
        settings.daemon = true;
    }
    if let Some(n) = args.tq_thread {
        settings.num_taskq_thread = n;
    }
    if let Some(n) = args.max_tq_thread {
        settings.max_taskq_thread = n;
    }
    if let Some(n) = args.parallel {
        settings.parallel = n;
    }
    if let Some(n) = args.property_size {
        settings.property_size = n;
    }
    if let Some(n) = args.msq_len {
        settings.msq_len = n;
    }
    if let Some(n) = args.qos_duration {
        settings.qos_duration = n;
    }
    if args.http {
        settings.http_server.enable = true;
    }
    if let Some(port) = args.port {
        settings.http_server.port = port;
    }

    settings.validate()?;
    Ok(settings)
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// The pid named by the file, when that process is alive. A stale file is
/// removed on the way through.
fn read_live_pid() -> Option<u32> {
    let content = std::fs::read_to_string(PID_FILE).ok()?;
    let pid: u32 = content.trim().parse().ok()?;
    let alive = unsafe { libc::kill(pid as libc::pid_t, 0) } == 0;
    if alive {
        Some(pid)
    } else {
        let _ = std::fs::remove_file(PID_FILE);
        None
    }
}

fn write_pid_file() -> std::io::Result<()> {
    if let Some(dir) = Path::new(PID_FILE).parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(PID_FILE, std::process::id().to_string())
}

fn remove_pid_file() {
    let _ = std::fs::remove_file(PID_FILE);
}
