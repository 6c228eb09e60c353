//! mcbridge - Memcached Sidecar Proxy
//!
//! This is the main entry point for the mcbridge application.

use anyhow::{Context, Result};
use clap::Parser;
use mcbridge::config::{self, Config};
use mcbridge::elasticache;
use mcbridge::error::ConfigError;
use mcbridge::handlers::{ConfigHandler, PoolDisconnect, ProxyHandler};
use mcbridge::listener::Listener;
use mcbridge::metrics::{StatsdClient, StatsdMonitor};
use mcbridge::pool::{Monitor, Server};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// mcbridge - sidecar proxy for ElastiCache-style memcached clusters
#[derive(Parser, Debug)]
#[command(name = "mcbridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// ElastiCache config endpoint to discover the cluster from
    upstream_config_host: Option<String>,

    /// Path to a TOML configuration file; when given it supplies the full
    /// configuration and the flags below are ignored
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// One of: tcp, tcp4, tcp6, unix or unixpacket
    #[arg(long, default_value = "unix")]
    network: String,

    /// Address to listen on for elasticache-like config server responses
    #[arg(long = "local-config", default_value = ":11210")]
    local_config: String,

    /// Prefix to use for unix socket filenames
    #[arg(long, default_value = "/var/tmp/mcbridge-")]
    local_socket_prefix: String,

    /// Suffix to use for unix socket filenames
    #[arg(long, default_value = ".sock")]
    local_socket_suffix: String,

    /// Port number to start from for local proxies
    #[arg(long, default_value_t = 11220)]
    local_port_start: u16,

    /// Unlink existing unix sockets before listening
    #[arg(long)]
    unlink: bool,

    /// Min connection pool size
    #[arg(long, default_value_t = 0)]
    min_pool_size: u64,

    /// Max connection pool size
    #[arg(long, default_value_t = 10)]
    max_pool_size: u64,

    /// Read timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    read_timeout_ms: u64,

    /// Write timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    write_timeout_ms: u64,

    /// Statsd address
    #[arg(long, default_value = "localhost:8125")]
    statsd: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Pretty print logging instead of JSON
    #[arg(long)]
    pretty: bool,
}

fn main() {
    let args = Args::parse();

    let (config, level) = match build_config(&args) {
        Ok(built) => built,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = setup_logging(level, args.pretty) {
        eprintln!("Failed to initialize logger: {}", e);
        std::process::exit(1);
    }

    info!("mcbridge v{}", mcbridge::VERSION);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            panic!("failed to start runtime: {}", e);
        }
    };

    if let Err(e) = runtime.block_on(run(config)) {
        error!(error = %format!("{:#}", e), "fatal error");
        panic!("{:#}", e);
    }
}

fn build_config(args: &Args) -> Result<(Config, Level), ConfigError> {
    let level = parse_level(&args.log_level)?;

    let config = if let Some(path) = &args.config {
        config::load_config(path)?
    } else {
        let upstream = args
            .upstream_config_host
            .clone()
            .ok_or(ConfigError::MissingUpstream)?;

        let mut config = Config::new(upstream);
        config.local_config_host = args.local_config.clone();
        config.network = args.network.clone();
        config.local_socket_prefix = args.local_socket_prefix.clone();
        config.local_socket_suffix = args.local_socket_suffix.clone();
        config.local_port_start = args.local_port_start;
        config.unlink = args.unlink;
        config.read_timeout_ms = args.read_timeout_ms;
        config.write_timeout_ms = args.write_timeout_ms;
        config.statsd_address = args.statsd.clone();
        config.pool.min_size = args.min_pool_size;
        config.pool.max_size = args.max_pool_size;
        config.validate()?;
        config
    };

    Ok((config, level))
}

fn parse_level(level: &str) -> Result<Level, ConfigError> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(ConfigError::InvalidLogLevel(other.to_string())),
    }
}

fn setup_logging(level: Level, pretty: bool) -> Result<()> {
    if pretty {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let statsd = Arc::new(
        StatsdClient::new(&config.statsd_address, "mcbridge", vec![])
            .with_context(|| format!("failed to set up statsd at {}", config.statsd_address))?,
    );

    let nodes = elasticache::cluster_nodes(&config.upstream_config_host).await?;
    info!(servers = ?nodes, "config read");

    let listeners = create_listeners(&config, statsd, &nodes)?;

    let mut serving = JoinSet::new();
    for listener in &listeners {
        serving.spawn(listener.clone().run());
    }

    spawn_signal_handler(listeners);

    info!("running");
    while let Some(finished) = serving.join_next().await {
        match finished {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %format!("{:#}", e), "listener error"),
            Err(e) => error!(error = %e, "listener task failed"),
        }
    }

    Ok(())
}

fn create_listeners(
    config: &Config,
    statsd: Arc<StatsdClient>,
    upstreams: &[String],
) -> Result<Vec<Arc<Listener>>> {
    let mut manifest_entries = Vec::new();
    let mut listeners = Vec::new();

    for (index, upstream) in upstreams.iter().enumerate() {
        let local = if config.is_unix() {
            let path = format!(
                "{}{}{}",
                config.local_socket_prefix, index, config.local_socket_suffix
            );
            manifest_entries.push(format!("{}||", path));
            path
        } else {
            let port = config.local_port_start as u32 + index as u32;
            manifest_entries.push(format!("localhost|127.0.0.1|{}", port));
            format!(":{}", port)
        };

        let tagged = Arc::new(
            statsd
                .with_tags(vec![
                    format!("upstream:{}", upstream),
                    format!("local:{}", local),
                ])
                .context("failed to derive statsd client")?,
        );

        let monitor: Arc<dyn Monitor> = Arc::new(StatsdMonitor::new(tagged.clone()));
        let server = Server::connect(upstream, config.pool.clone(), Some(monitor))
            .with_context(|| format!("failed to set up pool for {}", upstream))?;

        let handler = ProxyHandler::new(
            tagged.clone(),
            server.clone(),
            &local,
            config.read_timeout(),
            config.write_timeout(),
        );
        let shutdown = PoolDisconnect::new(server, DISCONNECT_TIMEOUT);

        listeners.push(Listener::new(
            &config.network,
            &local,
            config.unlink,
            tagged,
            handler,
            Some(shutdown),
        ));
    }

    let manifest = manifest_entries.join(" ");
    info!(manifest = %manifest, "advertising cluster manifest");
    listeners.push(Listener::new(
        "tcp4",
        &config.local_config_host,
        config.unlink,
        statsd,
        ConfigHandler::new(manifest),
        None,
    ));

    Ok(listeners)
}

fn spawn_signal_handler(listeners: Vec<Arc<Listener>>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut interrupt =
                signal(SignalKind::interrupt()).expect("Failed to setup SIGINT handler");
            let mut terminate =
                signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");

            let mut shutdown_attempted = false;
            loop {
                let was_interrupt = tokio::select! {
                    _ = interrupt.recv() => true,
                    _ = terminate.recv() => false,
                };

                if !shutdown_attempted {
                    info!("shutting down");
                    for listener in &listeners {
                        listener.shutdown();
                    }
                    shutdown_attempted = true;

                    if was_interrupt {
                        println!("Ctrl-C again to kill incoming connections");
                    }
                } else if was_interrupt {
                    warn!("terminating");
                    for listener in &listeners {
                        listener.kill();
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            for listener in &listeners {
                listener.shutdown();
            }
        }
    });
}
