use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context as _, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use hookcatch::{
    config::{Config, ConfigOverrides},
    health::{self, HealthSettings},
    logging,
    rate_limit::{ClientRateLimiter, RateLimitSettings, spawn_sweeper},
    server,
    storage::{Backend, IndexOutcome, MemoryBackend, RedisBackend, Store},
};

#[derive(Debug, Parser)]
#[command(name = "hookcatch", version, about = "Inbound HTTP capture service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the capture server.
    Serve {
        #[command(flatten)]
        common: CommonArgs,
        /// Listen address.
        #[arg(long, env = "ADDR")]
        addr: Option<String>,
        /// Listen port (0 picks an ephemeral port).
        #[arg(long, env = "PORT")]
        port: Option<u16>,
        /// Storage backend; `memory` keeps captures in-process and loses them on exit.
        #[arg(long, value_enum, default_value_t = BackendKind::Redis)]
        backend: BackendKind,
    },
    /// Print a stored record as JSON.
    Show {
        #[command(flatten)]
        common: CommonArgs,
        /// Record key (capture time in Unix milliseconds).
        key: String,
    },
}

#[derive(Debug, Clone, Args)]
struct CommonArgs {
    /// Optional path to config TOML.
    #[arg(long, env = "HOOKCATCH_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long = "redis-addr", env = "REDIS_ADDR")]
    redis_addr: Option<String>,
    #[arg(long = "redis-port", env = "REDIS_PORT")]
    redis_port: Option<u16>,
    #[arg(long = "redis-password", env = "REDIS_PASSWORD", hide_env_values = true)]
    redis_password: Option<String>,
    #[arg(long = "redis-db", env = "REDIS_DB")]
    redis_db: Option<i64>,
    /// Log level (trace, debug, info, warn, error, off).
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    Redis,
    Memory,
}

impl CommonArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            backend_host: self.redis_addr.clone(),
            backend_port: self.redis_port,
            backend_password: self.redis_password.clone(),
            backend_db: self.redis_db,
            log_level: self.log_level.clone(),
            ..ConfigOverrides::default()
        }
    }
}

fn load_config(common: &CommonArgs, overrides: ConfigOverrides) -> anyhow::Result<Config> {
    let mut config = Config::load(common.config.as_deref())?;
    config.apply_overrides(&overrides)?;
    Ok(config)
}

/// Connects and pings; any failure here is fatal at startup.
async fn connect_store(config: &Config, kind: BackendKind) -> anyhow::Result<Store> {
    let backend_config = &config.backend;
    let backend: Arc<dyn Backend> = match kind {
        BackendKind::Redis => {
            let connect_timeout = backend_config.operation_timeout();
            let redis = tokio::time::timeout(connect_timeout, RedisBackend::connect(backend_config))
                .await
                .map_err(|_| {
                    anyhow::anyhow!(
                        "connect to redis at {}:{} timed out after {connect_timeout:?}",
                        backend_config.host,
                        backend_config.port
                    )
                })?
                .with_context(|| {
                    format!(
                        "connect to redis at {}:{}",
                        backend_config.host, backend_config.port
                    )
                })?;
            Arc::new(redis)
        }
        BackendKind::Memory => {
            tracing::warn!("using in-memory backend; captured requests are lost on exit");
            Arc::new(MemoryBackend::new())
        }
    };

    let store = Store::new(backend).with_operation_timeout(backend_config.operation_timeout());
    store.ping().await.context("ping backend")?;
    Ok(store)
}

async fn run_serve(
    common: CommonArgs,
    addr: Option<String>,
    port: Option<u16>,
    backend: BackendKind,
) -> anyhow::Result<()> {
    let config = load_config(
        &common,
        ConfigOverrides {
            addr,
            port,
            ..common.overrides()
        },
    )?;
    logging::init(&config.logging)?;

    let store = connect_store(&config, backend).await?;
    match store.ensure_index().await.context("create search index")? {
        IndexOutcome::Created => tracing::info!("search index created"),
        IndexOutcome::AlreadyExists => tracing::debug!("search index already exists"),
    }

    let limiter = Arc::new(ClientRateLimiter::new(RateLimitSettings::from_config(
        &config.rate_limit,
    )));
    let sweeper = spawn_sweeper(
        Arc::clone(&limiter),
        Duration::from_secs(config.rate_limit.sweep_interval_secs),
    );
    let (monitor, transitions) =
        health::spawn_monitor(store.clone(), HealthSettings::from_config(&config.health));
    let transition_logger = health::spawn_transition_logger(transitions);

    let server = match server::serve(&config.server, limiter, store).await {
        Ok(server) => server,
        Err(err) => {
            monitor.shutdown().await;
            sweeper.shutdown().await;
            return Err(err);
        }
    };
    tracing::info!("{}", startup_summary(&config, server.listen_addr, backend));

    shutdown_signal().await;
    tracing::info!("shutdown signal received");
    server.shutdown().await;
    monitor.shutdown().await;
    let _ = transition_logger.await;
    sweeper.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn run_show(common: CommonArgs, key: String) -> anyhow::Result<()> {
    let config = load_config(&common, common.overrides())?;
    let store = connect_store(&config, BackendKind::Redis).await?;
    match store.read(&key).await {
        Ok(record) => {
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Err(err) if err.is_not_found() => bail!("record `{key}` not found"),
        Err(err) => Err(err).with_context(|| format!("read record `{key}`")),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn startup_summary(config: &Config, listen_addr: SocketAddr, backend: BackendKind) -> String {
    let backend_summary = match backend {
        BackendKind::Redis => format!(
            "redis://{}:{}/{} (password={})",
            config.backend.host,
            config.backend.port,
            config.backend.db,
            if config.backend.password.is_some() {
                "[REDACTED]"
            } else {
                "none"
            }
        ),
        BackendKind::Memory => "memory".to_owned(),
    };

    format!(
        "startup config: listen={listen_addr}, backend={backend_summary}, rate_limit={}/s burst {}, health_interval={}s",
        config.rate_limit.requests_per_second,
        config.rate_limit.burst,
        config.health.interval_secs,
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Serve {
            common,
            addr,
            port,
            backend,
        } => run_serve(common, addr, port, backend).await,
        Command::Show { common, key } => run_show(common, key).await,
    };
    if let Err(err) = &result {
        tracing::error!("{err:#}");
    }
    result
}
