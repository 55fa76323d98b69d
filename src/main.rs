use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use parkade::engine::Engine;
use parkade::{observability, reaper, wire};

struct Config {
    bind: String,
    port: u16,
    data_dir: PathBuf,
    max_connections: usize,
    compact_threshold: u64,
    reconcile_interval_secs: u64,
    metrics_port: Option<u16>,
    admin_email: String,
    admin_password: String,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    fn from_env() -> Self {
        Self {
            bind: env_string("PARKADE_BIND", "0.0.0.0"),
            port: env_parse("PARKADE_PORT", 6581),
            data_dir: PathBuf::from(env_string("PARKADE_DATA_DIR", "./data")),
            max_connections: env_parse("PARKADE_MAX_CONNECTIONS", 256),
            compact_threshold: env_parse("PARKADE_COMPACT_THRESHOLD", 10_000),
            reconcile_interval_secs: env_parse("PARKADE_RECONCILE_INTERVAL_SECS", 30),
            metrics_port: std::env::var("PARKADE_METRICS_PORT")
                .ok()
                .and_then(|v| v.parse().ok()),
            admin_email: env_string("PARKADE_ADMIN_EMAIL", "admin@parkade.local"),
            admin_password: env_string("PARKADE_ADMIN_PASSWORD", "admin"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    observability::init(config.metrics_port);

    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = config.data_dir.join("parkade.wal");
    let engine = Arc::new(Engine::new(wal_path.clone())?);
    tracing::info!(wal = %wal_path.display(), lots = engine.lots.len(), "engine recovered");

    if engine
        .ensure_admin(&config.admin_email, &config.admin_password, "Administrator")
        .await?
    {
        tracing::info!(email = %config.admin_email, "created initial admin account");
    }

    tokio::spawn(reaper::run_reconciler(
        engine.clone(),
        config.reconcile_interval_secs,
    ));
    tokio::spawn(reaper::run_compactor(
        engine.clone(),
        config.compact_threshold,
    ));

    let listener = TcpListener::bind((config.bind.as_str(), config.port)).await?;
    tracing::info!(bind = %config.bind, port = config.port, "listening");

    let semaphore = Arc::new(Semaphore::new(config.max_connections));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);

                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                    tracing::warn!(%peer, "connection cap reached, rejecting");
                    continue;
                };

                let engine = engine.clone();
                tokio::spawn(async move {
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                    wire::process_connection(stream, engine).await;
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                    drop(permit);
                });
            }
        }
    }

    tracing::info!("shutting down, draining connections");
    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        let _ = semaphore.acquire_many(config.max_connections as u32).await;
    })
    .await;
    if drained.is_err() {
        tracing::warn!("drain timed out, exiting with connections open");
    }
    Ok(())
}
