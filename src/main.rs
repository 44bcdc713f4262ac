use anyhow::Result;
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use telemetry_sync::{
    ApiClient, Config, LatestStrategy, MemoryCache, SnapshotCache, SnapshotReceiver, SqliteCache,
    StoreSettings, TelemetryStore,
};

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.rust_log));

    if config.json_logs() {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init();
    } else {
        fmt().with_env_filter(filter).with_target(false).init();
    }
}

fn open_cache(config: &Config) -> Box<dyn SnapshotCache> {
    match SqliteCache::open(&config.cache_path) {
        Ok(cache) => Box::new(cache),
        Err(e) => {
            warn!(error = %e, "Snapshot cache unavailable, keeping snapshots in memory");
            Box::new(MemoryCache::new())
        }
    }
}

async fn log_snapshots(mut rx: SnapshotReceiver) {
    while rx.changed().await.is_ok() {
        let snapshot = rx.borrow_and_update().clone();
        if let Some(message) = &snapshot.error {
            warn!(error = %message, "Telemetry unavailable, showing last known data");
        }
        if snapshot.loading {
            continue;
        }
        match &snapshot.latest {
            Some(latest) => info!(
                tag = latest.tag.as_deref().unwrap_or("unknown"),
                temperature = ?latest.temperature,
                humidity = ?latest.humidity,
                light = %latest.light_state,
                at = %latest.display_timestamp,
                history = snapshot.history.len(),
                "Latest reading"
            ),
            None => info!(history = snapshot.history.len(), "No readings yet"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let config = Config::load()?;
    init_tracing(&config);
    info!(
        base_url = %config.api_base_url,
        variant = %config.api_variant,
        "Telemetry sync starting"
    );

    let client = ApiClient::from_config(&config)?;
    let cache = open_cache(&config);
    let settings = StoreSettings::from_config(&config);
    let strategy = settings.latest_strategy;
    let store = TelemetryStore::new(client, cache, settings);

    tokio::spawn(log_snapshots(store.subscribe()));

    if !store.probe_health().await {
        warn!("API health check failed, starting from cached snapshot");
    }
    match store.source().total_records().await {
        Ok(total) => info!(total, "Records on server"),
        Err(e) => warn!(error = %e, "Could not count records"),
    }

    store.start().await;

    let refresh_period = Duration::from_secs(config.refresh_interval_secs.max(1));
    let health_period = Duration::from_secs(config.health_check_interval_secs.max(1));
    let mut refresh_interval = time::interval_at(Instant::now() + refresh_period, refresh_period);
    let mut health_interval = time::interval_at(Instant::now() + health_period, health_period);

    loop {
        tokio::select! {
            _ = refresh_interval.tick() => {
                let filter = store.last_filter();
                let ok = match strategy {
                    LatestStrategy::Derive => store.refresh_history(&filter).await,
                    LatestStrategy::Fetch => {
                        let (latest, history) =
                            tokio::join!(store.refresh_latest(), store.refresh_history(&filter));
                        latest && history
                    }
                };
                if !ok {
                    error!("Periodic refresh failed");
                }
            }
            _ = health_interval.tick() => {
                if !store.probe_health().await {
                    warn!("API unreachable");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}
