use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};
use tracing_subscriber::EnvFilter;

use tds_registry::bootstrap::Bootstrapper;
use tds_registry::config::{Config, StoreConfig};
use tds_registry::events::{EventBus, TdsEvent, PERSISTENCE_STARTED, PERSISTENCE_STOPPED};
use tds_registry::store::{ProjectStore, SqliteProjectStore};
use tds_registry::AccessorRegistry;

/// TDS agent - keeps per-project SCM, bug tracker and mail accessors pooled
#[derive(Parser, Debug)]
#[command(name = "tds-agent", version, about)]
struct Args {
    /// Path to TOML configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Project store URL, overrides [store].url
    #[arg(short, long)]
    database: Option<String>,

    /// Populate, run one self-test and exit
    #[arg(long)]
    check: bool,
}

async fn open_store(config: &Config) -> Option<Arc<dyn ProjectStore>> {
    let Some(store) = &config.store else {
        warn!("no project store configured");
        return None;
    };
    match SqliteProjectStore::connect(&store.url, store.max_connections).await {
        Ok(s) => Some(Arc::new(s)),
        Err(e) => {
            error!(url = %store.url, error = %e, "project store unreachable, continuing without it");
            None
        }
    }
}

fn report_health(registry: &AccessorRegistry) {
    let status = match registry.self_test() {
        Ok(()) => "ok".to_string(),
        Err(d) => d.to_string(),
    };
    let snapshot = registry.metrics();
    match serde_json::to_string(&snapshot) {
        Ok(metrics) => info!(
            self_test = %status,
            hit_rate = snapshot.hit_rate(),
            metrics = %metrics,
            "health report"
        ),
        Err(e) => warn!(error = %e, "failed to serialize metrics"),
    }
}

async fn next_tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(url) = args.database {
        let max_connections = config.store.as_ref().map_or(4, |s| s.max_connections);
        config.store = Some(StoreConfig {
            url,
            max_connections,
        });
        config.validate()?;
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    info!(
        store = config.store.as_ref().map(|s| s.url.as_str()).unwrap_or("none"),
        "TDS agent starting"
    );

    let registry = Arc::new(
        AccessorRegistry::new(info_span!("tds_registry"))
            .with_max_accessors(config.registry.max_accessors),
    );
    let bus = EventBus::new(config.events.capacity);
    debug!(capacity = bus.capacity(), "event bus ready");
    let shutdown = CancellationToken::new();

    let store = open_store(&config).await;
    let store_ready = store.is_some();
    let bootstrapper = Arc::new(Bootstrapper::new(
        Arc::clone(&registry),
        store,
        config.bootstrap_options(),
    ));
    let listener = Arc::clone(&bootstrapper).spawn_listener(&bus, shutdown.clone());

    bus.publish_lossy(
        TdsEvent::new(PERSISTENCE_STARTED).with_property("store_ready", store_ready.to_string()),
    );

    tokio::select! {
        _ = registry.wait_populated() => {
            info!(projects = registry.len(), "accessor pool ready");
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown requested before population finished");
            shutdown.cancel();
            listener.await?;
            return Ok(());
        }
    }

    if args.check {
        let result = registry.self_test();
        shutdown.cancel();
        listener.await?;
        return match result {
            Ok(()) => {
                info!(projects = ?registry.project_ids(), "self-test passed");
                Ok(())
            }
            Err(d) => Err(d.into()),
        };
    }

    let mut health = config.self_test_interval().map(tokio::time::interval);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            _ = next_tick(&mut health) => report_health(&registry),
        }
    }

    bus.publish_lossy(TdsEvent::new(PERSISTENCE_STOPPED));
    shutdown.cancel();
    listener.await?;
    info!("TDS agent stopped");
    Ok(())
}
