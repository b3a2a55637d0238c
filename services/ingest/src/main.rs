// wx-ingest: subscribes to the station's broker feed and maintains the
// deduplicated weather history.
//
// Runtime: wires together the local state database, the weather store, the
// sibling fan-out, the poller lease, the coordinator, the broker transport and
// the status HTTP server.

use clap::{Arg, Command};
use ingest::config::{DEFAULT_CONFIG_PATH, IngestConfig};
use ingest::coordinator::{CoordinatorConfig, IngestionCoordinator};
use ingest::fanout::{NoopChannel, SiblingChannel, TcpFanout};
use ingest::lease::SqliteLease;
use ingest::local_db::LocalDb;
use ingest::pipeline::IngestPipeline;
use ingest::reading_dedup::{ReadingDeduplicator, SqliteDedupJournal};
use ingest::status_http::{AppState, build_router};
use ingest::status_log::{DEFAULT_MAX_BANNERS, StatusLog};
use ingest::store::{SqliteStore, StoreAdapter};
use ingest::transport::{MqttConnector, TransportClient, TransportHandler};
use ingest::window::WindowState;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

fn fatal(msg: impl std::fmt::Display) -> ! {
    eprintln!("FATAL: {}", msg);
    std::process::exit(1);
}

fn fanout_channel(cfg: &IngestConfig, shutdown: &CancellationToken) -> Arc<dyn SiblingChannel> {
    if cfg.fanout.enabled {
        info!(addr = %cfg.fanout.bind, "sibling fan-out enabled");
        Arc::new(TcpFanout::start(cfg.fanout.bind, shutdown.clone()))
    } else {
        info!("sibling fan-out disabled; dedup is per-process");
        Arc::new(NoopChannel::new())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "wx-ingest starting");

    let matches = Command::new("wx-ingest")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Weather station telemetry ingestion")
        .arg(
            Arg::new("config")
                .help("Path to the TOML config file")
                .short('c')
                .long("config")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .get_matches();
    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let cfg = match ingest::config::load_config_from_path(&config_path) {
        Ok(cfg) => {
            info!(
                endpoint = %cfg.broker.endpoint,
                topic = %cfg.broker.topic,
                station = %cfg.station.id,
                "config loaded"
            );
            cfg
        }
        Err(e) => fatal(format!("failed to load config: {}", e)),
    };

    // Per-host state
    let local = match LocalDb::open(&cfg.store.local_path) {
        Ok(db) => {
            info!(path = %cfg.store.local_path.display(), "local state opened");
            db
        }
        Err(e) => fatal(format!("failed to open local state database: {}", e)),
    };
    let client_id = match local.load_or_create_client_id() {
        Ok(id) => id,
        Err(e) => fatal(format!("failed to load client id: {}", e)),
    };
    let local = Arc::new(Mutex::new(local));
    let instance_id = uuid::Uuid::new_v4().to_string();
    info!(client_id = %client_id, instance_id = %instance_id, "identity ready");

    // Weather store
    let store = match SqliteStore::open(&cfg.store.sqlite_path) {
        Ok(s) => {
            info!(path = %cfg.store.sqlite_path.display(), "weather store opened");
            s
        }
        Err(e) => fatal(format!("failed to open weather store: {}", e)),
    };
    if let Err(e) = store.upsert_station(&cfg.station).await {
        fatal(format!("failed to register station '{}': {}", cfg.station.id, e));
    }
    let store: Arc<dyn StoreAdapter> = Arc::new(store);

    let shutdown = CancellationToken::new();

    let (ui_tx, _) = broadcast::channel(256);
    let status = StatusLog::new(ui_tx, DEFAULT_MAX_BANNERS);

    let siblings = fanout_channel(&cfg, &shutdown);
    let dedup = Arc::new(ReadingDeduplicator::new(
        cfg.ingest.dedup_capacity,
        Arc::new(SqliteDedupJournal::new(Arc::clone(&local))),
        siblings,
        instance_id.clone(),
    ));
    let window = Arc::new(WindowState::new(cfg.ingest.retention()));
    let lease = Arc::new(SqliteLease::new(Arc::clone(&local)));

    let coordinator = Arc::new(IngestionCoordinator::new(
        CoordinatorConfig {
            station_id: cfg.station.id.clone(),
            instance_id,
            poll_interval: cfg.ingest.poll_interval,
            lease_check_interval: cfg.ingest.lease_check_interval,
            pending_capacity: cfg.ingest.pending_capacity,
        },
        Arc::clone(&store),
        dedup,
        window,
        lease,
        status.clone(),
    ));

    match coordinator.bootstrap().await {
        Ok(report) => info!(
            journal_keys = report.journal_keys,
            window = report.window_loaded,
            "bootstrap complete"
        ),
        Err(e) => {
            // Live ingestion still works; the next poll fills the window.
            warn!(error = %e, "bootstrap failed");
            status.warn(format!("Could not load history: {e}"));
        }
    }

    let poller = tokio::spawn(Arc::clone(&coordinator).run_poller(shutdown.clone()));
    let listener = tokio::spawn(Arc::clone(&coordinator).run_sibling_listener(shutdown.clone()));

    let pipeline = IngestPipeline::new(Arc::clone(&coordinator), cfg.ingest.message_dedup_capacity);
    let handler: Arc<dyn TransportHandler> = Arc::new(pipeline);
    let transport = Arc::new(TransportClient::new(
        Arc::new(MqttConnector::new()),
        cfg.ingest.timings(),
    ));
    let broker = cfg.broker.transport_config(client_id);
    transport.connect(broker.clone(), Arc::clone(&handler)).await;

    // Status HTTP server
    let app_state = AppState::new(Arc::clone(&coordinator), Arc::clone(&transport), broker, handler);
    let listener_http = match tokio::net::TcpListener::bind(&cfg.status_http.bind).await {
        Ok(l) => l,
        Err(e) => fatal(format!(
            "failed to bind status HTTP on {}: {}",
            cfg.status_http.bind, e
        )),
    };
    info!(bind = %cfg.status_http.bind, "status HTTP server started");
    let http_shutdown = shutdown.clone();
    let http = tokio::spawn(async move {
        let server = axum::serve(listener_http, build_router(app_state))
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await });
        if let Err(e) = server.await {
            error!(error = %e, "status HTTP server failed");
        }
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(e) => error!(error = %e, "failed to listen for ctrl-c; shutting down"),
    }
    shutdown.cancel();
    transport.disconnect().await;
    for (name, task) in [("poller", poller), ("sibling listener", listener), ("status http", http)] {
        if let Err(e) = task.await {
            warn!(task = name, error = %e, "task ended abnormally");
        }
    }
    info!("wx-ingest stopped");
}
