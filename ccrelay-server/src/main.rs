//! ccrelay binary entry point: config load, component wiring, leader
//! election, and graceful shutdown (§5), replacing the gateway's
//! monoio-thread-per-core engine with a single multi-threaded `tokio`
//! runtime now that every component (admin API, proxy executor, IPC,
//! WebSocket fan-out) already speaks `tokio`+`reqwest` natively.

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router as AxumRouter;
use ccrelay_concurrency::{ConcurrencyManager, WorkerQueue};
use ccrelay_core::config::RouterConfig;
use ccrelay_ipc::{bind_or_connect, default_socket_path, ElectionState, LeaderElection, LockClient, LockRole};
use ccrelay_observability::MetricsCollector;
use ccrelay_proxy::{PipelineState, ProxyExecutor};
use ccrelay_router::Router;
use ccrelay_store::{open_backend, Logger};
use ccrelay_ws::{ws_handler, Hub};
use clap::Parser;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "ccrelay", version, about = "Local reverse proxy routing chat-completion traffic across providers")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<String>,

    /// Log level used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Path to the persisted provider-selection state file. Defaults to
    /// `<config>.state.json`, or is skipped entirely when no config path
    /// is given.
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Override the configured bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the configured bind port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    ccrelay_observability::init_tracing(&cli.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "ccrelay starting");

    let mut config = RouterConfig::load(cli.config.as_deref())?;
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    let state_file = cli
        .state_file
        .clone()
        .or_else(|| cli.config.as_ref().map(|c| PathBuf::from(format!("{c}.state.json"))));

    let current_provider = ccrelay_admin::persist::load_current_provider(state_file.as_deref())
        .filter(|id| config.providers.contains_key(id))
        .unwrap_or_else(|| config.default_provider.clone());

    let router = Arc::new(Router::new(config.providers.clone(), config.routing.clone(), current_provider));

    let concurrency_cfg = config.concurrency.clone().unwrap_or_default();
    let default_queue = concurrency_cfg
        .enabled
        .then(|| WorkerQueue::new("default", concurrency_cfg.max_workers, concurrency_cfg.max_queue_size, concurrency_cfg.request_timeout));

    let executor = Arc::new(ProxyExecutor::new());
    let metrics = Arc::new(MetricsCollector::new()?);
    let concurrency = Arc::new(ConcurrencyManager::with_metrics(default_queue, &config.route_queues, Some(Arc::clone(&metrics))));

    let logger = if config.logging.enabled {
        let database = config.logging.database.clone().unwrap_or_else(default_log_path);
        match open_backend(&database) {
            Ok(backend) => Logger::start(Some(backend)),
            Err(e) => {
                error!(error = %e, "failed to open log store, logging disabled");
                Logger::start(None)
            }
        }
    } else {
        Logger::start(None)
    };

    let hub = Hub::new(Arc::clone(&router));

    let pipeline_state = PipelineState::new(Arc::clone(&router), Arc::clone(&concurrency), Arc::clone(&executor), logger.clone(), Arc::clone(&metrics));

    let admin_state = Arc::new(ccrelay_admin::AdminState {
        router: Arc::clone(&router),
        concurrency: Arc::clone(&concurrency),
        logger: logger.clone(),
        metrics: Arc::clone(&metrics),
        port: config.port,
        config_path: cli.config.clone(),
        state_file: state_file.clone(),
    });

    let instance_id = uuid::Uuid::new_v4().to_string();
    let pid = std::process::id();
    let start_time = chrono::Utc::now().timestamp_millis();
    let lock_path = default_socket_path();

    let role = bind_or_connect(lock_path.clone(), Duration::from_millis(200)).await?;
    match role {
        LockRole::Server(listener, lock_server) => {
            lock_server.spawn_accept_loop(listener);
            let election = Arc::new(LeaderElection::new(instance_id, pid, config.port, config.host.clone(), start_time, LockClient::new(lock_path)));
            run_as_contender(election, config, router, hub, pipeline_state, admin_state).await?;
        }
        LockRole::Client(lock_client) => {
            let election = Arc::new(LeaderElection::new(instance_id, pid, config.port, config.host.clone(), start_time, lock_client));
            run_as_contender(election, config, router, hub, pipeline_state, admin_state).await?;
        }
    }

    logger.force_flush().await;
    logger.close();
    info!("ccrelay stopped");
    Ok(())
}

fn default_log_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".ccrelay").join("logs.ndjson").to_string_lossy().to_string()
}

/// Drives the election state machine to completion or shutdown (§4.I). On
/// becoming leader, serves the HTTP stack; otherwise runs as a follower,
/// mirroring provider switches into the local `Router` via the WebSocket
/// fan-out until the leader disappears, then retries election.
async fn run_as_contender(
    election: Arc<LeaderElection>,
    config: RouterConfig,
    router: Arc<Router>,
    hub: Arc<Hub>,
    pipeline_state: Arc<PipelineState>,
    admin_state: Arc<ccrelay_admin::AdminState>,
) -> anyhow::Result<()> {
    let mut attempt: u32 = 0;
    loop {
        let now_ms = chrono::Utc::now().timestamp_millis();
        match election.attempt(now_ms).await {
            ElectionState::Leader => {
                attempt = 0;
                serve_as_leader(Arc::clone(&election), config, hub, pipeline_state, admin_state).await?;
                return Ok(());
            }
            ElectionState::Follower => {
                attempt = 0;
                run_as_follower(Arc::clone(&election), Arc::clone(&router)).await;
            }
            _ => {
                let delay = ccrelay_ipc::backoff_sequence(attempt.min(8));
                attempt += 1;
                warn!(?delay, "election attempt inconclusive, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Runs until the leader disappears, this instance wins an election itself,
/// or a shutdown signal arrives, then returns so the outer loop re-attempts
/// election. Mirrors the leader's `provider_changed` broadcasts into the
/// local `Router`. Re-probes on the exponential-backoff schedule from §4.I:
/// every successful probe resets the interval, a failed or inconclusive one
/// grows it.
async fn run_as_follower(election: Arc<LeaderElection>, router: Arc<Router>) {
    info!("running as follower");

    let Some(leader) = election.current_leader().await else {
        return;
    };
    let ws_url = format!("ws://{}:{}/ccrelay/ws", leader.host, leader.port);
    let client = ccrelay_ws::WsClient::new(ws_url);
    let (ws_shutdown_tx, ws_shutdown_rx) = tokio::sync::oneshot::channel();
    let follower_router = Arc::clone(&router);
    let ws_task = tokio::spawn(async move {
        client
            .run(
                move |msg| {
                    if let ccrelay_ws::WsMessage::ProviderChanged { provider_id, .. } = msg {
                        let _ = follower_router.switch_provider(&provider_id);
                    }
                },
                ws_shutdown_rx,
            )
            .await;
    });

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let initial_delay = ccrelay_ipc::backoff_sequence(0);
    let mut probe_delay = initial_delay;
    let mut failed_probes: u32 = 0;
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                let _ = ws_shutdown_tx.send(());
                let _ = ws_task.await;
                election.release().await;
                return;
            }
            _ = tokio::time::sleep(probe_delay) => {
                let now_ms = chrono::Utc::now().timestamp_millis();
                match election.attempt(now_ms).await {
                    ElectionState::Follower => {
                        failed_probes = 0;
                        probe_delay = initial_delay;
                    }
                    ElectionState::Leader => {
                        // The lock was free: we just won the election
                        // ourselves. Hand back to the outer loop to serve.
                        let _ = ws_shutdown_tx.send(());
                        let _ = ws_task.await;
                        return;
                    }
                    _ => {
                        failed_probes += 1;
                        probe_delay = ccrelay_ipc::next_backoff(probe_delay, failed_probes);
                    }
                }
            }
        }
    }
}

async fn serve_as_leader(
    election: Arc<LeaderElection>,
    config: RouterConfig,
    hub: Arc<Hub>,
    pipeline_state: Arc<PipelineState>,
    admin_state: Arc<ccrelay_admin::AdminState>,
) -> anyhow::Result<()> {
    let admin_router = ccrelay_admin::build_router(admin_state);

    let mut app: AxumRouter = AxumRouter::new().route("/ccrelay/ws", get(ws_handler)).with_state(Arc::clone(&hub));
    app = app.nest("/ccrelay/api", admin_router);
    app = app.fallback(move |req: axum::extract::Request| {
        let state = Arc::clone(&pipeline_state);
        async move {
            let (parts, body) = req.into_parts();
            let body_bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();
            let headers: Vec<(String, String)> = parts
                .headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
                .collect();
            ccrelay_proxy::handle_request(state, parts.method, parts.uri.path().to_string(), headers, body_bytes).await
        }
    });
    app = app.layer(ccrelay_admin::cors_layer());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            election.record_bind_failure();
            error!(error = %e, addr = %addr, "failed to bind HTTP listener");
            return Ok(());
        }
    };
    info!(%addr, "listening");
    election.mark_active().await;

    let (heartbeat_shutdown_tx, heartbeat_shutdown_rx) = tokio::sync::oneshot::channel();
    let heartbeat_election = Arc::clone(&election);
    let heartbeat = tokio::spawn(async move {
        ccrelay_ipc::run_heartbeat_loop(heartbeat_election, heartbeat_shutdown_rx, || chrono::Utc::now().timestamp_millis()).await;
    });

    let shutdown = shutdown_signal();
    let serve_result = axum::serve(listener, app.into_make_service()).with_graceful_shutdown(shutdown).await;
    if let Err(e) = serve_result {
        error!(error = %e, "HTTP server exited with an error");
    }

    info!("shutting down: releasing lock and notifying clients");
    let _ = heartbeat_shutdown_tx.send(());
    let _ = heartbeat.await;
    hub.announce_stopping();
    election.release().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

