//! Process glue for the peer-to-peer IPC / bus bridge service: CLI parsing,
//! configuration loading, logging setup, and wiring the long-polling
//! transport, bus bridge, and web selector together behind one HTTP server.

#[macro_use]
extern crate tracing;

mod config;
mod log;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Request, State};
use axum::http::header::HOST;
use axum::response::Response;
use axum::Router;
use camino::Utf8PathBuf;
use clap::Parser;
use tower::ServiceExt as _;

use bus_bridge::BusBridge;
use config::ConfHandle;
use ipc_task::ShutdownHandle;
use lp_transport::LongPollingTransport;
use peer_transport::{PeerExpiryTask, TransportConfig};
use web_router::{HostPattern, WebSelector};

/// Peer-to-peer IPC service: long-polling transport + bus bridge gateway.
#[derive(Parser, Debug)]
#[command(name = "ipc-gateway")]
struct Cli {
    /// Path to the JSON configuration file; created with defaults if absent.
    #[arg(long, default_value = "ipc-gateway.json")]
    config_path: Utf8PathBuf,

    /// Overrides the configured listen address.
    #[arg(long)]
    listen_addr: Option<SocketAddr>,

    /// Overrides the configured log filter directives.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let conf_handle = ConfHandle::init(&cli).context("unable to initialize configuration")?;
    let conf = conf_handle.get_conf();

    let _logger_guard = ipc_log::init::<log::LogConfig>(
        &conf.log_file,
        conf.verbosity_profile.to_log_filter(),
        conf.debug.log_directives.as_deref(),
    )
    .context("unable to initialize logging")?;

    info!(listen_addr = %conf.listen_addr, "Starting ipc-gateway");

    let bridge = BusBridge::new(conf.call_timeout);

    let transport_config = TransportConfig {
        idle_timeout: conf.idle_timeout,
        heartbeat_interval: conf.heartbeat_interval,
        ..TransportConfig::default()
    };
    let lp_transport = LongPollingTransport::new(transport_config, conf.park_timeout, Arc::clone(&bridge));
    bridge.attach(Arc::clone(lp_transport.peer_registry()));

    // `nest` strips the matched prefix before the long-polling router ever
    // sees the request, so the selector's own prefix can stay "/": per-host
    // dispatch is `WebSelector`'s job, the path rewrite is axum's.
    let lp_router = Router::new().nest(&format!("{}/lp", conf.transport_base_path), Arc::clone(&lp_transport).router());
    let mut selector = WebSelector::new(not_found_router());
    selector.register(HostPattern::Any, "/", lp_router);
    let selector = Arc::new(selector);

    let app = Router::new().fallback(dispatch).with_state(selector);

    let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();
    let expiry_task = ipc_task::spawn_task(PeerExpiryTask::new(Arc::clone(lp_transport.peer_registry())), shutdown_signal);

    let listener = tokio::net::TcpListener::bind(conf.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", conf.listen_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_on_ctrl_c())
        .await
        .context("server error")?;

    shutdown_handle.signal();
    let _ = expiry_task.join().await;

    info!("ipc-gateway stopped");
    Ok(())
}

async fn shutdown_on_ctrl_c() {
    let _ = tokio::signal::ctrl_c().await;
    debug!("Received Ctrl-C, shutting down");
}

fn not_found_router() -> Router {
    Router::new().fallback(|| async { axum::http::StatusCode::NOT_FOUND })
}

async fn dispatch(State(selector): State<Arc<WebSelector<Router>>>, request: Request) -> Response {
    let host = request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    let path = request.uri().path().to_owned();

    let router = selector.lookup(&host, &path).clone();
    match router.oneshot(request).await {
        Ok(response) => response,
        Err(infallible) => match infallible {},
    }
}
