use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::server::{self, GatewayState};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config: GatewayConfig,
    pub config_path: PathBuf,
    /// Overrides `server.listen` when set.
    pub listen: Option<String>,
    /// Overrides `server.admin_listen` when set.
    pub admin_listen: Option<String>,
}

/// Gateway lifecycle: build, serve, reload on SIGHUP, drain on SIGINT/SIGTERM.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    let mut config = args.config;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(admin_listen) = args.admin_listen {
        config.server.admin_listen = admin_listen;
    }
    let listen = config.server.listen.clone();
    let admin_listen = config.server.admin_listen.clone();
    let drain_timeout = Duration::from_secs(config.server.drain_timeout_secs);

    let metrics = Metrics::install()?;
    let state = GatewayState::new(config, metrics)?.with_config_path(args.config_path);
    tracing::info!("server: pipeline ready, routes={}", state.route_count());

    let shutdown = Arc::new(Notify::new());
    start_reload_listener(&state);
    start_admin_server(&state, admin_listen);

    tracing::info!("server: starting gateway, listen={}", listen);

    let proxy_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, state, shutdown, drain_timeout).await }
    });

    wait_for_shutdown(&shutdown).await;

    match proxy_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("server: proxy exited with error: {:#}", e),
        Err(e) => tracing::error!("server: proxy task error: {}", e),
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

pub fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

fn start_admin_server(state: &GatewayState, listen: String) {
    let state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&listen, state).await {
            tracing::error!("server: admin exited with error: {:#}", e);
        }
    });
}

#[cfg(unix)]
fn start_reload_listener(state: &GatewayState) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("config: SIGHUP handler unavailable, error={}", e);
            return;
        }
    };
    let state = state.clone();
    tokio::spawn(async move {
        while hup.recv().await.is_some() {
            tracing::info!("config: SIGHUP received, reloading");
            // Failures are logged and counted inside `reload`.
            let _ = state.reload().await;
        }
    });
}

#[cfg(not(unix))]
fn start_reload_listener(_state: &GatewayState) {}

/// Block until SIGINT or SIGTERM, then notify the proxy to start draining.
async fn wait_for_shutdown(shutdown: &Notify) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("server: failed to listen for ctrl-c, error={}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("server: failed to install SIGTERM handler, error={}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    // Stores a permit if the accept loop is not parked in `notified()`.
    shutdown.notify_one();
}
