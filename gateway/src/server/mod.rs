mod admin;
pub mod bootstrap;
mod state;

pub use state::{Collaborators, GatewayState, Pipeline};

use crate::proxy;
use anyhow::{Context, Result};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

async fn bind(listen: &str, surface: &str) -> Result<TcpListener> {
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("{surface} listen address '{listen}' is not host:port"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {surface} listener on {addr}"))?;
    info!("server: {} listener bound, addr={}", surface, addr);
    Ok(listener)
}

/// HTTP/1.1 and HTTP/2, whichever the client speaks.
fn connection_builder() -> auto::Builder<TokioExecutor> {
    auto::Builder::new(TokioExecutor::new())
}

pub async fn run_proxy_server(
    listen: &str,
    state: GatewayState,
    shutdown: Arc<Notify>,
    drain_timeout: Duration,
) -> Result<()> {
    let listener = bind(listen, "proxy").await?;
    serve_proxy(listener, state, shutdown, drain_timeout).await
}

/// Serve gateway traffic from `listener` until `shutdown` fires.
///
/// Every connection task lives in a `JoinSet`. On shutdown the listener is
/// dropped first, then open connections get `drain_timeout` to finish before
/// the rest are aborted.
pub async fn serve_proxy(
    listener: TcpListener,
    state: GatewayState,
    shutdown: Arc<Notify>,
    drain_timeout: Duration,
) -> Result<()> {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.notified() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    metrics::counter!("gateway_connections_total", "status" => "accepted")
                        .increment(1);
                    connections.spawn(proxy_connection(stream, peer, state.clone()));
                }
                Err(e) => {
                    metrics::counter!("gateway_connections_total", "status" => "error")
                        .increment(1);
                    warn!("server: accept failed, error={}", e);
                }
            },

            // Reap finished tasks so the set tracks only live connections.
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    drain(connections, drain_timeout).await;
    Ok(())
}

async fn drain(mut connections: JoinSet<()>, limit: Duration) {
    if connections.is_empty() {
        info!("server: shutdown with no open connections");
        return;
    }
    info!(
        "server: draining, open_connections={}, limit_secs={}",
        connections.len(),
        limit.as_secs_f64()
    );

    let finished = async {
        while connections.join_next().await.is_some() {}
    };
    if tokio::time::timeout(limit, finished).await.is_ok() {
        info!("server: drain complete");
        return;
    }

    warn!(
        "server: drain limit reached, aborting open_connections={}",
        connections.len()
    );
    connections.shutdown().await;
}

/// Keeps `gateway_connections_active` in step with live connection tasks,
/// including tasks aborted at the end of a drain.
struct OpenConnection;

impl OpenConnection {
    fn track() -> Self {
        metrics::gauge!("gateway_connections_active").increment(1.0);
        OpenConnection
    }
}

impl Drop for OpenConnection {
    fn drop(&mut self) {
        metrics::gauge!("gateway_connections_active").decrement(1.0);
    }
}

async fn proxy_connection(stream: TcpStream, peer: SocketAddr, state: GatewayState) {
    let _open = OpenConnection::track();
    let svc = service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        async move { proxy::handle_request(req, state, peer).await }
    });

    // Resets and half-closed sockets are routine for client traffic.
    if let Err(e) = connection_builder()
        .serve_connection(TokioIo::new(stream), svc)
        .await
    {
        debug!("server: connection ended, peer={}, error={}", peer, e);
    }
}

/// Admin API on its own listener. Connections are not drained; the process
/// exits once the proxy has drained.
pub async fn run_admin_server(listen: &str, state: GatewayState) -> Result<()> {
    let listener = bind(listen, "admin").await?;

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                warn!("server: admin accept failed, error={}", e);
                continue;
            }
        };
        let state = state.clone();

        tokio::spawn(async move {
            let svc = service_fn(move |req: Request<Incoming>| {
                admin::handle_admin(req, state.clone())
            });
            if let Err(e) = connection_builder()
                .serve_connection(TokioIo::new(stream), svc)
                .await
            {
                debug!("server: admin connection ended, peer={}, error={}", peer, e);
            }
        });
    }
}
