//! The connection listener and the admin shutdown lifecycle.
//!
//! Accepts TCP connections and spawns one dispatcher per connection,
//! matching `loja-rs`'s `Listener`/`run` shape but driving the per-client
//! cooperative cancellation model instead of a single broadcast shutdown to
//! every connection.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::channel::MessageChannel;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::registry::ClientId;
use crate::state::AppState;

/// Run the dispatch server.
///
/// Accepts connections from `listener` until either the external
/// `shutdown` future resolves (e.g. `tokio::signal::ctrl_c()`) or a
/// connection issues the `SHUTDOWN` admin command, which trips
/// `app.listener_stop` from inside a dispatcher task.
pub async fn run(listener: TcpListener, app: Arc<AppState>, shutdown: impl Future<Output = ()>) {
    let server_addr = listener
        .local_addr()
        .unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());
    let server_pid = std::process::id() as i64;

    tokio::select! {
        res = accept_loop(listener, Arc::clone(&app), server_addr, server_pid) => {
            match res {
                Ok(()) => info!("listener stopped (SHUTDOWN command or empty registry)"),
                Err(err) => error!(cause = %err, "listener stopped accepting connections"),
            }
        }
        _ = shutdown => {
            info!("external shutdown signal received");
            graceful_shutdown(&app, None).await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    app: Arc<AppState>,
    server_addr: std::net::SocketAddr,
    server_pid: i64,
) -> Result<()> {
    info!(%server_addr, "accepting inbound connections");

    loop {
        tokio::select! {
            accepted = accept_with_backoff(&listener) => {
                let socket = accepted?;
                spawn_dispatcher(socket, Arc::clone(&app), server_addr, server_pid);
            }
            _ = app.listener_stop.wait() => {
                return Ok(());
            }
        }
    }
}

fn spawn_dispatcher(socket: TcpStream, app: Arc<AppState>, server_addr: std::net::SocketAddr, server_pid: i64) {
    let channel = MessageChannel::from_tcp(socket);
    let peer_addr = channel
        .peer_addr()
        .unwrap_or_else(|| "0.0.0.0:0".parse().unwrap());

    tokio::spawn(async move {
        let dispatcher = Dispatcher::new(channel, app, peer_addr, server_addr, server_pid);
        if let Err(err) = dispatcher.run().await {
            error!(cause = %err, %peer_addr, "connection ended with an error");
        }
    });
}

/// Exponential backoff accept, mirroring `loja-rs::server::Listener::accept`.
async fn accept_with_backoff(listener: &TcpListener) -> Result<TcpStream> {
    let mut backoff = 1;
    loop {
        match listener.accept().await {
            Ok((socket, _)) => return Ok(socket),
            Err(err) => {
                if backoff > 64 {
                    error!(%err, "failed to accept inbound connection too many times");
                    return Err(err.into());
                }
                warn!(%err, "accept failed, retrying in {backoff}s");
            }
        }
        tokio::time::sleep(Duration::from_secs(backoff)).await;
        backoff *= 2;
    }
}

/// Admin lifecycle: set the stop signal for every live client, reclaim the
/// in-flight resource of every dead one, wait for the live ones to drain,
/// then stop the listener.
///
/// Entered from two places: the first worker to observe the info table
/// emptied by a `FINISH` or by an `RM_CLIENT` removal, and the explicit
/// `SHUTDOWN` command. Safe to call more than once concurrently;
/// [`crate::state::ShutdownLatch`] makes the listener-stop idempotent and
/// repeated reclaim/remove calls on an already-removed id are no-ops.
///
/// `exclude` is the client id of the connection triggering this shutdown,
/// if any (`FINISH`, `RM_CLIENT`, `SHUTDOWN` are all issued over a
/// connection that is itself in the registry). That connection cannot be
/// waited on here: it can only mark its own liveness flag dead after this
/// very call returns and its dispatcher loop exits, so waiting on it would
/// deadlock the caller against itself. Its entries are removed directly
/// instead of waited on.
pub async fn graceful_shutdown(app: &AppState, exclude: Option<ClientId>) {
    let ids = app.registry.control_ids().await;

    for &id in &ids {
        if Some(id) == exclude {
            continue;
        }
        if app.registry.is_alive(id).await {
            app.registry.request_stop(id).await;
        } else if let Some(info) = app.registry.info_snapshot(id).await {
            if let Some(resource) = info.current_resource_id {
                if let Err(err) = app
                    .persistence
                    .update_resource(
                        &resource,
                        crate::persistence::ResourceStatus::available(),
                        None,
                        None,
                        Some(info.name),
                    )
                    .await
                {
                    error!(%err, resource, "failed to reclaim resource during shutdown");
                }
            }
        }
    }

    for &id in &ids {
        if Some(id) == exclude {
            continue;
        }
        app.registry.wait_until_dead(id).await;
        app.registry.remove(id).await;
    }

    if let Some(id) = exclude {
        app.registry.remove(id).await;
    }

    debug!("all clients drained, stopping listener");
    app.listener_stop.trigger();
}
