mod aof;
mod commands;
mod config;
mod expire;
mod resp;
mod server;
mod store;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = config::Config::from_env();

    let metrics_addr: SocketAddr = config
        .metrics_listen_addr()
        .parse()
        .expect("invalid metrics listen address");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("failed to install Prometheus exporter");

    metrics::describe_gauge!("respd_keys_total", "Number of live keys in the store");
    metrics::describe_histogram!(
        "respd_command_duration_seconds",
        "Command processing latency in seconds"
    );
    metrics::describe_counter!(
        "respd_expired_keys_total",
        "Keys removed by the active expiration sweeper"
    );
    metrics::describe_counter!(
        "respd_aof_appends_total",
        "Frames appended to the append-only log"
    );
    metrics::describe_counter!(
        "respd_aof_dropped_total",
        "Frames dropped because the append-only log queue was full"
    );

    let store = store::new_store();

    // Rebuild state from the log and reopen it for appending, all before
    // the listener exists.
    let aof = match &config.aof_path {
        None => {
            info!("append-only log disabled");
            None
        }
        Some(path) => {
            let path = PathBuf::from(path);
            match aof::replay(&path, &store).await {
                Ok(0) => info!(path = %path.display(), "no commands to replay"),
                Ok(n) => info!(path = %path.display(), commands = n, "replayed append-only log"),
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "replay failed, continuing with recovered state")
                }
            }
            match aof::Aof::open(&path, config.aof_blocking) {
                Ok(aof) => Some(aof),
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "could not open append-only log, running without persistence");
                    None
                }
            }
        }
    };
    let aof_sender = aof.as_ref().map(|a| a.sender());

    let sweeper = expire::Sweeper::start(Arc::clone(&store));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await.expect("failed to bind");
    info!(addr = %addr, "respd listening");

    let conn_permits = Arc::new(Semaphore::new(config.max_connections));
    let limits = config.resp_limits();

    #[cfg(unix)]
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    loop {
        #[cfg(unix)]
        let stop = tokio::select! {
            result = listener.accept() => {
                accept(result, &store, &aof_sender, limits, &conn_permits);
                false
            }
            _ = signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                true
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                true
            }
        };

        #[cfg(not(unix))]
        let stop = tokio::select! {
            result = listener.accept() => {
                accept(result, &store, &aof_sender, limits, &conn_permits);
                false
            }
            _ = signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                true
            }
        };

        if stop {
            break;
        }
    }

    // Stop accepting first; in-flight handlers finish their command and
    // enqueue to the log before it drains.
    drop(listener);
    sweeper.stop().await;
    if let Some(aof) = aof {
        aof.stop().await;
    }
    info!("server stopped");
}

fn accept(
    result: std::io::Result<(tokio::net::TcpStream, SocketAddr)>,
    store: &store::Store,
    aof_sender: &Option<aof::AofSender>,
    limits: resp::RespLimits,
    conn_permits: &Arc<Semaphore>,
) {
    match result {
        Ok((stream, peer)) => {
            let Ok(permit) = Arc::clone(conn_permits).try_acquire_owned() else {
                warn!(%peer, "connection limit reached, refusing");
                return;
            };
            debug!(%peer, "accepted connection");
            tokio::spawn(server::handle_connection(
                stream,
                Arc::clone(store),
                aof_sender.clone(),
                limits,
                permit,
            ));
        }
        Err(e) => error!(?e, "accept error"),
    }
}
