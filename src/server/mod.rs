/// UNIX-socket server.
///
/// One acceptor task pushes accepted connections into a bounded queue;
/// a fixed pool of workers pulls one connection at a time. A connection
/// carries exactly one JSON request (client shuts down its write side)
/// and receives exactly one JSON response before the server closes it.
///
/// Shutdown is cooperative: the acceptor stops, the queue closes, workers
/// drain what they hold, and whatever is still running after the grace
/// period is aborted. A worker that dies outside shutdown is respawned.
pub mod admin;
pub mod auth;
pub mod dispatcher;
pub mod message;
pub mod secret;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::model::SessionStore;
use crate::state::{Database, Repository};

/// Cap on a single request body.
const MAX_REQUEST_BYTES: u64 = 1024 * 1024;

/// How long workers get to finish in-flight requests during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Shared state for all request handling.
pub struct ServerState {
    pub db: Database,
    pub repo: Repository,
    pub sessions: SessionStore,
}

impl ServerState {
    pub fn new(db: Database, config: &Config) -> Self {
        Self {
            db,
            repo: Repository::new(),
            sessions: SessionStore::new(config.session_idle_timeout, config.session_life_timeout),
        }
    }
}

/// Accept connections until `shutdown` resolves, then drain and stop.
pub async fn serve(
    state: Arc<ServerState>,
    config: &Config,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    // A leftover socket file from an unclean exit would make bind fail.
    if Path::new(&config.socket).exists() {
        std::fs::remove_file(&config.socket)?;
    }
    let listener = UnixListener::bind(&config.socket)?;
    let nworkers = config.nworkers.max(1);
    info!(socket = %config.socket, nworkers, "listening");

    let (queue_tx, queue_rx) = mpsc::channel::<UnixStream>(nworkers * 2);
    let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));

    let mut workers = JoinSet::new();
    for worker_id in 0..nworkers {
        workers.spawn(worker_loop(worker_id, state.clone(), queue_rx.clone()));
    }

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        if queue_tx.send(stream).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
            // A worker finishing here died unexpectedly; replace it.
            finished = workers.join_next(), if !workers.is_empty() => {
                if let Some(Err(e)) = finished {
                    warn!(error = %e, "worker died, respawning");
                    workers.spawn(worker_loop(nworkers, state.clone(), queue_rx.clone()));
                }
            }
            _ = &mut shutdown => {
                info!("shutting down");
                break;
            }
        }
    }

    // Closing the queue lets idle workers exit; busy ones finish their
    // request first.
    drop(queue_tx);
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while workers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("graceful shutdown timed out, aborting workers");
        workers.abort_all();
        while workers.join_next().await.is_some() {}
    }

    let _ = std::fs::remove_file(&config.socket);
    Ok(())
}

async fn worker_loop(
    worker_id: usize,
    state: Arc<ServerState>,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<UnixStream>>>,
) {
    loop {
        // Hold the queue lock only while pulling the next connection.
        let stream = { queue.lock().await.recv().await };
        let Some(stream) = stream else {
            debug!(worker_id, "queue closed, worker exiting");
            return;
        };
        if let Err(e) = handle_connection(&state, stream).await {
            warn!(worker_id, error = %e, "connection failed");
        }
    }
}

/// One request, one response, close.
async fn handle_connection(state: &ServerState, mut stream: UnixStream) -> std::io::Result<()> {
    let mut raw = Vec::new();
    (&mut stream)
        .take(MAX_REQUEST_BYTES + 1)
        .read_to_end(&mut raw)
        .await?;
    if raw.len() as u64 > MAX_REQUEST_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "request too large",
        ));
    }

    let response = dispatcher::handle(state, &raw).await;
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
