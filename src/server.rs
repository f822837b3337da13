//! The coordinator server: an acceptor loop spawning one task per client
//! connection, a single arbiter task those connections funnel requests
//! through, and a lifecycle controller driving graceful shutdown.

use crate::arbiter::{self, ArbiterMsg, ConnId};
use crate::wire::{Op, Request, Response};
use crate::{Connection, ConnectionStream, Error, Result, Shutdown};
use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc, oneshot, Semaphore},
};
use tracing::{debug, error, info, warn};

/// Maximum number of concurrent connections the coordinator will accept.
///
/// When this limit is reached, the acceptor stops accepting until an active
/// connection terminates and returns its permit.
const MAX_CONNECTIONS: usize = 4096;

/// Upper bound on how long graceful shutdown is given to finish before the
/// process is terminated forcibly. Configurable; see [`run`].
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Binds `addr`, retrying with the same bounded exponential back-off used
/// for individual `accept` failures: 1s, 2s, 4s, ... doubling, giving up
/// (fatally) after the 6th failed attempt.
pub async fn bind_with_retry(addr: SocketAddr) -> Result<TcpListener> {
    let mut backoff = 1u64;
    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if backoff > 64 {
                    error!(%err, "failed to bind {addr} too many times");
                    return Err(Error::BindFailed(err));
                }
                warn!(%err, "failed to bind {addr}, retrying in {backoff}s");
            }
        }
        tokio::time::sleep(Duration::from_secs(backoff)).await;
        backoff *= 2;
    }
}

struct Listener {
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    next_conn_id: AtomicU64,
    arbiter_tx: mpsc::UnboundedSender<ArbiterMsg>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
}

struct Handler<S> {
    id: ConnId,
    connection: Connection<S>,
    arbiter_tx: mpsc::UnboundedSender<ArbiterMsg>,
    shutdown: Shutdown,
    _shutdown_complete: mpsc::Sender<()>,
}

/// Runs the coordinator. Accepts connections from `listener` and arbitrates
/// their requests until the `shutdown` future completes, at which point
/// every connected client is sent `EXIT` and the process winds down.
///
/// `grace_period` of `None` falls back to [`DEFAULT_GRACE_PERIOD`]; `Some`
/// is honored as given, including `Some(Duration::ZERO)` for operators who
/// want shutdown to force-terminate immediately once clients are notified.
///
/// `tokio::signal::ctrl_c()` (or a combination with SIGTERM, see
/// `src/bin/server.rs`) is the expected `shutdown` argument.
pub async fn run(listener: TcpListener, shutdown: impl Future, grace_period: Option<Duration>) {
    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);
    let (arbiter_tx, arbiter_rx) = mpsc::unbounded_channel();

    let arbiter_task = tokio::spawn(arbiter::run(arbiter_rx));

    let mut server = Listener {
        listener,
        limit_connections: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        next_conn_id: AtomicU64::new(0),
        arbiter_tx: arbiter_tx.clone(),
        notify_shutdown,
        shutdown_complete_tx,
    };

    tokio::select! {
        res = server.run() => {
            if let Err(err) = res {
                error!(cause = %err, "failed to accept");
            }
        }
        _ = shutdown => {
            info!("shutdown signal received, notifying clients");
        }
    }

    let Listener { shutdown_complete_tx, notify_shutdown, .. } = server;

    // Every connection task subscribed to `notify_shutdown`; dropping it
    // delivers the signal to all of them.
    drop(notify_shutdown);
    drop(shutdown_complete_tx);
    // Dropping our own arbiter sender clone; once every connection task's
    // clone is also dropped, the arbiter task's channel closes and it exits.
    drop(arbiter_tx);

    let grace_period = grace_period.unwrap_or(DEFAULT_GRACE_PERIOD);
    match tokio::time::timeout(grace_period, shutdown_complete_rx.recv()).await {
        Ok(_) => info!("all connections drained, shutting down cleanly"),
        Err(_) => {
            error!("graceful shutdown exceeded the grace period, forcing termination");
            std::process::exit(1);
        }
    }

    let _ = arbiter_task.await;
}

impl Listener {
    async fn run(&mut self) -> Result<()> {
        info!("accepting inbound connections");

        loop {
            let permit = self.limit_connections.clone().acquire_owned().await.unwrap();

            let socket = self.accept().await?;
            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);

            let mut handler = Handler {
                id: conn_id,
                connection: Connection::new(socket),
                arbiter_tx: self.arbiter_tx.clone(),
                shutdown: Shutdown::new(self.notify_shutdown.subscribe()),
                _shutdown_complete: self.shutdown_complete_tx.clone(),
            };

            tokio::spawn(async move {
                if let Err(err) = handler.run().await {
                    error!(cause = %err, conn = handler.id, "connection error");
                }

                drop(permit);
            });
        }
    }

    /// Accept an inbound connection, retrying transient failures with the
    /// same bounded back-off used for the initial bind.
    async fn accept(&mut self) -> Result<TcpStream> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => {
                    debug!("successfully accepted inbound connection");
                    return Ok(socket);
                }
                Err(err) => {
                    if backoff > 64 {
                        error!(%err, "failed to accept inbound connection too many times");
                        return Err(err.into());
                    }
                    warn!(%err, "got error accepting inbound connection, trying again in {backoff} seconds");
                }
            }

            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

impl<S: ConnectionStream> Handler<S> {
    #[tracing::instrument(skip_all)]
    async fn run(&mut self) -> Result<()> {
        debug!(conn = self.id, "connection handler started");

        let (outbox_tx, mut inbox) = mpsc::unbounded_channel();
        let _ = self.arbiter_tx.send(ArbiterMsg::Connect { conn: self.id, outbox: outbox_tx });

        let result = self.process(&mut inbox).await;

        let _ = self.arbiter_tx.send(ArbiterMsg::Disconnect { conn: self.id });

        result
    }

    async fn process(&mut self, inbox: &mut mpsc::UnboundedReceiver<Response>) -> Result<()> {
        while !self.shutdown.is_shutdown() {
            tokio::select! {
                maybe_batch = self.connection.read_frames() => {
                    let batch = match maybe_batch? {
                        Some(batch) => batch,
                        None => return Ok(()),
                    };
                    self.handle_batch(batch).await?;
                }
                promoted = inbox.recv() => {
                    if let Some(response) = promoted {
                        self.connection.write_response(response).await?;
                    }
                }
                _ = self.shutdown.recv() => {
                    let _ = self.connection.write_response(Response::Exit).await;
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    /// Applies the ordering rule: every `DONE` in the batch is
    /// delivered to the arbiter before any `READ`/`WRIT`, while the
    /// `READ`/`WRIT` answers are still written back in their original
    /// relative order (removing the interleaved `DONE`s from a sequence
    /// does not reorder what remains).
    async fn handle_batch(&mut self, batch: Vec<Request>) -> Result<()> {
        let (dones, others): (Vec<Request>, Vec<Request>) =
            batch.into_iter().partition(|r| r.op == Op::Done);

        for done in dones {
            let _ = self.arbiter_tx.send(ArbiterMsg::Done { pid: done.pid, target: done.target });
        }

        for other in others {
            let (reply, rx) = oneshot::channel();
            self.arbiter_tx
                .send(ArbiterMsg::Request {
                    pid: other.pid,
                    conn: self.id,
                    target: other.target,
                    op: other.op,
                    reply,
                })
                .map_err(|_| {
                    Error::Protocol("arbiter task is no longer running".into())
                })?;

            let response = rx.await.map_err(|_| {
                Error::Protocol("arbiter task dropped the reply channel".into())
            })?;

            self.connection.write_response(response).await?;
        }

        Ok(())
    }
}
