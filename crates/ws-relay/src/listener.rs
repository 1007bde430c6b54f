use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::connection::{Connection, ConnectionTable, Outbound};
use crate::liveness::{LivenessMonitor, DEFAULT_PING_INTERVAL};
use crate::registry::Registry;
use crate::router::{Flow, Router};

/// Port used when none is configured.
pub const DEFAULT_PORT: u16 = 8080;

/// Frames a single peer may have queued before forwards to it fail.
pub const DEFAULT_SEND_QUEUE: usize = 256;

/// How long a closing connection may take to flush its queued frames.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Configuration for the relay server.
#[derive(Clone)]
pub struct RelayConfig {
    /// Address to bind the listening socket to. Port 0 picks a free port.
    pub listen_addr: SocketAddr,
    /// Time between liveness sweeps.
    pub ping_interval: Duration,
    /// Per-connection outbound queue length.
    pub send_queue: usize,
    /// Optional audit trail for session lifecycle events.
    pub audit: Option<AuditSink>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            ping_interval: DEFAULT_PING_INTERVAL,
            send_queue: DEFAULT_SEND_QUEUE,
            audit: None,
        }
    }
}

/// The rendezvous relay server.
///
/// Accepts WebSocket connections, wraps each in a [`Connection`], feeds every
/// inbound frame to the shared [`Router`], and runs the
/// [`LivenessMonitor`] alongside the accept loop.
pub struct Relay {
    listener: TcpListener,
    local_addr: SocketAddr,
    router: Arc<Router>,
    config: RelayConfig,
}

impl Relay {
    /// Bind the listening socket. Nothing is accepted until
    /// [`run`](Self::run) is called.
    pub async fn bind(config: RelayConfig) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.listen_addr))?;
        let local_addr = listener.local_addr()?;

        let mut router = Router::new(Arc::new(Registry::new()), Arc::new(ConnectionTable::new()));
        if let Some(audit) = &config.audit {
            router = router.with_audit(audit.clone());
        }

        Ok(Self {
            listener,
            local_addr,
            router: Arc::new(router),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    /// Accept connections until `shutdown` fires. Each connection is handled
    /// in its own Tokio task; a failing connection never stops the loop.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        tracing::info!(addr = %self.local_addr, "relay listening on ws://{}", self.local_addr);

        let mut monitor =
            LivenessMonitor::new(Arc::clone(self.router.connections()), self.config.ping_interval);
        if let Some(audit) = &self.config.audit {
            monitor = monitor.with_audit(audit.clone());
        }
        let monitor_task = tokio::spawn(monitor.run(shutdown.resubscribe()));

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            tracing::warn!(%err, "failed to accept connection");
                            continue;
                        }
                    };
                    let router = Arc::clone(&self.router);
                    let send_queue = self.config.send_queue;
                    let audit = self.config.audit.clone();

                    tokio::spawn(async move {
                        if let Err(err) =
                            handle_connection(stream, remote_addr, router, send_queue, audit).await
                        {
                            tracing::debug!(%remote_addr, err = %format!("{err:#}"), "connection handler error");
                        }
                    });
                }
                _ = shutdown.recv() => {
                    tracing::info!("relay shutting down");
                    break;
                }
            }
        }

        monitor_task.abort();
        Ok(())
    }
}

/// Why a connection's read loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadExit {
    /// Peer sent a close frame or the stream ended.
    PeerClosed,
    ReadError,
    /// The router asked for the connection to be closed.
    Rejected,
    /// The liveness monitor terminated the connection.
    Terminated,
}

/// Handle a single TCP connection from handshake through teardown.
async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    router: Arc<Router>,
    send_queue: usize,
    audit: Option<AuditSink>,
) -> anyhow::Result<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .context("websocket handshake failed")?;

    let (conn, outbound_rx) = Connection::new(remote_addr, send_queue);
    router.connect(&conn);

    tracing::info!(connection_id = %conn.id(), %remote_addr, "peer connected");
    if let Some(audit) = &audit {
        audit
            .log(AuditEntry::new(
                AuditEventType::ConnectionOpened,
                make_source(&conn),
                serde_json::json!({}),
            ))
            .await;
    }

    let (ws_write, ws_read) = ws.split();
    let mut writer = tokio::spawn(write_outbound(ws_write, outbound_rx, conn.id()));

    let exit = read_inbound(ws_read, &conn, &router).await;
    router.disconnect(&conn);

    match exit {
        ReadExit::Terminated => writer.abort(),
        _ => close_gracefully(&conn, &mut writer).await,
    }

    tracing::info!(
        connection_id = %conn.id(),
        %remote_addr,
        role = ?conn.role(),
        reason = ?exit,
        "connection closed"
    );
    if let Some(audit) = &audit {
        audit
            .log(AuditEntry::new(
                AuditEventType::ConnectionClosed,
                make_source(&conn),
                serde_json::json!({
                    "role": format!("{:?}", conn.role()),
                    "reason": format!("{exit:?}"),
                    "pending_requests": conn.pending_requests(),
                }),
            ))
            .await;
    }

    Ok(())
}

/// Queue a close frame behind whatever is already queued (an auth failure
/// reply, for one) and give the writer `CLOSE_GRACE` to drain. If the close
/// frame cannot be queued the writer is aborted at once.
async fn close_gracefully(conn: &Connection, writer: &mut JoinHandle<()>) {
    if let Err(err) = conn.close() {
        tracing::debug!(connection_id = %conn.id(), %err, "failed to queue close frame, aborting writer");
        writer.abort();
        return;
    }

    if tokio::time::timeout(CLOSE_GRACE, &mut *writer).await.is_err() {
        tracing::debug!(connection_id = %conn.id(), "writer did not drain in time");
        writer.abort();
    }
}

/// Feed inbound frames to the router until the peer goes away, the router
/// asks for a close, or the connection is terminated.
async fn read_inbound<R>(mut reader: R, conn: &Arc<Connection>, router: &Router) -> ReadExit
where
    R: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = conn.terminated() => return ReadExit::Terminated,
            next = reader.next() => next,
        };

        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => {
                tracing::debug!(connection_id = %conn.id(), %err, "read error, closing connection");
                return ReadExit::ReadError;
            }
            None => return ReadExit::PeerClosed,
        };

        let flow = match msg {
            Message::Text(text) => router.handle(conn, text.as_str()),
            Message::Binary(bytes) => router.handle_binary(conn, &bytes),
            Message::Pong(_) => {
                conn.mark_alive();
                Flow::Continue
            }
            Message::Close(frame) => {
                tracing::debug!(connection_id = %conn.id(), ?frame, "peer sent close");
                return ReadExit::PeerClosed;
            }
            // Pings are answered by tungstenite itself.
            Message::Ping(_) | Message::Frame(_) => Flow::Continue,
        };

        if flow == Flow::Close {
            return ReadExit::Rejected;
        }
    }
}

/// Drain a connection's outbound queue into the WebSocket sink.
async fn write_outbound<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Outbound>,
    connection_id: crate::connection::ConnectionId,
) where
    W: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    while let Some(frame) = outbound.recv().await {
        let msg = match frame {
            Outbound::Text(text) => Message::Text(text.into()),
            Outbound::Ping => Message::Ping(Default::default()),
            Outbound::Close => {
                let _ = writer.send(Message::Close(None)).await;
                break;
            }
        };

        if let Err(err) = writer.send(msg).await {
            tracing::debug!(%connection_id, %err, "write error, stopping writer");
            break;
        }
    }
}

fn make_source(conn: &Connection) -> AuditSource {
    AuditSource::new("ws-relay").with_connection(conn.id(), conn.remote_addr())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:40003".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn close_goes_out_after_queued_frames() {
        let (conn, mut rx) = Connection::new(addr(), 4);
        conn.send_text("bye").unwrap();

        let mut writer = tokio::spawn(async move {
            assert_eq!(rx.recv().await, Some(Outbound::Text("bye".into())));
            assert_eq!(rx.recv().await, Some(Outbound::Close));
        });

        close_gracefully(&conn, &mut writer).await;
        assert!(writer.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_aborts_writer_without_waiting() {
        let (conn, _rx) = Connection::new(addr(), 1);
        conn.send_text("stuck").unwrap();

        let mut writer = tokio::spawn(std::future::pending::<()>());
        let started = tokio::time::Instant::now();

        close_gracefully(&conn, &mut writer).await;
        assert!(started.elapsed() < CLOSE_GRACE);
        assert!(writer.await.unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_writer_is_aborted_after_grace() {
        let (conn, _rx) = Connection::new(addr(), 4);
        let mut writer = tokio::spawn(std::future::pending::<()>());

        close_gracefully(&conn, &mut writer).await;
        assert!(writer.await.unwrap_err().is_cancelled());
    }
}
