//! Server side of the control channel: listen socket, auth, connection
//! registry, and the call surface toward connected clients.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::endpoint::Endpoints;
use crate::error::{ErrorKind, KuixError};
use crate::frame::EotCodec;
use crate::handshake::{HandshakeReply, HandshakeRequest, MAX_HANDSHAKE_BYTES};
use crate::peer::{run_receive_loop, Connection, LoopExit, Role};

/// A client that never completes its handshake is dropped after this long.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection-level events published to subscribers.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    ConnectionAccepted { identifier: String },
    ConnectionRefused { identifier: String },
    ConnectionClosed { identifier: String, from_server: bool },
    ServerClosed,
}

/// State shared between the server handle, the accept loop, and the
/// per-connection tasks.
#[derive(Clone)]
struct Shared {
    auth_key: Arc<str>,
    endpoints: Arc<Endpoints>,
    connections: Arc<RwLock<HashMap<String, Arc<Connection>>>>,
    events: broadcast::Sender<ServerEvent>,
    shutdown: broadcast::Sender<()>,
}

/// The core-side transport: owns the listener and one [`Connection`] per
/// authenticated client, all sharing a single endpoint registry.
pub struct IpcServer {
    shared: Shared,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    closed: AtomicBool,
}

impl IpcServer {
    /// Bind the listen socket. Failure here is fatal to the caller.
    pub async fn bind(
        auth_key: impl Into<String>,
        host: &str,
        port: u16,
    ) -> Result<Arc<Self>, KuixError> {
        let listener = TcpListener::bind((host, port)).await.map_err(|e| {
            KuixError::wrap(
                ErrorKind::SocketServerBindError,
                format!("failed to bind to {host}:{port}"),
                e,
            )
        })?;
        let local_addr = listener.local_addr().map_err(|e| {
            KuixError::wrap(
                ErrorKind::SocketServerBindError,
                format!("failed to read the bound address for {host}:{port}"),
                e,
            )
        })?;

        let (events, _) = broadcast::channel(64);
        let (shutdown, _) = broadcast::channel(1);
        Ok(Arc::new(Self {
            shared: Shared {
                auth_key: Arc::from(auth_key.into()),
                endpoints: Endpoints::new(),
                connections: Arc::new(RwLock::new(HashMap::new())),
                events,
                shutdown,
            },
            listener: Mutex::new(Some(listener)),
            local_addr,
            closed: AtomicBool::new(false),
        }))
    }

    /// Begin accepting connections. Idempotent; the loop runs until
    /// [`close`](IpcServer::close).
    pub async fn start(&self) {
        let Some(listener) = self.listener.lock().await.take() else {
            return;
        };
        info!(addr = %self.local_addr, "control channel listening");
        tokio::spawn(accept_loop(self.shared.clone(), listener));
    }

    /// Subscribe to connection-level events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    /// The endpoint registry shared by every connection.
    pub fn endpoints(&self) -> &Arc<Endpoints> {
        &self.shared.endpoints
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn connected(&self) -> Vec<String> {
        self.shared.connections.read().await.keys().cloned().collect()
    }

    pub async fn is_connected(&self, identifier: &str) -> bool {
        self.shared.connections.read().await.contains_key(identifier)
    }

    async fn connection(&self, identifier: &str) -> Result<Arc<Connection>, KuixError> {
        self.shared
            .connections
            .read()
            .await
            .get(identifier)
            .cloned()
            .ok_or_else(|| {
                KuixError::new(
                    ErrorKind::ClientIdentifierNotFound,
                    format!("client '{identifier}' is not connected or the identifier is wrong"),
                )
            })
    }

    /// Fire-and-forget request to one client.
    pub async fn send(&self, identifier: &str, endpoint: &str, data: Value) -> Result<(), KuixError> {
        self.connection(identifier)
            .await?
            .send(endpoint, data)
            .await
            .map_err(|e| {
                e.add_ctx(format!(
                    "server: error while sending to endpoint '{endpoint}' of client '{identifier}'"
                ))
            })
    }

    /// Blocking request to one client; waits for the correlated response.
    pub async fn send_and_block(
        &self,
        identifier: &str,
        endpoint: &str,
        data: Value,
    ) -> Result<Value, KuixError> {
        self.connection(identifier)
            .await?
            .send_and_block(endpoint, data)
            .await
            .map_err(|e| {
                e.add_ctx(format!(
                    "server: error while calling blocking endpoint '{endpoint}' of client '{identifier}'"
                ))
            })
    }

    /// Answer a blocking request received from a client.
    pub async fn send_response(
        &self,
        identifier: &str,
        endpoint: &str,
        data: Value,
        rid: Uuid,
    ) -> Result<(), KuixError> {
        self.connection(identifier)
            .await?
            .send_response(endpoint, data, rid)
            .await
            .map_err(|e| {
                e.add_ctx(format!(
                    "server: error while responding to endpoint '{endpoint}' of client '{identifier}'"
                ))
            })
    }

    /// Stop accepting, close every connection, and fire `ServerClosed`
    /// exactly once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shared.shutdown.send(());
        let conns: Vec<Arc<Connection>> = self
            .shared
            .connections
            .read()
            .await
            .values()
            .cloned()
            .collect();
        for conn in conns {
            if let Err(e) = conn.close().await {
                warn!(peer = %conn.peer(), error = %e, "error while closing a connection");
            }
        }
        let _ = self.shared.events.send(ServerEvent::ServerClosed);
        info!(addr = %self.local_addr, "control channel closed");
    }
}

async fn accept_loop(shared: Shared, listener: TcpListener) {
    let mut shutdown_rx = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tokio::spawn(handle_connection(shared.clone(), stream, addr));
                }
                Err(e) => {
                    // Non-fatal; keep accepting.
                    warn!(
                        kind = %ErrorKind::SocketServerAcceptError,
                        error = %e,
                        "error while accepting a connection",
                    );
                }
            }
        }
    }
    debug!("accept loop stopped");
}

async fn handle_connection(shared: Shared, mut stream: TcpStream, addr: SocketAddr) {
    let mut buf = [0u8; MAX_HANDSHAKE_BYTES];
    let read = tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.read(&mut buf)).await;
    let len = match read {
        Ok(Ok(len)) if len > 0 => len,
        Ok(Ok(_)) => {
            debug!(%addr, "connection closed before the handshake");
            return;
        }
        Ok(Err(e)) => {
            warn!(%addr, error = %e, "handshake read failed");
            return;
        }
        Err(_) => {
            warn!(%addr, "handshake timed out");
            return;
        }
    };

    // A fast client may pipeline its first frames right behind the
    // handshake; parse only the first JSON value and keep the rest for the
    // codec.
    let mut values = serde_json::Deserializer::from_slice(&buf[..len]).into_iter::<HandshakeRequest>();
    let request = match values.next() {
        Some(Ok(request)) => request,
        Some(Err(e)) => {
            warn!(%addr, error = %e, "malformed handshake payload");
            return;
        }
        None => {
            warn!(%addr, "empty handshake payload");
            return;
        }
    };
    let leftover = buf[values.byte_offset()..len].to_vec();

    let identifier = request.identifier;
    let duplicate = shared.connections.read().await.contains_key(&identifier);
    if request.key != *shared.auth_key || duplicate {
        if duplicate {
            warn!(%identifier, %addr, "identifier collision; connection refused");
        } else {
            debug!(%identifier, %addr, "invalid credentials; connection refused");
        }
        let reply = serde_json::to_vec(&HandshakeReply::invalid()).unwrap_or_default();
        let _ = stream.write_all(&reply).await;
        let _ = shared.events.send(ServerEvent::ConnectionRefused { identifier });
        return;
    }

    let (read_half, mut write_half) = stream.into_split();
    let reply = serde_json::to_vec(&HandshakeReply::valid()).unwrap_or_default();
    if let Err(e) = write_half.write_all(&reply).await {
        warn!(%identifier, error = %e, "failed to send the handshake reply");
        return;
    }

    let mut reader = FramedRead::new(read_half, EotCodec);
    if !leftover.is_empty() {
        reader.read_buffer_mut().extend_from_slice(&leftover);
    }
    let writer = FramedWrite::new(write_half, EotCodec);
    let conn = Connection::new(
        identifier.clone(),
        Role::Server,
        writer,
        Arc::clone(&shared.endpoints),
    );

    shared
        .connections
        .write()
        .await
        .insert(identifier.clone(), Arc::clone(&conn));
    info!(%identifier, %addr, "client authenticated");
    let _ = shared.events.send(ServerEvent::ConnectionAccepted {
        identifier: identifier.clone(),
    });

    let exit = run_receive_loop(Arc::clone(&conn), reader).await;
    let _ = conn.close().await;
    shared.connections.write().await.remove(conn.peer());
    let _ = shared.events.send(ServerEvent::ConnectionClosed {
        identifier: conn.peer().to_owned(),
        from_server: exit == LoopExit::Local,
    });
}
