//! Client side of the control channel: connect, authenticate, then expose
//! the same call surface toward the server that the server exposes toward
//! clients.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::info;
use uuid::Uuid;

use crate::endpoint::Endpoints;
use crate::error::{ErrorKind, KuixError};
use crate::frame::EotCodec;
use crate::handshake::{HandshakeReply, HandshakeRequest, MAX_HANDSHAKE_BYTES};
use crate::peer::{run_receive_loop, Connection, LoopExit, Role};

/// Label used for the remote peer on the client side.
const SERVER_PEER: &str = "core";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectionClosed { from_client: bool },
}

/// The host-side transport: a single authenticated connection to the core.
pub struct IpcClient {
    identifier: String,
    endpoints: Arc<Endpoints>,
    conn: Arc<Connection>,
    events: broadcast::Sender<ClientEvent>,
    /// Held until [`start`](IpcClient::start) hands it to the receive loop.
    reader: Mutex<Option<FramedRead<OwnedReadHalf, EotCodec>>>,
}

impl std::fmt::Debug for IpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcClient")
            .field("identifier", &self.identifier)
            .finish()
    }
}

impl IpcClient {
    /// Connect and authenticate. Any failure up to and including an
    /// `invalid` handshake reply is fatal to this client.
    pub async fn connect(
        identifier: impl Into<String>,
        auth_key: &str,
        host: &str,
        port: u16,
    ) -> Result<Arc<Self>, KuixError> {
        let identifier = identifier.into();
        let mut stream = TcpStream::connect((host, port)).await.map_err(|e| {
            KuixError::wrap(
                ErrorKind::SocketClientConnectionError,
                format!("client '{identifier}' failed to connect to {host}:{port}"),
                e,
            )
        })?;

        let request = HandshakeRequest {
            identifier: identifier.clone(),
            key: auth_key.to_owned(),
        };
        let payload = serde_json::to_vec(&request).map_err(|e| {
            KuixError::wrap(
                ErrorKind::SocketClientConnectionError,
                "failed to encode the handshake payload",
                e,
            )
        })?;
        stream.write_all(&payload).await.map_err(|e| {
            KuixError::wrap(
                ErrorKind::SocketClientConnectionError,
                format!("client '{identifier}' failed to send the handshake"),
                e,
            )
        })?;

        let mut buf = [0u8; MAX_HANDSHAKE_BYTES];
        let len = tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.read(&mut buf))
            .await
            .map_err(|_| {
                KuixError::new(
                    ErrorKind::SocketClientConnectionError,
                    format!("client '{identifier}' timed out waiting for the handshake reply"),
                )
            })?
            .map_err(|e| {
                KuixError::wrap(
                    ErrorKind::SocketClientConnectionError,
                    format!("client '{identifier}' failed to read the handshake reply"),
                    e,
                )
            })?;
        // The server may pipeline its first frames right behind the reply;
        // parse only the first JSON value and keep the rest for the codec.
        let mut values = serde_json::Deserializer::from_slice(&buf[..len]).into_iter::<HandshakeReply>();
        let reply = match values.next() {
            Some(Ok(reply)) => reply,
            Some(Err(e)) => {
                return Err(KuixError::wrap(
                    ErrorKind::SocketClientConnectionError,
                    format!("client '{identifier}' received a malformed handshake reply"),
                    e,
                ));
            }
            None => {
                return Err(KuixError::new(
                    ErrorKind::SocketClientConnectionError,
                    format!("client '{identifier}' received an empty handshake reply"),
                ));
            }
        };
        let leftover = buf[values.byte_offset()..len].to_vec();
        if !reply.is_valid() {
            return Err(KuixError::new(
                ErrorKind::SocketClientConnectionError,
                format!("client '{identifier}' was refused by the server (invalid key or duplicate identifier)"),
            ));
        }

        let endpoints = Endpoints::new();
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, EotCodec);
        if !leftover.is_empty() {
            reader.read_buffer_mut().extend_from_slice(&leftover);
        }
        let writer = FramedWrite::new(write_half, EotCodec);
        let conn = Connection::new(SERVER_PEER, Role::Client, writer, Arc::clone(&endpoints));

        let (events, _) = broadcast::channel(16);
        info!(%identifier, %host, port, "connected to the core");

        Ok(Arc::new(Self {
            identifier,
            endpoints,
            conn,
            events,
            reader: Mutex::new(Some(reader)),
        }))
    }

    /// Start dispatching inbound frames. Called once the endpoint tables
    /// are wired, so a fast server can never hit an endpoint before it is
    /// registered. Idempotent.
    pub async fn start(&self) {
        let Some(reader) = self.reader.lock().await.take() else {
            return;
        };
        let conn = Arc::clone(&self.conn);
        let events = self.events.clone();
        tokio::spawn(async move {
            let exit = run_receive_loop(Arc::clone(&conn), reader).await;
            let _ = conn.close().await;
            let _ = events.send(ClientEvent::ConnectionClosed {
                from_client: exit == LoopExit::Local,
            });
        });
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn endpoints(&self) -> &Arc<Endpoints> {
        &self.endpoints
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Fire-and-forget request to the server.
    pub async fn send(&self, endpoint: &str, data: Value) -> Result<(), KuixError> {
        self.conn.send(endpoint, data).await.map_err(|e| {
            e.add_ctx(format!(
                "client '{}': error while sending to endpoint '{endpoint}'",
                self.identifier
            ))
        })
    }

    /// Blocking request to the server; waits for the correlated response.
    pub async fn send_and_block(&self, endpoint: &str, data: Value) -> Result<Value, KuixError> {
        self.conn.send_and_block(endpoint, data).await.map_err(|e| {
            e.add_ctx(format!(
                "client '{}': error while calling blocking endpoint '{endpoint}'",
                self.identifier
            ))
        })
    }

    /// Answer a blocking request received from the server.
    pub async fn send_response(
        &self,
        endpoint: &str,
        data: Value,
        rid: Uuid,
    ) -> Result<(), KuixError> {
        self.conn.send_response(endpoint, data, rid).await.map_err(|e| {
            e.add_ctx(format!(
                "client '{}': error while responding to endpoint '{endpoint}'",
                self.identifier
            ))
        })
    }

    /// Close the connection; the receive loop exits and a
    /// `ConnectionClosed {from_client: true}` event fires.
    pub async fn close(&self) -> Result<(), KuixError> {
        self.conn.close().await
    }

    /// Wait until the connection is closed, by either side.
    pub async fn wait_closed(&self) {
        let mut rx = self.conn.closed_rx();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
