//! Per-connection plumbing shared by both ends of the channel.
//!
//! A [`Connection`] owns the framed write half behind a mutex (one writer
//! at a time per socket) and a receive loop drives dispatch: handlers run
//! on fresh tasks so a slow handler never starves response delivery, and a
//! RESPONSE frame completes the matching pending entry and wakes the
//! blocked caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{watch, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::endpoint::Endpoints;
use crate::envelope::{Envelope, RequestType};
use crate::error::{ErrorKind, KuixError};
use crate::frame::{EotCodec, FrameError};

/// How long a response for an unknown rid waits before the second (and
/// last) lookup, to tolerate a response racing its registration.
const RID_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Which end of the channel this connection belongs to; picks the error
/// kinds raised by transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Server,
    Client,
}

impl Role {
    fn send_kind(self) -> ErrorKind {
        match self {
            Role::Server => ErrorKind::SocketServerSendError,
            Role::Client => ErrorKind::SocketClientSendError,
        }
    }

    fn close_kind(self) -> ErrorKind {
        match self {
            Role::Server => ErrorKind::SocketServerCloseError,
            Role::Client => ErrorKind::SocketClientCloseError,
        }
    }

    fn listen_kind(self) -> ErrorKind {
        match self {
            Role::Server => ErrorKind::SocketServerListeningConnectionError,
            Role::Client => ErrorKind::SocketClientListeningError,
        }
    }
}

/// One authenticated TCP connection plus the peer's shared tables.
pub struct Connection {
    /// Identifier of the remote peer: the client identifier on the server
    /// side, the server label on the client side.
    peer: String,
    role: Role,
    writer: Mutex<FramedWrite<OwnedWriteHalf, EotCodec>>,
    endpoints: Arc<Endpoints>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl Connection {
    pub(crate) fn new(
        peer: impl Into<String>,
        role: Role,
        writer: FramedWrite<OwnedWriteHalf, EotCodec>,
        endpoints: Arc<Endpoints>,
    ) -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            peer: peer.into(),
            role,
            writer: Mutex::new(writer),
            endpoints,
            closed: AtomicBool::new(false),
            closed_tx,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn endpoints(&self) -> &Arc<Endpoints> {
        &self.endpoints
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn closed_rx(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Write one frame. The writer mutex makes the frame atomic with
    /// respect to other senders on this connection.
    pub async fn send_data(&self, envelope: &Envelope) -> Result<(), KuixError> {
        if self.is_closed() {
            return Err(KuixError::new(
                self.role.send_kind(),
                format!("connection to '{}' is closed", self.peer),
            ));
        }
        let mut writer = self.writer.lock().await;
        writer.send(envelope).await.map_err(|e| {
            KuixError::wrap(
                self.role.send_kind(),
                format!("failed to send frame to '{}'", self.peer),
                e,
            )
        })?;
        trace!(peer = %self.peer, endpoint = %envelope.endpoint, rtype = ?envelope.rtype, "frame sent");
        Ok(())
    }

    /// One-way call: returns as soon as the frame is written.
    pub async fn send(&self, endpoint: &str, data: Value) -> Result<(), KuixError> {
        self.send_data(&Envelope::fire_and_forget(endpoint, data))
            .await
            .map_err(|e| e.add_ctx(format!("error while sending to endpoint '{endpoint}'")))
    }

    /// Blocking call: registers a pending entry, sends, and waits for the
    /// matching RESPONSE. There is no timeout by design; every blocking
    /// handler must respond exactly once.
    pub async fn send_and_block(&self, endpoint: &str, data: Value) -> Result<Value, KuixError> {
        let rid = Uuid::new_v4();
        let rx = self.endpoints.insert_pending(rid, &self.peer);

        if let Err(e) = self
            .send_data(&Envelope::blocking(endpoint, data, rid))
            .await
        {
            self.endpoints.remove_pending(rid);
            return Err(e.add_ctx(format!(
                "error while sending blocking request to endpoint '{endpoint}'"
            )));
        }

        match rx.await {
            Ok(response) => Ok(response),
            Err(_) => Err(KuixError::new(
                self.role.send_kind(),
                format!(
                    "connection to '{}' closed before endpoint '{endpoint}' responded",
                    self.peer
                ),
            )),
        }
    }

    /// Send the response of a blocking request received earlier.
    pub async fn send_response(
        &self,
        endpoint: &str,
        data: Value,
        rid: Uuid,
    ) -> Result<(), KuixError> {
        self.send_data(&Envelope::response(endpoint, data, rid))
            .await
            .map_err(|e| e.add_ctx(format!("error while responding to endpoint '{endpoint}'")))
    }

    /// Close the connection: flush and shut down the write half, stop the
    /// receive loop, and fail every request still waiting on this peer.
    pub async fn close(&self) -> Result<(), KuixError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // send_replace stores the value even while nobody subscribes yet.
        self.closed_tx.send_replace(true);
        self.endpoints.fail_pending_for(&self.peer);
        let mut writer = self.writer.lock().await;
        writer.close().await.map_err(|e| {
            KuixError::wrap(
                self.role.close_kind(),
                format!("error while closing the connection to '{}'", self.peer),
                e,
            )
        })
    }
}

/// Why the receive loop exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopExit {
    /// `close()` was called on this side.
    Local,
    /// The peer half-closed the socket or the read failed.
    Remote,
}

/// Drive one connection until it closes. Frames dispatch from here; the
/// handlers themselves run on spawned tasks.
pub(crate) async fn run_receive_loop(
    conn: Arc<Connection>,
    mut reader: FramedRead<OwnedReadHalf, EotCodec>,
) -> LoopExit {
    let mut closed_rx = conn.closed_rx();
    if *closed_rx.borrow() {
        return LoopExit::Local;
    }
    loop {
        tokio::select! {
            _ = closed_rx.changed() => {
                if *closed_rx.borrow() {
                    debug!(peer = %conn.peer(), "receive loop stopping on local close");
                    return LoopExit::Local;
                }
            }
            frame = reader.next() => match frame {
                Some(Ok(envelope)) => dispatch(&conn, envelope),
                Some(Err(FrameError::Json(e))) => {
                    warn!(peer = %conn.peer(), error = %e, "malformed frame dropped");
                }
                Some(Err(FrameError::Io(e))) => {
                    warn!(
                        peer = %conn.peer(),
                        kind = %conn.role.listen_kind(),
                        error = %e,
                        "receive loop error; connection closed",
                    );
                    return LoopExit::Remote;
                }
                // EOF: the peer half-closed the socket.
                None => {
                    debug!(peer = %conn.peer(), "peer closed the connection");
                    return LoopExit::Remote;
                }
            }
        }
    }
}

fn dispatch(conn: &Arc<Connection>, envelope: Envelope) {
    let Envelope {
        rtype,
        endpoint,
        data,
        rid,
    } = envelope;
    trace!(peer = %conn.peer(), %endpoint, ?rtype, "frame received");

    match rtype {
        RequestType::FireAndForget => match conn.endpoints.oneway_handler(&endpoint) {
            Some(handler) => {
                let caller = conn.peer.clone();
                tokio::spawn(handler(caller, data));
            }
            None => warn!(
                peer = %conn.peer(),
                %endpoint,
                kind = %ErrorKind::UnknownEndpoint,
                "request for unknown endpoint dropped",
            ),
        },
        RequestType::Blocking => {
            let Some(rid) = rid else {
                warn!(
                    peer = %conn.peer(),
                    %endpoint,
                    kind = %ErrorKind::IpcRequestHandlerError,
                    "blocking request without a rid dropped",
                );
                return;
            };
            match conn.endpoints.blocking_handler(&endpoint) {
                Some(handler) => {
                    let responder = Responder {
                        conn: Arc::clone(conn),
                        endpoint,
                        rid,
                        sent: false,
                    };
                    tokio::spawn(handler(responder, data));
                }
                None => warn!(
                    peer = %conn.peer(),
                    %endpoint,
                    kind = %ErrorKind::UnknownEndpoint,
                    "blocking request for unknown endpoint dropped; the originating call will hang",
                ),
            }
        }
        RequestType::Response => {
            let Some(rid) = rid else {
                warn!(
                    peer = %conn.peer(),
                    %endpoint,
                    kind = %ErrorKind::IpcRequestHandlerError,
                    "response without a rid dropped",
                );
                return;
            };
            if let Some(data) = conn.endpoints.complete_pending(rid, data) {
                // The pending entry may not be registered yet; retry once
                // off the receive loop.
                let endpoints = Arc::clone(&conn.endpoints);
                let peer = conn.peer.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(RID_RETRY_DELAY).await;
                    if endpoints.complete_pending(rid, data).is_some() {
                        warn!(
                            %peer,
                            %endpoint,
                            %rid,
                            kind = %ErrorKind::UnknownRid,
                            "response for unknown request id dropped",
                        );
                    }
                });
            }
        }
        RequestType::Unknown => warn!(
            peer = %conn.peer(),
            %endpoint,
            kind = %ErrorKind::UnknownRequestType,
            "request with unknown type dropped",
        ),
    }
}

/// One-shot handle for answering a blocking request. Consuming
/// [`respond`](Responder::respond) is the only way to fulfil it; dropping
/// it unanswered leaves the caller hanging, which is logged loudly.
pub struct Responder {
    conn: Arc<Connection>,
    endpoint: String,
    rid: Uuid,
    sent: bool,
}

impl Responder {
    pub fn rid(&self) -> Uuid {
        self.rid
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Identifier of the peer that sent the request.
    pub fn caller(&self) -> &str {
        self.conn.peer()
    }

    pub async fn respond(mut self, data: Value) -> Result<(), KuixError> {
        self.sent = true;
        self.conn.send_response(&self.endpoint, data, self.rid).await
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if !self.sent {
            warn!(
                endpoint = %self.endpoint,
                rid = %self.rid,
                "blocking endpoint dropped its responder without answering; the caller will hang",
            );
        }
    }
}
