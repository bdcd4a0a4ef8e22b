//! kuix-proto - Wire protocol for the KuiX control channel.
//!
//! The core and every worker host speak the same protocol over loopback
//! TCP: UTF-8 JSON documents delimited by a `0x04` sentinel byte, preceded
//! by a one-shot authentication exchange. On top of the framing sits a
//! peer-symmetric request multiplexer with three message kinds
//! (fire-and-forget, blocking correlated by UUID, response) addressing
//! named endpoints on either side.

pub mod client;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod peer;
pub mod server;

pub use client::{ClientEvent, IpcClient};
pub use endpoint::{Endpoints, RoutingKeyFn, ROUTING_KEY};
pub use envelope::{Envelope, RequestType};
pub use error::{EndpointReply, ErrorKind, KuixError};
pub use frame::{EotCodec, FrameError, EOT};
pub use handshake::{HandshakeReply, HandshakeRequest, HandshakeStatus, MAX_HANDSHAKE_BYTES};
pub use peer::{Connection, Responder};
pub use server::{IpcServer, ServerEvent};
