//! Structured errors that cross the IPC boundary.
//!
//! Local infrastructure failures use plain `thiserror` enums where they
//! occur. Anything that can travel between the core and a worker host is a
//! [`KuixError`]: a kind tag, a base message, the raise site, and an ordered
//! list of context notes appended as the error propagates upward. The wire
//! shape is `{type, base_msg, traceback, context}` and the receiving peer
//! reconstructs an equivalent error it can branch on.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Every error kind that can be raised by the framework or carried over the
/// wire. Variant names are the on-wire tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    // Transport, server side
    SocketServerBindError,
    SocketServerAcceptError,
    SocketServerListeningConnectionError,
    SocketServerSendError,
    SocketServerCloseError,
    ClientIdentifierNotFound,
    // Transport, client side
    SocketClientConnectionError,
    SocketClientListeningError,
    SocketClientSendError,
    SocketClientCloseError,
    // Multiplexer
    IpcRequestHandlerError,
    UnknownEndpoint,
    UnknownRid,
    UnknownRequestType,
    EventSubscriptionError,
    // Worker host
    StrategyImportError,
    ComponentImportError,
    ComponentInitError,
    StrategyNotFoundError,
    WorkerAlreadyExistsError,
    WorkerNotFoundError,
    WorkerInitError,
    WorkerMethodCallError,
    ProcessLaunchError,
    ProcessNotFound,
    // Worker runtime
    WorkerAlreadyStarted,
    WorkerAlreadyStopped,
    WorkerStoppingTimeout,
    WorkerStoppingError,
    StrategyComponentOpeningError,
    StrategyComponentStartingError,
    StrategyComponentStoppingError,
    StrategyComponentClosingError,
    StrategyClosingError,
    // Core
    CoreSetupError,
    CoreNotConfigured,
    CoreConfigLoadError,
    CoreConfigGenerationError,
    ProcessAlreadyExists,
    StrategyAlreadyRegistered,
    StrategyNotRegistered,
    ProcessComponentAlreadyRegistered,
    /// Catch-all for tags minted by a newer peer.
    #[serde(other)]
    Generic,
}

impl ErrorKind {
    /// On-wire tag, mirrored for Display.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SocketServerBindError => "SocketServerBindError",
            ErrorKind::SocketServerAcceptError => "SocketServerAcceptError",
            ErrorKind::SocketServerListeningConnectionError => "SocketServerListeningConnectionError",
            ErrorKind::SocketServerSendError => "SocketServerSendError",
            ErrorKind::SocketServerCloseError => "SocketServerCloseError",
            ErrorKind::ClientIdentifierNotFound => "ClientIdentifierNotFound",
            ErrorKind::SocketClientConnectionError => "SocketClientConnectionError",
            ErrorKind::SocketClientListeningError => "SocketClientListeningError",
            ErrorKind::SocketClientSendError => "SocketClientSendError",
            ErrorKind::SocketClientCloseError => "SocketClientCloseError",
            ErrorKind::IpcRequestHandlerError => "IpcRequestHandlerError",
            ErrorKind::UnknownEndpoint => "UnknownEndpoint",
            ErrorKind::UnknownRid => "UnknownRid",
            ErrorKind::UnknownRequestType => "UnknownRequestType",
            ErrorKind::EventSubscriptionError => "EventSubscriptionError",
            ErrorKind::StrategyImportError => "StrategyImportError",
            ErrorKind::ComponentImportError => "ComponentImportError",
            ErrorKind::ComponentInitError => "ComponentInitError",
            ErrorKind::StrategyNotFoundError => "StrategyNotFoundError",
            ErrorKind::WorkerAlreadyExistsError => "WorkerAlreadyExistsError",
            ErrorKind::WorkerNotFoundError => "WorkerNotFoundError",
            ErrorKind::WorkerInitError => "WorkerInitError",
            ErrorKind::WorkerMethodCallError => "WorkerMethodCallError",
            ErrorKind::ProcessLaunchError => "ProcessLaunchError",
            ErrorKind::ProcessNotFound => "ProcessNotFound",
            ErrorKind::WorkerAlreadyStarted => "WorkerAlreadyStarted",
            ErrorKind::WorkerAlreadyStopped => "WorkerAlreadyStopped",
            ErrorKind::WorkerStoppingTimeout => "WorkerStoppingTimeout",
            ErrorKind::WorkerStoppingError => "WorkerStoppingError",
            ErrorKind::StrategyComponentOpeningError => "StrategyComponentOpeningError",
            ErrorKind::StrategyComponentStartingError => "StrategyComponentStartingError",
            ErrorKind::StrategyComponentStoppingError => "StrategyComponentStoppingError",
            ErrorKind::StrategyComponentClosingError => "StrategyComponentClosingError",
            ErrorKind::StrategyClosingError => "StrategyClosingError",
            ErrorKind::CoreSetupError => "CoreSetupError",
            ErrorKind::CoreNotConfigured => "CoreNotConfigured",
            ErrorKind::CoreConfigLoadError => "CoreConfigLoadError",
            ErrorKind::CoreConfigGenerationError => "CoreConfigGenerationError",
            ErrorKind::ProcessAlreadyExists => "ProcessAlreadyExists",
            ErrorKind::StrategyAlreadyRegistered => "StrategyAlreadyRegistered",
            ErrorKind::StrategyNotRegistered => "StrategyNotRegistered",
            ErrorKind::ProcessComponentAlreadyRegistered => "ProcessComponentAlreadyRegistered",
            ErrorKind::Generic => "Generic",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured error with chained context, serializable across the IPC
/// boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KuixError {
    #[serde(rename = "type")]
    kind: ErrorKind,
    #[serde(rename = "base_msg")]
    message: String,
    /// Raise site (`file:line`). Stack frames are not carried across the
    /// wire; the ordered context notes are.
    #[serde(rename = "traceback")]
    trace: String,
    #[serde(rename = "context")]
    context: Vec<String>,
}

impl KuixError {
    #[track_caller]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let loc = std::panic::Location::caller();
        Self {
            kind,
            message: message.into(),
            trace: format!("{}:{}", loc.file(), loc.line()),
            context: Vec::new(),
        }
    }

    /// Build an error preserving its initial cause as the first context note.
    #[track_caller]
    pub fn wrap(kind: ErrorKind, message: impl Into<String>, cause: impl fmt::Display) -> Self {
        Self::new(kind, message).caused_by(cause)
    }

    /// Record the initial cause. The original kind and message survive as
    /// the first context note.
    pub fn caused_by(mut self, cause: impl fmt::Display) -> Self {
        self.context.insert(0, format!("caused by: {cause}"));
        self
    }

    /// Append a context note while propagating upward.
    pub fn add_ctx(mut self, note: impl Into<String>) -> Self {
        self.context.push(note.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn trace(&self) -> &str {
        &self.trace
    }

    pub fn context(&self) -> &[String] {
        &self.context
    }

    /// True when the needle appears anywhere in the message or context chain.
    pub fn chain_contains(&self, needle: &str) -> bool {
        self.message.contains(needle) || self.context.iter().any(|n| n.contains(needle))
    }
}

impl fmt::Display for KuixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        for note in &self.context {
            write!(f, "; {note}")?;
        }
        Ok(())
    }
}

impl std::error::Error for KuixError {}

/// The reply contract of every blocking endpoint:
/// `{"status": "success"|"error", "return": <value | serialized error>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "return", rename_all = "lowercase")]
pub enum EndpointReply {
    Success(serde_json::Value),
    Error(KuixError),
}

impl EndpointReply {
    pub fn success(value: impl Into<serde_json::Value>) -> Self {
        Self::Success(value.into())
    }

    pub fn error(err: KuixError) -> Self {
        Self::Error(err)
    }

    /// Parse the `data` of a RESPONSE envelope.
    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            serde_json::json!({
                "status": "error",
                "return": {
                    "type": "Generic",
                    "base_msg": format!("reply serialization failed: {e}"),
                    "traceback": "",
                    "context": [],
                }
            })
        })
    }

    pub fn into_result(self) -> Result<serde_json::Value, KuixError> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Error(err) => Err(err),
        }
    }
}

impl From<Result<serde_json::Value, KuixError>> for EndpointReply {
    fn from(result: Result<serde_json::Value, KuixError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(err) => Self::Error(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn wire_shape_field_names() {
        let err = KuixError::new(ErrorKind::WorkerNotFoundError, "worker 'W1' not found")
            .add_ctx("while stopping worker");
        let value = serde_json::to_value(&err).unwrap();

        assert_eq!(value["type"], "WorkerNotFoundError");
        assert_eq!(value["base_msg"], "worker 'W1' not found");
        assert_eq!(value["context"][0], "while stopping worker");
        assert!(value["traceback"].as_str().unwrap().contains("error.rs"));
    }

    #[test]
    fn error_roundtrip() {
        let err = KuixError::wrap(
            ErrorKind::WorkerMethodCallError,
            "worker 'W1' failed to start",
            "boom",
        )
        .add_ctx("core: error while starting worker");

        let json = serde_json::to_string(&err).unwrap();
        let back: KuixError = serde_json::from_str(&json).unwrap();

        assert_eq!(back, err);
        assert!(back.is(ErrorKind::WorkerMethodCallError));
        assert!(back.chain_contains("boom"));
    }

    #[test]
    fn unknown_kind_deserializes_as_generic() {
        let json = serde_json::json!({
            "type": "SomethingFromTheFuture",
            "base_msg": "m",
            "traceback": "",
            "context": [],
        });
        let back: KuixError = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), ErrorKind::Generic);
    }

    #[test]
    fn reply_tagging() {
        let ok = EndpointReply::success("created");
        let value = ok.to_value();
        assert_eq!(value["status"], "success");
        assert_eq!(value["return"], "created");

        let err = EndpointReply::error(KuixError::new(ErrorKind::StrategyNotFoundError, "nope"));
        let value = err.to_value();
        assert_eq!(value["status"], "error");
        assert_eq!(value["return"]["type"], "StrategyNotFoundError");
    }

    #[test]
    fn reply_into_result() {
        let ok = EndpointReply::from_value(serde_json::json!({
            "status": "success",
            "return": {"pong": 42},
        }))
        .unwrap();
        assert_eq!(ok.into_result().unwrap()["pong"], 42);

        let err = EndpointReply::from_value(serde_json::json!({
            "status": "error",
            "return": {"type": "WorkerNotFoundError", "base_msg": "m", "traceback": "", "context": []},
        }))
        .unwrap();
        assert!(err.into_result().unwrap_err().is(ErrorKind::WorkerNotFoundError));
    }
}
