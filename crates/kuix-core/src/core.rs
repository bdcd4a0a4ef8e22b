//! The core orchestrator: owns the control-channel server, the host table,
//! and the registries, and exposes the public API user code drives.
//!
//! Strategy and component registrations are broadcast: pushed to every
//! connected host when registered, and replayed to every host that
//! connects later, so a host's view never depends on its join order.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kuix_conf::{CoreConfig, Workdir};
use kuix_proto::{EndpointReply, ErrorKind, IpcServer, KuixError, Responder, ServerEvent};
use rand::RngCore;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{error, info};
use uuid::Uuid;

use crate::process::{default_host_binary, HostSpawner};
use crate::tracker::ProcessTracker;

/// How long `create_process_and_wait` waits for the child to connect back.
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyDescriptor {
    pub name: String,
    pub import_path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentDescriptor {
    pub name: String,
    pub import_path: String,
    pub config: Value,
}

/// Settings for [`Core::setup`].
#[derive(Debug, Clone)]
pub struct CoreOptions {
    pub config: CoreConfig,
    /// Root under which the `kuiX/` working directories are created.
    pub root: PathBuf,
    /// Worker-host binary; defaults to a sibling of the current executable.
    pub host_binary: Option<PathBuf>,
}

impl CoreOptions {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            root: PathBuf::from(""),
            host_binary: None,
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_host_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.host_binary = Some(binary.into());
        self
    }
}

/// State shared between the public API and the replay task that follows
/// connection events.
#[derive(Clone)]
struct Broadcast {
    server: Arc<IpcServer>,
    tracker: Arc<ProcessTracker>,
    strategies: Arc<Mutex<Vec<StrategyDescriptor>>>,
    components: Arc<Mutex<Vec<ComponentDescriptor>>>,
}

impl Broadcast {
    async fn push_strategy(
        &self,
        host_id: &str,
        descriptor: &StrategyDescriptor,
    ) -> Result<(), KuixError> {
        let response = self
            .server
            .send_and_block(
                host_id,
                "register_strategy",
                json!({"name": descriptor.name, "import_path": descriptor.import_path}),
            )
            .await?;
        parse_reply(response)?;
        self.tracker.mark_strategy(host_id, &descriptor.name).await;
        Ok(())
    }

    async fn push_component(
        &self,
        host_id: &str,
        descriptor: &ComponentDescriptor,
    ) -> Result<(), KuixError> {
        let response = self
            .server
            .send_and_block(
                host_id,
                "add_component",
                json!({
                    "name": descriptor.name,
                    "import_path": descriptor.import_path,
                    "config": descriptor.config,
                }),
            )
            .await?;
        parse_reply(response)?;
        Ok(())
    }

    /// Replay every known strategy and process component to a host that
    /// just connected.
    async fn push_all_to(&self, host_id: &str) {
        let strategies = self.strategies.lock().unwrap().clone();
        for descriptor in strategies {
            if let Err(e) = self.push_strategy(host_id, &descriptor).await {
                error!(
                    host = %host_id,
                    strategy = %descriptor.name,
                    error = %e,
                    "failed to push a registered strategy to a new host",
                );
            }
        }
        let components = self.components.lock().unwrap().clone();
        for descriptor in components {
            if let Err(e) = self.push_component(host_id, &descriptor).await {
                error!(
                    host = %host_id,
                    component = %descriptor.name,
                    error = %e,
                    "failed to push a registered component to a new host",
                );
            }
        }
    }

    async fn event_loop(self, mut events: broadcast::Receiver<ServerEvent>) {
        loop {
            match events.recv().await {
                Ok(ServerEvent::ConnectionAccepted { identifier }) => {
                    self.tracker.register(&identifier).await;
                    self.push_all_to(&identifier).await;
                }
                Ok(ServerEvent::ConnectionClosed { identifier, .. }) => {
                    self.tracker.remove(&identifier).await;
                }
                Ok(ServerEvent::ConnectionRefused { .. }) => {}
                Ok(ServerEvent::ServerClosed) => break,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    error!(skipped, "core event loop lagged behind server events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

pub struct Core {
    config: CoreConfig,
    auth_key: String,
    workdir: Workdir,
    broadcast: Broadcast,
    spawner: HostSpawner,
    started: AtomicBool,
}

impl Core {
    /// Scaffold the filesystem, resolve the auth key, and bind the
    /// listener. Failures here are fatal to the caller.
    pub async fn setup(options: CoreOptions) -> Result<Arc<Self>, KuixError> {
        let workdir = Workdir::create(&options.root).map_err(|e| {
            KuixError::wrap(
                ErrorKind::CoreSetupError,
                "error while setting up the core working directories",
                e,
            )
        })?;

        let config = options.config;
        let auth_key = if config.auth_key.is_empty() {
            generate_auth_key()
        } else {
            config.auth_key.clone()
        };

        let server = IpcServer::bind(&auth_key, &config.ipc_host, config.ipc_port)
            .await
            .map_err(|e| e.add_ctx("error while configuring the core"))?;

        let spawner = HostSpawner::new(
            options.host_binary.unwrap_or_else(default_host_binary),
            config.ipc_host.clone(),
            server.local_addr().port(),
            auth_key.clone(),
            config.artificial_latency,
        );

        Ok(Arc::new(Self {
            config,
            auth_key,
            workdir,
            broadcast: Broadcast {
                server,
                tracker: Arc::new(ProcessTracker::new()),
                strategies: Arc::new(Mutex::new(Vec::new())),
                components: Arc::new(Mutex::new(Vec::new())),
            },
            spawner,
            started: AtomicBool::new(false),
        }))
    }

    /// Start accepting hosts and replaying registrations to late joiners.
    /// Non-blocking; idempotent.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let events = self.broadcast.server.subscribe();
        self.broadcast.server.start().await;
        tokio::spawn(self.broadcast.clone().event_loop(events));
        info!(addr = %self.broadcast.server.local_addr(), "core started");
    }

    // --- configuration & introspection ---

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn auth_key(&self) -> &str {
        &self.auth_key
    }

    pub fn workdir(&self) -> &Workdir {
        &self.workdir
    }

    pub fn server(&self) -> &Arc<IpcServer> {
        &self.broadcast.server
    }

    pub fn tracker(&self) -> &Arc<ProcessTracker> {
        &self.broadcast.tracker
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.broadcast.server.local_addr()
    }

    pub fn registered_strategies(&self) -> Vec<StrategyDescriptor> {
        self.broadcast.strategies.lock().unwrap().clone()
    }

    // --- multiplexer pass-through ---

    /// Register a one-way endpoint callable from any host.
    pub fn register_endpoint<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.broadcast.server.endpoints().register_endpoint(name, handler);
    }

    /// Register a blocking endpoint callable from any host. The handler
    /// must consume its responder exactly once.
    pub fn register_blocking_endpoint<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Responder, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.broadcast
            .server
            .endpoints()
            .register_blocking_endpoint(name, handler);
    }

    pub async fn send(&self, host_id: &str, endpoint: &str, data: Value) -> Result<(), KuixError> {
        self.broadcast.server.send(host_id, endpoint, data).await
    }

    pub async fn send_and_block(
        &self,
        host_id: &str,
        endpoint: &str,
        data: Value,
    ) -> Result<Value, KuixError> {
        self.broadcast.server.send_and_block(host_id, endpoint, data).await
    }

    pub async fn send_response(
        &self,
        host_id: &str,
        endpoint: &str,
        data: Value,
        rid: Uuid,
    ) -> Result<(), KuixError> {
        self.broadcast
            .server
            .send_response(host_id, endpoint, data, rid)
            .await
    }

    // --- processes ---

    /// Launch a worker-host child. Non-blocking; the host shows up in the
    /// tracker once it authenticates.
    pub async fn create_process(&self, identifier: &str) -> Result<(), KuixError> {
        if self.broadcast.tracker.contains(identifier).await {
            return Err(KuixError::new(
                ErrorKind::ProcessAlreadyExists,
                format!("a worker host with identifier '{identifier}' already exists"),
            ));
        }
        self.spawner.spawn(identifier)
    }

    /// Launch a child and wait (up to 30 s) for it to connect back.
    pub async fn create_process_and_wait(&self, identifier: &str) -> Result<(), KuixError> {
        self.create_process_with_timeout(identifier, LAUNCH_TIMEOUT).await
    }

    /// Like [`create_process_and_wait`](Core::create_process_and_wait) with
    /// an explicit deadline.
    pub async fn create_process_with_timeout(
        &self,
        identifier: &str,
        deadline: Duration,
    ) -> Result<(), KuixError> {
        self.create_process(identifier).await?;

        let poll = Duration::from_secs_f64(self.config.artificial_latency.max(0.01));
        let mut waited = Duration::ZERO;
        while waited < deadline {
            if self.broadcast.tracker.contains(identifier).await {
                return Ok(());
            }
            tokio::time::sleep(poll).await;
            waited += poll;
        }
        Err(KuixError::new(
            ErrorKind::ProcessLaunchError,
            format!("worker host '{identifier}' did not connect back in time; check the logs"),
        ))
    }

    /// Ask a host to tear itself down. The host acknowledges, then
    /// self-terminates; its record drops when the connection closes.
    pub async fn close_process(&self, host_id: &str) -> Result<(), KuixError> {
        self.ensure_host(host_id).await?;
        let response = self
            .broadcast
            .server
            .send_and_block(host_id, "close_process", json!({}))
            .await
            .map_err(|e| e.add_ctx(format!("core: error while closing process '{host_id}'")))?;
        parse_reply(response)
            .map(drop)
            .map_err(|e| e.add_ctx(format!("core: error while closing process '{host_id}'")))
    }

    // --- strategies & components ---

    /// Register a strategy descriptor and push it to every connected host.
    /// Push failures are logged per host and the first one is returned; the
    /// registration itself stays recorded either way.
    pub async fn register_strategy(&self, name: &str, import_path: &str) -> Result<(), KuixError> {
        let descriptor = {
            let mut strategies = self.broadcast.strategies.lock().unwrap();
            if strategies.iter().any(|d| d.name == name) {
                return Err(KuixError::new(
                    ErrorKind::StrategyAlreadyRegistered,
                    format!("strategy '{name}' already registered"),
                ));
            }
            let descriptor = StrategyDescriptor {
                name: name.to_owned(),
                import_path: import_path.to_owned(),
            };
            strategies.push(descriptor.clone());
            descriptor
        };

        let mut first_error = None;
        for host_id in self.broadcast.tracker.identifiers().await {
            if let Err(e) = self.broadcast.push_strategy(&host_id, &descriptor).await {
                let e = e.add_ctx(format!(
                    "core: error while registering strategy '{name}' on process '{host_id}'"
                ));
                error!(host = %host_id, strategy = %name, error = %e, "strategy push failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Register a process component and push it to every connected host.
    pub async fn register_process_component(
        &self,
        name: &str,
        import_path: &str,
        config: Value,
    ) -> Result<(), KuixError> {
        let descriptor = {
            let mut components = self.broadcast.components.lock().unwrap();
            if components.iter().any(|d| d.name == name) {
                return Err(KuixError::new(
                    ErrorKind::ProcessComponentAlreadyRegistered,
                    format!("component '{name}' already registered"),
                ));
            }
            let descriptor = ComponentDescriptor {
                name: name.to_owned(),
                import_path: import_path.to_owned(),
                config,
            };
            components.push(descriptor.clone());
            descriptor
        };

        let mut first_error = None;
        for host_id in self.broadcast.tracker.identifiers().await {
            if let Err(e) = self.broadcast.push_component(&host_id, &descriptor).await {
                let e = e.add_ctx(format!(
                    "core: error while registering process component '{name}' on process '{host_id}'"
                ));
                error!(host = %host_id, component = %name, error = %e, "component push failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    // --- workers ---

    /// Instance a worker from a registered strategy on a specific host.
    pub async fn create_worker(
        &self,
        host_id: &str,
        strategy_name: &str,
        worker_id: &str,
        config: Value,
    ) -> Result<(), KuixError> {
        self.ensure_host(host_id).await?;
        if !self
            .broadcast
            .strategies
            .lock()
            .unwrap()
            .iter()
            .any(|d| d.name == strategy_name)
        {
            return Err(KuixError::new(
                ErrorKind::StrategyNotRegistered,
                format!("strategy '{strategy_name}' was not registered; call register_strategy first"),
            ));
        }

        let response = self
            .broadcast
            .server
            .send_and_block(
                host_id,
                "create_worker",
                json!({
                    "strategy_name": strategy_name,
                    "identifier": worker_id,
                    "config": config,
                }),
            )
            .await
            .map_err(|e| {
                e.add_ctx(format!(
                    "core: error while creating worker '{worker_id}' for strategy '{strategy_name}'"
                ))
            })?;
        parse_reply(response).map(drop).map_err(|e| {
            e.add_ctx(format!(
                "core: error while creating worker '{worker_id}' for strategy '{strategy_name}' on process '{host_id}'"
            ))
        })
    }

    pub async fn start_worker(&self, host_id: &str, worker_id: &str) -> Result<(), KuixError> {
        self.worker_op(host_id, worker_id, "start_worker", "starting").await
    }

    pub async fn stop_worker(&self, host_id: &str, worker_id: &str) -> Result<(), KuixError> {
        self.worker_op(host_id, worker_id, "stop_worker", "stopping").await
    }

    pub async fn close_worker(&self, host_id: &str, worker_id: &str) -> Result<(), KuixError> {
        self.worker_op(host_id, worker_id, "close_worker", "closing").await
    }

    async fn worker_op(
        &self,
        host_id: &str,
        worker_id: &str,
        endpoint: &str,
        verb: &str,
    ) -> Result<(), KuixError> {
        self.ensure_host(host_id).await?;
        let response = self
            .broadcast
            .server
            .send_and_block(host_id, endpoint, json!({"identifier": worker_id}))
            .await
            .map_err(|e| {
                e.add_ctx(format!(
                    "core: error while {verb} worker '{worker_id}' on process '{host_id}'"
                ))
            })?;
        parse_reply(response).map(drop).map_err(|e| {
            e.add_ctx(format!(
                "core: error while {verb} worker '{worker_id}' on process '{host_id}'"
            ))
        })
    }

    async fn ensure_host(&self, host_id: &str) -> Result<(), KuixError> {
        if self.broadcast.tracker.contains(host_id).await {
            Ok(())
        } else {
            Err(KuixError::new(
                ErrorKind::ProcessNotFound,
                format!("worker host '{host_id}' not found"),
            ))
        }
    }

    /// Shut the control channel down; hosts observe the closed connection.
    pub async fn close(&self) {
        self.broadcast.server.close().await;
    }
}

/// Generate a fresh 256-byte auth key, hex-encoded.
pub fn generate_auth_key() -> String {
    let mut bytes = [0u8; 256];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn parse_reply(response: Value) -> Result<Value, KuixError> {
    EndpointReply::from_value(response)
        .map_err(|e| {
            KuixError::wrap(
                ErrorKind::IpcRequestHandlerError,
                "malformed endpoint reply",
                e,
            )
        })?
        .into_result()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_key_is_256_bytes_hex() {
        let key = generate_auth_key();
        assert_eq!(key.len(), 512);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(generate_auth_key(), key);
    }

    #[test]
    fn reply_parsing_surfaces_typed_errors() {
        let err = parse_reply(json!({
            "status": "error",
            "return": {"type": "WorkerNotFoundError", "base_msg": "m", "traceback": "", "context": []},
        }))
        .unwrap_err();
        assert!(err.is(ErrorKind::WorkerNotFoundError));

        let ok = parse_reply(json!({"status": "success", "return": "started"})).unwrap();
        assert_eq!(ok, "started");
    }
}
