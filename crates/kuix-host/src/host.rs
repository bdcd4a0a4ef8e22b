//! The worker host: one per child process, connected to the core over the
//! control channel.
//!
//! All native endpoints are blocking and answer with the
//! `{"status", "return"}` reply contract. Worker lifecycle operations run
//! on the blocking thread pool because a stop can poll for minutes; the
//! receive loop is never tied up by them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kuix_proto::{EndpointReply, ErrorKind, IpcClient, KuixError, Responder, RoutingKeyFn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, trace};
use uuid::Uuid;

use crate::component::HostComponent;
use crate::registry::{install_defaults, ComponentRegistry, StrategyRegistry};
use crate::worker::Worker;

/// Connection settings for a worker host.
#[derive(Debug, Clone)]
pub struct HostOptions {
    pub identifier: String,
    pub auth_key: String,
    pub host: String,
    pub port: u16,
    /// Pacing knob forwarded by the core; carried for invocation
    /// compatibility.
    pub artificial_latency: f64,
    /// Terminate the OS process after `close_process` has been served.
    /// True in the host binary, false when a host is embedded in tests.
    pub exit_on_close: bool,
}

impl HostOptions {
    pub fn new(identifier: impl Into<String>, auth_key: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            identifier: identifier.into(),
            auth_key: auth_key.into(),
            host: host.into(),
            port,
            artificial_latency: 0.1,
            exit_on_close: false,
        }
    }
}

pub struct WorkerHost {
    identifier: String,
    ipc: Arc<IpcClient>,
    strategies: StrategyRegistry,
    component_registry: ComponentRegistry,
    components: Mutex<HashMap<String, Box<dyn HostComponent>>>,
    workers: Mutex<HashMap<String, Arc<Mutex<Worker>>>>,
    exit_on_close: bool,
}

impl WorkerHost {
    /// Connect to the core, link the built-in registrations, and install
    /// the native endpoints.
    pub async fn connect(options: HostOptions) -> Result<Arc<Self>, KuixError> {
        let ipc = IpcClient::connect(
            &options.identifier,
            &options.auth_key,
            &options.host,
            options.port,
        )
        .await
        .map_err(|e| e.add_ctx(format!("worker host '{}' setup error", options.identifier)))?;

        let host = Arc::new(Self {
            identifier: options.identifier.clone(),
            ipc,
            strategies: StrategyRegistry::new(),
            component_registry: ComponentRegistry::new(),
            components: Mutex::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            exit_on_close: options.exit_on_close,
        });
        install_defaults(&host.strategies);
        Self::register_native_endpoints(&host);
        // Dispatch starts only now: the core can never race an endpoint
        // call ahead of the registrations above.
        host.ipc.start().await;
        info!(identifier = %host.identifier, "worker host ready");
        Ok(host)
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn ipc(&self) -> &Arc<IpcClient> {
        &self.ipc
    }

    /// Registries for linking user strategies and components before the
    /// core starts driving this host.
    pub fn strategies(&self) -> &StrategyRegistry {
        &self.strategies
    }

    pub fn component_registry(&self) -> &ComponentRegistry {
        &self.component_registry
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    /// Block until the connection to the core is gone.
    pub async fn wait_closed(&self) {
        self.ipc.wait_closed().await;
    }

    // --- call surface toward the core ---

    pub async fn send(&self, endpoint: &str, data: Value) -> Result<(), KuixError> {
        self.ipc.send(endpoint, data).await
    }

    pub async fn send_and_block(&self, endpoint: &str, data: Value) -> Result<Value, KuixError> {
        self.ipc.send_and_block(endpoint, data).await
    }

    pub async fn send_response(&self, endpoint: &str, data: Value, rid: Uuid) -> Result<(), KuixError> {
        self.ipc.send_response(endpoint, data, rid).await
    }

    /// Expose an endpoint to the core.
    pub fn register_endpoint<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.ipc.endpoints().register_endpoint(name, handler);
    }

    pub fn register_blocking_endpoint<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Responder, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.ipc.endpoints().register_blocking_endpoint(name, handler);
    }

    /// Expose an endpoint addressed to one worker; the wire-level handler
    /// routes on `data["worker_id"]`.
    pub fn register_worker_endpoint<F, Fut>(&self, name: impl Into<String>, worker_id: impl Into<String>, handler: F)
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.ipc.endpoints().register_routed_endpoint(name, worker_id, handler);
    }

    pub fn register_worker_blocking_endpoint<F, Fut>(
        &self,
        name: impl Into<String>,
        worker_id: impl Into<String>,
        handler: F,
    ) where
        F: Fn(Responder, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.ipc
            .endpoints()
            .register_routed_blocking_endpoint(name, worker_id, handler);
    }

    /// Routed registration with a custom key extractor.
    pub fn register_worker_endpoint_with<F, Fut>(
        &self,
        name: impl Into<String>,
        worker_id: impl Into<String>,
        extractor: RoutingKeyFn,
        handler: F,
    ) where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.ipc
            .endpoints()
            .register_routed_endpoint_with(name, worker_id, extractor, handler);
    }

    // --- native endpoints ---

    fn register_native_endpoints(host: &Arc<Self>) {
        Self::native_blocking(host, "register_strategy", |host, data| async move {
            host.handle_register_strategy(data)
        });
        Self::native_blocking(host, "add_component", |host, data| async move {
            host.handle_add_component(data)
        });
        Self::native_blocking(host, "create_worker", |host, data| async move {
            host.handle_create_worker(data).await
        });
        Self::native_blocking(host, "start_worker", |host, data| async move {
            host.handle_worker_op(data, WorkerOp::Start).await
        });
        Self::native_blocking(host, "stop_worker", |host, data| async move {
            host.handle_worker_op(data, WorkerOp::Stop).await
        });
        Self::native_blocking(host, "close_worker", |host, data| async move {
            host.handle_worker_op(data, WorkerOp::Close).await
        });

        let close_host = Arc::clone(host);
        host.ipc
            .endpoints()
            .register_blocking_endpoint("close_process", move |responder, _data| {
                let host = Arc::clone(&close_host);
                async move {
                    host.handle_close_process(responder).await;
                }
            });
    }

    /// Wire one blocking endpoint to a handler producing a reply.
    fn native_blocking<F, Fut>(host: &Arc<Self>, name: &'static str, handler: F)
    where
        F: Fn(Arc<Self>, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = EndpointReply> + Send + 'static,
    {
        let host = Arc::clone(host);
        let endpoints = Arc::clone(host.ipc.endpoints());
        endpoints.register_blocking_endpoint(name, move |responder, data| {
            let host = Arc::clone(&host);
            let reply = handler(host, data);
            async move {
                respond_or_log(responder, reply.await).await;
            }
        });
    }

    fn handle_register_strategy(&self, data: Value) -> EndpointReply {
        let request: RegisterStrategyRequest = match parse_request("register_strategy", data) {
            Ok(request) => request,
            Err(e) => return EndpointReply::error(e),
        };
        match self.strategies.activate(&request.name, &request.import_path) {
            Ok(()) => {
                trace!(host = %self.identifier, strategy = %request.name, "strategy registered");
                EndpointReply::success("registered")
            }
            Err(e) => EndpointReply::error(e.add_ctx(format!(
                "worker host '{}' register_strategy: unable to register strategy '{}'",
                self.identifier, request.name
            ))),
        }
    }

    fn handle_add_component(&self, data: Value) -> EndpointReply {
        let request: AddComponentRequest = match parse_request("add_component", data) {
            Ok(request) => request,
            Err(e) => return EndpointReply::error(e),
        };
        if self.components.lock().unwrap().contains_key(&request.name) {
            // Idempotent: broadcast re-delivery is expected.
            return EndpointReply::success("added");
        }
        match self
            .component_registry
            .build(&request.name, &request.import_path, request.config)
        {
            Ok(component) => {
                self.components.lock().unwrap().insert(request.name.clone(), component);
                trace!(host = %self.identifier, component = %request.name, "component added");
                EndpointReply::success("added")
            }
            Err(e) => EndpointReply::error(e.add_ctx(format!(
                "worker host '{}' add_component: unable to add component '{}'",
                self.identifier, request.name
            ))),
        }
    }

    async fn handle_create_worker(self: Arc<Self>, data: Value) -> EndpointReply {
        let request: CreateWorkerRequest = match parse_request("create_worker", data) {
            Ok(request) => request,
            Err(e) => return EndpointReply::error(e),
        };

        if self.workers.lock().unwrap().contains_key(&request.identifier) {
            return EndpointReply::error(KuixError::new(
                ErrorKind::WorkerAlreadyExistsError,
                format!(
                    "worker host '{}' create_worker: worker '{}' already exists",
                    self.identifier, request.identifier
                ),
            ));
        }

        let strategy = match self
            .strategies
            .build(&request.strategy_name, &request.identifier, request.config)
        {
            Ok(strategy) => strategy,
            Err(e) => {
                return EndpointReply::error(e.add_ctx(format!(
                    "worker host '{}' create_worker: unable to create worker '{}'",
                    self.identifier, request.identifier
                )))
            }
        };

        let mut worker = Worker::new(&request.identifier, &request.strategy_name, strategy);
        let opened = tokio::task::spawn_blocking(move || worker.open().map(|()| worker)).await;
        let worker = match opened {
            Ok(Ok(worker)) => worker,
            Ok(Err(e)) => {
                return EndpointReply::error(
                    KuixError::new(
                        ErrorKind::WorkerInitError,
                        format!(
                            "worker host '{}' create_worker: worker '{}' failed to init",
                            self.identifier, request.identifier
                        ),
                    )
                    .caused_by(e),
                )
            }
            Err(join) => return EndpointReply::error(panicked_op(&self.identifier, "create_worker", join)),
        };

        let mut workers = self.workers.lock().unwrap();
        if workers.contains_key(&request.identifier) {
            return EndpointReply::error(KuixError::new(
                ErrorKind::WorkerAlreadyExistsError,
                format!(
                    "worker host '{}' create_worker: worker '{}' already exists",
                    self.identifier, request.identifier
                ),
            ));
        }
        workers.insert(request.identifier.clone(), Arc::new(Mutex::new(worker)));
        trace!(host = %self.identifier, worker = %request.identifier, "worker created");
        EndpointReply::success("created")
    }

    async fn handle_worker_op(self: Arc<Self>, data: Value, op: WorkerOp) -> EndpointReply {
        let request: WorkerRequest = match parse_request(op.endpoint(), data) {
            Ok(request) => request,
            Err(e) => return EndpointReply::error(e),
        };

        let worker = {
            let workers = self.workers.lock().unwrap();
            match workers.get(&request.identifier) {
                Some(worker) => Arc::clone(worker),
                None => {
                    return EndpointReply::error(KuixError::new(
                        ErrorKind::WorkerNotFoundError,
                        format!(
                            "worker host '{}' {}: worker '{}' not found",
                            self.identifier,
                            op.endpoint(),
                            request.identifier
                        ),
                    ))
                }
            }
        };

        let run = Arc::clone(&worker);
        let result = tokio::task::spawn_blocking(move || {
            let mut worker = run.lock().unwrap();
            match op {
                WorkerOp::Start => worker.start(),
                WorkerOp::Stop => worker.stop(),
                WorkerOp::Close => worker.close(),
            }
        })
        .await;

        match result {
            Ok(Ok(())) => {
                if op == WorkerOp::Close {
                    self.workers.lock().unwrap().remove(&request.identifier);
                }
                trace!(
                    host = %self.identifier,
                    worker = %request.identifier,
                    outcome = op.past_tense(),
                    "worker operation done",
                );
                EndpointReply::success(op.past_tense())
            }
            Ok(Err(e)) => EndpointReply::error(
                KuixError::new(
                    ErrorKind::WorkerMethodCallError,
                    format!(
                        "worker host '{}' {}: worker '{}' failed to {}",
                        self.identifier,
                        op.endpoint(),
                        request.identifier,
                        op.verb()
                    ),
                )
                .caused_by(e),
            ),
            Err(join) => EndpointReply::error(panicked_op(&self.identifier, op.endpoint(), join)),
        }
    }

    /// Stop all workers, acknowledge, then tear the process down. The
    /// response goes out before the transport closes; the core is blocked
    /// on it.
    async fn handle_close_process(self: Arc<Self>, responder: Responder) {
        info!(host = %self.identifier, "closing worker host");

        let workers: Vec<(String, Arc<Mutex<Worker>>)> =
            self.workers.lock().unwrap().drain().collect();
        let host_id = self.identifier.clone();
        let closed = tokio::task::spawn_blocking(move || {
            for (id, worker) in workers {
                if let Err(e) = worker.lock().unwrap().close() {
                    error!(
                        host = %host_id,
                        worker = %id,
                        kind = %ErrorKind::WorkerMethodCallError,
                        error = %e,
                        "error while closing a worker during close_process",
                    );
                }
            }
        })
        .await;
        if let Err(e) = closed {
            error!(host = %self.identifier, error = %e, "worker teardown panicked during close_process");
        }

        let reply = EndpointReply::success("closed");
        if let Err(e) = responder.respond(reply.to_value()).await {
            error!(host = %self.identifier, error = %e, "failed to acknowledge close_process");
        }
        if let Err(e) = self.ipc.close().await {
            error!(host = %self.identifier, error = %e, "error while closing the control channel");
        }
        if self.exit_on_close {
            info!(host = %self.identifier, "terminating the process");
            std::process::exit(0);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerOp {
    Start,
    Stop,
    Close,
}

impl WorkerOp {
    fn endpoint(self) -> &'static str {
        match self {
            WorkerOp::Start => "start_worker",
            WorkerOp::Stop => "stop_worker",
            WorkerOp::Close => "close_worker",
        }
    }

    fn verb(self) -> &'static str {
        match self {
            WorkerOp::Start => "start",
            WorkerOp::Stop => "stop",
            WorkerOp::Close => "close",
        }
    }

    fn past_tense(self) -> &'static str {
        match self {
            WorkerOp::Start => "started",
            WorkerOp::Stop => "stopped",
            WorkerOp::Close => "closed",
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegisterStrategyRequest {
    name: String,
    import_path: String,
}

#[derive(Debug, Deserialize)]
struct AddComponentRequest {
    name: String,
    import_path: String,
    #[serde(default)]
    config: Value,
}

#[derive(Debug, Deserialize)]
struct CreateWorkerRequest {
    strategy_name: String,
    identifier: String,
    #[serde(default)]
    config: Value,
}

#[derive(Debug, Deserialize)]
struct WorkerRequest {
    identifier: String,
}

fn parse_request<T: DeserializeOwned>(endpoint: &str, data: Value) -> Result<T, KuixError> {
    serde_json::from_value(data).map_err(|e| {
        KuixError::wrap(
            ErrorKind::IpcRequestHandlerError,
            format!("malformed request data for endpoint '{endpoint}'"),
            e,
        )
    })
}

fn panicked_op(host: &str, endpoint: &str, join: tokio::task::JoinError) -> KuixError {
    KuixError::wrap(
        ErrorKind::WorkerMethodCallError,
        format!("worker host '{host}' {endpoint}: the operation panicked"),
        join,
    )
}

async fn respond_or_log(responder: Responder, reply: EndpointReply) {
    let endpoint = responder.endpoint().to_owned();
    if let Err(e) = responder.respond(reply.to_value()).await {
        error!(%endpoint, error = %e, "failed to send the endpoint response");
    }
}
