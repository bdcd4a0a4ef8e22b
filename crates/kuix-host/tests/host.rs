//! Integration tests driving a worker host through its native endpoints,
//! the way the core does: over a real loopback control channel.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::timeout;

use kuix_host::{ComponentSet, HostOptions, Strategy, StrategyComponent, WorkerControl, WorkerHost};
use kuix_proto::{EndpointReply, ErrorKind, IpcServer, KuixError, ServerEvent};

const KEY: &str = "k";
const HOST_ID: &str = "H1";

async fn start_pair() -> (Arc<IpcServer>, Arc<WorkerHost>) {
    let server = IpcServer::bind(KEY, "127.0.0.1", 0).await.unwrap();
    server.start().await;

    let options = HostOptions::new(HOST_ID, KEY, "127.0.0.1", server.local_addr().port());
    let host = WorkerHost::connect(options).await.unwrap();
    (server, host)
}

/// Call a native endpoint and unwrap the `{"status", "return"}` contract.
async fn call(server: &IpcServer, endpoint: &str, data: Value) -> Result<Value, KuixError> {
    let response = timeout(
        Duration::from_secs(10),
        server.send_and_block(HOST_ID, endpoint, data),
    )
    .await
    .expect("endpoint did not answer")
    .unwrap();
    EndpointReply::from_value(response).unwrap().into_result()
}

/// A strategy whose component blows up during the requested phase.
struct ExplodingStrategy {
    components: ComponentSet,
}

struct ExplodingComponent {
    fail_on: String,
}

impl StrategyComponent for ExplodingComponent {
    fn start(&mut self) -> anyhow::Result<()> {
        if self.fail_on == "start" {
            anyhow::bail!("boom");
        }
        Ok(())
    }
}

impl Strategy for ExplodingStrategy {
    fn components(&mut self) -> Option<&mut ComponentSet> {
        Some(&mut self.components)
    }

    fn strategy(&mut self, ctl: &WorkerControl) {
        while ctl.check_status() {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

fn link_exploding(host: &WorkerHost) {
    host.strategies().link(
        "Exploding",
        |_id: &str, config: Value| -> anyhow::Result<Box<dyn Strategy>> {
            let fail_on = config
                .get("fail_on")
                .and_then(Value::as_str)
                .unwrap_or("start")
                .to_owned();
            let mut components = ComponentSet::new();
            components.add("exploding", ExplodingComponent { fail_on });
            Ok(Box::new(ExplodingStrategy { components }))
        },
    );
}

#[tokio::test]
async fn full_worker_lifecycle_over_ipc() {
    let (server, host) = start_pair().await;

    let result = call(
        &server,
        "register_strategy",
        json!({"name": "Debug", "import_path": "/strategies/Debug.py"}),
    )
    .await
    .unwrap();
    assert_eq!(result, "registered");

    let result = call(
        &server,
        "create_worker",
        json!({"strategy_name": "Debug", "identifier": "W1", "config": {"tick_ms": 20}}),
    )
    .await
    .unwrap();
    assert_eq!(result, "created");
    assert_eq!(host.worker_count(), 1);

    assert_eq!(
        call(&server, "start_worker", json!({"identifier": "W1"})).await.unwrap(),
        "started"
    );

    // Let the strategy loop tick a little before stopping it.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        call(&server, "stop_worker", json!({"identifier": "W1"})).await.unwrap(),
        "stopped"
    );
    assert_eq!(
        call(&server, "close_worker", json!({"identifier": "W1"})).await.unwrap(),
        "closed"
    );
    assert_eq!(host.worker_count(), 0);

    // The record is gone; a fresh start must fail with WorkerNotFound.
    let err = call(&server, "start_worker", json!({"identifier": "W1"}))
        .await
        .unwrap_err();
    assert!(err.is(ErrorKind::WorkerNotFoundError));
}

#[tokio::test]
async fn duplicate_worker_identifier_is_rejected() {
    let (server, _host) = start_pair().await;

    call(
        &server,
        "register_strategy",
        json!({"name": "Debug", "import_path": "/strategies/Debug.py"}),
    )
    .await
    .unwrap();

    let create = json!({"strategy_name": "Debug", "identifier": "W1", "config": {}});
    call(&server, "create_worker", create.clone()).await.unwrap();

    let err = call(&server, "create_worker", create).await.unwrap_err();
    assert!(err.is(ErrorKind::WorkerAlreadyExistsError));
    assert!(err.chain_contains("W1"));
}

#[tokio::test]
async fn unknown_strategy_and_unlinked_strategy() {
    let (server, _host) = start_pair().await;

    // Not linked into the binary at all: the loader fails the import.
    let err = call(
        &server,
        "register_strategy",
        json!({"name": "Ghost", "import_path": "/strategies/Ghost.py"}),
    )
    .await
    .unwrap_err();
    assert!(err.is(ErrorKind::StrategyImportError));

    // Linked but never registered: worker creation cannot find it.
    let err = call(
        &server,
        "create_worker",
        json!({"strategy_name": "Debug", "identifier": "W1", "config": {}}),
    )
    .await
    .unwrap_err();
    assert!(err.is(ErrorKind::StrategyNotFoundError));
}

#[tokio::test]
async fn start_failure_propagates_the_cause() {
    let (server, host) = start_pair().await;
    link_exploding(&host);

    call(
        &server,
        "register_strategy",
        json!({"name": "Exploding", "import_path": "/strategies/Exploding.py"}),
    )
    .await
    .unwrap();
    call(
        &server,
        "create_worker",
        json!({"strategy_name": "Exploding", "identifier": "W1", "config": {"fail_on": "start"}}),
    )
    .await
    .unwrap();

    let err = call(&server, "start_worker", json!({"identifier": "W1"}))
        .await
        .unwrap_err();
    assert!(err.is(ErrorKind::WorkerMethodCallError));
    assert!(err.chain_contains("boom"), "original cause must survive the wire");
    assert!(
        err.message().contains("worker 'W1' failed to start"),
        "the phase note names the worker and the operation: {}",
        err.message()
    );
    assert!(err.message().contains(HOST_ID));
}

#[tokio::test]
async fn worker_init_failure_is_typed() {
    let (server, host) = start_pair().await;
    host.strategies().link(
        "Broken",
        |_id: &str, _config: Value| -> anyhow::Result<Box<dyn Strategy>> {
            anyhow::bail!("ctor exploded")
        },
    );

    call(
        &server,
        "register_strategy",
        json!({"name": "Broken", "import_path": "/strategies/Broken.py"}),
    )
    .await
    .unwrap();

    let err = call(
        &server,
        "create_worker",
        json!({"strategy_name": "Broken", "identifier": "W1", "config": {}}),
    )
    .await
    .unwrap_err();
    assert!(err.is(ErrorKind::WorkerInitError));
    assert!(err.chain_contains("ctor exploded"));
}

#[tokio::test]
async fn add_component_is_idempotent() {
    let (server, host) = start_pair().await;

    struct Noop;
    impl kuix_host::HostComponent for Noop {}
    host.component_registry().link(
        "Noop",
        |_config: Value| -> anyhow::Result<Box<dyn kuix_host::HostComponent>> { Ok(Box::new(Noop)) },
    );

    let add = json!({"name": "Noop", "import_path": "/components/Noop.py", "config": {}});
    assert_eq!(call(&server, "add_component", add.clone()).await.unwrap(), "added");
    assert_eq!(call(&server, "add_component", add).await.unwrap(), "added");

    let err = call(
        &server,
        "add_component",
        json!({"name": "Ghost", "import_path": "/components/Ghost.py", "config": {}}),
    )
    .await
    .unwrap_err();
    assert!(err.is(ErrorKind::ComponentImportError));
}

#[tokio::test]
async fn close_process_acknowledges_before_disconnecting() {
    let (server, host) = start_pair().await;
    let mut events = server.subscribe();

    call(
        &server,
        "register_strategy",
        json!({"name": "Debug", "import_path": "/strategies/Debug.py"}),
    )
    .await
    .unwrap();
    call(
        &server,
        "create_worker",
        json!({"strategy_name": "Debug", "identifier": "W1", "config": {"tick_ms": 20}}),
    )
    .await
    .unwrap();
    call(&server, "start_worker", json!({"identifier": "W1"})).await.unwrap();

    // The acknowledgement must arrive; only afterwards does the host drop
    // the connection.
    let result = call(&server, "close_process", json!({})).await.unwrap();
    assert_eq!(result, "closed");
    assert_eq!(host.worker_count(), 0);

    let closed = timeout(Duration::from_secs(5), async {
        loop {
            if let ServerEvent::ConnectionClosed { identifier, .. } = events.recv().await.unwrap() {
                if identifier == HOST_ID {
                    return;
                }
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "the host must disconnect after acknowledging");
}
