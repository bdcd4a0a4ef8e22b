//! Integration tests for the control channel over real loopback sockets:
//! authentication, request/response correlation, peer symmetry, routed
//! endpoints, and shutdown behavior.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::timeout;

use kuix_proto::{IpcClient, IpcServer, ServerEvent};

const KEY: &str = "k";

async fn start_server() -> Arc<IpcServer> {
    let server = IpcServer::bind(KEY, "127.0.0.1", 0).await.unwrap();
    server.start().await;
    server
}

async fn connect(server: &IpcServer, identifier: &str) -> Arc<IpcClient> {
    let client = IpcClient::connect(identifier, KEY, "127.0.0.1", server.local_addr().port())
        .await
        .unwrap();
    client.start().await;
    client
}

/// Wait for a specific event, ignoring the others.
async fn expect_event<F>(rx: &mut broadcast::Receiver<ServerEvent>, mut pred: F) -> ServerEvent
where
    F: FnMut(&ServerEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not observed in time")
}

#[tokio::test]
async fn handshake_accepts_valid_key() {
    let server = start_server().await;
    let mut events = server.subscribe();

    let _client = connect(&server, "C1").await;

    expect_event(&mut events, |e| {
        matches!(e, ServerEvent::ConnectionAccepted { identifier } if identifier == "C1")
    })
    .await;
    assert!(server.is_connected("C1").await);
}

#[tokio::test]
async fn handshake_refuses_invalid_key() {
    let server = start_server().await;
    let mut events = server.subscribe();

    let result = IpcClient::connect("C1", "wrong", "127.0.0.1", server.local_addr().port()).await;
    assert!(result.is_err());
    assert!(result
        .unwrap_err()
        .is(kuix_proto::ErrorKind::SocketClientConnectionError));

    expect_event(&mut events, |e| {
        matches!(e, ServerEvent::ConnectionRefused { identifier } if identifier == "C1")
    })
    .await;
    assert!(!server.is_connected("C1").await);
}

#[tokio::test]
async fn duplicate_identifier_refused() {
    let server = start_server().await;
    let _first = connect(&server, "C1").await;

    let second = IpcClient::connect("C1", KEY, "127.0.0.1", server.local_addr().port()).await;
    assert!(second.is_err());

    // The first connection survives.
    assert!(server.is_connected("C1").await);
    assert_eq!(server.connected().await.len(), 1);
}

#[tokio::test]
async fn blocking_echo_roundtrip() {
    let server = start_server().await;
    let client = connect(&server, "C1").await;

    client.endpoints().register_blocking_endpoint("echo", |responder, data| async move {
        let reply = json!({"pong": data["ping"]});
        responder.respond(reply).await.unwrap();
    });

    let response = server
        .send_and_block("C1", "echo", json!({"ping": 42}))
        .await
        .unwrap();
    assert_eq!(response, json!({"pong": 42}));

    // No pending-table leak on either side.
    assert_eq!(server.endpoints().pending_count(), 0);
    assert_eq!(client.endpoints().pending_count(), 0);
}

#[tokio::test]
async fn blocking_call_is_symmetric() {
    let server = start_server().await;
    let client = connect(&server, "C1").await;

    server.endpoints().register_blocking_endpoint("sum", |responder, data| async move {
        let a = data["a"].as_i64().unwrap();
        let b = data["b"].as_i64().unwrap();
        responder.respond(json!({"sum": a + b})).await.unwrap();
    });

    // Host-to-core direction.
    let response = client.send_and_block("sum", json!({"a": 2, "b": 40})).await.unwrap();
    assert_eq!(response["sum"], 42);
    assert_eq!(client.endpoints().pending_count(), 0);
}

#[tokio::test]
async fn unknown_blocking_endpoint_hangs_the_caller() {
    let server = start_server().await;
    let _client = connect(&server, "C1").await;

    // The receiver logs UnknownEndpoint and drops; the call never returns.
    let hung = timeout(
        Duration::from_secs(2),
        server.send_and_block("C1", "nope", json!({})),
    )
    .await;
    assert!(hung.is_err(), "call to an unknown endpoint must hang");
}

#[tokio::test]
async fn fire_and_forget_both_directions() {
    let server = start_server().await;

    let (core_tx, mut core_rx) = tokio::sync::mpsc::channel::<(String, serde_json::Value)>(8);
    server.endpoints().register_endpoint("notify", move |caller, data| {
        let tx = core_tx.clone();
        async move {
            tx.send((caller, data)).await.unwrap();
        }
    });

    let client = connect(&server, "C1").await;
    let (host_tx, mut host_rx) = tokio::sync::mpsc::channel::<serde_json::Value>(8);
    client.endpoints().register_endpoint("poke", move |_caller, data| {
        let tx = host_tx.clone();
        async move {
            tx.send(data).await.unwrap();
        }
    });

    client.send("notify", json!({"n": 1})).await.unwrap();
    let (caller, data) = timeout(Duration::from_secs(5), core_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(caller, "C1");
    assert_eq!(data["n"], 1);

    server.send("C1", "poke", json!({"n": 2})).await.unwrap();
    let data = timeout(Duration::from_secs(5), host_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(data["n"], 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_blocking_requests_correlate() {
    let server = start_server().await;
    let client = connect(&server, "C1").await;

    client.endpoints().register_blocking_endpoint("double", |responder, data| async move {
        // Shuffle completion order a little.
        let n = data["n"].as_u64().unwrap();
        tokio::time::sleep(Duration::from_millis(50 - n % 50)).await;
        responder.respond(json!({"doubled": n * 2})).await.unwrap();
    });

    let mut tasks = Vec::new();
    for n in 0u64..32 {
        let server = Arc::clone(&server);
        tasks.push(tokio::spawn(async move {
            let response = server
                .send_and_block("C1", "double", json!({"n": n}))
                .await
                .unwrap();
            assert_eq!(response["doubled"], n * 2);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(server.endpoints().pending_count(), 0);
}

#[tokio::test]
async fn routed_blocking_endpoint_dispatches_by_worker() {
    let server = start_server().await;
    let client = connect(&server, "C1").await;

    for worker in ["W1", "W2"] {
        let who = worker.to_owned();
        client
            .endpoints()
            .register_routed_blocking_endpoint("whoami", worker, move |responder, _data| {
                let who = who.clone();
                async move {
                    responder.respond(json!({"worker": who})).await.unwrap();
                }
            });
    }

    let response = server
        .send_and_block("C1", "whoami", json!({"worker_id": "W2"}))
        .await
        .unwrap();
    assert_eq!(response["worker"], "W2");

    let response = server
        .send_and_block("C1", "whoami", json!({"worker_id": "W1"}))
        .await
        .unwrap();
    assert_eq!(response["worker"], "W1");

    // Unknown worker id is dropped; the call hangs at the caller.
    let hung = timeout(
        Duration::from_secs(1),
        server.send_and_block("C1", "whoami", json!({"worker_id": "W9"})),
    )
    .await;
    assert!(hung.is_err());
}

#[tokio::test]
async fn client_close_notifies_server() {
    let server = start_server().await;
    let mut events = server.subscribe();
    let client = connect(&server, "C1").await;

    client.close().await.unwrap();

    let event = expect_event(&mut events, |e| {
        matches!(e, ServerEvent::ConnectionClosed { identifier, .. } if identifier == "C1")
    })
    .await;
    match event {
        ServerEvent::ConnectionClosed { from_server, .. } => assert!(!from_server),
        _ => unreachable!(),
    }
    assert!(!server.is_connected("C1").await);
}

#[tokio::test]
async fn server_close_fails_in_flight_requests() {
    let server = start_server().await;
    let client = connect(&server, "C1").await;

    // An endpoint that never answers keeps the request pending.
    client
        .endpoints()
        .register_blocking_endpoint("black-hole", |responder, _data| async move {
            // Keep the responder alive long enough for close() to win.
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(responder);
        });

    let call = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.send_and_block("C1", "black-hole", json!({})).await })
    };
    // Let the request get registered before closing.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.endpoints().pending_count(), 1);

    server.close().await;

    let result = timeout(Duration::from_secs(5), call).await.unwrap().unwrap();
    assert!(result.is_err(), "pending requests fail when the server closes");
    assert_eq!(server.endpoints().pending_count(), 0);
}

#[tokio::test]
async fn server_close_fires_closed_event_once() {
    let server = start_server().await;
    let mut events = server.subscribe();
    let _client = connect(&server, "C1").await;

    server.close().await;
    server.close().await;

    expect_event(&mut events, |e| matches!(e, ServerEvent::ServerClosed)).await;
    // A second ServerClosed must not arrive.
    let extra = timeout(Duration::from_millis(300), async {
        loop {
            match events.recv().await {
                Ok(ServerEvent::ServerClosed) => break,
                Ok(_) => continue,
                Err(_) => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    assert!(extra.is_err(), "ServerClosed fired twice");
}
