//! Name-addressed endpoint registry, shared by every connection of a peer.
//!
//! Two disjoint tables: one-way endpoints invoked with `(caller, data)` and
//! blocking endpoints invoked with `(responder, data)`, where the
//! [`Responder`] must be consumed exactly once. Routed endpoints install a
//! single wire-level dispatcher per name and fan out on a routing key
//! extracted from the request data (by default `data["worker_id"]`).
//!
//! The pending-request table lives here too: one entry per in-flight
//! blocking request, keyed by UUID, holding the oneshot that wakes the
//! caller when the response arrives.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;
use uuid::Uuid;

use crate::peer::Responder;

/// Routing key field read by the default extractor.
pub const ROUTING_KEY: &str = "worker_id";

pub type HandlerFuture = BoxFuture<'static, ()>;
pub type OneWayHandler = Arc<dyn Fn(String, Value) -> HandlerFuture + Send + Sync>;
pub type BlockingHandler = Arc<dyn Fn(Responder, Value) -> HandlerFuture + Send + Sync>;
pub type RoutingKeyFn = Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>;

pub fn default_routing_key() -> RoutingKeyFn {
    Arc::new(|data| {
        data.get(ROUTING_KEY)
            .and_then(Value::as_str)
            .map(str::to_owned)
    })
}

struct RouteTable<H> {
    extractor: RoutingKeyFn,
    routes: RwLock<HashMap<String, H>>,
}

impl<H> RouteTable<H> {
    fn new(extractor: RoutingKeyFn) -> Self {
        Self {
            extractor,
            routes: RwLock::new(HashMap::new()),
        }
    }
}

struct Pending {
    tx: oneshot::Sender<Value>,
    peer: String,
}

/// Endpoint and pending-request tables for one peer.
pub struct Endpoints {
    oneway: RwLock<HashMap<String, OneWayHandler>>,
    blocking: RwLock<HashMap<String, BlockingHandler>>,
    routed_oneway: RwLock<HashMap<String, Arc<RouteTable<OneWayHandler>>>>,
    routed_blocking: RwLock<HashMap<String, Arc<RouteTable<BlockingHandler>>>>,
    pending: Mutex<HashMap<Uuid, Pending>>,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            oneway: RwLock::new(HashMap::new()),
            blocking: RwLock::new(HashMap::new()),
            routed_oneway: RwLock::new(HashMap::new()),
            routed_blocking: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl Endpoints {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a one-way endpoint. A duplicate name overwrites the previous
    /// handler with a warning.
    pub fn register_endpoint<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let handler: OneWayHandler = Arc::new(move |caller, data| Box::pin(handler(caller, data)));
        self.install_oneway(name, handler);
    }

    /// Register a blocking endpoint. The handler must consume its
    /// [`Responder`] exactly once or the originating call hangs forever.
    pub fn register_blocking_endpoint<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Responder, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let handler: BlockingHandler =
            Arc::new(move |responder, data| Box::pin(handler(responder, data)));
        self.install_blocking(name, handler);
    }

    /// Register a one-way endpoint addressed to a specific routing key. The
    /// first registration of a name installs the wire-level dispatcher and
    /// fixes the key extractor; later registrations only add routes.
    pub fn register_routed_endpoint<F, Fut>(
        &self,
        name: impl Into<String>,
        key: impl Into<String>,
        handler: F,
    ) where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register_routed_endpoint_with(name, key, default_routing_key(), handler)
    }

    pub fn register_routed_endpoint_with<F, Fut>(
        &self,
        name: impl Into<String>,
        key: impl Into<String>,
        extractor: RoutingKeyFn,
        handler: F,
    ) where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let key = key.into();
        let handler: OneWayHandler = Arc::new(move |caller, data| Box::pin(handler(caller, data)));

        let table = {
            let mut routed = self.routed_oneway.write().unwrap();
            match routed.get(&name) {
                Some(table) => Arc::clone(table),
                None => {
                    let table = Arc::new(RouteTable::new(extractor));
                    routed.insert(name.clone(), Arc::clone(&table));
                    self.install_oneway(name.clone(), oneway_dispatcher(name.clone(), Arc::clone(&table)));
                    table
                }
            }
        };
        if table.routes.write().unwrap().insert(key.clone(), handler).is_some() {
            warn!(
                endpoint = %name, %key,
                "routed endpoint already registered for this key; the previous handler was overwritten",
            );
        }
    }

    /// Blocking counterpart of [`register_routed_endpoint`].
    ///
    /// [`register_routed_endpoint`]: Endpoints::register_routed_endpoint
    pub fn register_routed_blocking_endpoint<F, Fut>(
        &self,
        name: impl Into<String>,
        key: impl Into<String>,
        handler: F,
    ) where
        F: Fn(Responder, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register_routed_blocking_endpoint_with(name, key, default_routing_key(), handler)
    }

    pub fn register_routed_blocking_endpoint_with<F, Fut>(
        &self,
        name: impl Into<String>,
        key: impl Into<String>,
        extractor: RoutingKeyFn,
        handler: F,
    ) where
        F: Fn(Responder, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let key = key.into();
        let handler: BlockingHandler =
            Arc::new(move |responder, data| Box::pin(handler(responder, data)));

        let table = {
            let mut routed = self.routed_blocking.write().unwrap();
            match routed.get(&name) {
                Some(table) => Arc::clone(table),
                None => {
                    let table = Arc::new(RouteTable::new(extractor));
                    routed.insert(name.clone(), Arc::clone(&table));
                    self.install_blocking(
                        name.clone(),
                        blocking_dispatcher(name.clone(), Arc::clone(&table)),
                    );
                    table
                }
            }
        };
        if table.routes.write().unwrap().insert(key.clone(), handler).is_some() {
            warn!(
                endpoint = %name, %key,
                "routed blocking endpoint already registered for this key; the previous handler was overwritten",
            );
        }
    }

    fn install_oneway(&self, name: String, handler: OneWayHandler) {
        if self
            .oneway
            .write()
            .unwrap()
            .insert(name.clone(), handler)
            .is_some()
        {
            warn!(
                endpoint = %name,
                "endpoint already registered; the previous handler was overwritten",
            );
        }
    }

    fn install_blocking(&self, name: String, handler: BlockingHandler) {
        if self
            .blocking
            .write()
            .unwrap()
            .insert(name.clone(), handler)
            .is_some()
        {
            warn!(
                endpoint = %name,
                "blocking endpoint already registered; the previous handler was overwritten",
            );
        }
    }

    pub(crate) fn oneway_handler(&self, name: &str) -> Option<OneWayHandler> {
        self.oneway.read().unwrap().get(name).cloned()
    }

    pub(crate) fn blocking_handler(&self, name: &str) -> Option<BlockingHandler> {
        self.blocking.read().unwrap().get(name).cloned()
    }

    // --- pending blocking requests ---

    /// Insert before send so a response can never beat its registration.
    pub(crate) fn insert_pending(&self, rid: Uuid, peer: &str) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            rid,
            Pending {
                tx,
                peer: peer.to_owned(),
            },
        );
        rx
    }

    /// Wake the waiter for `rid`. Returns the data back when the id is
    /// unknown so the caller can retry.
    pub(crate) fn complete_pending(&self, rid: Uuid, data: Value) -> Option<Value> {
        let entry = self.pending.lock().unwrap().remove(&rid);
        match entry {
            Some(pending) => {
                // A dropped receiver means the caller went away; nothing to do.
                let _ = pending.tx.send(data);
                None
            }
            None => Some(data),
        }
    }

    pub(crate) fn remove_pending(&self, rid: Uuid) {
        self.pending.lock().unwrap().remove(&rid);
    }

    /// Fail every in-flight request sent over a now-closed connection.
    pub(crate) fn fail_pending_for(&self, peer: &str) {
        let mut pending = self.pending.lock().unwrap();
        pending.retain(|_, entry| entry.peer != peer);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

fn oneway_dispatcher(name: String, table: Arc<RouteTable<OneWayHandler>>) -> OneWayHandler {
    Arc::new(move |caller, data| {
        let name = name.clone();
        let table = Arc::clone(&table);
        Box::pin(async move {
            let Some(key) = (table.extractor)(&data) else {
                warn!(endpoint = %name, "routed request carries no routing key; dropped");
                return;
            };
            let handler = table.routes.read().unwrap().get(&key).cloned();
            match handler {
                Some(handler) => handler(caller, data).await,
                None => warn!(endpoint = %name, %key, "routed request for unknown worker; dropped"),
            }
        })
    })
}

fn blocking_dispatcher(name: String, table: Arc<RouteTable<BlockingHandler>>) -> BlockingHandler {
    Arc::new(move |responder, data| {
        let name = name.clone();
        let table = Arc::clone(&table);
        Box::pin(async move {
            let Some(key) = (table.extractor)(&data) else {
                warn!(endpoint = %name, "routed blocking request carries no routing key; dropped");
                return;
            };
            let handler = table.routes.read().unwrap().get(&key).cloned();
            match handler {
                Some(handler) => handler(responder, data).await,
                None => {
                    warn!(endpoint = %name, %key, "routed blocking request for unknown worker; dropped");
                }
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_insert_complete_removes_entry() {
        let endpoints = Endpoints::new();
        let rid = Uuid::new_v4();
        let rx = endpoints.insert_pending(rid, "C1");
        assert_eq!(endpoints.pending_count(), 1);

        assert!(endpoints
            .complete_pending(rid, serde_json::json!({"ok": true}))
            .is_none());
        assert_eq!(endpoints.pending_count(), 0);
        assert_eq!(rx.blocking_recv().unwrap()["ok"], true);
    }

    #[test]
    fn unknown_rid_returns_data() {
        let endpoints = Endpoints::new();
        let data = serde_json::json!({"orphan": 1});
        let back = endpoints.complete_pending(Uuid::new_v4(), data.clone());
        assert_eq!(back, Some(data));
    }

    #[test]
    fn fail_pending_is_per_peer() {
        let endpoints = Endpoints::new();
        let rid_a = Uuid::new_v4();
        let rid_b = Uuid::new_v4();
        let rx_a = endpoints.insert_pending(rid_a, "A");
        let _rx_b = endpoints.insert_pending(rid_b, "B");

        endpoints.fail_pending_for("A");
        assert_eq!(endpoints.pending_count(), 1);
        assert!(rx_a.blocking_recv().is_err());
        assert!(endpoints
            .complete_pending(rid_b, serde_json::Value::Null)
            .is_none());
    }

    #[test]
    fn default_key_reads_worker_id() {
        let extractor = default_routing_key();
        assert_eq!(
            extractor(&serde_json::json!({"worker_id": "W1", "x": 1})),
            Some("W1".to_owned())
        );
        assert_eq!(extractor(&serde_json::json!({"x": 1})), None);
    }
}
