//! Connected worker-host tracking.
//!
//! One record per authenticated host connection, keyed by identifier. The
//! record also carries which strategies have been successfully pushed to
//! that host, which is how the core keeps its broadcast invariant
//! observable.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::RwLock;
use tracing::info;

/// Information about one connected worker host.
#[derive(Debug, Clone)]
pub struct HostRecord {
    pub identifier: String,
    pub connected_at: Instant,
    /// Strategies confirmed registered on this host, in push order.
    pub registered_strategies: Vec<String>,
}

impl HostRecord {
    fn new(identifier: String) -> Self {
        Self {
            identifier,
            connected_at: Instant::now(),
            registered_strategies: Vec::new(),
        }
    }
}

/// Tracks connected worker hosts.
#[derive(Debug, Default)]
pub struct ProcessTracker {
    hosts: RwLock<HashMap<String, HostRecord>>,
}

impl ProcessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly authenticated host.
    pub async fn register(&self, identifier: &str) {
        let mut hosts = self.hosts.write().await;
        if hosts.contains_key(identifier) {
            // The server refuses duplicate identifiers; reaching this means
            // a stale record survived a reconnect race.
            info!(%identifier, "host re-registered");
        } else {
            info!(%identifier, "host registered");
        }
        hosts.insert(identifier.to_owned(), HostRecord::new(identifier.to_owned()));
    }

    pub async fn remove(&self, identifier: &str) {
        if self.hosts.write().await.remove(identifier).is_some() {
            info!(%identifier, "host removed");
        }
    }

    pub async fn contains(&self, identifier: &str) -> bool {
        self.hosts.read().await.contains_key(identifier)
    }

    pub async fn count(&self) -> usize {
        self.hosts.read().await.len()
    }

    pub async fn identifiers(&self) -> Vec<String> {
        self.hosts.read().await.keys().cloned().collect()
    }

    /// Record a successful strategy push.
    pub async fn mark_strategy(&self, identifier: &str, strategy: &str) {
        let mut hosts = self.hosts.write().await;
        if let Some(record) = hosts.get_mut(identifier) {
            if !record.registered_strategies.iter().any(|s| s == strategy) {
                record.registered_strategies.push(strategy.to_owned());
            }
        }
    }

    pub async fn strategies_of(&self, identifier: &str) -> Option<Vec<String>> {
        self.hosts
            .read()
            .await
            .get(identifier)
            .map(|record| record.registered_strategies.clone())
    }

    /// Summary for diagnostics.
    pub async fn summary(&self) -> serde_json::Value {
        let hosts = self.hosts.read().await;
        let now = Instant::now();
        let list: Vec<_> = hosts
            .values()
            .map(|record| {
                serde_json::json!({
                    "identifier": record.identifier,
                    "connected_secs": now.duration_since(record.connected_at).as_secs(),
                    "registered_strategies": record.registered_strategies,
                })
            })
            .collect();
        serde_json::json!({
            "count": hosts.len(),
            "hosts": list,
        })
    }
}
