//! The strategy contract and the built-in debug strategy.
//!
//! A strategy is the body of a worker: a blocking loop running on its own
//! thread. The loop must call [`WorkerControl::check_status`] regularly and
//! return when it signals stop; that is the whole cooperative-stop
//! protocol.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use crate::component::ComponentSet;
use crate::worker::WorkerControl;

impl std::fmt::Debug for dyn Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Strategy").finish()
    }
}

pub trait Strategy: Send + 'static {
    /// The strategy's ordered components, if it has any. Lifecycle phases
    /// (open/start/stop/close) iterate them in insertion order.
    fn components(&mut self) -> Option<&mut ComponentSet> {
        None
    }

    /// The worker body. Runs on a dedicated thread; must poll
    /// `ctl.check_status()` and return when it yields false.
    fn strategy(&mut self, ctl: &WorkerControl);

    /// Invoked on the strategy thread once the loop observed the stop flag.
    fn stop_strategy(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Invoked when the worker closes for good.
    fn close_strategy(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Builds a worker's strategy instance from `(identifier, config)`.
pub trait StrategyFactory: Send + Sync {
    fn build(&self, identifier: &str, config: Value) -> anyhow::Result<Box<dyn Strategy>>;
}

impl<F> StrategyFactory for F
where
    F: Fn(&str, Value) -> anyhow::Result<Box<dyn Strategy>> + Send + Sync,
{
    fn build(&self, identifier: &str, config: Value) -> anyhow::Result<Box<dyn Strategy>> {
        self(identifier, config)
    }
}

/// Built-in strategy that ticks and logs; handy for wiring checks and used
/// throughout the test suite. Config: `{"tick_ms": <u64>}`, default 1000.
pub struct DebugStrategy {
    identifier: String,
    tick: Duration,
    components: ComponentSet,
}

impl DebugStrategy {
    pub const NAME: &'static str = "Debug";

    pub fn new(identifier: &str, config: Value) -> Self {
        let tick_ms = config.get("tick_ms").and_then(Value::as_u64).unwrap_or(1000);
        let mut components = ComponentSet::new();
        components.add("debug", DebugComponent);
        Self {
            identifier: identifier.to_owned(),
            tick: Duration::from_millis(tick_ms),
            components,
        }
    }
}

impl Strategy for DebugStrategy {
    fn components(&mut self) -> Option<&mut ComponentSet> {
        Some(&mut self.components)
    }

    fn strategy(&mut self, ctl: &WorkerControl) {
        while ctl.check_status() {
            debug!(worker = %self.identifier, "debug strategy running");
            std::thread::sleep(self.tick);
        }
    }

    fn stop_strategy(&mut self) -> anyhow::Result<()> {
        info!(worker = %self.identifier, "debug strategy stopping");
        Ok(())
    }

    fn close_strategy(&mut self) -> anyhow::Result<()> {
        info!(worker = %self.identifier, "debug strategy closing");
        Ok(())
    }
}

/// Component counterpart of [`DebugStrategy`]; logs every phase.
pub struct DebugComponent;

impl crate::component::StrategyComponent for DebugComponent {
    fn open(&mut self) -> anyhow::Result<()> {
        debug!("debug component opened");
        Ok(())
    }

    fn start(&mut self) -> anyhow::Result<()> {
        debug!("debug component started");
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        debug!("debug component stopped");
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        debug!("debug component closed");
        Ok(())
    }
}
