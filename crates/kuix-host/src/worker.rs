//! Worker runtime: the status state machine and the lifecycle driving a
//! strategy thread.
//!
//! A worker moves through `Stopped -> Starting -> Running -> Stopping ->
//! Stopped`. `Stopped` implies no live thread; the other three imply one.
//! Stop is cooperative: the flag flips to `Stopping` and the strategy loop
//! is expected to observe it via `check_status` and return. The stop call
//! polls at 100 ms, warns at 60 s, and gives up with a timeout error at
//! 600 s (discarding the thread handle; the thread may still be running,
//! which is documented user error).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use kuix_proto::{ErrorKind, KuixError};
use tracing::{debug, error, warn};

use crate::strategy::Strategy;

const STOP_POLL: Duration = Duration::from_millis(100);
const STOP_WARN_AFTER: Duration = Duration::from_secs(60);
const STOP_FAIL_AFTER: Duration = Duration::from_secs(600);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl WorkerStatus {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerStatus::Starting,
            2 => WorkerStatus::Running,
            3 => WorkerStatus::Stopping,
            _ => WorkerStatus::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Starting => "starting",
            WorkerStatus::Running => "running",
            WorkerStatus::Stopping => "stopping",
        }
    }
}

/// Shared status cell, written by the lifecycle and the strategy thread.
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU8::new(WorkerStatus::Stopped as u8)))
    }

    pub fn get(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, status: WorkerStatus) {
        self.0.store(status as u8, Ordering::SeqCst);
    }
}

/// Handle given to the strategy loop for cooperative stop.
pub struct WorkerControl {
    status: Arc<StatusCell>,
}

impl WorkerControl {
    /// Poll this from the strategy loop. Returns false once the worker has
    /// been scheduled to stop; the loop must then return.
    pub fn check_status(&self) -> bool {
        self.status.get() != WorkerStatus::Stopping
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.get()
    }
}

/// Transitions to `Stopped` when the strategy thread exits, even if the
/// strategy panicked, so a stop never spins on a dead thread.
struct StatusGuard(Arc<StatusCell>);

impl Drop for StatusGuard {
    fn drop(&mut self) {
        self.0.set(WorkerStatus::Stopped);
    }
}

/// One worker: a strategy instance plus its thread and status.
pub struct Worker {
    identifier: String,
    strategy_name: String,
    status: Arc<StatusCell>,
    /// Present while the worker is at rest; moved into the thread while
    /// running.
    strategy: Option<Box<dyn Strategy>>,
    thread: Option<JoinHandle<Box<dyn Strategy>>>,
}

impl Worker {
    pub fn new(identifier: impl Into<String>, strategy_name: impl Into<String>, strategy: Box<dyn Strategy>) -> Self {
        Self {
            identifier: identifier.into(),
            strategy_name: strategy_name.into(),
            status: StatusCell::new(),
            strategy: Some(strategy),
            thread: None,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn strategy_name(&self) -> &str {
        &self.strategy_name
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.get()
    }

    /// Open the strategy's components, in insertion order. Called once
    /// before the first start.
    pub fn open(&mut self) -> Result<(), KuixError> {
        let Some(strategy) = self.strategy.as_mut() else {
            return Ok(());
        };
        component_phase(
            &mut **strategy,
            ErrorKind::StrategyComponentOpeningError,
            "opening",
            |c| c.open(),
        )
    }

    /// Start components, then launch the strategy thread.
    pub fn start(&mut self) -> Result<(), KuixError> {
        if self.thread.is_some() {
            return Err(KuixError::new(
                ErrorKind::WorkerAlreadyStarted,
                format!("worker '{}' is already started or still running", self.identifier),
            ));
        }
        let Some(mut strategy) = self.strategy.take() else {
            return Err(KuixError::new(
                ErrorKind::WorkerMethodCallError,
                format!("worker '{}' has no strategy instance left", self.identifier),
            ));
        };

        if let Err(e) = component_phase(
            &mut *strategy,
            ErrorKind::StrategyComponentStartingError,
            "starting",
            |c| c.start(),
        ) {
            self.strategy = Some(strategy);
            return Err(e);
        }

        self.status.set(WorkerStatus::Starting);
        let status = Arc::clone(&self.status);
        let identifier = self.identifier.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("strategy-{}", self.identifier))
            .spawn(move || {
                let _guard = StatusGuard(Arc::clone(&status));
                let ctl = WorkerControl {
                    status: Arc::clone(&status),
                };
                strategy.strategy(&ctl);
                if status.get() == WorkerStatus::Stopping {
                    if let Err(e) = strategy.stop_strategy() {
                        error!(worker = %identifier, error = %e, "stop hook failed");
                    }
                }
                strategy
            });
        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                self.status.set(WorkerStatus::Running);
                debug!(worker = %self.identifier, "worker started");
                Ok(())
            }
            Err(e) => {
                self.status.set(WorkerStatus::Stopped);
                Err(KuixError::wrap(
                    ErrorKind::WorkerMethodCallError,
                    format!("failed to spawn the strategy thread of worker '{}'", self.identifier),
                    e,
                ))
            }
        }
    }

    /// Flip the stop flag and wait for the strategy loop to observe it,
    /// then stop components.
    pub fn stop(&mut self) -> Result<(), KuixError> {
        if self.thread.is_none() {
            return Err(KuixError::new(
                ErrorKind::WorkerAlreadyStopped,
                format!("worker '{}' is already stopped", self.identifier),
            ));
        }
        self.status.set(WorkerStatus::Stopping);

        let mut waited = Duration::ZERO;
        let mut warned = false;
        while !self.thread.as_ref().is_some_and(|h| h.is_finished()) {
            if waited >= STOP_FAIL_AFTER {
                // The handle is discarded but the thread may still run.
                self.thread = None;
                return Err(KuixError::new(
                    ErrorKind::WorkerStoppingTimeout,
                    format!(
                        "worker '{}' was scheduled to stop but is still running after 10 minutes; \
                         the thread handle is discarded but the thread may still be alive. \
                         Add check_status calls to the strategy loop",
                        self.identifier
                    ),
                ));
            }
            if waited >= STOP_WARN_AFTER && !warned {
                warn!(
                    worker = %self.identifier,
                    "worker was scheduled to stop but is still running after 60 seconds; \
                     add check_status calls to the strategy loop",
                );
                warned = true;
            }
            std::thread::sleep(STOP_POLL);
            waited += STOP_POLL;
        }

        let handle = self.thread.take().expect("checked above");
        let joined = handle.join();
        self.status.set(WorkerStatus::Stopped);
        match joined {
            Ok(strategy) => self.strategy = Some(strategy),
            Err(_) => {
                return Err(KuixError::new(
                    ErrorKind::WorkerStoppingError,
                    format!("the strategy thread of worker '{}' panicked", self.identifier),
                ));
            }
        }

        if let Some(strategy) = self.strategy.as_mut() {
            component_phase(
                &mut **strategy,
                ErrorKind::StrategyComponentStoppingError,
                "stopping",
                |c| c.stop(),
            )?;
        }
        debug!(worker = %self.identifier, "worker stopped");
        Ok(())
    }

    /// Stop if needed, run the strategy close hook, close components.
    pub fn close(&mut self) -> Result<(), KuixError> {
        match self.stop() {
            Ok(()) => {}
            Err(e) if e.is(ErrorKind::WorkerAlreadyStopped) => {}
            Err(e) if e.is(ErrorKind::WorkerStoppingTimeout) => {
                warn!(worker = %self.identifier, error = %e, "stop timed out during close");
            }
            Err(e) => {
                return Err(KuixError::new(
                    ErrorKind::WorkerStoppingError,
                    format!("error while stopping worker '{}' during close", self.identifier),
                )
                .caused_by(e));
            }
        }

        if let Some(strategy) = self.strategy.as_mut() {
            strategy.close_strategy().map_err(|e| {
                KuixError::wrap(
                    ErrorKind::StrategyClosingError,
                    format!("error while closing the strategy of worker '{}'", self.identifier),
                    e,
                )
            })?;
            component_phase(
                &mut **strategy,
                ErrorKind::StrategyComponentClosingError,
                "closing",
                |c| c.close(),
            )?;
        }
        debug!(worker = %self.identifier, "worker closed");
        Ok(())
    }
}

/// Drive one lifecycle phase over a strategy's components, in insertion
/// order, wrapping the first failure in the phase's error kind.
fn component_phase<F>(
    strategy: &mut dyn Strategy,
    kind: ErrorKind,
    phase: &str,
    mut run: F,
) -> Result<(), KuixError>
where
    F: FnMut(&mut (dyn crate::component::StrategyComponent + 'static)) -> anyhow::Result<()>,
{
    if let Some(components) = strategy.components() {
        for (name, component) in components.iter_mut() {
            run(component).map_err(|e| {
                KuixError::wrap(
                    kind,
                    format!("error while {phase} strategy component '{name}'"),
                    e,
                )
            })?;
        }
    }
    Ok(())
}
