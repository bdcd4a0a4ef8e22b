//! kuix-host - Worker host for the KuiX orchestration framework.
//!
//! One worker host runs per child process. It connects to the core over the
//! control channel, serves the native lifecycle endpoints, and owns the
//! workers: strategy instances running on their own threads with a
//! cooperative stop protocol.
//!
//! User crates link [`Strategy`] and component factories into the host
//! binary and register them by name; the core then activates and drives
//! them over IPC.

pub mod component;
pub mod host;
pub mod registry;
pub mod strategy;
pub mod telemetry;
pub mod worker;

pub use component::{ComponentSet, HostComponent, HostComponentFactory, StrategyComponent};
pub use host::{HostOptions, WorkerHost};
pub use registry::{install_defaults, ComponentRegistry, StrategyRegistry};
pub use strategy::{DebugStrategy, Strategy, StrategyFactory};
pub use worker::{Worker, WorkerControl, WorkerStatus};
