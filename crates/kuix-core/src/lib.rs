//! kuix-core - Core orchestrator for the KuiX framework.
//!
//! The core owns the control-channel listener, spawns and supervises
//! worker-host child processes, and exposes the public API user code
//! drives: strategy registration, worker lifecycle commands, and arbitrary
//! named endpoints over the request multiplexer.

pub mod core;
pub mod process;
pub mod telemetry;
pub mod tracker;

pub use crate::core::{generate_auth_key, ComponentDescriptor, Core, CoreOptions, StrategyDescriptor};
pub use process::{default_host_binary, HostSpawner};
pub use tracker::{HostRecord, ProcessTracker};
