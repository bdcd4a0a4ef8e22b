//! Component contracts: small user-authored objects attached to a worker
//! or to the host itself, driven through a four-phase lifecycle.

use serde_json::Value;

/// A component attached to a worker's strategy. All phases default to
/// no-ops; implement the ones that matter.
pub trait StrategyComponent: Send {
    fn open(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
    fn start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
    fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Ordered set of named strategy components. Phases iterate in insertion
/// order, for open/start and for stop/close alike.
#[derive(Default)]
pub struct ComponentSet {
    items: Vec<(String, Box<dyn StrategyComponent>)>,
}

impl ComponentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, component: impl StrategyComponent + 'static) -> &mut Self {
        self.items.push((name.into(), Box::new(component)));
        self
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut (dyn StrategyComponent + 'static))> {
        self.items
            .iter_mut()
            .map(|(name, component)| (name.as_str(), component.as_mut()))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A component attached to the host process, installed over IPC via
/// `add_component`.
impl std::fmt::Debug for dyn HostComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn HostComponent").finish()
    }
}

pub trait HostComponent: Send {
    fn open(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
    fn start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
    fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Builds a [`HostComponent`] from the config carried by `add_component`.
pub trait HostComponentFactory: Send + Sync {
    fn build(&self, config: Value) -> anyhow::Result<Box<dyn HostComponent>>;
}

impl<F> HostComponentFactory for F
where
    F: Fn(Value) -> anyhow::Result<Box<dyn HostComponent>> + Send + Sync,
{
    fn build(&self, config: Value) -> anyhow::Result<Box<dyn HostComponent>> {
        self(config)
    }
}
