//! Unit registry -- the task kinds this process can run.
//!
//! The manager looks up a factory by [`TaskKind`] when a task is requested
//! and asks it to build the unit from the request parameters.

use std::collections::HashMap;

use anyhow::Result;

use curator_model::TaskKind;

use super::TaskWork;
use crate::manager::TaskRequest;

/// Builds units of work for one task kind.
pub trait UnitFactory: Send + Sync {
    fn kind(&self) -> TaskKind;

    /// Build the unit for `request`. An error rejects the request.
    fn build(&self, request: &TaskRequest) -> Result<TaskWork>;
}

/// A factory backed by a closure.
pub struct FnFactory<F> {
    kind: TaskKind,
    build: F,
}

impl<F> FnFactory<F>
where
    F: Fn(&TaskRequest) -> Result<TaskWork> + Send + Sync,
{
    pub fn new(kind: TaskKind, build: F) -> Self {
        Self { kind, build }
    }
}

impl<F> UnitFactory for FnFactory<F>
where
    F: Fn(&TaskRequest) -> Result<TaskWork> + Send + Sync,
{
    fn kind(&self) -> TaskKind {
        self.kind
    }

    fn build(&self, request: &TaskRequest) -> Result<TaskWork> {
        (self.build)(request)
    }
}

/// Registered [`UnitFactory`] implementations, keyed by kind.
#[derive(Default)]
pub struct UnitRegistry {
    factories: HashMap<TaskKind, Box<dyn UnitFactory>>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under [`UnitFactory::kind`], returning the one it
    /// replaced.
    pub fn register(
        &mut self,
        factory: impl UnitFactory + 'static,
    ) -> Option<Box<dyn UnitFactory>> {
        self.factories.insert(factory.kind(), Box::new(factory))
    }

    /// Register a closure as the factory for `kind`.
    pub fn register_fn<F>(&mut self, kind: TaskKind, build: F) -> Option<Box<dyn UnitFactory>>
    where
        F: Fn(&TaskRequest) -> Result<TaskWork> + Send + Sync + 'static,
    {
        self.register(FnFactory::new(kind, build))
    }

    pub fn get(&self, kind: TaskKind) -> Option<&dyn UnitFactory> {
        self.factories.get(&kind).map(|b| b.as_ref())
    }

    pub fn kinds(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<TaskKind> = self.factories.keys().copied().collect();
        kinds.sort_by_key(|k| k.to_string());
        kinds
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for UnitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
