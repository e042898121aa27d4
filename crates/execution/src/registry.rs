//! Explicit provider registry, built once at startup.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::ExecutionError;
use crate::provider::UnitOfWork;

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    units: HashMap<String, Arc<dyn UnitOfWork>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `unit` under its own name. Names are unique.
    pub fn register(&mut self, unit: impl UnitOfWork) -> Result<(), ExecutionError> {
        self.register_arc(Arc::new(unit))
    }

    pub fn register_arc(&mut self, unit: Arc<dyn UnitOfWork>) -> Result<(), ExecutionError> {
        let name = unit.name().to_string();
        if self.units.contains_key(&name) {
            return Err(ExecutionError::DuplicateProvider(name));
        }
        self.units.insert(name, unit);
        Ok(())
    }

    pub fn with(mut self, unit: impl UnitOfWork) -> Result<Self, ExecutionError> {
        self.register(unit)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn UnitOfWork>> {
        self.units.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.units.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}
