//! Material working copy updaters, looked up by material type.

use crate::error::MaterialUpdateError;
use async_trait::async_trait;
use gantry_core::material::MaterialRevision;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Brings a working copy at `dest` to the given revision.
#[async_trait]
pub trait MaterialUpdater: Send + Sync {
    async fn update(&self, revision: &MaterialRevision, dest: &Path) -> Result<(), MaterialUpdateError>;
}

/// Updaters keyed by material type (`git`, `hg`, `svn`, ...).
#[derive(Clone, Default)]
pub struct MaterialUpdaterRegistry {
    updaters: HashMap<String, Arc<dyn MaterialUpdater>>,
}

impl MaterialUpdaterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, material_type: impl Into<String>, updater: Arc<dyn MaterialUpdater>) -> Self {
        self.updaters.insert(material_type.into(), updater);
        self
    }

    pub fn get(&self, material_type: &str) -> Result<Arc<dyn MaterialUpdater>, MaterialUpdateError> {
        self.updaters
            .get(material_type)
            .cloned()
            .ok_or_else(|| MaterialUpdateError::NoUpdater(material_type.to_string()))
    }
}

impl std::fmt::Debug for MaterialUpdaterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaterialUpdaterRegistry")
            .field("types", &self.updaters.keys().collect::<Vec<_>>())
            .finish()
    }
}
