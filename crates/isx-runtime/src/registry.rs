// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed registry of named [`Stage`] implementations.

use isx_core::Stage;
use isx_error::{ErrorCode, PipelineError};
use std::collections::HashMap;
use std::sync::Arc;

/// A registry of stages keyed by [`Stage::id`], remembering registration
/// order so the resolver can tie-break deterministically.
#[derive(Default)]
pub struct StageRegistry {
    stages: HashMap<String, Arc<dyn Stage>>,
    order: Vec<String>,
}

impl StageRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage. Fails with [`ErrorCode::DependencyDuplicate`] if a
    /// stage with the same id is already registered.
    pub fn register(&mut self, stage: impl Stage + 'static) -> Result<(), PipelineError> {
        let id = stage.id().to_string();
        if self.stages.contains_key(&id) {
            return Err(PipelineError::new(
                ErrorCode::DependencyDuplicate,
                format!("stage '{id}' is already registered"),
            )
            .with_stage(id));
        }
        self.order.push(id.clone());
        self.stages.insert(id, Arc::new(stage));
        Ok(())
    }

    /// Look up a stage by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn Stage>> {
        self.stages.get(id).cloned()
    }

    /// Stage ids in registration order.
    #[must_use]
    pub fn registration_order(&self) -> &[String] {
        &self.order
    }

    /// Number of registered stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the registry has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isx_core::{CancellationToken, StageHandle};

    struct Noop(&'static str, Vec<String>);

    #[async_trait::async_trait]
    impl Stage for Noop {
        fn id(&self) -> &str {
            self.0
        }
        fn name(&self) -> &str {
            self.0
        }
        fn dependencies(&self) -> &[String] {
            &self.1
        }
        async fn execute(
            &self,
            _cancel: CancellationToken,
            _handle: StageHandle,
        ) -> Result<(), PipelineError> {
            Ok(())
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = StageRegistry::new();
        registry.register(Noop("scrape", vec![])).unwrap();
        let err = registry.register(Noop("scrape", vec![])).unwrap_err();
        assert_eq!(err.code, ErrorCode::DependencyDuplicate);
    }

    #[test]
    fn registration_order_is_preserved() {
        let mut registry = StageRegistry::new();
        registry.register(Noop("scrape", vec![])).unwrap();
        registry.register(Noop("process", vec![])).unwrap();
        assert_eq!(registry.registration_order(), &["scrape", "process"]);
    }
}
