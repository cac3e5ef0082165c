//! The `Plugin` trait -- the adapter interface for task producers.
//!
//! A plug-in contributes item types to the registry, optional model-wide
//! validation, the tasks that realize each pending item delta, and the code
//! that runs those tasks. The trait is object-safe so plug-ins can be held
//! as `Arc<dyn Plugin>` in the [`super::PluginRegistry`].

use anyhow::Result;
use async_trait::async_trait;

use cairn_model::{DeltaKind, ItemView, Model, ModelError, TypeRegistry};

use crate::plan::{Task, TaskSpec};

/// Collaborator that turns model deltas into executable work.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique name (e.g. "package"). Tasks record it to find their runner.
    fn name(&self) -> &str;

    /// Register item types, and hang top-level children off the root with
    /// [`TypeRegistry::add_child`]. Called once while the engine is built.
    fn register_types(&self, _registry: &mut TypeRegistry) -> Result<()> {
        Ok(())
    }

    /// Extra whole-model checks run by `create_plan`. Every returned error
    /// is reported alongside the model's own validation errors.
    fn validate_model(&self, _model: &Model) -> Vec<ModelError> {
        Vec::new()
    }

    /// Tasks realizing `delta` on `item`. Called for every pending item,
    /// collections included; return an empty list for items this plug-in
    /// does not handle.
    fn tasks_for(&self, model: &Model, item: &ItemView, delta: DeltaKind) -> Result<Vec<TaskSpec>>;

    /// Execute one task. An error fails the task (and with it the plan)
    /// but nothing else.
    async fn run_task(&self, task: &Task) -> Result<()>;
}

// Compile-time assertion: Plugin must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Plugin) {}
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Produces one task per non-collection item and runs nothing.
    struct NoopPlugin;

    #[async_trait]
    impl Plugin for NoopPlugin {
        fn name(&self) -> &str {
            "noop"
        }

        fn tasks_for(
            &self,
            _model: &Model,
            item: &ItemView,
            delta: DeltaKind,
        ) -> Result<Vec<TaskSpec>> {
            if item.collection {
                return Ok(Vec::new());
            }
            Ok(vec![TaskSpec::new(format!("{delta} {}", item.path), "noop")])
        }

        async fn run_task(&self, _task: &Task) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn plugin_is_object_safe() {
        let plugin: Arc<dyn Plugin> = Arc::new(NoopPlugin);
        assert_eq!(plugin.name(), "noop");
    }

    #[test]
    fn default_hooks_are_empty() {
        let plugin = NoopPlugin;
        let mut registry = TypeRegistry::with_core_types();
        plugin.register_types(&mut registry).unwrap();
        assert_eq!(registry.len(), 2);

        let model = Model::new(registry).unwrap();
        assert!(plugin.validate_model(&model).is_empty());

        let root = model.query("/").unwrap();
        let tasks = plugin.tasks_for(&model, &root, DeltaKind::Update).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].description, "update /");
    }
}
