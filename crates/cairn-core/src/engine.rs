//! The engine facade: intent operations on the model and the plan
//! lifecycle (create, show, run, stop, remove).
//!
//! The model and the current plan share one `RwLock`. Mutations and plan
//! calls take the write lock; queries take the read lock. While a plan is
//! Running or Stopping the model is frozen. Snapshots are captured under
//! the lock and written after it is released.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use cairn_model::{
    DeltaKind, ErrorKind, ItemPath, ItemView, LifecycleState, Model, ModelError, ModelResult,
    ModelSnapshot, PendingDelta, PropertyView, Removal, RestoreReport, TypeRegistry,
    load_snapshot, save_snapshot,
};

use crate::config::{ConfigOverrides, EngineConfig};
use crate::executor::Executor;
use crate::plan::{Plan, PlanState, PlanView, build_plan};
use crate::plugin::{Plugin, PluginRegistry};

/// Everything guarded by the engine lock.
#[derive(Debug)]
pub(crate) struct EngineState {
    pub(crate) model: Model,
    pub(crate) plan: Option<Plan>,
    /// Present while a plan runs.
    pub(crate) cancel: Option<CancellationToken>,
    /// Bumped on every captured snapshot so stale writes can be skipped.
    generation: u64,
}

impl EngineState {
    fn plan_active(&self) -> bool {
        self.plan.as_ref().is_some_and(|p| p.state.is_active())
    }

    fn ensure_idle(&self) -> ModelResult<()> {
        if self.plan_active() {
            return Err(ModelError::invalid_request(
                "Model cannot be changed while a plan is running",
            )
            .into());
        }
        Ok(())
    }

    /// A model change makes an unstarted plan stale.
    fn invalidate_plan(&mut self) {
        if let Some(plan) = self.plan.as_mut().filter(|p| p.state == PlanState::Initial) {
            plan.state = PlanState::Invalid;
            tracing::info!(plan_id = %plan.id, "plan invalidated by model change");
        }
    }
}

/// A snapshot taken under the engine lock, waiting to be written.
#[derive(Debug)]
pub(crate) struct PendingSave {
    generation: u64,
    snapshot: ModelSnapshot,
}

/// Writes model snapshots off the engine lock. Writes are serialized and a
/// snapshot older than the last one written is dropped.
#[derive(Debug, Clone)]
pub(crate) struct Persister {
    path: Option<PathBuf>,
    written: Arc<Mutex<u64>>,
}

impl Persister {
    fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            written: Arc::new(Mutex::new(0)),
        }
    }

    /// Capture the model. Call with the engine write lock held.
    pub(crate) fn capture(&self, state: &mut EngineState) -> Option<PendingSave> {
        self.path.as_ref()?;
        state.generation += 1;
        Some(PendingSave {
            generation: state.generation,
            snapshot: state.model.snapshot(),
        })
    }

    /// Write a captured snapshot. Failures are logged, not returned: the
    /// in-memory change already happened.
    pub(crate) async fn save(&self, pending: Option<PendingSave>) {
        let (Some(path), Some(pending)) = (self.path.clone(), pending) else {
            return;
        };
        let PendingSave {
            generation,
            snapshot,
        } = pending;
        let mut written = self.written.lock().await;
        if generation <= *written {
            return;
        }
        let target = path.clone();
        let result =
            tokio::task::spawn_blocking(move || save_snapshot(&target, &snapshot)).await;
        match result {
            Ok(Ok(())) => *written = generation,
            Ok(Err(e)) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to save model snapshot");
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "snapshot writer panicked");
            }
        }
    }
}

fn no_plan() -> ModelError {
    ModelError::invalid_location("Plan does not exist")
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Collects plug-ins, then builds the type registry and the model.
pub struct EngineBuilder {
    config: EngineConfig,
    plugins: PluginRegistry,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            plugins: PluginRegistry::new(),
        }
    }

    /// Builder for a config resolved from `overrides`, the environment and
    /// the config file (see [`EngineConfig::resolve`]).
    pub fn resolved(overrides: &ConfigOverrides) -> Result<Self> {
        Ok(Self::new(EngineConfig::resolve(overrides)?))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugins.register(plugin);
        self
    }

    pub fn plugin_arc(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.register_arc(plugin);
        self
    }

    /// Register every plug-in's types and load (or bootstrap) the model.
    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;

        let mut registry = TypeRegistry::with_core_types();
        for plugin in self.plugins.iter() {
            plugin
                .register_types(&mut registry)
                .with_context(|| format!("plug-in {} failed to register types", plugin.name()))?;
        }

        let model = match &self.config.snapshot_path {
            Some(path) if path.exists() => {
                let snapshot = load_snapshot(path)?;
                let model = Model::from_snapshot(registry, &snapshot)
                    .with_context(|| format!("failed to restore model from {}", path.display()))?;
                tracing::info!(path = %path.display(), items = model.len(), "model loaded");
                model
            }
            _ => Model::new(registry).context("invalid item type registry")?,
        };

        tracing::info!(plugins = ?self.plugins.names(), "engine ready");
        Ok(Engine {
            state: Arc::new(RwLock::new(EngineState {
                model,
                plan: None,
                cancel: None,
                generation: 0,
            })),
            plugins: Arc::new(self.plugins),
            persister: Persister::new(self.config.snapshot_path.clone()),
            config: self.config,
        })
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Handle on a plan started by [`Engine::run_plan`].
#[derive(Debug)]
pub struct RunHandle {
    plan_id: Uuid,
    handle: JoinHandle<PlanState>,
}

impl RunHandle {
    pub fn plan_id(&self) -> Uuid {
        self.plan_id
    }

    /// Wait for the plan to reach a terminal state.
    pub async fn wait(self) -> Result<PlanState> {
        self.handle.await.context("plan executor panicked")
    }
}

/// Shared handle on a model and its plan. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    state: Arc<RwLock<EngineState>>,
    plugins: Arc<PluginRegistry>,
    persister: Persister,
    config: EngineConfig,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("plugins", &self.plugins)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    /// Apply `op` under the write lock. On success an unstarted plan is
    /// invalidated and the model is persisted.
    async fn mutate<T>(&self, op: impl FnOnce(&mut Model) -> ModelResult<T>) -> ModelResult<T> {
        let (out, pending) = {
            let mut guard = self.state.write().await;
            guard.ensure_idle()?;
            let out = op(&mut guard.model)?;
            guard.invalidate_plan();
            (out, self.persister.capture(&mut guard))
        };
        self.persister.save(pending).await;
        Ok(out)
    }

    // -- Intents -------------------------------------------------------------

    pub async fn create(
        &self,
        path: &str,
        item_type: &str,
        properties: &BTreeMap<String, String>,
    ) -> ModelResult<ItemView> {
        self.mutate(|m| m.create(path, item_type, properties)).await
    }

    pub async fn inherit(
        &self,
        dest: &str,
        source: &str,
        overrides: &BTreeMap<String, String>,
    ) -> ModelResult<ItemView> {
        self.mutate(|m| m.inherit(dest, source, overrides)).await
    }

    pub async fn update(
        &self,
        path: &str,
        set: &BTreeMap<String, String>,
        delete: &[&str],
    ) -> ModelResult<ItemView> {
        self.mutate(|m| m.update(path, set, delete)).await
    }

    pub async fn remove(&self, path: &str) -> ModelResult<Removal> {
        self.mutate(|m| m.remove(path)).await
    }

    /// Discard every pending model change.
    pub async fn restore_model(&self) -> ModelResult<RestoreReport> {
        self.mutate(|m| Ok(m.restore_model())).await
    }

    pub async fn query(&self, path: &str) -> ModelResult<ItemView> {
        self.state.read().await.model.query(path)
    }

    pub async fn query_properties(
        &self,
        path: &str,
        names: &[&str],
    ) -> ModelResult<BTreeMap<String, PropertyView>> {
        self.state.read().await.model.query_properties(path, names)
    }

    pub async fn find(&self, base: &str, item_type: &str) -> ModelResult<Vec<ItemView>> {
        self.state.read().await.model.find(base, item_type)
    }

    pub async fn children(&self, path: &str) -> ModelResult<Vec<ItemPath>> {
        self.state.read().await.model.children(path)
    }

    pub async fn state_of(&self, path: &str) -> Option<LifecycleState> {
        self.state.read().await.model.state_of(path)
    }

    pub async fn exists(&self, path: &str) -> bool {
        self.state.read().await.model.exists(path)
    }

    pub async fn pending_deltas(&self) -> Vec<PendingDelta> {
        self.state.read().await.model.pending_deltas()
    }

    pub async fn snapshot(&self) -> ModelSnapshot {
        self.state.read().await.model.snapshot()
    }

    // -- Plans ---------------------------------------------------------------

    /// Build a plan from the pending deltas, replacing any previous plan.
    /// A failed attempt leaves the previous plan Invalid.
    ///
    /// When no plug-in has work for the pending deltas, they are settled
    /// on the spot (committed as if a plan had run) and `DoNothingPlan` is
    /// still reported.
    pub async fn create_plan(&self) -> ModelResult<PlanView> {
        let mut guard = self.state.write().await;
        if let Some(plan) = guard.plan.as_ref().filter(|p| p.state.is_active()) {
            return Err(ModelError::new(
                ErrorKind::InvalidPlanState,
                format!("Create plan failed: plan is {}", plan.state),
            )
            .into());
        }

        let errors = match build_plan(&guard.model, &self.plugins) {
            Ok(plan) => {
                let view = plan.view();
                guard.plan = Some(plan);
                return Ok(view);
            }
            Err(errors) => errors,
        };
        if let Some(plan) = guard.plan.as_mut() {
            plan.state = PlanState::Invalid;
        }
        tracing::info!(errors = errors.len(), "create plan rejected");

        if errors.kinds() != [ErrorKind::DoNothingPlan] {
            return Err(errors);
        }
        let deltas: Vec<(ItemPath, DeltaKind)> = guard
            .model
            .pending_deltas()
            .into_iter()
            .map(|d| (d.path, d.kind))
            .collect();
        if deltas.is_empty() {
            return Err(errors);
        }
        let report = guard.model.commit(&deltas);
        tracing::info!(
            applied = report.applied.len(),
            deleted = report.deleted.len(),
            "settled pending items that need no tasks"
        );
        let pending = self.persister.capture(&mut guard);
        drop(guard);
        self.persister.save(pending).await;
        Err(errors)
    }

    pub async fn show_plan(&self) -> ModelResult<PlanView> {
        let guard = self.state.read().await;
        guard.plan.as_ref().map(Plan::view).ok_or_else(|| no_plan().into())
    }

    /// Start the current plan in the background.
    pub async fn run_plan(&self) -> ModelResult<RunHandle> {
        let mut guard = self.state.write().await;
        let guard = &mut *guard;
        let plan = guard.plan.as_mut().ok_or_else(no_plan)?;
        if plan.state != PlanState::Initial {
            return Err(ModelError::new(
                ErrorKind::InvalidPlanState,
                format!("Plan is {}, only an initial plan can run", plan.state),
            )
            .into());
        }

        plan.state = PlanState::Running;
        plan.started_at = Some(Utc::now());
        let plan_id = plan.id;
        let cancel = CancellationToken::new();
        guard.cancel = Some(cancel.clone());
        tracing::info!(plan_id = %plan_id, phases = plan.phases.len(), "plan started");

        let executor = Executor {
            state: Arc::clone(&self.state),
            plugins: Arc::clone(&self.plugins),
            max_parallel_tasks: self.config.max_parallel_tasks,
            persister: self.persister.clone(),
        };
        let handle = tokio::spawn(executor.run(plan_id, cancel));
        Ok(RunHandle { plan_id, handle })
    }

    /// Ask a running plan to stop after its current phase.
    pub async fn stop_plan(&self) -> ModelResult<PlanView> {
        let mut guard = self.state.write().await;
        let guard = &mut *guard;
        let plan = guard.plan.as_mut().ok_or_else(no_plan)?;
        if plan.state != PlanState::Running {
            return Err(ModelError::invalid_location(format!(
                "No running plan to stop (plan is {})",
                plan.state
            ))
            .into());
        }
        plan.state = PlanState::Stopping;
        if let Some(cancel) = &guard.cancel {
            cancel.cancel();
        }
        tracing::info!(plan_id = %plan.id, "plan stopping");
        Ok(plan.view())
    }

    /// Discard the current plan. Item states are not touched.
    pub async fn remove_plan(&self) -> ModelResult<()> {
        let mut guard = self.state.write().await;
        let plan = guard.plan.as_ref().ok_or_else(no_plan)?;
        if plan.state.is_active() {
            return Err(ModelError::new(
                ErrorKind::InvalidPlanState,
                format!("Cannot remove a plan that is {}", plan.state),
            )
            .into());
        }
        tracing::info!(plan_id = %plan.id, "plan removed");
        guard.plan = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cairn_model::registry::ROOT_TYPE;
    use cairn_model::{ChildDef, DeltaKind, ItemTypeDef, PropertyDef};

    use crate::plan::{Task, TaskSpec};

    /// `node` items under `/deployment/nodes` get one task each; `group`
    /// items under `/deployment/groups` need none.
    struct NodePlugin;

    #[async_trait]
    impl Plugin for NodePlugin {
        fn name(&self) -> &str {
            "node"
        }

        fn register_types(&self, registry: &mut TypeRegistry) -> Result<()> {
            registry.register(ItemTypeDef::new("node").property(PropertyDef::new("label")))?;
            registry.register(ItemTypeDef::new("group"))?;
            registry.register(
                ItemTypeDef::new("deployment")
                    .child("nodes", ChildDef::collection("node"))
                    .child("groups", ChildDef::collection("group")),
            )?;
            registry.add_child(ROOT_TYPE, "deployment", ChildDef::item("deployment"))?;
            Ok(())
        }

        fn tasks_for(&self, _: &Model, item: &ItemView, delta: DeltaKind) -> Result<Vec<TaskSpec>> {
            if item.item_type != "node" || item.collection {
                return Ok(Vec::new());
            }
            Ok(vec![TaskSpec::new(format!("{delta} {}", item.path), "apply")])
        }

        async fn run_task(&self, _task: &Task) -> Result<()> {
            Ok(())
        }
    }

    fn engine() -> Engine {
        Engine::builder(EngineConfig::in_memory())
            .plugin(NodePlugin)
            .build()
            .unwrap()
    }

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[tokio::test]
    async fn plan_lifecycle_errors_without_plan() {
        let engine = engine();
        let kinds = |e: cairn_model::ModelErrors| e.kinds();
        assert_eq!(
            kinds(engine.show_plan().await.unwrap_err()),
            vec![ErrorKind::InvalidLocation]
        );
        assert_eq!(
            kinds(engine.run_plan().await.unwrap_err()),
            vec![ErrorKind::InvalidLocation]
        );
        assert_eq!(
            kinds(engine.stop_plan().await.unwrap_err()),
            vec![ErrorKind::InvalidLocation]
        );
        assert_eq!(
            kinds(engine.remove_plan().await.unwrap_err()),
            vec![ErrorKind::InvalidLocation]
        );
        assert_eq!(
            kinds(engine.create_plan().await.unwrap_err()),
            vec![ErrorKind::DoNothingPlan]
        );
    }

    #[tokio::test]
    async fn mutation_invalidates_initial_plan() {
        let engine = engine();
        engine
            .create("/deployment/nodes/n1", "node", &props(&[("label", "a")]))
            .await
            .unwrap();
        let plan = engine.create_plan().await.unwrap();
        assert_eq!(plan.state, PlanState::Initial);

        engine
            .update("/deployment/nodes/n1", &props(&[("label", "b")]), &[])
            .await
            .unwrap();
        assert_eq!(engine.show_plan().await.unwrap().state, PlanState::Invalid);

        let err = engine.run_plan().await.unwrap_err();
        assert_eq!(err.kinds(), vec![ErrorKind::InvalidPlanState]);
        assert!(err.iter().all(|e| e.kind.is_validation()));
    }

    #[tokio::test]
    async fn failed_create_plan_invalidates_previous() {
        let engine = engine();
        engine
            .create("/deployment/nodes/n1", "node", &BTreeMap::new())
            .await
            .unwrap();
        engine.create_plan().await.unwrap();
        let state = engine.run_plan().await.unwrap().wait().await.unwrap();
        assert_eq!(state, PlanState::Complete);

        let err = engine.create_plan().await.unwrap_err();
        assert_eq!(err.kinds(), vec![ErrorKind::DoNothingPlan]);
        assert_eq!(engine.show_plan().await.unwrap().state, PlanState::Invalid);
    }

    #[tokio::test]
    async fn run_commits_and_remove_plan_keeps_items() {
        let engine = engine();
        engine
            .create("/deployment/nodes/n1", "node", &BTreeMap::new())
            .await
            .unwrap();
        engine.create_plan().await.unwrap();
        let handle = engine.run_plan().await.unwrap();
        assert_eq!(handle.wait().await.unwrap(), PlanState::Complete);

        assert_eq!(
            engine.state_of("/deployment/nodes/n1").await,
            Some(LifecycleState::Applied)
        );
        assert!(engine.pending_deltas().await.is_empty());

        let err = engine.run_plan().await.unwrap_err();
        assert_eq!(err.kinds(), vec![ErrorKind::InvalidPlanState]);

        engine.remove_plan().await.unwrap();
        assert!(engine.show_plan().await.is_err());
        assert!(engine.exists("/deployment/nodes/n1").await);
    }

    #[tokio::test]
    async fn items_without_tasks_are_settled_by_create_plan() {
        let engine = engine();
        engine
            .create("/deployment/groups/g1", "group", &BTreeMap::new())
            .await
            .unwrap();
        let err = engine.create_plan().await.unwrap_err();
        assert_eq!(err.kinds(), vec![ErrorKind::DoNothingPlan]);
        assert_eq!(
            engine.state_of("/deployment/groups/g1").await,
            Some(LifecycleState::Applied)
        );
        assert!(engine.pending_deltas().await.is_empty());
        assert!(engine.show_plan().await.is_err());

        engine.remove("/deployment/groups/g1").await.unwrap();
        let err = engine.create_plan().await.unwrap_err();
        assert_eq!(err.kinds(), vec![ErrorKind::DoNothingPlan]);
        assert!(!engine.exists("/deployment/groups/g1").await);
    }

    #[tokio::test]
    async fn stale_snapshots_are_not_written() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("model.json");
        let persister = Persister::new(Some(path.clone()));
        let engine = engine();
        let mut state = engine.state.write().await;

        let older = persister.capture(&mut state);
        state
            .model
            .create("/deployment/nodes/n1", "node", &BTreeMap::new())
            .unwrap();
        let newer = persister.capture(&mut state);
        drop(state);

        persister.save(newer).await;
        persister.save(older).await;
        let saved = load_snapshot(&path).unwrap();
        assert!(
            saved
                .items
                .iter()
                .any(|r| r.path.as_str() == "/deployment/nodes/n1")
        );
    }

    #[tokio::test]
    async fn in_memory_persister_captures_nothing() {
        let engine = engine();
        let mut state = engine.state.write().await;
        assert!(engine.persister.capture(&mut state).is_none());
    }

    #[test]
    fn resolved_builder_honours_overrides() {
        let overrides = ConfigOverrides {
            max_parallel_tasks: Some(3),
            snapshot_path: Some(PathBuf::from("/srv/cairn/model.json")),
            log_filter: Some("debug".to_owned()),
        };
        let builder = EngineBuilder::resolved(&overrides).unwrap();
        let config = builder.config();
        assert_eq!(config.max_parallel_tasks, 3);
        assert_eq!(
            config.snapshot_path.as_deref(),
            Some(std::path::Path::new("/srv/cairn/model.json"))
        );
        assert_eq!(config.log_filter, "debug");
    }

    #[tokio::test]
    async fn builder_rejects_zero_parallelism() {
        let err = Engine::builder(EngineConfig::in_memory().with_max_parallel_tasks(0))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("max_parallel_tasks"));
    }
}
