//! Shared fixtures for cairn integration tests.
//!
//! [`SamplePlugin`] registers a small software-deployment vocabulary and
//! produces one task per pending item. Tests can make tasks for a given
//! item fail, or hold them until released, to drive plan execution
//! deterministically.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::Notify;

use cairn_core::{Engine, EngineConfig, Plugin, Task, TaskSpec};
use cairn_model::registry::ROOT_TYPE;
use cairn_model::{
    ChildDef, DeltaKind, ErrorKind, ItemTypeDef, ItemView, LifecycleState, Model, ModelError,
    PropertyDef, TypeRegistry, Validator,
};

pub const PLUGIN_NAME: &str = "sample";

/// Property map from literal pairs.
pub fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

/// In-memory engine with `plugin` registered.
pub fn engine(plugin: &SamplePlugin) -> Engine {
    engine_with(EngineConfig::in_memory(), plugin)
}

pub fn engine_with(config: EngineConfig, plugin: &SamplePlugin) -> Engine {
    Engine::builder(config)
        .plugin(plugin.clone())
        .build()
        .expect("failed to build engine")
}

// ===========================================================================
// Sample plug-in
// ===========================================================================

/// A task the plug-in ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub item_path: String,
    pub call: String,
    pub description: String,
}

/// Pauses the tasks of one item. `started` fires when such a task begins;
/// the task then waits for [`TaskGate::release`].
#[derive(Debug, Clone, Default)]
pub struct TaskGate {
    started: Arc<Notify>,
    release: Arc<Notify>,
}

impl TaskGate {
    pub async fn started(&self) {
        self.started.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[derive(Default)]
struct Inner {
    runs: Mutex<Vec<RunRecord>>,
    failing: Mutex<BTreeSet<String>>,
    gates: Mutex<HashMap<String, TaskGate>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Item types:
///
/// - `software-item`: abstract base of installables;
/// - `package` (`name`*, `version`, `ensure` = installed|absent|latest);
/// - `package-list` (`name`*) with a `packages` collection;
/// - `service` (`service_name`*) with a required `config` child of type
///   `service-config` (`port` 1..=65535);
/// - `software` and `ms` (`hostname`, default `ms1`), each with an `items`
///   collection, hung off the root as `/software` and `/ms`.
///
/// Model check: a package with `ensure=absent` may not pin a `version`.
#[derive(Clone, Default)]
pub struct SamplePlugin {
    inner: Arc<Inner>,
}

impl SamplePlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every task for the item at `path` fail.
    pub fn fail_on(&self, path: &str) {
        lock(&self.inner.failing).insert(path.to_owned());
    }

    /// Hold every task for the item at `path` until the gate is released.
    pub fn hold(&self, path: &str) -> TaskGate {
        lock(&self.inner.gates)
            .entry(path.to_owned())
            .or_default()
            .clone()
    }

    /// Tasks run so far, in completion order.
    pub fn runs(&self) -> Vec<RunRecord> {
        lock(&self.inner.runs).clone()
    }

    pub fn ran(&self, path: &str) -> bool {
        lock(&self.inner.runs).iter().any(|r| r.item_path == path)
    }
}

#[async_trait]
impl Plugin for SamplePlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn register_types(&self, registry: &mut TypeRegistry) -> Result<()> {
        registry.register(ItemTypeDef::new("software-item").describe("Anything installable."))?;
        registry.register(
            ItemTypeDef::new("package")
                .extends("software-item")
                .describe("An OS package.")
                .property(
                    PropertyDef::new("name")
                        .mandatory()
                        .validator(Validator::basic_string()),
                )
                .property(PropertyDef::new("version").validator(Validator::basic_string()))
                .property(
                    PropertyDef::new("ensure")
                        .default_value("installed")
                        .validator(Validator::one_of(["installed", "absent", "latest"])),
                ),
        )?;
        registry.register(
            ItemTypeDef::new("package-list")
                .extends("software-item")
                .describe("A named group of packages.")
                .property(
                    PropertyDef::new("name")
                        .mandatory()
                        .validator(Validator::basic_string()),
                )
                .child("packages", ChildDef::collection("package")),
        )?;
        registry.register(
            ItemTypeDef::new("service-config")
                .property(PropertyDef::new("port").validator(Validator::int_range(1, 65535))),
        )?;
        registry.register(
            ItemTypeDef::new("service")
                .extends("software-item")
                .property(PropertyDef::new("service_name").mandatory())
                .child("config", ChildDef::item("service-config").required()),
        )?;
        registry.register(
            ItemTypeDef::new("software").child("items", ChildDef::collection("software-item")),
        )?;
        registry.register(
            ItemTypeDef::new("ms")
                .describe("A managed server.")
                .property(PropertyDef::new("hostname").default_value("ms1"))
                .child("items", ChildDef::collection("software-item")),
        )?;
        registry.add_child(ROOT_TYPE, "software", ChildDef::item("software"))?;
        registry.add_child(ROOT_TYPE, "ms", ChildDef::item("ms"))?;
        Ok(())
    }

    fn validate_model(&self, model: &Model) -> Vec<ModelError> {
        let Ok(packages) = model.find("/", "package") else {
            return Vec::new();
        };
        packages
            .iter()
            .filter(|p| p.state != LifecycleState::ForRemoval)
            .filter(|p| p.value("ensure") == Some("absent") && p.value("version").is_some())
            .map(|p| {
                ModelError::new(
                    ErrorKind::Validation,
                    "A version cannot be pinned on a package that is absent",
                )
                .at(&p.path)
                .on_property("version")
            })
            .collect()
    }

    fn tasks_for(&self, _model: &Model, item: &ItemView, delta: DeltaKind) -> Result<Vec<TaskSpec>> {
        if item.collection || item.read_only {
            return Ok(Vec::new());
        }
        let subject = item.value("name").unwrap_or(&item.item_type);
        let (verb, call) = match delta {
            DeltaKind::Create => ("Install", "apply"),
            DeltaKind::Update => ("Reconfigure", "apply"),
            DeltaKind::Remove => ("Remove", "remove"),
        };
        let spec = item.properties.iter().fold(
            TaskSpec::new(format!("{verb} {subject} on {}", item.path), call),
            |spec, (key, prop)| spec.arg(key.as_str(), prop.value.as_str()),
        );
        Ok(vec![spec])
    }

    async fn run_task(&self, task: &Task) -> Result<()> {
        let gate = lock(&self.inner.gates).get(task.item_path.as_str()).cloned();
        if let Some(gate) = gate {
            gate.started.notify_one();
            gate.release.notified().await;
        }

        lock(&self.inner.runs).push(RunRecord {
            item_path: task.item_path.to_string(),
            call: task.call.clone(),
            description: task.description.clone(),
        });

        if lock(&self.inner.failing).contains(task.item_path.as_str()) {
            bail!("{} failed on {}", task.call, task.item_path);
        }
        Ok(())
    }
}
