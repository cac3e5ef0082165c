//! Plan engine for the cairn item model.
//!
//! An [`Engine`] owns a [`cairn_model::Model`] and at most one [`Plan`].
//! Plug-ins contribute item types and the tasks that realize pending item
//! deltas; plans order those tasks into phases and run them.
//!
//! A program embedding the engine gets its builder from
//! [`EngineBuilder::resolved`], which resolves an [`EngineConfig`] from
//! explicit overrides, `CAIRN_*` variables and the config file. It passes
//! the resolved `log_filter` to [`logging::init`] and then calls
//! [`EngineBuilder::build`].

pub mod config;
pub mod engine;
mod executor;
pub mod logging;
pub mod plan;
pub mod plugin;

pub use config::{ConfigOverrides, EngineConfig};
pub use engine::{Engine, EngineBuilder, RunHandle};
pub use plan::{
    Phase, PhaseView, Plan, PlanState, PlanView, Task, TaskId, TaskSpec, TaskState, TaskView,
};
pub use plugin::{Plugin, PluginRegistry};
