//! Plans: phased task graphs computed from pending model deltas.

pub mod builder;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cairn_model::{DeltaKind, ItemPath};

pub use builder::build_plan;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// State of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanState {
    /// No longer matches the model (or failed to build); cannot run.
    Invalid,
    Initial,
    Running,
    Stopping,
    Stopped,
    Failed,
    Complete,
}

impl PlanState {
    /// Running or winding down; the model is locked against mutation.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Stopping)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Complete)
    }
}

impl fmt::Display for PlanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Invalid => "invalid",
            Self::Initial => "initial",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Complete => "complete",
        };
        f.write_str(s)
    }
}

impl FromStr for PlanState {
    type Err = PlanStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invalid" => Ok(Self::Invalid),
            "initial" => Ok(Self::Initial),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            "complete" => Ok(Self::Complete),
            other => Err(PlanStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PlanState`] string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid plan state: {0:?}")]
pub struct PlanStateParseError(pub String);

/// State of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Initial,
    Running,
    Success,
    Failed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initial => "initial",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskState {
    type Err = TaskStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(Self::Initial),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(TaskStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskState`] string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid task state: {0:?}")]
pub struct TaskStateParseError(pub String);

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A task as declared by a plug-in in [`crate::Plugin::tasks_for`].
///
/// The id is assigned up front so that sibling specs can depend on each
/// other with [`TaskSpec::after`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub id: TaskId,
    pub description: String,
    /// Name of the operation the plug-in runs for this task.
    pub call: String,
    pub args: BTreeMap<String, String>,
    pub requires_tasks: BTreeSet<TaskId>,
    pub requires_items: BTreeSet<ItemPath>,
}

impl TaskSpec {
    pub fn new(description: impl Into<String>, call: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            description: description.into(),
            call: call.into(),
            args: BTreeMap::new(),
            requires_tasks: BTreeSet::new(),
            requires_items: BTreeSet::new(),
        }
    }

    pub fn arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Run only after `other` has succeeded.
    pub fn after(mut self, other: &TaskSpec) -> Self {
        self.requires_tasks.insert(other.id);
        self
    }

    /// Run only after every task of the item at `path` has succeeded.
    pub fn after_item(mut self, path: ItemPath) -> Self {
        self.requires_items.insert(path);
        self
    }
}

/// A task inside a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub item_path: ItemPath,
    pub delta: DeltaKind,
    pub plugin: String,
    pub description: String,
    pub call: String,
    pub args: BTreeMap<String, String>,
    pub requires_tasks: BTreeSet<TaskId>,
    pub requires_items: BTreeSet<ItemPath>,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub(crate) fn from_spec(spec: TaskSpec, item_path: ItemPath, delta: DeltaKind, plugin: &str) -> Self {
        Self {
            id: spec.id,
            item_path,
            delta,
            plugin: plugin.to_owned(),
            description: spec.description,
            call: spec.call,
            args: spec.args,
            requires_tasks: spec.requires_tasks,
            requires_items: spec.requires_items,
            state: TaskState::Initial,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Tasks with no ordering constraint between them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub tasks: Vec<Task>,
}

/// An item delta the plan was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedDelta {
    pub path: ItemPath,
    pub kind: DeltaKind,
}

/// A phased task graph. Its structure never changes after creation; only
/// plan and task states advance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub state: PlanState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub phases: Vec<Phase>,
    pub deltas: Vec<PlannedDelta>,
}

impl Plan {
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.phases.iter().flat_map(|p| p.tasks.iter())
    }

    pub fn task_count(&self) -> usize {
        self.phases.iter().map(|p| p.tasks.len()).sum()
    }

    pub(crate) fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.phases
            .iter_mut()
            .flat_map(|p| p.tasks.iter_mut())
            .find(|t| t.id == id)
    }

    pub fn view(&self) -> PlanView {
        PlanView {
            id: self.id,
            state: self.state,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            phases: self
                .phases
                .iter()
                .enumerate()
                .map(|(i, phase)| PhaseView {
                    number: i + 1,
                    tasks: phase
                        .tasks
                        .iter()
                        .map(|t| TaskView {
                            id: t.id,
                            item_path: t.item_path.clone(),
                            description: t.description.clone(),
                            state: t.state,
                            error: t.error.clone(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

/// What `show_plan` returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanView {
    pub id: Uuid,
    pub state: PlanState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub phases: Vec<PhaseView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseView {
    /// 1-based.
    pub number: usize,
    pub tasks: Vec<TaskView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    pub item_path: ItemPath,
    pub description: String,
    pub state: TaskState,
    pub error: Option<String>,
}

impl PlanView {
    /// All tasks targeting `path`, in phase order.
    pub fn tasks_for(&self, path: &str) -> Vec<&TaskView> {
        self.phases
            .iter()
            .flat_map(|p| p.tasks.iter())
            .filter(|t| t.item_path.as_str() == path)
            .collect()
    }

    /// 1-based number of the first phase containing a task for `path`.
    pub fn phase_of(&self, path: &str) -> Option<usize> {
        self.phases
            .iter()
            .find(|p| p.tasks.iter().any(|t| t.item_path.as_str() == path))
            .map(|p| p.number)
    }
}

impl fmt::Display for PlanView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Plan {} ({})", self.id, self.state)?;
        for phase in &self.phases {
            writeln!(f, "Phase {}", phase.number)?;
            for task in &phase.tasks {
                writeln!(f, "  [{}] {}  {}", task.state, task.item_path, task.description)?;
            }
        }
        Ok(())
    }
}
