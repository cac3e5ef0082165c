//! Plan executor: runs the phases of a plan in order, the tasks of each
//! phase concurrently, and commits the outcome to the model.
//!
//! The engine lock is held only to record task state; it is released
//! while plug-ins run.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use cairn_model::{DeltaKind, ItemPath};

use crate::engine::{EngineState, Persister};
use crate::plan::{Plan, PlanState, Task, TaskId, TaskState};
use crate::plugin::{Plugin, PluginRegistry};

/// Everything a running plan needs, detached from the [`crate::Engine`].
pub(crate) struct Executor {
    pub(crate) state: Arc<RwLock<EngineState>>,
    pub(crate) plugins: Arc<PluginRegistry>,
    pub(crate) max_parallel_tasks: usize,
    pub(crate) persister: Persister,
}

impl Executor {
    /// Run plan `plan_id` to a terminal state and return it.
    pub(crate) async fn run(self, plan_id: Uuid, cancel: CancellationToken) -> PlanState {
        let phase_count = {
            let guard = self.state.read().await;
            match guard.plan.as_ref().filter(|p| p.id == plan_id) {
                Some(plan) => plan.phases.len(),
                None => {
                    tracing::error!(plan_id = %plan_id, "plan vanished before execution");
                    return PlanState::Failed;
                }
            }
        };

        let semaphore = Arc::new(Semaphore::new(self.max_parallel_tasks));
        let mut outcome = PlanState::Complete;

        for index in 0..phase_count {
            if cancel.is_cancelled() {
                tracing::info!(plan_id = %plan_id, phase = index + 1, "plan stopped before phase");
                outcome = PlanState::Stopped;
                break;
            }

            let failed = self.run_phase(plan_id, index, &semaphore).await;
            if failed > 0 {
                tracing::warn!(plan_id = %plan_id, phase = index + 1, failed, "phase failed");
                outcome = PlanState::Failed;
                break;
            }
            tracing::info!(plan_id = %plan_id, phase = index + 1, "phase complete");
        }

        self.finish(plan_id, outcome).await;
        outcome
    }

    /// Run one phase to its barrier. Returns the number of failed tasks.
    async fn run_phase(&self, plan_id: Uuid, index: usize, semaphore: &Arc<Semaphore>) -> usize {
        let tasks = self.start_phase(plan_id, index).await;
        let mut set = JoinSet::new();
        for task in tasks {
            let plugin = self.plugins.get(&task.plugin);
            let semaphore = Arc::clone(semaphore);
            set.spawn(async move {
                let result = run_task(plugin, semaphore, &task).await;
                (task.id, result)
            });
        }

        let mut failed = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((task_id, result)) => {
                    if !self.record(plan_id, task_id, result).await {
                        failed += 1;
                    }
                }
                Err(e) => {
                    tracing::error!(plan_id = %plan_id, error = %e, "task aborted");
                }
            }
        }

        // Tasks whose future panicked never reported back.
        failed + self.fail_unfinished(plan_id, index).await
    }

    /// Mark every task of the phase Running and hand out copies.
    async fn start_phase(&self, plan_id: Uuid, index: usize) -> Vec<Task> {
        let mut guard = self.state.write().await;
        let Some(phase) = guard
            .plan
            .as_mut()
            .filter(|p| p.id == plan_id)
            .and_then(|p| p.phases.get_mut(index))
        else {
            return Vec::new();
        };
        let now = Utc::now();
        for task in &mut phase.tasks {
            task.state = TaskState::Running;
            task.started_at = Some(now);
        }
        phase.tasks.clone()
    }

    /// Record a task outcome. Returns whether it succeeded.
    async fn record(&self, plan_id: Uuid, task_id: TaskId, result: Result<()>) -> bool {
        let mut guard = self.state.write().await;
        let Some(task) = guard
            .plan
            .as_mut()
            .filter(|p| p.id == plan_id)
            .and_then(|p| p.task_mut(task_id))
        else {
            return false;
        };
        task.completed_at = Some(Utc::now());
        match result {
            Ok(()) => {
                task.state = TaskState::Success;
                tracing::debug!(task_id = %task_id, path = %task.item_path, "task succeeded");
                true
            }
            Err(e) => {
                task.state = TaskState::Failed;
                task.error = Some(format!("{e:#}"));
                tracing::warn!(
                    task_id = %task_id,
                    path = %task.item_path,
                    description = %task.description,
                    error = %e,
                    "task failed"
                );
                false
            }
        }
    }

    async fn fail_unfinished(&self, plan_id: Uuid, index: usize) -> usize {
        let mut guard = self.state.write().await;
        let Some(phase) = guard
            .plan
            .as_mut()
            .filter(|p| p.id == plan_id)
            .and_then(|p| p.phases.get_mut(index))
        else {
            return 0;
        };
        let mut count = 0;
        for task in phase.tasks.iter_mut().filter(|t| t.state == TaskState::Running) {
            task.state = TaskState::Failed;
            task.error = Some("task terminated unexpectedly".to_owned());
            task.completed_at = Some(Utc::now());
            count += 1;
        }
        count
    }

    /// Settle the plan state and commit what the tasks achieved.
    async fn finish(&self, plan_id: Uuid, outcome: PlanState) {
        let pending = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let Some(plan) = state.plan.as_mut().filter(|p| p.id == plan_id) else {
                return;
            };
            plan.state = outcome;
            plan.finished_at = Some(Utc::now());
            let items = committable(plan, outcome);
            state.cancel = None;

            let report = state.model.commit(&items);
            tracing::info!(
                plan_id = %plan_id,
                state = %outcome,
                applied = report.applied.len(),
                deleted = report.deleted.len(),
                deferred = report.deferred.len(),
                "plan finished"
            );
            self.persister.capture(state)
        };
        self.persister.save(pending).await;
    }
}

async fn run_task(
    plugin: Option<Arc<dyn Plugin>>,
    semaphore: Arc<Semaphore>,
    task: &Task,
) -> Result<()> {
    let plugin = plugin.ok_or_else(|| anyhow!("plug-in {:?} is not registered", task.plugin))?;
    let _permit = semaphore
        .acquire_owned()
        .await
        .context("task semaphore closed")?;
    plugin.run_task(task).await
}

/// Item deltas the plan may commit: items whose tasks all succeeded.
/// A task-less item follows its nearest ancestor that has tasks; with no
/// such ancestor it is committed only when every phase ran.
fn committable(plan: &Plan, outcome: PlanState) -> Vec<(ItemPath, DeltaKind)> {
    let succeeded = |path: &ItemPath| -> Option<bool> {
        let mut tasks = plan.tasks().filter(|t| &t.item_path == path).peekable();
        tasks.peek()?;
        Some(tasks.all(|t| t.state == TaskState::Success))
    };
    plan.deltas
        .iter()
        .filter(|delta| {
            succeeded(&delta.path).unwrap_or_else(|| {
                std::iter::successors(delta.path.parent(), ItemPath::parent)
                    .find_map(|ancestor| succeeded(&ancestor))
                    .unwrap_or(outcome == PlanState::Complete)
            })
        })
        .map(|delta| (delta.path.clone(), delta.kind))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Phase, PlannedDelta, TaskSpec};

    fn path(raw: &str) -> ItemPath {
        ItemPath::parse(raw).unwrap()
    }

    fn plan(tasks: Vec<(&str, TaskState)>, deltas: &[&str]) -> Plan {
        let tasks = tasks
            .into_iter()
            .map(|(p, state)| {
                let mut task =
                    Task::from_spec(TaskSpec::new(p, "apply"), path(p), DeltaKind::Create, "t");
                task.state = state;
                task
            })
            .collect();
        Plan {
            id: Uuid::new_v4(),
            state: PlanState::Running,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            phases: vec![Phase { tasks }],
            deltas: deltas
                .iter()
                .map(|p| PlannedDelta {
                    path: path(p),
                    kind: DeltaKind::Create,
                })
                .collect(),
        }
    }

    fn paths(items: Vec<(ItemPath, DeltaKind)>) -> Vec<String> {
        items.into_iter().map(|(p, _)| p.to_string()).collect()
    }

    #[test]
    fn commits_only_fully_successful_items() {
        let plan = plan(
            vec![
                ("/a", TaskState::Success),
                ("/b", TaskState::Success),
                ("/b", TaskState::Failed),
                ("/c", TaskState::Initial),
            ],
            &["/a", "/b", "/c", "/d"],
        );
        assert_eq!(paths(committable(&plan, PlanState::Failed)), vec!["/a"]);
    }

    #[test]
    fn taskless_items_follow_nearest_ancestor_with_tasks() {
        let plan = plan(
            vec![("/a", TaskState::Success), ("/b", TaskState::Failed)],
            &["/a", "/a/items", "/a/items/x/list", "/b", "/b/items"],
        );
        assert_eq!(
            paths(committable(&plan, PlanState::Failed)),
            vec!["/a", "/a/items", "/a/items/x/list"]
        );
    }

    #[test]
    fn orphan_taskless_items_wait_for_completion() {
        let plan = plan(vec![("/a", TaskState::Success)], &["/a", "/c/items"]);
        assert_eq!(paths(committable(&plan, PlanState::Stopped)), vec!["/a"]);
        assert_eq!(
            paths(committable(&plan, PlanState::Complete)),
            vec!["/a", "/c/items"]
        );
    }
}
