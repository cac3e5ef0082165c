//! Turn the model's pending deltas into a phased plan.
//!
//! Every plug-in is asked for the tasks of every pending item. Tasks are
//! then ordered by a dependency graph and layered: a task's phase is the
//! length of the longest dependency chain leading to it, so each phase only
//! depends on earlier ones. Edges come from
//!
//! - the tree: parents before children for create/update, children before
//!   parents for removal;
//! - inheritance: sources before references for create/update, references
//!   before sources for removal;
//! - explicit `requires_tasks` / `requires_items` declared by plug-ins.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::Utc;
use uuid::Uuid;

use cairn_model::{
    DeltaKind, ErrorKind, ItemPath, Model, ModelError, ModelErrors, ModelResult, PendingDelta,
};

use crate::plugin::PluginRegistry;

use super::{Phase, Plan, PlanState, PlannedDelta, Task, TaskId};

/// Validate the model and build a new plan in state Initial.
pub fn build_plan(model: &Model, plugins: &PluginRegistry) -> ModelResult<Plan> {
    let mut errors: Vec<ModelError> = match model.validate() {
        Ok(()) => Vec::new(),
        Err(errs) => errs.into_iter().collect(),
    };
    for plugin in plugins.iter() {
        errors.extend(plugin.validate_model(model));
    }
    ModelErrors::check(errors)?;

    let deltas = model.pending_deltas();
    let tasks = collect_tasks(model, plugins, &deltas)?;
    if tasks.is_empty() {
        return Err(ModelError::new(
            ErrorKind::DoNothingPlan,
            "Create plan failed: no tasks were generated",
        )
        .into());
    }

    let phases = layer(&tasks, &deltas)?;
    let plan = Plan {
        id: Uuid::new_v4(),
        state: PlanState::Initial,
        created_at: Utc::now(),
        started_at: None,
        finished_at: None,
        phases,
        deltas: deltas
            .iter()
            .map(|d| PlannedDelta {
                path: d.path.clone(),
                kind: d.kind,
            })
            .collect(),
    };
    tracing::info!(
        plan_id = %plan.id,
        phases = plan.phases.len(),
        tasks = plan.task_count(),
        items = plan.deltas.len(),
        "plan created"
    );
    Ok(plan)
}

fn collect_tasks(
    model: &Model,
    plugins: &PluginRegistry,
    deltas: &[PendingDelta],
) -> ModelResult<Vec<Task>> {
    let mut tasks = Vec::new();
    let mut errors = Vec::new();
    for delta in deltas {
        let item = model.query(delta.path.as_str())?;
        for plugin in plugins.iter() {
            match plugin.tasks_for(model, &item, delta.kind) {
                Ok(specs) => tasks.extend(specs.into_iter().map(|spec| {
                    Task::from_spec(spec, delta.path.clone(), delta.kind, plugin.name())
                })),
                Err(e) => errors.push(
                    ModelError::new(
                        ErrorKind::Plugin,
                        format!("Plugin {} failed to generate tasks: {e:#}", plugin.name()),
                    )
                    .at(&delta.path),
                ),
            }
        }
    }
    ModelErrors::check(errors)?;
    Ok(tasks)
}

/// Order tasks into phases (Kahn's algorithm, tracking longest-path depth).
fn layer(tasks: &[Task], deltas: &[PendingDelta]) -> ModelResult<Vec<Phase>> {
    let n = tasks.len();
    let by_id: HashMap<TaskId, usize> = tasks.iter().enumerate().map(|(i, t)| (t.id, i)).collect();
    let mut by_item: BTreeMap<&ItemPath, Vec<usize>> = BTreeMap::new();
    for (i, task) in tasks.iter().enumerate() {
        by_item.entry(&task.item_path).or_default().push(i);
    }
    let sources: HashMap<&ItemPath, &ItemPath> = deltas
        .iter()
        .filter_map(|d| d.source.as_ref().map(|s| (&d.path, s)))
        .collect();

    let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut in_degree = vec![0usize; n];
    let mut add_edge = |before: usize, after: usize| {
        if before != after && !adj[before].contains(&after) {
            adj[before].push(after);
            in_degree[after] += 1;
        }
    };

    let mut unknown = Vec::new();
    for (i, task) in tasks.iter().enumerate() {
        let removing = task.delta == DeltaKind::Remove;

        // Tree order against every ancestor's tasks.
        let mut ancestor = task.item_path.parent();
        while let Some(path) = ancestor {
            for &j in by_item.get(&path).into_iter().flatten() {
                let other_removing = tasks[j].delta == DeltaKind::Remove;
                match (removing, other_removing) {
                    (false, false) => add_edge(j, i),
                    (true, true) => add_edge(i, j),
                    _ => {}
                }
            }
            ancestor = path.parent();
        }

        // Inheritance order against the source's tasks.
        if let Some(source) = sources.get(&task.item_path) {
            for &j in by_item.get(*source).into_iter().flatten() {
                let other_removing = tasks[j].delta == DeltaKind::Remove;
                match (removing, other_removing) {
                    (false, false) => add_edge(j, i),
                    (true, true) => add_edge(i, j),
                    _ => {}
                }
            }
        }

        for dep in &task.requires_tasks {
            match by_id.get(dep) {
                Some(&j) => add_edge(j, i),
                None => unknown.push(
                    ModelError::new(
                        ErrorKind::Plugin,
                        format!("Task {:?} requires unknown task {dep}", task.description),
                    )
                    .at(&task.item_path),
                ),
            }
        }
        for path in &task.requires_items {
            for &j in by_item.get(path).into_iter().flatten() {
                add_edge(j, i);
            }
        }
    }
    ModelErrors::check(unknown)?;

    let mut depth = vec![0usize; n];
    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut sorted = 0usize;
    while let Some(node) = queue.pop_front() {
        sorted += 1;
        for &next in &adj[node] {
            depth[next] = depth[next].max(depth[node] + 1);
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if sorted != n {
        let mut cycle: Vec<String> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg > 0)
            .map(|(i, _)| format!("{} ({})", tasks[i].item_path, tasks[i].description))
            .collect();
        cycle.sort();
        return Err(ModelError::internal(format!(
            "Task dependency cycle detected: {}",
            cycle.join(", ")
        ))
        .into());
    }

    let phase_count = depth.iter().copied().max().map_or(0, |d| d + 1);
    let mut phases: Vec<Phase> = (0..phase_count).map(|_| Phase { tasks: Vec::new() }).collect();
    for (i, task) in tasks.iter().enumerate() {
        phases[depth[i]].tasks.push(task.clone());
    }
    for phase in &mut phases {
        phase.tasks.sort_by(|a, b| {
            a.item_path
                .cmp(&b.item_path)
                .then_with(|| a.description.cmp(&b.description))
        });
    }
    Ok(phases)
}
