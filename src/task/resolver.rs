//! Dependency resolution over a Task List.
//!
//! Pure functions only; nothing here touches disk.
//!
//! # Policy
//! - A task is runnable when it does not pass yet and every dependency id is
//!   in the completed set.
//! - A dependency on an id that does not exist keeps the task blocked forever
//!   (it is reported by `dangling_dependencies`, never an error).
//! - A dependency cycle is a structural error, distinct from "nothing
//!   runnable yet".

use std::collections::{HashMap, HashSet};

use super::Task;

/// Structural errors in a dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("Dependency cycle detected: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },
}

/// A dependency edge pointing at an id missing from the list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingDependency {
    pub task_id: String,
    pub missing_id: String,
}

/// Tasks eligible to run given the completed set, in declaration order.
pub fn runnable<'a>(tasks: &'a [Task], completed: &HashSet<String>) -> Vec<&'a Task> {
    tasks
        .iter()
        .filter(|t| !t.passes && !completed.contains(&t.id))
        .filter(|t| t.depends_on.iter().all(|dep| completed.contains(dep)))
        .collect()
}

/// Runnable tasks after checking the graph for cycles.
///
/// # Errors
/// Returns `ResolveError::DependencyCycle` when the graph can never drain.
pub fn resolve<'a>(
    tasks: &'a [Task],
    completed: &HashSet<String>,
) -> Result<Vec<&'a Task>, ResolveError> {
    detect_cycle(tasks)?;
    Ok(runnable(tasks, completed))
}

/// Order runnable tasks for dispatch: priority first (lower value wins), then
/// declaration order.
pub fn dispatch_order<'a>(tasks: &'a [Task], runnable: &[&'a Task]) -> Vec<&'a Task> {
    let position: HashMap<&str, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .rev()
        .collect();
    let mut ordered = runnable.to_vec();
    ordered.sort_by_key(|t| (t.priority, position.get(t.id.as_str()).copied()));
    ordered
}

/// Every dependency id that does not name a task of the list.
pub fn dangling_dependencies(tasks: &[Task]) -> Vec<DanglingDependency> {
    let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    tasks
        .iter()
        .flat_map(|t| {
            t.depends_on
                .iter()
                .filter(|dep| !ids.contains(dep.as_str()))
                .map(move |dep| DanglingDependency {
                    task_id: t.id.clone(),
                    missing_id: dep.clone(),
                })
        })
        .collect()
}

/// Find a dependency cycle, if any.
///
/// Edges to unknown ids are ignored (they block, they do not loop). A task
/// depending on itself is a cycle of length one.
pub fn detect_cycle(tasks: &[Task]) -> Result<(), ResolveError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let index: HashMap<&str, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();
    let mut marks = vec![Mark::Unvisited; tasks.len()];

    for start in 0..tasks.len() {
        if marks[start] != Mark::Unvisited {
            continue;
        }
        // Iterative DFS: (node, next dependency to visit)
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        marks[start] = Mark::InProgress;

        while let Some(frame) = stack.last_mut() {
            let node = frame.0;
            let deps = &tasks[node].depends_on;
            if frame.1 >= deps.len() {
                marks[node] = Mark::Done;
                stack.pop();
                continue;
            }
            let dep = &deps[frame.1];
            frame.1 += 1;
            let Some(&child) = index.get(dep.as_str()) else {
                continue;
            };
            match marks[child] {
                Mark::Unvisited => {
                    marks[child] = Mark::InProgress;
                    stack.push((child, 0));
                }
                Mark::InProgress => {
                    let from = stack
                        .iter()
                        .position(|&(n, _)| n == child)
                        .unwrap_or(0);
                    let mut cycle: Vec<String> = stack[from..]
                        .iter()
                        .map(|&(n, _)| tasks[n].id.clone())
                        .collect();
                    cycle.push(tasks[child].id.clone());
                    return Err(ResolveError::DependencyCycle { cycle });
                }
                Mark::Done => {}
            }
        }
    }
    Ok(())
}

/// Group pending tasks into stages that can run together (Kahn's algorithm).
///
/// Stage `n` only depends on tasks from earlier stages or tasks that already
/// pass. Tasks blocked by dangling dependencies are left out.
///
/// # Errors
/// Returns `ResolveError::DependencyCycle` if the graph contains a cycle.
pub fn execution_stages(tasks: &[Task]) -> Result<Vec<Vec<String>>, ResolveError> {
    detect_cycle(tasks)?;

    let mut completed: HashSet<String> = tasks
        .iter()
        .filter(|t| t.passes)
        .map(|t| t.id.clone())
        .collect();
    let mut stages = Vec::new();

    loop {
        let ready: Vec<String> = runnable(tasks, &completed)
            .into_iter()
            .map(|t| t.id.clone())
            .collect();
        if ready.is_empty() {
            break;
        }
        completed.extend(ready.iter().cloned());
        stages.push(ready);
    }
    Ok(stages)
}
