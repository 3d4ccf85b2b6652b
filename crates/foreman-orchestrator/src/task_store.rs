use crate::types::{NewTask, Task, TaskStatus};
use chrono::Utc;
use foreman_core::{ForemanError, ForemanResult};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Authoritative owner of every task and its status.
///
/// Each task sits behind its own lock, so a status change is a single
/// compare-expected-then-set step and independent tasks never contend.
/// Callers get cloned snapshots, never references into the store.
pub struct TaskStore {
    tasks: RwLock<HashMap<Uuid, Arc<Mutex<Task>>>>,
    /// Reverse dependency edges: task -> tasks that depend on it.
    dependents: RwLock<HashMap<Uuid, BTreeSet<Uuid>>>,
    by_workflow: RwLock<HashMap<Uuid, Vec<Uuid>>>,
    next_seq: AtomicU64,
}

impl TaskStore {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            dependents: RwLock::new(HashMap::new()),
            by_workflow: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Create a task. It starts `Blocked` when any dependency has not
    /// completed, otherwise `Pending`. Dependencies must already exist.
    pub fn create_task(&self, workflow_id: Uuid, spec: NewTask) -> ForemanResult<Task> {
        if spec.description.trim().is_empty() {
            return Err(ForemanError::Validation(format!(
                "task '{}' has an empty description",
                spec.key
            )));
        }
        for request in &spec.resources {
            request.validate()?;
        }

        let id = Uuid::new_v4();
        let dependencies: BTreeSet<Uuid> = spec.dependencies.iter().copied().collect();

        // Registering the reverse edges and reading dependency statuses under
        // one write lock means a dependency completing concurrently is either
        // seen as completed here or sees this task as a dependent.
        let mut dependents = self.dependents.write();
        let mut unmet = BTreeSet::new();
        for dep in &dependencies {
            let status = self.entry(*dep)?.lock().status;
            if status != TaskStatus::Completed {
                unmet.insert(*dep);
            }
        }
        for dep in &dependencies {
            dependents.entry(*dep).or_default().insert(id);
        }

        let now = Utc::now();
        let status = if unmet.is_empty() {
            TaskStatus::Pending
        } else {
            TaskStatus::Blocked
        };
        let task = Task {
            id,
            workflow_id,
            key: spec.key,
            description: spec.description,
            assigned_agent: spec.assigned_agent,
            priority: spec.priority,
            status,
            dependencies,
            unmet,
            resources: spec.resources,
            metadata: spec.metadata,
            output: None,
            failure_reason: None,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            created_at: now,
            updated_at: now,
        };
        self.tasks.write().insert(id, Arc::new(Mutex::new(task.clone())));
        drop(dependents);
        self.by_workflow.write().entry(workflow_id).or_default().push(id);

        debug!(task_id = %id, key = %task.key, status = %task.status, "Task created");
        Ok(task)
    }

    /// Move a task from `expected` to `next`.
    ///
    /// Fails with `InvalidTransition` when the pair is not in the transition
    /// table, when `next` needs every dependency completed and some are not,
    /// or when failing without a reason. Fails with `StaleStatus` when the
    /// task is no longer in `expected`.
    pub fn transition(
        &self,
        id: Uuid,
        expected: TaskStatus,
        next: TaskStatus,
        reason: Option<&str>,
    ) -> ForemanResult<Task> {
        let entry = self.entry(id)?;
        let mut task = entry.lock();
        if task.status != expected {
            if !expected.can_transition_to(next) {
                return Err(invalid(&task, expected, next));
            }
            return Err(ForemanError::StaleStatus {
                task_id: id.to_string(),
                expected: expected.to_string(),
                actual: task.status.to_string(),
            });
        }
        apply(&mut task, next, reason)?;
        Ok(task.clone())
    }

    /// `InProgress -> Completed`, recording the task's output.
    pub fn complete(&self, id: Uuid, output: String) -> ForemanResult<Task> {
        let entry = self.entry(id)?;
        let mut task = entry.lock();
        if task.status != TaskStatus::InProgress {
            return Err(ForemanError::StaleStatus {
                task_id: id.to_string(),
                expected: TaskStatus::InProgress.to_string(),
                actual: task.status.to_string(),
            });
        }
        apply(&mut task, TaskStatus::Completed, None)?;
        task.output = Some(output);
        Ok(task.clone())
    }

    /// Fail a task from whatever non-terminal status it is in.
    ///
    /// Returns `None` when the task had already finished.
    pub fn fail(&self, id: Uuid, reason: &str) -> ForemanResult<Option<Task>> {
        let entry = self.entry(id)?;
        let mut task = entry.lock();
        if task.status.is_terminal() {
            return Ok(None);
        }
        apply(&mut task, TaskStatus::Failed, Some(reason))?;
        Ok(Some(task.clone()))
    }

    /// Record that `dependency` completed. If that was the last unmet
    /// dependency of a blocked task, it moves to `Pending` and the new
    /// snapshot is returned.
    pub fn satisfy_dependency(&self, id: Uuid, dependency: Uuid) -> ForemanResult<Option<Task>> {
        let entry = self.entry(id)?;
        let mut task = entry.lock();
        if !task.unmet.remove(&dependency) {
            return Ok(None);
        }
        task.updated_at = Utc::now();
        if task.status == TaskStatus::Blocked && task.unmet.is_empty() {
            apply(&mut task, TaskStatus::Pending, None)?;
            return Ok(Some(task.clone()));
        }
        Ok(None)
    }

    pub fn get(&self, id: Uuid) -> ForemanResult<Task> {
        Ok(self.entry(id)?.lock().clone())
    }

    /// Tasks that list `id` as a dependency.
    pub fn dependents(&self, id: Uuid) -> Vec<Uuid> {
        self.dependents
            .read()
            .get(&id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every task of a workflow, in creation order.
    pub fn list(&self, workflow_id: Uuid) -> Vec<Task> {
        let ids = self.by_workflow.read().get(&workflow_id).cloned().unwrap_or_default();
        let tasks = self.tasks.read();
        ids.iter()
            .filter_map(|id| tasks.get(id).map(|t| t.lock().clone()))
            .collect()
    }

    /// Ready tasks of a workflow: most urgent first, then oldest first.
    pub fn ready(&self, workflow_id: Uuid) -> Vec<Task> {
        let mut ready: Vec<Task> = self
            .list(workflow_id)
            .into_iter()
            .filter(Task::is_ready)
            .collect();
        ready.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        ready
    }

    /// Drop every task of a workflow along with its dependency edges.
    /// Returns how many tasks were removed.
    pub fn forget_workflow(&self, workflow_id: Uuid) -> usize {
        let Some(ids) = self.by_workflow.write().remove(&workflow_id) else {
            return 0;
        };
        let mut dependents = self.dependents.write();
        let mut tasks = self.tasks.write();
        for id in &ids {
            dependents.remove(id);
            let Some(task) = tasks.remove(id) else { continue };
            for dep in &task.lock().dependencies {
                if let Some(edges) = dependents.get_mut(dep) {
                    edges.remove(id);
                }
            }
        }
        debug!(workflow_id = %workflow_id, tasks = ids.len(), "Workflow tasks forgotten");
        ids.len()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, id: Uuid) -> ForemanResult<Arc<Mutex<Task>>> {
        self.tasks
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| ForemanError::NotFound(format!("task {id}")))
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(task: &Task, from: TaskStatus, to: TaskStatus) -> ForemanError {
    ForemanError::InvalidTransition {
        task_id: task.id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}

/// The one place a status actually changes.
fn apply(task: &mut Task, next: TaskStatus, reason: Option<&str>) -> ForemanResult<()> {
    if !task.status.can_transition_to(next) {
        return Err(invalid(task, task.status, next));
    }
    if next.requires_dependencies_met() && !task.unmet.is_empty() {
        return Err(ForemanError::InvalidTransition {
            task_id: task.id.to_string(),
            from: task.status.to_string(),
            to: format!("{next} ({} unmet dependencies)", task.unmet.len()),
        });
    }
    if next == TaskStatus::Failed {
        match reason.map(str::trim) {
            Some(r) if !r.is_empty() => task.failure_reason = Some(r.to_string()),
            _ => {
                return Err(ForemanError::InvalidTransition {
                    task_id: task.id.to_string(),
                    from: task.status.to_string(),
                    to: format!("{next} without a reason"),
                })
            }
        }
    }
    debug!(task_id = %task.id, from = %task.status, to = %next, "Task transition");
    task.status = next;
    task.updated_at = Utc::now();
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{AgentRole, Priority};

    fn new_task(key: &str, deps: Vec<Uuid>) -> NewTask {
        NewTask::new(key, format!("task {key}"), AgentRole::Technical).with_dependencies(deps)
    }

    #[test]
    fn test_create_without_dependencies_is_pending() {
        let store = TaskStore::new();
        let wf = Uuid::new_v4();
        let task = store.create_task(wf, new_task("a", vec![])).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.is_ready());
        assert_eq!(store.list(wf).len(), 1);
    }

    #[test]
    fn test_create_with_unmet_dependency_is_blocked() {
        let store = TaskStore::new();
        let wf = Uuid::new_v4();
        let a = store.create_task(wf, new_task("a", vec![])).unwrap();
        let b = store.create_task(wf, new_task("b", vec![a.id])).unwrap();
        assert_eq!(b.status, TaskStatus::Blocked);
        assert_eq!(b.unmet.len(), 1);
        assert_eq!(store.dependents(a.id), vec![b.id]);
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let store = TaskStore::new();
        let err = store
            .create_task(Uuid::new_v4(), new_task("a", vec![Uuid::new_v4()]))
            .unwrap_err();
        assert!(matches!(err, ForemanError::NotFound(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_dependency_already_completed_counts_as_met() {
        let store = TaskStore::new();
        let wf = Uuid::new_v4();
        let a = store.create_task(wf, new_task("a", vec![])).unwrap();
        store.transition(a.id, TaskStatus::Pending, TaskStatus::Assigned, None).unwrap();
        store.transition(a.id, TaskStatus::Assigned, TaskStatus::InProgress, None).unwrap();
        store.complete(a.id, "done".into()).unwrap();

        let b = store.create_task(wf, new_task("b", vec![a.id])).unwrap();
        assert_eq!(b.status, TaskStatus::Pending);
    }

    #[test]
    fn test_full_lifecycle() {
        let store = TaskStore::new();
        let t = store.create_task(Uuid::new_v4(), new_task("a", vec![])).unwrap();
        store.transition(t.id, TaskStatus::Pending, TaskStatus::Assigned, None).unwrap();
        store.transition(t.id, TaskStatus::Assigned, TaskStatus::InProgress, None).unwrap();
        let done = store.complete(t.id, "report".into()).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.output.as_deref(), Some("report"));
    }

    #[test]
    fn test_transition_outside_table_is_invalid() {
        let store = TaskStore::new();
        let t = store.create_task(Uuid::new_v4(), new_task("a", vec![])).unwrap();
        let err = store
            .transition(t.id, TaskStatus::Pending, TaskStatus::Completed, None)
            .unwrap_err();
        assert!(matches!(err, ForemanError::InvalidTransition { .. }));
        assert_eq!(store.get(t.id).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_terminal_tasks_cannot_move() {
        let store = TaskStore::new();
        let t = store.create_task(Uuid::new_v4(), new_task("a", vec![])).unwrap();
        store.fail(t.id, "boom").unwrap();
        let err = store
            .transition(t.id, TaskStatus::Failed, TaskStatus::Pending, None)
            .unwrap_err();
        assert!(matches!(err, ForemanError::InvalidTransition { .. }));
        assert!(store.fail(t.id, "again").unwrap().is_none());
        assert_eq!(store.get(t.id).unwrap().failure_reason.as_deref(), Some("boom"));
    }

    #[test]
    fn test_stale_expected_status() {
        let store = TaskStore::new();
        let t = store.create_task(Uuid::new_v4(), new_task("a", vec![])).unwrap();
        store.transition(t.id, TaskStatus::Pending, TaskStatus::Assigned, None).unwrap();
        let err = store
            .transition(t.id, TaskStatus::Pending, TaskStatus::Assigned, None)
            .unwrap_err();
        assert!(matches!(err, ForemanError::StaleStatus { .. }));
    }

    #[test]
    fn test_failed_requires_reason() {
        let store = TaskStore::new();
        let t = store.create_task(Uuid::new_v4(), new_task("a", vec![])).unwrap();
        assert!(store.fail(t.id, "  ").is_err());
        assert!(store
            .transition(t.id, TaskStatus::Pending, TaskStatus::Failed, None)
            .is_err());
        assert_eq!(store.get(t.id).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_blocked_cannot_skip_to_pending_with_unmet() {
        let store = TaskStore::new();
        let wf = Uuid::new_v4();
        let a = store.create_task(wf, new_task("a", vec![])).unwrap();
        let b = store.create_task(wf, new_task("b", vec![a.id])).unwrap();
        let err = store
            .transition(b.id, TaskStatus::Blocked, TaskStatus::Pending, None)
            .unwrap_err();
        assert!(matches!(err, ForemanError::InvalidTransition { .. }));
    }

    #[test]
    fn test_satisfy_dependency_unblocks_once() {
        let store = TaskStore::new();
        let wf = Uuid::new_v4();
        let a = store.create_task(wf, new_task("a", vec![])).unwrap();
        let b = store.create_task(wf, new_task("b", vec![])).unwrap();
        let c = store.create_task(wf, new_task("c", vec![a.id, b.id])).unwrap();

        assert!(store.satisfy_dependency(c.id, a.id).unwrap().is_none());
        assert_eq!(store.get(c.id).unwrap().status, TaskStatus::Blocked);
        let unblocked = store.satisfy_dependency(c.id, b.id).unwrap().unwrap();
        assert_eq!(unblocked.status, TaskStatus::Pending);
        // A duplicate notification is a no-op.
        assert!(store.satisfy_dependency(c.id, b.id).unwrap().is_none());
    }

    #[test]
    fn test_ready_orders_by_priority_then_age() {
        let store = TaskStore::new();
        let wf = Uuid::new_v4();
        let low = store
            .create_task(wf, new_task("low", vec![]).with_priority(Priority::LOW))
            .unwrap();
        let high = store
            .create_task(wf, new_task("high", vec![]).with_priority(Priority::HIGH))
            .unwrap();
        let mid_a = store.create_task(wf, new_task("mid-a", vec![])).unwrap();
        let mid_b = store.create_task(wf, new_task("mid-b", vec![])).unwrap();
        let blocked = store.create_task(wf, new_task("blocked", vec![low.id])).unwrap();

        let ids: Vec<Uuid> = store.ready(wf).iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![high.id, mid_a.id, mid_b.id, low.id]);
        assert!(!ids.contains(&blocked.id));
    }

    #[test]
    fn test_forget_workflow_drops_only_its_tasks() {
        let store = TaskStore::new();
        let (wf, other) = (Uuid::new_v4(), Uuid::new_v4());
        let a = store.create_task(wf, new_task("a", vec![])).unwrap();
        let b = store.create_task(wf, new_task("b", vec![a.id])).unwrap();
        let kept = store.create_task(other, new_task("kept", vec![])).unwrap();

        assert_eq!(store.forget_workflow(wf), 2);
        assert_eq!(store.len(), 1);
        assert!(store.list(wf).is_empty());
        assert!(store.dependents(a.id).is_empty());
        assert!(matches!(store.get(b.id), Err(ForemanError::NotFound(_))));
        assert_eq!(store.get(kept.id).unwrap().key, "kept");
        assert_eq!(store.forget_workflow(wf), 0);
    }

    #[test]
    fn test_concurrent_transitions_single_winner() {
        let store = Arc::new(TaskStore::new());
        let t = store.create_task(Uuid::new_v4(), new_task("a", vec![])).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .transition(t.id, TaskStatus::Pending, TaskStatus::Assigned, None)
                        .is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(store.get(t.id).unwrap().status, TaskStatus::Assigned);
    }
}
