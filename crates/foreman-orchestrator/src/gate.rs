use crate::task_store::TaskStore;
use crate::types::{Task, TaskStatus};
use foreman_core::{channels, EventBus, ForemanError};
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Recomputes downstream eligibility after a task settles.
///
/// Completion unblocks dependents whose last unmet dependency it was.
/// Failure fails every transitive dependent straight away, so none of them
/// can ever start.
pub struct DependencyGate {
    tasks: Arc<TaskStore>,
    bus: Arc<EventBus>,
}

impl DependencyGate {
    pub fn new(tasks: Arc<TaskStore>, bus: Arc<EventBus>) -> Self {
        Self { tasks, bus }
    }

    /// `completed` reached `Completed`. Returns the tasks moved `Blocked -> Pending`.
    pub fn on_completed(&self, completed: Uuid) -> Vec<Task> {
        let mut unblocked = Vec::new();
        for dependent in self.tasks.dependents(completed) {
            match self.tasks.satisfy_dependency(dependent, completed) {
                Ok(Some(task)) => {
                    self.announce(&task, completed, "unblocked");
                    unblocked.push(task);
                }
                Ok(None) => {}
                Err(e) => warn!(task_id = %dependent, error = %e, "Could not record completed dependency"),
            }
        }
        unblocked
    }

    /// `failed` reached `Failed` with `reason`. Returns every dependent that
    /// this cascade failed.
    pub fn on_failed(&self, failed: Uuid, reason: &str) -> Vec<Task> {
        let origin = match self.tasks.get(failed) {
            Ok(task) => cascade_reason(Some(&task.key), failed, reason),
            Err(_) => cascade_reason(None, failed, reason),
        };

        let mut cascaded = Vec::new();
        let mut seen = HashSet::from([failed]);
        let mut queue: VecDeque<Uuid> = self.tasks.dependents(failed).into();

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            match self.tasks.fail(id, &origin) {
                Ok(Some(task)) => {
                    self.announce(&task, failed, "cascaded");
                    cascaded.push(task);
                }
                Ok(None) => {}
                Err(e) => warn!(task_id = %id, error = %e, "Could not cascade dependency failure"),
            }
            queue.extend(self.tasks.dependents(id));
        }

        if !cascaded.is_empty() {
            info!(task_id = %failed, cascaded = cascaded.len(), "Dependency failure cascaded");
        }
        cascaded
    }

    /// Catch a task created against a dependency that has already failed.
    pub fn on_created(&self, task: &Task) -> Option<Task> {
        let failed_dep = task.unmet.iter().find_map(|dep| {
            self.tasks
                .get(*dep)
                .ok()
                .filter(|t| t.status == TaskStatus::Failed)
        })?;
        let reason = failed_dep
            .failure_reason
            .clone()
            .unwrap_or_else(|| "unknown cause".to_string());
        let origin = cascade_reason(Some(&failed_dep.key), failed_dep.id, &reason);
        match self.tasks.fail(task.id, &origin) {
            Ok(Some(failed)) => {
                self.announce(&failed, failed_dep.id, "cascaded");
                Some(failed)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Could not fail task created after its dependency failed");
                None
            }
        }
    }

    fn announce(&self, task: &Task, trigger: Uuid, outcome: &str) {
        self.bus.publish(
            channels::DEPENDENCY_GATE,
            json!({
                "workflow_id": task.workflow_id,
                "task_id": task.id,
                "trigger": trigger,
                "outcome": outcome,
                "status": task.status,
            }),
        );
    }
}

/// Failure reason recorded on a dependent of the failed task `origin`.
fn cascade_reason(key: Option<&str>, origin: Uuid, reason: &str) -> String {
    let cause = match key {
        Some(key) => format!("'{key}' ({origin}): {reason}"),
        None => format!("{origin}: {reason}"),
    };
    ForemanError::DependencyFailed(cause).to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{AgentRole, NewTask};

    struct Fixture {
        tasks: Arc<TaskStore>,
        bus: Arc<EventBus>,
        gate: DependencyGate,
        wf: Uuid,
    }

    fn fixture() -> Fixture {
        let tasks = Arc::new(TaskStore::new());
        let bus = Arc::new(EventBus::default());
        let gate = DependencyGate::new(Arc::clone(&tasks), Arc::clone(&bus));
        Fixture {
            tasks,
            bus,
            gate,
            wf: Uuid::new_v4(),
        }
    }

    impl Fixture {
        fn add(&self, key: &str, deps: Vec<Uuid>) -> Task {
            self.tasks
                .create_task(
                    self.wf,
                    NewTask::new(key, format!("task {key}"), AgentRole::Cost).with_dependencies(deps),
                )
                .unwrap()
        }

        fn run_to_completion(&self, id: Uuid) {
            self.tasks.transition(id, TaskStatus::Pending, TaskStatus::Assigned, None).unwrap();
            self.tasks.transition(id, TaskStatus::Assigned, TaskStatus::InProgress, None).unwrap();
            self.tasks.complete(id, "ok".into()).unwrap();
        }
    }

    #[test]
    fn test_completion_unblocks_only_fully_satisfied_dependents() {
        let f = fixture();
        let a = f.add("a", vec![]);
        let b = f.add("b", vec![]);
        let only_a = f.add("only-a", vec![a.id]);
        let both = f.add("both", vec![a.id, b.id]);

        f.run_to_completion(a.id);
        let unblocked = f.gate.on_completed(a.id);
        assert_eq!(unblocked.len(), 1);
        assert_eq!(unblocked[0].id, only_a.id);
        assert_eq!(f.tasks.get(both.id).unwrap().status, TaskStatus::Blocked);

        f.run_to_completion(b.id);
        let unblocked = f.gate.on_completed(b.id);
        assert_eq!(unblocked[0].id, both.id);
        assert_eq!(f.tasks.get(both.id).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_failure_cascades_directly_from_blocked() {
        let f = fixture();
        let b = f.add("b", vec![]);
        let a = f.add("a", vec![b.id]);
        let mut sub = f.bus.subscribe(channels::DEPENDENCY_GATE);

        f.tasks.fail(b.id, "supplier quote timed out").unwrap();
        let cascaded = f.gate.on_failed(b.id, "supplier quote timed out");

        assert_eq!(cascaded.len(), 1);
        let a = f.tasks.get(a.id).unwrap();
        assert_eq!(a.status, TaskStatus::Failed);
        let reason = a.failure_reason.unwrap();
        assert!(reason.starts_with("Dependency failed: 'b'"), "{reason}");
        assert!(reason.contains(&b.id.to_string()), "{reason}");
        assert!(reason.contains("supplier quote timed out"), "{reason}");

        let event = sub.try_recv().unwrap();
        assert_eq!(event.payload["outcome"], "cascaded");
    }

    #[test]
    fn test_failure_cascades_transitively_with_origin() {
        let f = fixture();
        let root = f.add("root", vec![]);
        let mid = f.add("mid", vec![root.id]);
        let leaf = f.add("leaf", vec![mid.id]);
        let side = f.add("side", vec![]);
        let joined = f.add("joined", vec![side.id, leaf.id]);

        f.tasks.fail(root.id, "permit rejected").unwrap();
        let cascaded = f.gate.on_failed(root.id, "permit rejected");

        let ids: HashSet<Uuid> = cascaded.iter().map(|t| t.id).collect();
        assert_eq!(ids, HashSet::from([mid.id, leaf.id, joined.id]));
        for id in [mid.id, leaf.id, joined.id] {
            let t = f.tasks.get(id).unwrap();
            assert!(t.failure_reason.unwrap().contains("'root'"));
        }
        assert_eq!(f.tasks.get(side.id).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_on_created_after_dependency_failed() {
        let f = fixture();
        let dep = f.add("dep", vec![]);
        f.tasks.fail(dep.id, "cancelled").unwrap();

        let late = f.add("late", vec![dep.id]);
        assert_eq!(late.status, TaskStatus::Blocked);
        let failed = f.gate.on_created(&late).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.failure_reason.unwrap().contains("cancelled"));
    }

    #[test]
    fn test_on_created_with_healthy_dependency_is_noop() {
        let f = fixture();
        let dep = f.add("dep", vec![]);
        let t = f.add("t", vec![dep.id]);
        assert!(f.gate.on_created(&t).is_none());
    }
}
