use crate::types::{AgentMetrics, AgentRole, AgentState, WorkerStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Tracks worker state and metrics for every role.
pub struct AgentMonitor {
    states: Arc<RwLock<HashMap<AgentRole, AgentState>>>,
}

impl AgentMonitor {
    pub fn new() -> Self {
        let states = AgentRole::ALL
            .iter()
            .map(|role| {
                (
                    *role,
                    AgentState {
                        role: *role,
                        active_tasks: Vec::new(),
                        status: WorkerStatus::Idle,
                        metrics: AgentMetrics::default(),
                    },
                )
            })
            .collect();
        Self {
            states: Arc::new(RwLock::new(states)),
        }
    }

    /// A worker of `role` picked up `task_id`.
    pub async fn start_task(&self, role: AgentRole, task_id: Uuid) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(&role) {
            state.active_tasks.push(task_id);
            state.status = WorkerStatus::Working;
        }
    }

    /// A worker of `role` let go of `task_id`, whatever the outcome.
    pub async fn finish_task(&self, role: AgentRole, task_id: Uuid) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(&role) {
            state.active_tasks.retain(|id| *id != task_id);
            if state.active_tasks.is_empty() && state.status == WorkerStatus::Working {
                state.status = WorkerStatus::Idle;
            }
        }
    }

    pub async fn record_completion(&self, role: AgentRole, duration_ms: u64) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(&role) {
            state.metrics.tasks_completed += 1;
            state.metrics.duration_ms += duration_ms;
            if state.status == WorkerStatus::Error {
                state.status = WorkerStatus::Working;
            }
        }
    }

    /// Record a failed task. The role shows `Error` until its next success.
    pub async fn record_error(&self, role: AgentRole, duration_ms: u64) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(&role) {
            state.metrics.tasks_failed += 1;
            state.metrics.duration_ms += duration_ms;
            state.status = WorkerStatus::Error;
        }
    }

    /// Count one external call attempt.
    pub async fn record_attempt(&self, role: AgentRole) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(&role) {
            state.metrics.attempts += 1;
        }
    }

    /// All roles, in [`AgentRole::ALL`] order.
    pub async fn snapshot(&self) -> Vec<AgentState> {
        let states = self.states.read().await;
        AgentRole::ALL
            .iter()
            .filter_map(|role| states.get(role).cloned())
            .collect()
    }

    pub async fn get_state(&self, role: AgentRole) -> Option<AgentState> {
        let states = self.states.read().await;
        states.get(&role).cloned()
    }

    pub async fn aggregate_metrics(&self) -> AgentMetrics {
        let states = self.states.read().await;
        let mut total = AgentMetrics::default();
        for state in states.values() {
            total.tasks_completed += state.metrics.tasks_completed;
            total.tasks_failed += state.metrics.tasks_failed;
            total.attempts += state.metrics.attempts;
            total.duration_ms += state.metrics.duration_ms;
        }
        total
    }

    pub async fn to_json(&self) -> serde_json::Value {
        let states = self.snapshot().await;
        let aggregate = self.aggregate_metrics().await;
        serde_json::json!({
            "agents": states,
            "aggregate": aggregate,
        })
    }
}

impl Default for AgentMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_state() {
        let monitor = AgentMonitor::new();
        let states = monitor.snapshot().await;
        assert_eq!(states.len(), 6);
        assert_eq!(states[0].role, AgentRole::Document);
        for state in &states {
            assert_eq!(state.status, WorkerStatus::Idle);
            assert!(state.active_tasks.is_empty());
        }
    }

    #[tokio::test]
    async fn test_parallel_tasks_for_one_role() {
        let monitor = AgentMonitor::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        monitor.start_task(AgentRole::Technical, a).await;
        monitor.start_task(AgentRole::Technical, b).await;
        monitor.finish_task(AgentRole::Technical, a).await;
        let state = monitor.get_state(AgentRole::Technical).await.unwrap();
        assert_eq!(state.status, WorkerStatus::Working);
        assert_eq!(state.active_tasks, vec![b]);

        monitor.finish_task(AgentRole::Technical, b).await;
        let state = monitor.get_state(AgentRole::Technical).await.unwrap();
        assert_eq!(state.status, WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn test_error_then_recovery() {
        let monitor = AgentMonitor::new();
        monitor.record_error(AgentRole::Cost, 40).await;
        let state = monitor.get_state(AgentRole::Cost).await.unwrap();
        assert_eq!(state.status, WorkerStatus::Error);
        assert_eq!(state.metrics.tasks_failed, 1);

        monitor.record_completion(AgentRole::Cost, 60).await;
        let state = monitor.get_state(AgentRole::Cost).await.unwrap();
        assert_ne!(state.status, WorkerStatus::Error);
        assert_eq!(state.metrics.duration_ms, 100);
    }

    #[tokio::test]
    async fn test_aggregate_and_json() {
        let monitor = AgentMonitor::new();
        monitor.record_attempt(AgentRole::Document).await;
        monitor.record_attempt(AgentRole::Compliance).await;
        monitor.record_attempt(AgentRole::Compliance).await;
        monitor.record_completion(AgentRole::Compliance, 10).await;

        let agg = monitor.aggregate_metrics().await;
        assert_eq!(agg.attempts, 3);
        assert_eq!(agg.tasks_completed, 1);

        let json = monitor.to_json().await;
        assert!(json["agents"].is_array());
        assert_eq!(json["aggregate"]["attempts"], 3);
    }
}
