use crate::config::CoordinatorConfig;
use crate::conflicts::{ConflictLog, ConflictRecord, ConflictStatus};
use crate::gate::DependencyGate;
use crate::ledger::{Denial, Reservation, ResourceLedger};
use crate::monitor::AgentMonitor;
use crate::plan::WorkflowPlan;
use crate::profiles::{default_profiles, render_prompt, AgentProfile};
use crate::services::{SearchResult, Services};
use crate::task_store::TaskStore;
use crate::types::{
    AgentRole, NewTask, StatusCounts, Task, TaskStatus, WorkflowState, WorkflowStatus,
};
use chrono::{DateTime, Utc};
use foreman_core::{channels, CancelSignal, EventBus, ForemanError, ForemanResult, Subscription};
use foreman_resilience::{RateLimiter, RetryExecutor};
use foreman_store::{tables, MemoryStore, PersistentStore};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Per-workflow bookkeeping shared by the driver, the workers and callers.
struct WorkflowHandle {
    id: Uuid,
    name: String,
    workflow_type: String,
    details: serde_json::Value,
    plan: serde_json::Value,
    created_at: DateTime<Utc>,
    cancel: CancelSignal,
    /// Set once `cancel_workflow` starts; only `Cancelled` may be published after.
    cancelling: AtomicBool,
    /// Wakes the driver after `resume` or a capacity change.
    wake: Notify,
    state: watch::Sender<WorkflowState>,
    /// Flips to true once the driver and every worker it spawned have exited.
    stopped: watch::Sender<bool>,
}

impl WorkflowHandle {
    fn current(&self) -> WorkflowState {
        *self.state.borrow()
    }

    fn is_cancelling(&self) -> bool {
        self.cancelling.load(Ordering::SeqCst)
    }

    fn is_final(&self) -> bool {
        matches!(
            self.current(),
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }

    fn to_record(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "name": self.name,
            "type": self.workflow_type,
            "details": self.details,
            "plan": self.plan,
            "status": self.current(),
            "created_at": self.created_at,
            "updated_at": Utc::now(),
        })
    }
}

/// Top-level façade: admits workflow plans and drives their tasks to a
/// terminal state.
///
/// Each submitted workflow gets a driver task that launches ready tasks
/// into a bounded worker pool. A worker reserves the task's resources,
/// then calls the assigned role's services through the retry executor and
/// the rate limiter. Outcomes flow back through the task store and the
/// dependency gate, and every change is published on the event bus and
/// written to the persistent store.
pub struct WorkflowCoordinator {
    config: CoordinatorConfig,
    tasks: Arc<TaskStore>,
    gate: DependencyGate,
    ledger: Arc<ResourceLedger>,
    conflicts: Arc<ConflictLog>,
    bus: Arc<EventBus>,
    limiter: Arc<RateLimiter>,
    retry: RetryExecutor,
    services: Services,
    store: Arc<dyn PersistentStore>,
    monitor: Arc<AgentMonitor>,
    profiles: HashMap<AgentRole, AgentProfile>,
    workers: Arc<Semaphore>,
    workflows: RwLock<HashMap<Uuid, Arc<WorkflowHandle>>>,
}

impl WorkflowCoordinator {
    /// Build a coordinator with default profiles and an in-memory store.
    pub fn new(config: CoordinatorConfig, services: Services) -> ForemanResult<Self> {
        config.validate()?;

        let tasks = Arc::new(TaskStore::new());
        let bus = Arc::new(EventBus::new(config.event_buffer));
        let limiter = RateLimiter::from_config(&config.rate_limits, config.default_bucket);
        let profiles = default_profiles().into_iter().map(|p| (p.role, p)).collect();

        Ok(Self {
            gate: DependencyGate::new(Arc::clone(&tasks), Arc::clone(&bus)),
            tasks,
            ledger: Arc::new(ResourceLedger::from_capacities(&config.resources)),
            conflicts: Arc::new(ConflictLog::new()),
            bus,
            limiter: Arc::new(limiter),
            retry: RetryExecutor::new(config.retry.clone()),
            services,
            store: Arc::new(MemoryStore::new()),
            monitor: Arc::new(AgentMonitor::new()),
            profiles,
            workers: Arc::new(Semaphore::new(config.max_workers)),
            workflows: RwLock::new(HashMap::new()),
            config,
        })
    }

    /// Persist records to `store` instead of memory.
    pub fn with_store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = store;
        self
    }

    /// Replace the profiles of the given roles.
    pub fn with_profiles(mut self, profiles: Vec<AgentProfile>) -> Self {
        for profile in profiles {
            self.profiles.insert(profile.role, profile);
        }
        self
    }

    /// Configuration the coordinator was built with.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Task records of every workflow.
    pub fn tasks(&self) -> &Arc<TaskStore> {
        &self.tasks
    }

    /// Resource reservations.
    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    /// Recorded resource conflicts.
    pub fn conflicts(&self) -> &Arc<ConflictLog> {
        &self.conflicts
    }

    /// Per-role activity and metrics.
    pub fn monitor(&self) -> &Arc<AgentMonitor> {
        &self.monitor
    }

    /// Rate limiter shared by all service calls.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Event bus carrying progress updates.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Live progress on `channel`, e.g. [`channels::WORKFLOW_UPDATES`].
    pub fn subscribe(&self, channel: &str) -> Subscription {
        self.bus.subscribe(channel)
    }

    // -----------------------------------------------------------------------
    // Consumer-facing operations
    // -----------------------------------------------------------------------

    /// Create every task of `plan` and start driving the workflow.
    ///
    /// Fails without creating anything if the plan is malformed, names a
    /// role without a profile, or requests an unregistered resource type.
    pub async fn submit_workflow(self: &Arc<Self>, plan: WorkflowPlan) -> ForemanResult<Uuid> {
        let order = plan.execution_order()?;
        for planned in &order {
            if !self.profiles.contains_key(&planned.agent) {
                return Err(ForemanError::Validation(format!(
                    "task '{}': no profile for role '{}'",
                    planned.key, planned.agent
                )));
            }
            if let Some(unknown) = planned
                .resources
                .iter()
                .find(|r| !self.ledger.is_registered(&r.resource_type))
            {
                return Err(ForemanError::Validation(format!(
                    "task '{}': unknown resource type '{}'",
                    planned.key, unknown.resource_type
                )));
            }
        }

        let workflow_id = Uuid::new_v4();
        let mut ids: HashMap<&str, Uuid> = HashMap::new();
        let mut created = Vec::with_capacity(order.len());
        for planned in &order {
            let dependencies = planned
                .depends_on
                .iter()
                .filter_map(|key| ids.get(key.as_str()).copied())
                .collect();
            let spec = NewTask {
                key: planned.key.clone(),
                description: planned.description.clone(),
                assigned_agent: planned.agent,
                priority: planned.priority,
                dependencies,
                resources: planned.resources.clone(),
                metadata: planned.metadata.clone(),
            };
            let task = self.tasks.create_task(workflow_id, spec)?;
            ids.insert(planned.key.as_str(), task.id);
            let task = self.gate.on_created(&task).unwrap_or(task);
            created.push(task);
        }

        let (state, _) = watch::channel(WorkflowState::Running);
        let (stopped, _) = watch::channel(false);
        let handle = Arc::new(WorkflowHandle {
            id: workflow_id,
            name: plan.name.clone(),
            workflow_type: plan.workflow_type.clone(),
            details: plan.details.clone(),
            plan: serde_json::to_value(&plan)?,
            created_at: Utc::now(),
            cancel: CancelSignal::new(),
            cancelling: AtomicBool::new(false),
            wake: Notify::new(),
            state,
            stopped,
        });
        self.workflows.write().insert(workflow_id, Arc::clone(&handle));

        self.persist(tables::WORKFLOWS, handle.to_record()).await;
        for task in &created {
            self.task_changed(task).await;
        }
        self.bus.publish(
            channels::WORKFLOW_UPDATES,
            json!({
                "workflow_id": workflow_id,
                "name": handle.name,
                "status": WorkflowState::Running,
                "tasks": created.len(),
            }),
        );
        info!(
            workflow_id = %workflow_id,
            name = %handle.name,
            tasks = created.len(),
            "Workflow submitted"
        );

        tokio::spawn(Arc::clone(self).drive(handle));
        Ok(workflow_id)
    }

    /// Snapshot of a workflow's tasks and aggregate state.
    pub fn get_status(&self, workflow_id: Uuid) -> ForemanResult<WorkflowStatus> {
        let handle = self.handle(workflow_id)?;
        let tasks = self.tasks.list(workflow_id);
        Ok(WorkflowStatus {
            workflow_id,
            name: handle.name.clone(),
            overall: handle.current(),
            counts: StatusCounts::tally(&tasks),
            tasks,
        })
    }

    /// Fail every non-terminal task with reason `cancelled`, release their
    /// reservations and stop in-flight calls.
    ///
    /// Cancelling a workflow that already finished changes nothing.
    pub async fn cancel_workflow(&self, workflow_id: Uuid) -> ForemanResult<WorkflowStatus> {
        let handle = self.handle(workflow_id)?;
        if handle.is_final() || handle.cancelling.swap(true, Ordering::SeqCst) {
            return self.get_status(workflow_id);
        }

        // Fail everything before signalling, so no worker can cascade its own
        // failure onto tasks that are about to be cancelled.
        let tasks = self.tasks.list(workflow_id);
        let mut failed = Vec::new();
        for task in &tasks {
            if let Some(t) = self.tasks.fail(task.id, "cancelled")? {
                failed.push(t);
            }
        }
        handle.cancel.cancel();
        for task in &failed {
            self.task_changed(task).await;
        }
        for task in &tasks {
            self.release(task.id).await;
        }
        let cancelled = failed.len();
        self.set_state(&handle, WorkflowState::Cancelled).await;
        handle.wake.notify_one();

        info!(workflow_id = %workflow_id, cancelled, "Workflow cancelled");
        self.get_status(workflow_id)
    }

    /// Ask a stalled workflow's driver to retry its pending tasks.
    pub fn resume(&self, workflow_id: Uuid) -> ForemanResult<()> {
        let handle = self.handle(workflow_id)?;
        debug!(workflow_id = %workflow_id, "Resume requested");
        handle.wake.notify_one();
        Ok(())
    }

    /// Mark a conflict resolved and resume its workflow.
    pub async fn resolve_conflict(
        &self,
        conflict_id: Uuid,
        resolution: Option<String>,
    ) -> ForemanResult<ConflictRecord> {
        let record = self.conflicts.resolve(conflict_id, resolution)?;
        self.persist(tables::CONFLICTS, record.to_record()).await;
        self.bus
            .publish(channels::RESOURCE_CONFLICTS, record.to_record());
        info!(conflict_id = %conflict_id, task_id = %record.task_id, "Conflict resolved");
        if self.workflows.read().contains_key(&record.workflow_id) {
            self.resume(record.workflow_id)?;
        }
        Ok(record)
    }

    /// Change a resource's capacity and wake every workflow so waiting
    /// tasks can try again.
    pub fn set_capacity(&self, resource_type: &str, capacity: u64) -> ForemanResult<()> {
        self.ledger.set_capacity(resource_type, capacity)?;
        for handle in self.workflows.read().values() {
            handle.wake.notify_one();
        }
        Ok(())
    }

    /// Wait until the workflow settles or `timeout` passes, then report its status.
    pub async fn wait(
        &self,
        workflow_id: Uuid,
        timeout: Option<Duration>,
    ) -> ForemanResult<WorkflowStatus> {
        let handle = self.handle(workflow_id)?;
        let mut rx = handle.state.subscribe();
        let settled = rx.wait_for(|state| state.is_settled());
        match timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, settled).await.is_err() {
                    debug!(workflow_id = %workflow_id, "Wait timed out");
                }
            }
            None => {
                let _ = settled.await;
            }
        }
        self.get_status(workflow_id)
    }

    /// Ids of every workflow still held by the coordinator.
    pub fn workflow_ids(&self) -> Vec<Uuid> {
        self.workflows.read().keys().copied().collect()
    }

    /// Drop a completed, failed or cancelled workflow from memory: its
    /// handle, tasks and conflict records. Waits for its driver and workers
    /// to exit first. Persisted records are left in the store.
    ///
    /// Workflows are retained until forgotten, so long-lived coordinators
    /// should call this once a workflow's outcome has been collected.
    pub async fn forget(&self, workflow_id: Uuid) -> ForemanResult<()> {
        let handle = self.handle(workflow_id)?;
        if !handle.is_final() {
            return Err(ForemanError::Validation(format!(
                "workflow {workflow_id} is {} and cannot be forgotten yet",
                handle.current()
            )));
        }
        let mut stopped = handle.stopped.subscribe();
        let _ = stopped.wait_for(|done| *done).await;

        for task in self.tasks.list(workflow_id) {
            self.release(task.id).await;
        }
        let tasks = self.tasks.forget_workflow(workflow_id);
        let conflicts = self.conflicts.forget_workflow(workflow_id);
        self.workflows.write().remove(&workflow_id);
        info!(workflow_id = %workflow_id, tasks, conflicts, "Workflow forgotten");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Driver
    // -----------------------------------------------------------------------

    async fn drive(self: Arc<Self>, wf: Arc<WorkflowHandle>) {
        let mut running: JoinSet<()> = JoinSet::new();

        loop {
            if wf.is_cancelling() {
                break;
            }

            for task in self.tasks.ready(wf.id) {
                if wf.is_cancelling() {
                    break;
                }
                if let Some(assigned) = self.admit(&wf, task).await {
                    running.spawn(Arc::clone(&self).run_task(Arc::clone(&wf), assigned));
                }
            }

            let state = self.evaluate(&wf, running.len());
            if matches!(state, WorkflowState::Completed | WorkflowState::Failed) {
                // Let workers finish releasing and recording before announcing.
                drain(wf.id, &mut running).await;
                self.set_state(&wf, state).await;
                break;
            }
            self.set_state(&wf, state).await;

            tokio::select! {
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        error!(workflow_id = %wf.id, error = %e, "Task worker panicked");
                    }
                }
                _ = wf.wake.notified() => {}
                _ = wf.cancel.cancelled() => {}
            }
        }

        // Workers observe the cancel signal and wind down on their own.
        drain(wf.id, &mut running).await;
        wf.stopped.send_replace(true);
        debug!(workflow_id = %wf.id, state = %wf.current(), "Workflow driver stopped");
    }

    /// Reserve a ready task's resources and move it to `Assigned`.
    ///
    /// A refused reservation leaves the task `Pending` and logs a conflict.
    async fn admit(&self, wf: &WorkflowHandle, task: Task) -> Option<Task> {
        if !task.resources.is_empty() {
            match self.ledger.allocate_all(task.id, &task.resources) {
                Ok(reservations) => {
                    self.clear_conflicts(wf, &task).await;
                    self.reserved(wf, &task, &reservations).await;
                }
                Err(denial) => {
                    self.note_conflict(wf, &task, denial).await;
                    return None;
                }
            }
        }

        match self
            .tasks
            .transition(task.id, TaskStatus::Pending, TaskStatus::Assigned, None)
        {
            Ok(assigned) => {
                self.task_changed(&assigned).await;
                Some(assigned)
            }
            Err(e) => {
                debug!(task_id = %task.id, error = %e, "Task changed before assignment");
                self.release(task.id).await;
                None
            }
        }
    }

    fn evaluate(&self, wf: &WorkflowHandle, in_flight: usize) -> WorkflowState {
        let counts = StatusCounts::tally(&self.tasks.list(wf.id));
        if counts.active() == 0 {
            if counts.failed > 0 {
                WorkflowState::Failed
            } else {
                WorkflowState::Completed
            }
        } else if in_flight == 0 && counts.assigned == 0 && counts.in_progress == 0 {
            WorkflowState::Stalled
        } else {
            WorkflowState::Running
        }
    }

    async fn set_state(&self, wf: &WorkflowHandle, state: WorkflowState) {
        let changed = wf.state.send_if_modified(|current| {
            // Completed, Failed and Cancelled are final, and a workflow being
            // cancelled can only become Cancelled.
            let settled = matches!(
                *current,
                WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
            );
            if *current == state
                || settled
                || (wf.is_cancelling() && state != WorkflowState::Cancelled)
            {
                false
            } else {
                *current = state;
                true
            }
        });
        if !changed {
            return;
        }
        match state {
            WorkflowState::Stalled => {
                warn!(workflow_id = %wf.id, "Workflow stalled on resource conflicts")
            }
            _ => info!(workflow_id = %wf.id, state = %state, "Workflow state changed"),
        }
        self.bus.publish(
            channels::WORKFLOW_UPDATES,
            json!({ "workflow_id": wf.id, "status": state }),
        );
        self.persist(tables::WORKFLOWS, wf.to_record()).await;
    }

    // -----------------------------------------------------------------------
    // Worker
    // -----------------------------------------------------------------------

    async fn run_task(self: Arc<Self>, wf: Arc<WorkflowHandle>, task: Task) {
        let permit = tokio::select! {
            permit = Arc::clone(&self.workers).acquire_owned() => permit.ok(),
            _ = wf.cancel.cancelled() => None,
        };
        if permit.is_none() {
            self.release(task.id).await;
            return;
        }

        let role = task.assigned_agent;
        let task = match self
            .tasks
            .transition(task.id, TaskStatus::Assigned, TaskStatus::InProgress, None)
        {
            Ok(t) => t,
            Err(e) => {
                debug!(task_id = %task.id, error = %e, "Task changed before start");
                self.release(task.id).await;
                return;
            }
        };
        self.task_changed(&task).await;
        self.monitor.start_task(role, task.id).await;
        info!(task_id = %task.id, key = %task.key, role = %role, "Executing task");

        let started = Instant::now();
        let result = self.execute(&wf, &task).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => match self.tasks.complete(task.id, output) {
                Ok(done) => {
                    info!(task_id = %task.id, role = %role, duration_ms = elapsed_ms, "Task completed");
                    self.monitor.record_completion(role, elapsed_ms).await;
                    self.task_changed(&done).await;
                    for unblocked in self.gate.on_completed(done.id) {
                        self.task_changed(&unblocked).await;
                    }
                }
                Err(e) => debug!(task_id = %task.id, error = %e, "Result discarded"),
            },
            // Cancelled errors only come from this workflow's signal.
            Err(_) if wf.is_cancelling() || wf.cancel.is_cancelled() => {
                // The rest of the workflow is failed by cancel_workflow.
                match self.tasks.fail(task.id, "cancelled") {
                    Ok(Some(cancelled)) => {
                        info!(task_id = %task.id, role = %role, "Task cancelled");
                        self.task_changed(&cancelled).await;
                    }
                    Ok(None) => debug!(task_id = %task.id, "Cancelled task already settled"),
                    Err(fail_err) => {
                        error!(task_id = %task.id, error = %fail_err, "Could not record task cancellation")
                    }
                }
            }
            Err(e) => {
                let reason = e.to_string();
                match self.tasks.fail(task.id, &reason) {
                    Ok(Some(failed)) => {
                        error!(task_id = %task.id, role = %role, error = %e, "Task failed");
                        self.monitor.record_error(role, elapsed_ms).await;
                        self.task_changed(&failed).await;
                        for cascaded in self.gate.on_failed(failed.id, &reason) {
                            self.task_changed(&cascaded).await;
                            self.release(cascaded.id).await;
                        }
                    }
                    Ok(None) => debug!(task_id = %task.id, error = %e, "Task already settled"),
                    Err(fail_err) => {
                        error!(task_id = %task.id, error = %fail_err, "Could not record task failure")
                    }
                }
            }
        }

        self.release(task.id).await;
        self.monitor.finish_task(role, task.id).await;
        drop(permit);
    }

    /// Research (for research-first roles), then reason.
    async fn execute(&self, wf: &WorkflowHandle, task: &Task) -> ForemanResult<String> {
        let profile = self.profiles.get(&task.assigned_agent).ok_or_else(|| {
            ForemanError::NotFound(format!("profile for role '{}'", task.assigned_agent))
        })?;

        let research = if profile.research_first {
            self.research(wf, task, profile).await?
        } else {
            Vec::new()
        };

        let mut deps: Vec<Task> = task
            .dependencies
            .iter()
            .filter_map(|id| self.tasks.get(*id).ok())
            .collect();
        deps.sort_by_key(|dep| dep.seq);
        let upstream: Vec<(String, String)> = deps
            .into_iter()
            .map(|dep| (dep.key, dep.output.unwrap_or_default()))
            .collect();
        let prompt = render_prompt(profile, task, &upstream, &research);

        let mut params = profile.params.clone();
        if let Some(obj) = params.as_object_mut() {
            obj.insert("task_id".into(), json!(task.id));
            obj.insert("role".into(), json!(task.assigned_agent));
        }

        let reasoning = Arc::clone(&self.services.reasoning);
        self.guarded_call(wf, task.assigned_agent, &profile.reasoning_key, "reasoning", || {
            let reasoning = Arc::clone(&reasoning);
            let prompt = prompt.clone();
            let params = params.clone();
            async move { reasoning.submit(&prompt, &params).await }
        })
        .await
    }

    async fn research(
        &self,
        wf: &WorkflowHandle,
        task: &Task,
        profile: &AgentProfile,
    ) -> ForemanResult<Vec<SearchResult>> {
        let Some(search) = self.services.search.as_ref().map(Arc::clone) else {
            debug!(task_id = %task.id, "No search service configured, skipping research");
            return Ok(Vec::new());
        };
        let query = task.description.clone();
        let params = json!({ "role": task.assigned_agent, "max_results": 5 });
        let results = self
            .guarded_call(wf, task.assigned_agent, &profile.search_key, "search", || {
                let search = Arc::clone(&search);
                let query = query.clone();
                let params = params.clone();
                async move { search.query(&query, &params).await }
            })
            .await?;
        debug!(task_id = %task.id, hits = results.len(), "Research complete");
        Ok(results)
    }

    /// One external call: rate-limited per attempt, retried on transient
    /// failure, abandoned on cancellation.
    async fn guarded_call<T, F, Fut>(
        &self,
        wf: &WorkflowHandle,
        role: AgentRole,
        key: &str,
        op_name: &str,
        mut call: F,
    ) -> ForemanResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ForemanResult<T>>,
    {
        let acquire_timeout = Duration::from_millis(self.config.acquire_timeout_ms);
        self.retry
            .execute(
                op_name,
                |_attempt| {
                    let fut = call();
                    async move {
                        self.monitor.record_attempt(role).await;
                        self.limiter
                            .acquire_with_cancel(key, 1.0, Some(acquire_timeout), &wf.cancel)
                            .await?;
                        fut.await
                    }
                },
                ForemanError::is_transient,
                Some(&wf.cancel),
            )
            .await
    }

    // -----------------------------------------------------------------------
    // Bookkeeping
    // -----------------------------------------------------------------------

    async fn reserved(&self, wf: &WorkflowHandle, task: &Task, reservations: &[Reservation]) {
        for reservation in reservations {
            self.persist(tables::RESERVATIONS, reservation.to_record(false))
                .await;
            let Some(utilization) = self
                .ledger
                .utilization(&reservation.resource_type, &reservation.window())
            else {
                continue;
            };
            if utilization >= self.config.utilization_alert_threshold {
                warn!(
                    resource_type = %reservation.resource_type,
                    utilization,
                    task_id = %task.id,
                    "Resource utilization above threshold"
                );
                self.bus.publish(
                    channels::RESOURCE_ALERTS,
                    json!({
                        "workflow_id": wf.id,
                        "task_id": task.id,
                        "resource_type": reservation.resource_type,
                        "utilization": utilization,
                        "threshold": self.config.utilization_alert_threshold,
                        "window_start": reservation.window_start,
                        "window_end": reservation.window_end,
                    }),
                );
            }
        }
    }

    /// Log a refused reservation once per task until it is resolved.
    async fn note_conflict(&self, wf: &WorkflowHandle, task: &Task, denial: Denial) {
        if self.conflicts.has_pending_for(task.id) {
            return;
        }
        let details = json!({
            "task_key": task.key,
            "reason": denial.reason,
            "resource_type": denial.request.resource_type,
            "requested": denial.request.quantity,
            "available": denial.available,
            "window_start": denial.request.window.start,
            "window_end": denial.request.window.end,
        });
        let record = self.conflicts.record(wf.id, task.id, details, task.priority);
        warn!(
            task_id = %task.id,
            resource_type = %denial.request.resource_type,
            requested = denial.request.quantity,
            available = denial.available,
            conflict_id = %record.id,
            "Resource conflict, task stays pending"
        );
        self.persist(tables::CONFLICTS, record.to_record()).await;
        self.bus
            .publish(channels::RESOURCE_CONFLICTS, record.to_record());
    }

    /// A task that was refused earlier got its resources after all.
    async fn clear_conflicts(&self, wf: &WorkflowHandle, task: &Task) {
        if !self.conflicts.has_pending_for(task.id) {
            return;
        }
        let stale = self
            .conflicts
            .for_workflow(wf.id)
            .into_iter()
            .filter(|c| c.task_id == task.id && c.status == ConflictStatus::Pending);
        for conflict in stale {
            match self
                .conflicts
                .resolve(conflict.id, Some("resources became available".into()))
            {
                Ok(resolved) => {
                    debug!(conflict_id = %resolved.id, task_id = %task.id, "Conflict cleared");
                    self.persist(tables::CONFLICTS, resolved.to_record()).await;
                    self.bus
                        .publish(channels::RESOURCE_CONFLICTS, resolved.to_record());
                }
                Err(e) => debug!(conflict_id = %conflict.id, error = %e, "Conflict already resolved"),
            }
        }
    }

    async fn release(&self, task_id: Uuid) {
        for reservation in self.ledger.release(task_id) {
            self.persist(tables::RESERVATIONS, reservation.to_record(true))
                .await;
        }
    }

    async fn task_changed(&self, task: &Task) {
        self.bus.publish(
            channels::WORKFLOW_UPDATES,
            json!({
                "workflow_id": task.workflow_id,
                "task_id": task.id,
                "key": task.key,
                "status": task.status,
                "reason": task.failure_reason,
            }),
        );
        self.persist(tables::TASKS, task.to_record()).await;
    }

    /// Store failures never fail a task; they are logged and dropped.
    async fn persist(&self, table: &str, record: serde_json::Value) {
        if let Err(e) = self.store.put(table, record).await {
            warn!(table, error = %e, "Failed to persist record");
        }
    }

    fn handle(&self, workflow_id: Uuid) -> ForemanResult<Arc<WorkflowHandle>> {
        self.workflows
            .read()
            .get(&workflow_id)
            .cloned()
            .ok_or_else(|| ForemanError::NotFound(format!("workflow {workflow_id}")))
    }
}

async fn drain(workflow_id: Uuid, running: &mut JoinSet<()>) {
    while let Some(joined) = running.join_next().await {
        if let Err(e) = joined {
            error!(workflow_id = %workflow_id, error = %e, "Task worker panicked");
        }
    }
}
