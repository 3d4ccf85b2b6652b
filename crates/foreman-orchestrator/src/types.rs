use chrono::{DateTime, Utc};
use foreman_core::{ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Specialist worker a task is assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// Drafts contracts, specifications and plans.
    Document,
    /// Validates technical specifications and construction methods.
    Technical,
    /// Checks regulatory compliance and permits.
    Compliance,
    /// Estimates and analyses project cost.
    Cost,
    /// Plans and monitors allocation of shared resources.
    Resource,
    /// Coordinates the other roles.
    Orchestration,
}

impl AgentRole {
    /// Every role, in a stable order.
    pub const ALL: [AgentRole; 6] = [
        AgentRole::Document,
        AgentRole::Technical,
        AgentRole::Compliance,
        AgentRole::Cost,
        AgentRole::Resource,
        AgentRole::Orchestration,
    ];
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentRole::Document => write!(f, "document"),
            AgentRole::Technical => write!(f, "technical"),
            AgentRole::Compliance => write!(f, "compliance"),
            AgentRole::Cost => write!(f, "cost"),
            AgentRole::Resource => write!(f, "resource"),
            AgentRole::Orchestration => write!(f, "orchestration"),
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Blocked,
    Assigned,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// The transition table. Anything not listed here is rejected.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Assigned) | (Assigned, InProgress) | (InProgress, Completed) | (Blocked, Pending) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Statuses a task may only hold once all its dependencies completed.
    pub fn requires_dependencies_met(self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Assigned | TaskStatus::InProgress | TaskStatus::Completed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Urgency from 1 (lowest) to 5 (most urgent).
///
/// Deserializes from a number or from the names `low`, `medium` and `high`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "PriorityRepr", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const LOW: Priority = Priority(1);
    pub const MEDIUM: Priority = Priority(3);
    pub const HIGH: Priority = Priority(5);

    pub fn new(level: u8) -> ForemanResult<Self> {
        if (1..=5).contains(&level) {
            Ok(Self(level))
        } else {
            Err(ForemanError::Validation(format!(
                "priority must be between 1 and 5, got {level}"
            )))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::MEDIUM
    }
}

impl std::str::FromStr for Priority {
    type Err = ForemanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::LOW),
            "medium" => Ok(Priority::MEDIUM),
            "high" => Ok(Priority::HIGH),
            other => match other.parse::<u8>() {
                Ok(n) => Priority::new(n),
                Err(_) => Err(ForemanError::Validation(format!("unknown priority '{s}'"))),
            },
        }
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p.0
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PriorityRepr {
    Level(u64),
    Name(String),
}

impl TryFrom<PriorityRepr> for Priority {
    type Error = ForemanError;

    fn try_from(repr: PriorityRepr) -> Result<Self, Self::Error> {
        match repr {
            PriorityRepr::Level(n) => u8::try_from(n)
                .map_err(|_| ForemanError::Validation(format!("priority out of range: {n}")))
                .and_then(Priority::new),
            PriorityRepr::Name(name) => name.parse(),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> ForemanResult<Self> {
        let window = Self { start, end };
        window.validate()?;
        Ok(window)
    }

    pub fn validate(&self) -> ForemanResult<()> {
        if self.start < self.end {
            Ok(())
        } else {
            Err(ForemanError::Validation(format!(
                "window start {} must be before end {}",
                self.start, self.end
            )))
        }
    }

    /// True when some instant lies in both windows.
    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }
}

/// A claim a task needs on a finite resource before it can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub resource_type: String,
    pub quantity: u64,
    pub window: TimeWindow,
}

impl ResourceRequest {
    pub fn new(resource_type: impl Into<String>, quantity: u64, window: TimeWindow) -> Self {
        Self {
            resource_type: resource_type.into(),
            quantity,
            window,
        }
    }

    /// Reject empty types, zero quantities and empty windows.
    pub fn validate(&self) -> ForemanResult<()> {
        if self.resource_type.trim().is_empty() {
            return Err(ForemanError::Validation("resource type must not be empty".into()));
        }
        if self.quantity == 0 {
            return Err(ForemanError::Validation(format!(
                "quantity for '{}' must be positive",
                self.resource_type
            )));
        }
        self.window.validate()
    }
}

/// Everything needed to create a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    /// Plan-local name, unique inside a workflow.
    pub key: String,
    pub description: String,
    pub assigned_agent: AgentRole,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    #[serde(default)]
    pub resources: Vec<ResourceRequest>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl NewTask {
    pub fn new(key: impl Into<String>, description: impl Into<String>, agent: AgentRole) -> Self {
        Self {
            key: key.into(),
            description: description.into(),
            assigned_agent: agent,
            priority: Priority::default(),
            dependencies: Vec::new(),
            resources: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_resource(mut self, request: ResourceRequest) -> Self {
        self.resources.push(request);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A task as held by the task store. Callers only ever see snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub key: String,
    pub description: String,
    pub assigned_agent: AgentRole,
    pub priority: Priority,
    pub status: TaskStatus,
    pub dependencies: BTreeSet<Uuid>,
    /// Dependencies that have not completed yet.
    pub unmet: BTreeSet<Uuid>,
    pub resources: Vec<ResourceRequest>,
    pub metadata: serde_json::Value,
    pub output: Option<String>,
    pub failure_reason: Option<String>,
    /// Creation sequence number, used to break priority ties.
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Pending with nothing left to wait for.
    pub fn is_ready(&self) -> bool {
        self.status == TaskStatus::Pending && self.unmet.is_empty()
    }

    /// Persisted record shape.
    pub fn to_record(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "workflow_id": self.workflow_id,
            "key": self.key,
            "agent": self.assigned_agent,
            "priority": self.priority,
            "status": self.status,
            "dependencies": self.dependencies,
            "metadata": self.metadata,
            "failure_reason": self.failure_reason,
            "created_at": self.created_at,
            "updated_at": self.updated_at,
        })
    }
}

/// Worker status shown by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Working,
    Error,
}

/// Running totals for one role.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    /// Service calls issued, retries included.
    pub attempts: u32,
    pub duration_ms: u64,
}

/// Current state of one role's workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub role: AgentRole,
    /// Tasks this role is executing right now.
    pub active_tasks: Vec<Uuid>,
    pub status: WorkerStatus,
    pub metrics: AgentMetrics,
}

/// Aggregate state of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Running,
    Completed,
    /// Every task settled and at least one failed.
    Failed,
    Cancelled,
    /// Nothing in flight and the remaining tasks wait on resource conflicts.
    Stalled,
}

impl WorkflowState {
    /// True for every state except `Running`.
    pub fn is_settled(self) -> bool {
        !matches!(self, WorkflowState::Running)
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowState::Running => "running",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
            WorkflowState::Cancelled => "cancelled",
            WorkflowState::Stalled => "stalled",
        };
        f.write_str(s)
    }
}

/// Per-status task counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub blocked: usize,
    pub assigned: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn tally<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut counts = Self::default();
        for task in tasks {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Blocked => counts.blocked += 1,
                TaskStatus::Assigned => counts.assigned += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Tasks not yet in a terminal status.
    pub fn active(&self) -> usize {
        self.pending + self.blocked + self.assigned + self.in_progress
    }
}

/// Answer to `get_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub workflow_id: Uuid,
    pub name: String,
    pub overall: WorkflowState,
    pub counts: StatusCounts,
    pub tasks: Vec<Task>,
}
