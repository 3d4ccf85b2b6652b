//! Multi-agent workflow coordination for construction project management.
//!
//! A workflow plan decomposes a project into tasks, each assigned to a
//! specialised agent role. The coordinator enforces dependency ordering,
//! reserves scarce resources (crews, equipment) over time windows, calls
//! external reasoning and search services under rate limits and retries,
//! and reports progress on the event bus.
//!
//! # Main types
//!
//! - [`WorkflowCoordinator`] — Submits plans and drives their tasks to completion.
//! - [`TaskStore`] — Authoritative task records with compare-and-set transitions.
//! - [`DependencyGate`] — Unblocks or cascades failure to dependent tasks.
//! - [`ResourceLedger`] — Capacity-bounded, time-windowed resource reservations.
//! - [`ConflictLog`] — Refused reservations awaiting resolution.
//! - [`AgentMonitor`] — Per-role activity and metrics.
//! - [`WorkflowPlan`] — Externally produced task decomposition.

/// Coordinator configuration.
pub mod config;
/// Resource conflict records.
pub mod conflicts;
/// Workflow coordinator.
pub mod engine;
/// Dependency gating between tasks.
pub mod gate;
/// Resource reservations.
pub mod ledger;
/// Per-role activity monitoring.
pub mod monitor;
/// Workflow plans and their validation.
pub mod plan;
/// Agent role profiles and prompt rendering.
pub mod profiles;
/// External reasoning and search service interfaces.
pub mod services;
/// Task records and lifecycle transitions.
pub mod task_store;
/// Shared orchestration types (Task, TaskStatus, AgentRole, etc.).
pub mod types;

pub use config::CoordinatorConfig;
pub use conflicts::{ConflictLog, ConflictRecord, ConflictStatus};
pub use engine::WorkflowCoordinator;
pub use gate::DependencyGate;
pub use ledger::{AllocationOutcome, Denial, DenialReason, Reservation, ResourceLedger, ResourceSummary};
pub use monitor::AgentMonitor;
pub use plan::{PlannedTask, WorkflowPlan};
pub use profiles::{default_profiles, render_prompt, AgentProfile};
pub use services::{ReasoningService, SearchResult, SearchService, Services};
pub use task_store::TaskStore;
pub use types::{
    AgentMetrics, AgentRole, AgentState, NewTask, Priority, ResourceRequest, StatusCounts, Task,
    TaskStatus, TimeWindow, WorkerStatus, WorkflowState, WorkflowStatus,
};
