use crate::types::Priority;
use chrono::{DateTime, Utc};
use foreman_core::{ForemanError, ForemanResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Pending,
    Resolved,
}

/// A refused allocation awaiting human (or out-of-core) resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub task_id: Uuid,
    /// The refused request and what was available.
    pub details: serde_json::Value,
    pub priority: Priority,
    pub status: ConflictStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolution: Option<String>,
}

impl ConflictRecord {
    /// Persisted record shape.
    pub fn to_record(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({ "id": self.id }))
    }
}

/// Append-only log of resource conflicts.
///
/// Recording or resolving a conflict never touches allocation state.
#[derive(Default)]
pub struct ConflictLog {
    records: RwLock<Vec<ConflictRecord>>,
}

impl ConflictLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        workflow_id: Uuid,
        task_id: Uuid,
        details: serde_json::Value,
        priority: Priority,
    ) -> ConflictRecord {
        let record = ConflictRecord {
            id: Uuid::new_v4(),
            workflow_id,
            task_id,
            details,
            priority,
            status: ConflictStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
            resolution: None,
        };
        self.records.write().push(record.clone());
        record
    }

    /// Mark a pending conflict resolved.
    pub fn resolve(&self, id: Uuid, resolution: Option<String>) -> ForemanResult<ConflictRecord> {
        let mut records = self.records.write();
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| ForemanError::NotFound(format!("conflict {id}")))?;
        if record.status == ConflictStatus::Resolved {
            return Err(ForemanError::Validation(format!("conflict {id} is already resolved")));
        }
        record.status = ConflictStatus::Resolved;
        record.resolved_at = Some(Utc::now());
        record.resolution = resolution;
        Ok(record.clone())
    }

    pub fn get(&self, id: Uuid) -> Option<ConflictRecord> {
        self.records.read().iter().find(|r| r.id == id).cloned()
    }

    /// Pending conflicts, most urgent first.
    pub fn pending(&self) -> Vec<ConflictRecord> {
        let mut pending: Vec<ConflictRecord> = self
            .records
            .read()
            .iter()
            .filter(|r| r.status == ConflictStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        pending
    }

    pub fn has_pending_for(&self, task_id: Uuid) -> bool {
        self.records
            .read()
            .iter()
            .any(|r| r.task_id == task_id && r.status == ConflictStatus::Pending)
    }

    pub fn for_workflow(&self, workflow_id: Uuid) -> Vec<ConflictRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| r.workflow_id == workflow_id)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<ConflictRecord> {
        self.records.read().clone()
    }

    /// Drop every record of a workflow. Returns how many were removed.
    pub fn forget_workflow(&self, workflow_id: Uuid) -> usize {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|r| r.workflow_id != workflow_id);
        before - records.len()
    }
}
