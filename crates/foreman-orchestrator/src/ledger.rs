use crate::types::{ResourceRequest, TimeWindow};
use chrono::{DateTime, Utc};
use foreman_core::{ForemanError, ForemanResult};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// A granted, time-windowed claim on part of a resource pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub resource_type: String,
    pub task_id: Uuid,
    pub quantity: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    pub fn window(&self) -> TimeWindow {
        TimeWindow {
            start: self.window_start,
            end: self.window_end,
        }
    }

    /// Persisted record shape. `released` marks reservations given back.
    pub fn to_record(&self, released: bool) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "resource_type": self.resource_type,
            "task_id": self.task_id,
            "quantity": self.quantity,
            "window_start": self.window_start,
            "window_end": self.window_end,
            "released": released,
        })
    }
}

/// Why an allocation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    InsufficientResource,
    UnknownResource,
}

/// A refused allocation, with what was asked for and what was left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denial {
    pub reason: DenialReason,
    pub request: ResourceRequest,
    pub available: u64,
}

impl From<Denial> for ForemanError {
    fn from(d: Denial) -> Self {
        match d.reason {
            DenialReason::InsufficientResource => ForemanError::InsufficientResource {
                resource_type: d.request.resource_type,
                requested: d.request.quantity,
                available: d.available,
            },
            DenialReason::UnknownResource => ForemanError::UnknownResource(d.request.resource_type),
        }
    }
}

/// Result of a single allocation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationOutcome {
    Granted(Reservation),
    Denied(Denial),
}

impl AllocationOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, AllocationOutcome::Granted(_))
    }
}

/// Capacity and current reservations of one resource type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSummary {
    pub resource_type: String,
    pub capacity: u64,
    pub reservations: Vec<Reservation>,
}

struct Pool {
    capacity: u64,
    reservations: Vec<Reservation>,
}

impl Pool {
    /// Sum of quantities of every reservation overlapping `window`.
    fn committed(&self, window: &TimeWindow) -> u64 {
        self.reservations
            .iter()
            .filter(|r| r.window().overlaps(window))
            .map(|r| r.quantity)
            .sum()
    }
}

/// Finite-capacity resources and the reservations held against them.
///
/// Each resource type has its own lock; allocations of different types never
/// wait on each other. The ledger only grants or refuses. It never preempts
/// or re-ranks existing reservations.
pub struct ResourceLedger {
    pools: RwLock<HashMap<String, Arc<Mutex<Pool>>>>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Build a ledger from a type -> capacity table.
    pub fn from_capacities(capacities: &HashMap<String, u64>) -> Self {
        let ledger = Self::new();
        for (resource_type, capacity) in capacities {
            ledger.register(resource_type, *capacity);
        }
        ledger
    }

    /// Add a resource type, or change the capacity of an existing one.
    pub fn register(&self, resource_type: &str, capacity: u64) {
        let mut pools = self.pools.write();
        match pools.get(resource_type) {
            Some(pool) => pool.lock().capacity = capacity,
            None => {
                pools.insert(
                    resource_type.to_string(),
                    Arc::new(Mutex::new(Pool {
                        capacity,
                        reservations: Vec::new(),
                    })),
                );
            }
        }
        info!(resource_type, capacity, "Resource registered");
    }

    /// Change the capacity of a known resource type.
    ///
    /// Lowering capacity below what is already reserved does not revoke
    /// anything; new requests are simply refused until usage drops.
    pub fn set_capacity(&self, resource_type: &str, capacity: u64) -> ForemanResult<()> {
        let pool = self
            .pool(resource_type)
            .ok_or_else(|| ForemanError::UnknownResource(resource_type.to_string()))?;
        pool.lock().capacity = capacity;
        info!(resource_type, capacity, "Resource capacity changed");
        Ok(())
    }

    pub fn capacity(&self, resource_type: &str) -> Option<u64> {
        self.pool(resource_type).map(|p| p.lock().capacity)
    }

    pub fn is_registered(&self, resource_type: &str) -> bool {
        self.pools.read().contains_key(resource_type)
    }

    /// Grant `request` to `task_id` if the overlapping reservations leave room.
    pub fn allocate(&self, request: &ResourceRequest, task_id: Uuid) -> AllocationOutcome {
        let Some(pool) = self.pool(&request.resource_type) else {
            return AllocationOutcome::Denied(Denial {
                reason: DenialReason::UnknownResource,
                request: request.clone(),
                available: 0,
            });
        };

        let mut pool = pool.lock();
        let committed = pool.committed(&request.window);
        let available = pool.capacity.saturating_sub(committed);
        if request.quantity > available {
            debug!(
                resource_type = %request.resource_type,
                requested = request.quantity,
                available,
                task_id = %task_id,
                "Allocation refused"
            );
            return AllocationOutcome::Denied(Denial {
                reason: DenialReason::InsufficientResource,
                request: request.clone(),
                available,
            });
        }

        let reservation = Reservation {
            id: Uuid::new_v4(),
            resource_type: request.resource_type.clone(),
            task_id,
            quantity: request.quantity,
            window_start: request.window.start,
            window_end: request.window.end,
            created_at: Utc::now(),
        };
        pool.reservations.push(reservation.clone());
        debug!(
            resource_type = %request.resource_type,
            quantity = request.quantity,
            task_id = %task_id,
            "Allocation granted"
        );
        AllocationOutcome::Granted(reservation)
    }

    /// Grant every request or none of them.
    pub fn allocate_all(
        &self,
        task_id: Uuid,
        requests: &[ResourceRequest],
    ) -> Result<Vec<Reservation>, Denial> {
        let mut granted: Vec<Reservation> = Vec::with_capacity(requests.len());
        for request in requests {
            match self.allocate(request, task_id) {
                AllocationOutcome::Granted(r) => granted.push(r),
                AllocationOutcome::Denied(denial) => {
                    for r in &granted {
                        self.remove(r);
                    }
                    return Err(denial);
                }
            }
        }
        Ok(granted)
    }

    /// Drop every reservation held by `task_id` and return them.
    /// Releasing again returns nothing and changes nothing.
    pub fn release(&self, task_id: Uuid) -> Vec<Reservation> {
        let pools: Vec<Arc<Mutex<Pool>>> = self.pools.read().values().cloned().collect();
        let mut released = Vec::new();
        for pool in pools {
            let mut pool = pool.lock();
            let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut pool.reservations)
                .into_iter()
                .partition(|r| r.task_id == task_id);
            pool.reservations = rest;
            released.extend(mine);
        }
        if !released.is_empty() {
            debug!(task_id = %task_id, count = released.len(), "Reservations released");
        }
        released
    }

    pub fn reservations_for(&self, task_id: Uuid) -> Vec<Reservation> {
        let pools: Vec<Arc<Mutex<Pool>>> = self.pools.read().values().cloned().collect();
        pools
            .iter()
            .flat_map(|p| {
                p.lock()
                    .reservations
                    .iter()
                    .filter(|r| r.task_id == task_id)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Quantity reserved over reservations overlapping `window`.
    pub fn committed(&self, resource_type: &str, window: &TimeWindow) -> Option<u64> {
        self.pool(resource_type).map(|p| p.lock().committed(window))
    }

    /// Committed share of capacity over `window`, in `[0, 1]` unless capacity
    /// was lowered under existing reservations.
    pub fn utilization(&self, resource_type: &str, window: &TimeWindow) -> Option<f64> {
        let pool = self.pool(resource_type)?;
        let pool = pool.lock();
        if pool.capacity == 0 {
            return Some(if pool.reservations.is_empty() { 0.0 } else { 1.0 });
        }
        Some(pool.committed(window) as f64 / pool.capacity as f64)
    }

    /// Point-in-time copy of every pool, sorted by resource type.
    pub fn snapshot(&self) -> Vec<ResourceSummary> {
        let pools: Vec<(String, Arc<Mutex<Pool>>)> = self
            .pools
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        let mut out: Vec<ResourceSummary> = pools
            .into_iter()
            .map(|(resource_type, pool)| {
                let pool = pool.lock();
                ResourceSummary {
                    resource_type,
                    capacity: pool.capacity,
                    reservations: pool.reservations.clone(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.resource_type.cmp(&b.resource_type));
        out
    }

    fn pool(&self, resource_type: &str) -> Option<Arc<Mutex<Pool>>> {
        self.pools.read().get(resource_type).cloned()
    }

    fn remove(&self, reservation: &Reservation) {
        if let Some(pool) = self.pool(&reservation.resource_type) {
            pool.lock().reservations.retain(|r| r.id != reservation.id);
        }
    }
}

impl Default for ResourceLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn window(from_h: i64, to_h: i64) -> TimeWindow {
        let base = DateTime::parse_from_rfc3339("2026-03-02T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        TimeWindow::new(base + Duration::hours(from_h), base + Duration::hours(to_h)).unwrap()
    }

    fn workers(qty: u64, w: TimeWindow) -> ResourceRequest {
        ResourceRequest::new("workers", qty, w)
    }

    #[test]
    fn test_overlapping_request_refused() {
        let ledger = ResourceLedger::new();
        ledger.register("workers", 10);
        let x = Uuid::new_v4();
        let y = Uuid::new_v4();

        assert!(ledger.allocate(&workers(6, window(0, 8)), x).is_granted());
        match ledger.allocate(&workers(6, window(4, 12)), y) {
            AllocationOutcome::Denied(d) => {
                assert_eq!(d.reason, DenialReason::InsufficientResource);
                assert_eq!(d.available, 4);
            }
            other => panic!("expected denial, got {other:?}"),
        }
        assert!(ledger.reservations_for(y).is_empty());
    }

    #[test]
    fn test_disjoint_windows_share_capacity() {
        let ledger = ResourceLedger::new();
        ledger.register("workers", 10);
        assert!(ledger.allocate(&workers(10, window(0, 8)), Uuid::new_v4()).is_granted());
        // Half-open windows: [0,8) and [8,16) never overlap.
        assert!(ledger.allocate(&workers(10, window(8, 16)), Uuid::new_v4()).is_granted());
    }

    #[test]
    fn test_unknown_resource_refused() {
        let ledger = ResourceLedger::new();
        match ledger.allocate(&ResourceRequest::new("crane", 1, window(0, 1)), Uuid::new_v4()) {
            AllocationOutcome::Denied(d) => {
                assert_eq!(d.reason, DenialReason::UnknownResource);
                let err: ForemanError = d.into();
                assert!(matches!(err, ForemanError::UnknownResource(_)));
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[test]
    fn test_release_is_idempotent() {
        let ledger = ResourceLedger::new();
        ledger.register("workers", 10);
        ledger.register("cranes", 2);
        let task = Uuid::new_v4();
        let other = Uuid::new_v4();
        ledger.allocate(&workers(3, window(0, 4)), task);
        ledger.allocate(&ResourceRequest::new("cranes", 1, window(0, 4)), task);
        ledger.allocate(&workers(2, window(0, 4)), other);

        assert_eq!(ledger.release(task).len(), 2);
        let after_once = ledger.snapshot();
        assert!(ledger.release(task).is_empty());
        let after_twice = ledger.snapshot();

        assert_eq!(after_once.len(), after_twice.len());
        for (a, b) in after_once.iter().zip(&after_twice) {
            assert_eq!(a.reservations, b.reservations);
        }
        assert_eq!(ledger.committed("workers", &window(0, 4)), Some(2));
    }

    #[test]
    fn test_allocate_all_rolls_back() {
        let ledger = ResourceLedger::new();
        ledger.register("workers", 10);
        ledger.register("cranes", 1);
        ledger.allocate(&ResourceRequest::new("cranes", 1, window(0, 4)), Uuid::new_v4());

        let task = Uuid::new_v4();
        let denial = ledger
            .allocate_all(
                task,
                &[
                    workers(5, window(0, 4)),
                    ResourceRequest::new("cranes", 1, window(2, 6)),
                ],
            )
            .unwrap_err();
        assert_eq!(denial.request.resource_type, "cranes");
        assert!(ledger.reservations_for(task).is_empty());
        assert_eq!(ledger.committed("workers", &window(0, 4)), Some(0));
    }

    #[test]
    fn test_capacity_increase_admits_waiting_request() {
        let ledger = ResourceLedger::new();
        ledger.register("workers", 4);
        ledger.allocate(&workers(4, window(0, 4)), Uuid::new_v4());
        assert!(!ledger.allocate(&workers(2, window(0, 4)), Uuid::new_v4()).is_granted());

        ledger.set_capacity("workers", 6).unwrap();
        assert!(ledger.allocate(&workers(2, window(0, 4)), Uuid::new_v4()).is_granted());
        assert!(ledger.set_capacity("unknown", 1).is_err());
    }

    #[test]
    fn test_utilization() {
        let ledger = ResourceLedger::new();
        ledger.register("workers", 10);
        ledger.allocate(&workers(9, window(0, 4)), Uuid::new_v4());
        let u = ledger.utilization("workers", &window(1, 2)).unwrap();
        assert!((u - 0.9).abs() < 1e-9);
        assert_eq!(ledger.utilization("workers", &window(5, 6)), Some(0.0));
        assert_eq!(ledger.utilization("cranes", &window(0, 1)), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocations_never_overcommit() {
        let ledger = Arc::new(ResourceLedger::new());
        ledger.register("workers", 10);

        let mut handles = Vec::new();
        for i in 0..64i64 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                let start = i % 6;
                let request = workers((i as u64 % 4) + 1, window(start, start + 3));
                ledger.allocate(&request, Uuid::new_v4()).is_granted()
            }));
        }
        let mut granted = 0;
        for h in handles {
            if h.await.unwrap() {
                granted += 1;
            }
        }
        assert!(granted > 0);

        let snapshot = ledger.snapshot();
        let reservations = &snapshot[0].reservations;
        for sample in reservations {
            let t = sample.window_start;
            let load: u64 = reservations
                .iter()
                .filter(|r| r.window().contains(t))
                .map(|r| r.quantity)
                .sum();
            assert!(load <= 10, "over-committed at {t}: {load}");
        }
    }
}
