//! Persistence seam for the engine.
//!
//! Everything an engine restart needs flows through this trait: instance
//! records, soup snapshots, issued routes, parked messages, and the
//! per-instance event log. Implementations decide durability; the engine
//! only assumes reads observe its own prior writes.

use crate::events::EngineEvent;
use crate::routing::{ParkedMessage, RouteEntry};
use crate::types::{InstanceRecord, InstanceStatus};
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
pub trait SoupStore: Send + Sync {
    // ─── Instance records ─────────────────────────────────────

    async fn save_instance(&self, record: &InstanceRecord) -> Result<()>;

    async fn load_instance(&self, instance_id: Uuid) -> Result<Option<InstanceRecord>>;

    async fn update_instance_status(&self, instance_id: Uuid, status: InstanceStatus)
        -> Result<()>;

    /// All records, ordered by instance id.
    async fn list_instances(&self) -> Result<Vec<InstanceRecord>>;

    // ─── Soup snapshots ───────────────────────────────────────

    /// Replace the instance's snapshot. Write-once per cycle boundary.
    async fn store_soup(&self, instance_id: Uuid, bytes: &[u8]) -> Result<()>;

    async fn load_soup(&self, instance_id: Uuid) -> Result<Option<Vec<u8>>>;

    // ─── Routes ───────────────────────────────────────────────

    async fn save_routes(&self, entries: &[RouteEntry]) -> Result<()>;

    /// Drop one instance's select group. Group ids are scoped per instance.
    async fn remove_routes_for_group(&self, instance_id: Uuid, select_group: &str) -> Result<()>;

    async fn remove_routes_for_instance(&self, instance_id: Uuid) -> Result<()>;

    async fn load_all_routes(&self) -> Result<Vec<RouteEntry>>;

    // ─── Parked messages ──────────────────────────────────────

    async fn save_parked(&self, parked: &ParkedMessage) -> Result<()>;

    async fn remove_parked(&self, mex_id: &str) -> Result<()>;

    async fn load_all_parked(&self) -> Result<Vec<ParkedMessage>>;

    // ─── Event log ────────────────────────────────────────────

    /// Append to the instance's event log; returns the event's sequence
    /// number, starting at 1.
    async fn append_event(&self, instance_id: Uuid, event: &EngineEvent) -> Result<u64>;

    /// Events with sequence number >= `from_seq`, in order.
    async fn read_events(&self, instance_id: Uuid, from_seq: u64)
        -> Result<Vec<(u64, EngineEvent)>>;
}
