//! In-memory [`SoupStore`] for tests and single-node runs.

use crate::events::EngineEvent;
use crate::routing::{ParkedMessage, RouteEntry};
use crate::store::SoupStore;
use crate::types::{InstanceRecord, InstanceStatus};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Default)]
struct MemoryInner {
    instances: BTreeMap<Uuid, InstanceRecord>,
    soups: BTreeMap<Uuid, Vec<u8>>,
    routes: Vec<RouteEntry>,
    parked: Vec<ParkedMessage>,
    events: BTreeMap<Uuid, Vec<EngineEvent>>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SoupStore for MemoryStore {
    async fn save_instance(&self, record: &InstanceRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.instances.insert(record.instance_id, record.clone());
        Ok(())
    }

    async fn load_instance(&self, instance_id: Uuid) -> Result<Option<InstanceRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.instances.get(&instance_id).cloned())
    }

    async fn update_instance_status(
        &self,
        instance_id: Uuid,
        status: InstanceStatus,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .instances
            .get_mut(&instance_id)
            .ok_or_else(|| anyhow!("no instance record for {instance_id}"))?;
        record.status = status;
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.instances.values().cloned().collect())
    }

    async fn store_soup(&self, instance_id: Uuid, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.soups.insert(instance_id, bytes.to_vec());
        Ok(())
    }

    async fn load_soup(&self, instance_id: Uuid) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock().await;
        Ok(inner.soups.get(&instance_id).cloned())
    }

    async fn save_routes(&self, entries: &[RouteEntry]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.routes.extend_from_slice(entries);
        Ok(())
    }

    async fn remove_routes_for_group(&self, instance_id: Uuid, select_group: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .routes
            .retain(|r| !(r.instance_id == instance_id && r.select_group == select_group));
        Ok(())
    }

    async fn remove_routes_for_instance(&self, instance_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.routes.retain(|r| r.instance_id != instance_id);
        Ok(())
    }

    async fn load_all_routes(&self) -> Result<Vec<RouteEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner.routes.clone())
    }

    async fn save_parked(&self, parked: &ParkedMessage) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .parked
            .retain(|p| p.message.mex_id != parked.message.mex_id);
        inner.parked.push(parked.clone());
        Ok(())
    }

    async fn remove_parked(&self, mex_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.parked.retain(|p| p.message.mex_id != mex_id);
        Ok(())
    }

    async fn load_all_parked(&self) -> Result<Vec<ParkedMessage>> {
        let inner = self.inner.lock().await;
        Ok(inner.parked.clone())
    }

    async fn append_event(&self, instance_id: Uuid, event: &EngineEvent) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let log = inner.events.entry(instance_id).or_default();
        log.push(event.clone());
        Ok(log.len() as u64)
    }

    async fn read_events(
        &self,
        instance_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, EngineEvent)>> {
        let inner = self.inner.lock().await;
        let log = inner.events.get(&instance_id).map(Vec::as_slice).unwrap_or(&[]);
        Ok(log
            .iter()
            .enumerate()
            .map(|(i, e)| (i as u64 + 1, e.clone()))
            .filter(|(seq, _)| *seq >= from_seq)
            .collect())
    }
}
