//! Instance lifecycle and the cycle transaction.
//!
//! A cycle is restore, inject, drain, persist: the engine loads the
//! instance's snapshot, applies any pending definition replacement, injects
//! the routed delivery, drains reductions through the [`Vpu`], then applies
//! boundary effects in a fixed order: selector registrations, select-group
//! cancellations, snapshot write, completion check. An unhandled fault skips
//! everything after the drain so the previous snapshot stays authoritative.
//!
//! Inbound traffic enters through [`Engine::handle_inbound`], which routes
//! the message, creates an instance for instantiating operations, and runs
//! the receiving instance's cycle under its per-instance lock.

use crate::error::EngineError;
use crate::events::EngineEvent;
use crate::routing::{
    correlator_id, CorrelationRouter, MatchedRoute, RouteDecision, RoutePolicy,
};
use crate::soup::Soup;
use crate::store::SoupStore;
use crate::types::*;
use crate::vpu::{CycleEffects, ProcessDefinition, SelectRegistration, Vpu};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Reduction cap per cycle. A cycle that hits it is persisted mid-drain and
/// picked up again by the next cycle.
pub const DEFAULT_CYCLE_CAP: usize = 10_000;

/// Default retry window for unroutable messages.
pub const DEFAULT_PARK_TTL_MS: i64 = 60_000;

/// Fault raised when a cycle's selector batch conflicts with a live two-way
/// receive. Raised at the cycle boundary; carries no logic id.
pub const CONFLICT_FAULT: &str = "sys.conflicting-receive";

// ─── Outcomes ─────────────────────────────────────────────────

/// What one cycle produced. When `fault` is set the boundary effects were
/// dropped: nothing in `outbound` or `new_selectors` left the kernel.
#[derive(Clone, Debug)]
pub struct CycleOutcome {
    pub instance_id: Uuid,
    pub cycle: CycleId,
    pub reductions: usize,
    pub quiesced: bool,
    pub outbound: Vec<OutboundRequest>,
    pub new_selectors: Vec<SelectRegistration>,
    pub fault: Option<InstanceFault>,
    pub status: InstanceStatus,
}

/// Disposition of one inbound message.
#[derive(Debug)]
pub enum DispatchOutcome {
    Delivered {
        outcome: CycleOutcome,
        /// True when the message instantiated the instance it reached.
        created: bool,
    },
    Parked,
    /// Several equally specific routes matched; the message was rejected
    /// and nothing was consumed.
    Ambiguous { candidates: Vec<MatchedRoute> },
}

// ─── The engine ───────────────────────────────────────────────

#[derive(Clone)]
struct DefinitionEntry {
    definition: Arc<ProcessDefinition>,
    /// Upgrade maps keyed by the version they lead away from. Each map is
    /// expected to bridge straight to the current version.
    replacements: BTreeMap<DefinitionVersion, ReplacementMap>,
}

struct InstanceSlot {
    process_id: String,
    status: InstanceStatus,
    /// Serializes cycles per instance.
    lock: Arc<Mutex<()>>,
}

/// Orchestrates instances of registered process definitions over a store.
pub struct Engine {
    store: Arc<dyn SoupStore>,
    router: Arc<CorrelationRouter>,
    definitions: Mutex<BTreeMap<String, Arc<DefinitionEntry>>>,
    /// correlator id -> process id, for instance-creating operations.
    instantiating: Mutex<BTreeMap<String, String>>,
    slots: Mutex<BTreeMap<Uuid, InstanceSlot>>,
    cycle_cap: usize,
    park_ttl_ms: i64,
}

impl Engine {
    pub fn new(store: Arc<dyn SoupStore>) -> Self {
        Self {
            store,
            router: Arc::new(CorrelationRouter::new()),
            definitions: Mutex::new(BTreeMap::new()),
            instantiating: Mutex::new(BTreeMap::new()),
            slots: Mutex::new(BTreeMap::new()),
            cycle_cap: DEFAULT_CYCLE_CAP,
            park_ttl_ms: DEFAULT_PARK_TTL_MS,
        }
    }

    pub fn with_cycle_cap(mut self, cap: usize) -> Self {
        self.cycle_cap = cap;
        self
    }

    pub fn with_park_ttl_ms(mut self, ttl_ms: i64) -> Self {
        self.park_ttl_ms = ttl_ms;
        self
    }

    pub fn router(&self) -> &CorrelationRouter {
        &self.router
    }

    pub fn store(&self) -> &Arc<dyn SoupStore> {
        &self.store
    }

    // ─── Definitions ──────────────────────────────────────────

    pub async fn register_definition(&self, definition: Arc<ProcessDefinition>) {
        let process_id = definition.process_id().to_string();
        self.index_instantiating(&definition, &process_id).await;
        let mut definitions = self.definitions.lock().await;
        definitions.insert(
            process_id.clone(),
            Arc::new(DefinitionEntry {
                definition,
                replacements: BTreeMap::new(),
            }),
        );
        info!("process '{}' registered", process_id);
    }

    /// Swap in a new definition version. `map` upgrades checkpoints written
    /// under the version it names; maps for older versions are kept.
    pub async fn replace_definition(
        &self,
        definition: Arc<ProcessDefinition>,
        map: ReplacementMap,
    ) {
        let process_id = definition.process_id().to_string();
        self.index_instantiating(&definition, &process_id).await;
        let mut definitions = self.definitions.lock().await;
        let mut replacements = definitions
            .get(&process_id)
            .map(|e| e.replacements.clone())
            .unwrap_or_default();
        replacements.insert(map.from_version, map);
        definitions.insert(
            process_id.clone(),
            Arc::new(DefinitionEntry {
                definition,
                replacements,
            }),
        );
        info!("process '{}' replaced", process_id);
    }

    async fn index_instantiating(&self, definition: &ProcessDefinition, process_id: &str) {
        let mut index = self.instantiating.lock().await;
        for (partner_link, operation) in definition.instantiating_operations() {
            index.insert(
                correlator_id(partner_link, operation),
                process_id.to_string(),
            );
        }
    }

    async fn definition_entry(&self, process_id: &str) -> Result<Arc<DefinitionEntry>, EngineError> {
        let definitions = self.definitions.lock().await;
        definitions
            .get(process_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownProcess(process_id.to_string()))
    }

    // ─── Instance lifecycle ───────────────────────────────────

    /// Create a fresh instance and run its first cycle, which typically
    /// registers the instance's initial selectors.
    pub async fn start_instance(&self, process_id: &str) -> Result<CycleOutcome, EngineError> {
        let entry = self.definition_entry(process_id).await?;
        let instance_id = Uuid::now_v7();
        let record = InstanceRecord {
            instance_id,
            process_id: process_id.to_string(),
            status: InstanceStatus::Active,
            definition_version: entry.definition.version(),
            created_at: now_ms(),
        };
        self.store.save_instance(&record).await?;
        {
            let mut slots = self.slots.lock().await;
            slots.insert(
                instance_id,
                InstanceSlot {
                    process_id: process_id.to_string(),
                    status: InstanceStatus::Active,
                    lock: Arc::new(Mutex::new(())),
                },
            );
        }
        let mut vpu = Vpu::new(entry.definition.clone());
        vpu.inject_root();
        let bytes = vpu.snapshot()?;
        self.store.store_soup(instance_id, &bytes).await?;
        self.store
            .append_event(
                instance_id,
                &EngineEvent::InstanceStarted {
                    process_id: process_id.to_string(),
                    definition_version: version_hex(&entry.definition.version()),
                },
            )
            .await?;
        info!("instance {} of '{}' started", instance_id, process_id);
        self.run_cycle(instance_id, None).await
    }

    /// Run one transactional reduction cycle, optionally injecting a routed
    /// delivery first.
    pub async fn run_cycle(
        &self,
        instance_id: Uuid,
        delivery: Option<Delivery>,
    ) -> Result<CycleOutcome, EngineError> {
        let (process_id, lock) = self.slot_handle(instance_id).await?;
        let _guard = lock.lock().await;
        self.ensure_active(instance_id).await?;
        let entry = self.definition_entry(&process_id).await?;
        let mut vpu = self.load_vpu(instance_id, &entry).await?;

        if let Some(delivery) = &delivery {
            let channel = if delivery.consume {
                vpu.soup_mut().import(&delivery.select_group)?
            } else {
                vpu.soup_mut().peek_import(&delivery.select_group)?
            };
            let payload = json!({
                "index": delivery.index,
                "op": delivery.operation,
                "payload": delivery.payload,
                "mex_id": delivery.mex_id,
            });
            vpu.deliver(channel, OP_SELECTED, payload)?;
            trace!(
                "delivery {} injected on channel {} of instance {}",
                delivery.mex_id,
                channel,
                instance_id
            );
        }

        let mut effects = CycleEffects::new();
        let report = match vpu.run_cycle(&mut effects, self.cycle_cap) {
            Ok(report) => report,
            Err(err) if err.is_corruption() => {
                return Err(self.quarantine(instance_id, err.to_string()).await)
            }
            Err(err) => return Err(err.into()),
        };

        // unhandled fault: the previous snapshot stays authoritative and
        // no boundary effect leaves the kernel
        if let Some(fault) = vpu.fault().cloned() {
            return self
                .fault_outcome(instance_id, report.cycle, report.reductions, fault)
                .await;
        }

        if let Err(err) = self.apply_selectors(instance_id, &effects).await {
            match err {
                EngineError::Routing(routing) => {
                    let fault = InstanceFault {
                        fault: FaultValue::new(
                            CONFLICT_FAULT,
                            json!({ "error": routing.to_string() }),
                        ),
                        logic: String::new(),
                        cycle: report.cycle,
                    };
                    return self
                        .fault_outcome(instance_id, report.cycle, report.reductions, fault)
                        .await;
                }
                other => return Err(other),
            }
        }

        for group in &effects.cancels {
            self.router.remove_group(instance_id, group).await;
            self.store.remove_routes_for_group(instance_id, group).await?;
            if let Err(err) = vpu.soup_mut().import(group) {
                trace!("cancel of select group {}: {}", group, err);
            }
            self.store
                .append_event(
                    instance_id,
                    &EngineEvent::SelectorsCancelled {
                        select_group: group.clone(),
                    },
                )
                .await?;
        }

        let bytes = vpu.snapshot()?;
        self.store.store_soup(instance_id, &bytes).await?;
        let digest = hex::encode(Sha256::digest(&bytes));
        self.store
            .append_event(
                instance_id,
                &EngineEvent::SnapshotStored {
                    cycle: report.cycle,
                    bytes: bytes.len(),
                    digest,
                },
            )
            .await?;
        self.store
            .append_event(
                instance_id,
                &EngineEvent::CycleCompleted {
                    cycle: report.cycle,
                    reductions: report.reductions,
                    outbound: effects.outbound.len(),
                    quiesced: report.quiesced,
                },
            )
            .await?;

        let status = if vpu.is_complete() {
            let at = now_ms();
            let status = InstanceStatus::Completed { at };
            self.set_status(instance_id, status.clone()).await?;
            self.router.remove_instance(instance_id).await;
            self.store.remove_routes_for_instance(instance_id).await?;
            self.store
                .append_event(instance_id, &EngineEvent::InstanceCompleted { at })
                .await?;
            info!("instance {} completed", instance_id);
            status
        } else {
            InstanceStatus::Active
        };

        debug!(
            "instance {} cycle {}: {} reductions, {} outbound, quiesced: {}",
            instance_id,
            report.cycle,
            report.reductions,
            effects.outbound.len(),
            report.quiesced
        );
        Ok(CycleOutcome {
            instance_id,
            cycle: report.cycle,
            reductions: report.reductions,
            quiesced: report.quiesced,
            outbound: effects.outbound,
            new_selectors: effects.selections,
            fault: None,
            status,
        })
    }

    async fn fault_outcome(
        &self,
        instance_id: Uuid,
        cycle: CycleId,
        reductions: usize,
        fault: InstanceFault,
    ) -> Result<CycleOutcome, EngineError> {
        let status = InstanceStatus::Faulted {
            fault: fault.clone(),
            at: now_ms(),
        };
        self.set_status(instance_id, status.clone()).await?;
        self.store
            .append_event(
                instance_id,
                &EngineEvent::InstanceFaulted {
                    fault: fault.clone(),
                },
            )
            .await?;
        warn!(
            "instance {} faulted in cycle {}: {}",
            instance_id, cycle, fault.fault.name
        );
        Ok(CycleOutcome {
            instance_id,
            cycle,
            reductions,
            quiesced: false,
            outbound: Vec::new(),
            new_selectors: Vec::new(),
            fault: Some(fault),
            status,
        })
    }

    async fn apply_selectors(
        &self,
        instance_id: Uuid,
        effects: &CycleEffects,
    ) -> Result<(), EngineError> {
        let mut applied: Vec<String> = Vec::new();
        for registration in &effects.selections {
            match self
                .router
                .register(instance_id, &registration.select_group, &registration.selectors)
                .await
            {
                Ok(entries) => {
                    self.store.save_routes(&entries).await?;
                    self.store
                        .append_event(
                            instance_id,
                            &EngineEvent::SelectorsRegistered {
                                select_group: registration.select_group.clone(),
                                count: entries.len(),
                            },
                        )
                        .await?;
                    applied.push(registration.select_group.clone());
                }
                Err(conflict) => {
                    for group in &applied {
                        self.router.remove_group(instance_id, group).await;
                        self.store.remove_routes_for_group(instance_id, group).await?;
                    }
                    return Err(conflict.into());
                }
            }
        }
        Ok(())
    }

    async fn load_vpu(
        &self,
        instance_id: Uuid,
        entry: &DefinitionEntry,
    ) -> Result<Vpu, EngineError> {
        let bytes = self
            .store
            .load_soup(instance_id)
            .await?
            .ok_or(EngineError::MissingSnapshot(instance_id))?;
        let mut soup = match Soup::restore(&bytes) {
            Ok(soup) => soup,
            Err(err) if err.is_corruption() => {
                return Err(self.quarantine(instance_id, err.to_string()).await)
            }
            Err(err) => return Err(err.into()),
        };
        let current = entry.definition.version();
        if soup.definition_version() != current {
            let from = soup.definition_version();
            let Some(map) = entry.replacements.get(&from) else {
                return Err(EngineError::VersionMismatch {
                    instance: instance_id,
                    version: version_hex(&from),
                });
            };
            let substitutions = soup.apply_replacements(map);
            soup.set_definition_version(current);
            self.store
                .append_event(
                    instance_id,
                    &EngineEvent::DefinitionReplaced {
                        from_version: version_hex(&from),
                        to_version: version_hex(&current),
                        substitutions,
                    },
                )
                .await?;
            debug!(
                "instance {} upgraded from version {} ({} substitutions)",
                instance_id,
                version_hex(&from),
                substitutions
            );
        }
        Ok(Vpu::resume(entry.definition.clone(), soup))
    }

    // ─── Inbound traffic ──────────────────────────────────────

    /// Route an inbound message and run the receiving instance's cycle.
    pub async fn handle_inbound(
        &self,
        message: InboundMessage,
    ) -> Result<DispatchOutcome, EngineError> {
        let now = now_ms();
        self.dispatch(message, now, self.park_ttl_ms).await
    }

    async fn dispatch(
        &self,
        message: InboundMessage,
        now: Timestamp,
        ttl_ms: i64,
    ) -> Result<DispatchOutcome, EngineError> {
        let mut created = false;
        loop {
            let instantiating = self.instantiating_process(&message).await;
            let decision = self
                .router
                .route(&message, instantiating.is_some(), now, ttl_ms)
                .await;
            match decision {
                RouteDecision::Matched(matched) => {
                    return self.deliver_matched(&message, matched, created).await;
                }
                RouteDecision::CreateInstance => {
                    if created {
                        // the fresh instance registered no selector for this
                        // operation; park instead of looping
                        let parked = self.router.park(message.clone(), now, ttl_ms).await;
                        self.store.save_parked(&parked).await?;
                        return Ok(DispatchOutcome::Parked);
                    }
                    let process_id = instantiating.ok_or_else(|| {
                        EngineError::UnknownProcess(correlator_id(
                            &message.partner_link,
                            &message.operation,
                        ))
                    })?;
                    self.start_instance(&process_id).await?;
                    created = true;
                }
                RouteDecision::Parked(parked) => {
                    self.store.save_parked(&parked).await?;
                    return Ok(DispatchOutcome::Parked);
                }
                RouteDecision::Ambiguous(candidates) => {
                    warn!(
                        "message {} matches {} equally specific routes; rejected",
                        message.mex_id,
                        candidates.len()
                    );
                    return Ok(DispatchOutcome::Ambiguous { candidates });
                }
            }
        }
    }

    async fn deliver_matched(
        &self,
        message: &InboundMessage,
        matched: MatchedRoute,
        created: bool,
    ) -> Result<DispatchOutcome, EngineError> {
        let delivery = Delivery {
            select_group: matched.select_group.clone(),
            index: matched.index,
            operation: message.operation.clone(),
            payload: message.payload.clone(),
            mex_id: message.mex_id.clone(),
            consume: matched.policy == RoutePolicy::OneShot,
        };
        self.store
            .append_event(
                matched.instance_id,
                &EngineEvent::MessageRouted {
                    mex_id: message.mex_id.clone(),
                    correlator: correlator_id(&message.partner_link, &message.operation),
                    select_group: matched.select_group.clone(),
                    index: matched.index,
                },
            )
            .await?;
        match self.run_cycle(matched.instance_id, Some(delivery)).await {
            Ok(outcome) if outcome.fault.is_some() => {
                // the delivery never landed; hand the claimed routes back
                if !matched.consumed.is_empty() {
                    self.router.load_routes(matched.consumed).await;
                }
                Ok(DispatchOutcome::Delivered { outcome, created })
            }
            Ok(outcome) => {
                if !matched.consumed.is_empty() {
                    self.store
                        .remove_routes_for_group(matched.instance_id, &matched.select_group)
                        .await?;
                }
                Ok(DispatchOutcome::Delivered { outcome, created })
            }
            Err(err) => {
                if !matched.consumed.is_empty() {
                    self.router.load_routes(matched.consumed).await;
                }
                Err(err)
            }
        }
    }

    /// Re-dispatch parked messages that current routes could accept. Call
    /// after cycles that registered new selectors.
    pub async fn retry_parked(&self) -> Result<Vec<DispatchOutcome>, EngineError> {
        let now = now_ms();
        let ready = self.router.take_parked(now).await;
        let mut outcomes = Vec::with_capacity(ready.len());
        for parked in ready {
            self.store.remove_parked(&parked.message.mex_id).await?;
            let remaining = (parked.expires_at - now).max(0);
            outcomes.push(self.dispatch(parked.message, now, remaining).await?);
        }
        Ok(outcomes)
    }

    // ─── Operator actions ─────────────────────────────────────

    /// Terminate an instance: signal its control channel, drop structural
    /// work, drain matched communication reductions, withdraw routes.
    /// Selector registrations staged during the drain are dropped.
    pub async fn terminate_instance(
        &self,
        instance_id: Uuid,
    ) -> Result<CycleOutcome, EngineError> {
        let (process_id, lock) = self.slot_handle(instance_id).await?;
        let _guard = lock.lock().await;
        self.ensure_active(instance_id).await?;
        let entry = self.definition_entry(&process_id).await?;
        let mut vpu = self.load_vpu(instance_id, &entry).await?;

        let dropped = vpu.terminate()?;
        let mut effects = CycleEffects::new();
        let report = match vpu.run_cycle(&mut effects, self.cycle_cap) {
            Ok(report) => report,
            Err(err) if err.is_corruption() => {
                return Err(self.quarantine(instance_id, err.to_string()).await)
            }
            Err(err) => return Err(err.into()),
        };

        let bytes = vpu.snapshot()?;
        self.store.store_soup(instance_id, &bytes).await?;
        self.router.remove_instance(instance_id).await;
        self.store.remove_routes_for_instance(instance_id).await?;
        if let Some(fault) = vpu.fault().cloned() {
            self.store
                .append_event(instance_id, &EngineEvent::InstanceFaulted { fault })
                .await?;
        }
        let at = now_ms();
        let status = InstanceStatus::Terminated { at };
        self.set_status(instance_id, status.clone()).await?;
        self.store
            .append_event(
                instance_id,
                &EngineEvent::InstanceTerminated {
                    at,
                    dropped_reductions: dropped,
                },
            )
            .await?;
        info!(
            "instance {} terminated ({} structural reductions dropped)",
            instance_id, dropped
        );
        Ok(CycleOutcome {
            instance_id,
            cycle: report.cycle,
            reductions: report.reductions,
            quiesced: report.quiesced,
            outbound: effects.outbound,
            new_selectors: Vec::new(),
            fault: None,
            status,
        })
    }

    /// Clear a faulted status so cycles may run again from the last good
    /// snapshot.
    pub async fn retry_instance(&self, instance_id: Uuid) -> Result<(), EngineError> {
        {
            let mut slots = self.slots.lock().await;
            let slot = slots
                .get_mut(&instance_id)
                .ok_or(EngineError::UnknownInstance(instance_id))?;
            match &slot.status {
                InstanceStatus::Faulted { .. } => slot.status = InstanceStatus::Active,
                other => {
                    return Err(EngineError::NotActive {
                        instance: instance_id,
                        status: other.label().to_string(),
                    })
                }
            }
        }
        self.store
            .update_instance_status(instance_id, InstanceStatus::Active)
            .await?;
        debug!("instance {} reset to active", instance_id);
        Ok(())
    }

    pub async fn instance_status(&self, instance_id: Uuid) -> Result<InstanceStatus, EngineError> {
        let slots = self.slots.lock().await;
        slots
            .get(&instance_id)
            .map(|s| s.status.clone())
            .ok_or(EngineError::UnknownInstance(instance_id))
    }

    /// Instance records in creation order.
    pub async fn instances(&self) -> Result<Vec<InstanceRecord>, EngineError> {
        Ok(self.store.list_instances().await?)
    }

    /// Rebuild slots and the router from the store after a restart.
    /// Returns the number of instance records loaded.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let records = self.store.list_instances().await?;
        let count = records.len();
        {
            let mut slots = self.slots.lock().await;
            for record in records {
                slots.insert(
                    record.instance_id,
                    InstanceSlot {
                        process_id: record.process_id.clone(),
                        status: record.status.clone(),
                        lock: Arc::new(Mutex::new(())),
                    },
                );
            }
        }
        let routes = self.store.load_all_routes().await?;
        let route_count = routes.len();
        self.router.load_routes(routes).await;
        let parked = self.store.load_all_parked().await?;
        self.router.load_parked(parked, now_ms()).await;
        info!("recovered {} instances, {} routes", count, route_count);
        Ok(count)
    }

    // ─── Internals ────────────────────────────────────────────

    async fn instantiating_process(&self, message: &InboundMessage) -> Option<String> {
        let index = self.instantiating.lock().await;
        index
            .get(&correlator_id(&message.partner_link, &message.operation))
            .cloned()
    }

    async fn slot_handle(
        &self,
        instance_id: Uuid,
    ) -> Result<(String, Arc<Mutex<()>>), EngineError> {
        let slots = self.slots.lock().await;
        let slot = slots
            .get(&instance_id)
            .ok_or(EngineError::UnknownInstance(instance_id))?;
        check_active(instance_id, &slot.status)?;
        Ok((slot.process_id.clone(), slot.lock.clone()))
    }

    /// Re-check under the per-instance lock; the status may have moved
    /// while we waited.
    async fn ensure_active(&self, instance_id: Uuid) -> Result<(), EngineError> {
        let slots = self.slots.lock().await;
        let slot = slots
            .get(&instance_id)
            .ok_or(EngineError::UnknownInstance(instance_id))?;
        check_active(instance_id, &slot.status)
    }

    async fn set_status(
        &self,
        instance_id: Uuid,
        status: InstanceStatus,
    ) -> Result<(), EngineError> {
        {
            let mut slots = self.slots.lock().await;
            if let Some(slot) = slots.get_mut(&instance_id) {
                slot.status = status.clone();
            }
        }
        self.store.update_instance_status(instance_id, status).await?;
        Ok(())
    }

    async fn quarantine(&self, instance_id: Uuid, reason: String) -> EngineError {
        warn!("quarantining instance {}: {}", instance_id, reason);
        let status = InstanceStatus::Quarantined {
            reason: reason.clone(),
            at: now_ms(),
        };
        if let Err(err) = self.set_status(instance_id, status).await {
            warn!("could not persist quarantine of {}: {}", instance_id, err);
        }
        if let Err(err) = self
            .store
            .append_event(
                instance_id,
                &EngineEvent::InstanceQuarantined {
                    reason: reason.clone(),
                },
            )
            .await
        {
            warn!("could not record quarantine of {}: {}", instance_id, err);
        }
        EngineError::Quarantined(instance_id, reason)
    }
}

fn check_active(instance_id: Uuid, status: &InstanceStatus) -> Result<(), EngineError> {
    match status {
        InstanceStatus::Active => Ok(()),
        InstanceStatus::Quarantined { reason, .. } => {
            Err(EngineError::Quarantined(instance_id, reason.clone()))
        }
        other => Err(EngineError::NotActive {
            instance: instance_id,
            status: other.label().to_string(),
        }),
    }
}

fn now_ms() -> Timestamp {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::{order_keys, order_process};
    use crate::routing::Selector;
    use crate::store_memory::MemoryStore;
    use crate::vpu::ReductionCtx;
    use serde_json::Value;

    fn submit(order_id: &str, mex: &str) -> InboundMessage {
        InboundMessage::new(
            "customer",
            "submit",
            json!({ "order_id": order_id }),
            mex,
        )
    }

    fn decide(order_id: &str, approved: bool, mex: &str) -> InboundMessage {
        InboundMessage::new("approver", "decide", json!({ "approved": approved }), mex)
            .with_keys(order_keys(order_id))
    }

    fn engine() -> (Engine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Engine::new(store.clone()), store)
    }

    async fn event_kinds(store: &MemoryStore, instance_id: Uuid) -> Vec<&'static str> {
        store
            .read_events(instance_id, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|(_, e)| e.kind())
            .collect()
    }

    #[tokio::test]
    async fn order_flow_end_to_end() {
        let (engine, store) = engine();
        engine.register_definition(order_process()).await;

        let outcome = engine.handle_inbound(submit("42", "m1")).await.unwrap();
        let DispatchOutcome::Delivered { outcome, created } = outcome else {
            panic!("expected delivery, got {outcome:?}");
        };
        assert!(created);
        assert_eq!(outcome.outbound.len(), 1);
        assert_eq!(outcome.outbound[0].operation, "ack");
        assert_eq!(outcome.status, InstanceStatus::Active);
        // the intake selector is spent; decide and status remain
        assert_eq!(engine.router().route_count().await, 2);

        let instance_id = outcome.instance_id;
        let outcome = engine
            .handle_inbound(decide("42", true, "m2"))
            .await
            .unwrap();
        let DispatchOutcome::Delivered { outcome, created } = outcome else {
            panic!("expected delivery, got {outcome:?}");
        };
        assert!(!created);
        assert_eq!(outcome.instance_id, instance_id);
        assert_eq!(outcome.outbound[0].operation, "ship");
        assert!(matches!(outcome.status, InstanceStatus::Completed { .. }));
        assert_eq!(engine.router().route_count().await, 0);

        let kinds = event_kinds(&store, instance_id).await;
        assert!(kinds.contains(&"instance_started"));
        assert!(kinds.contains(&"selectors_registered"));
        assert!(kinds.contains(&"message_routed"));
        assert!(kinds.contains(&"snapshot_stored"));
        assert_eq!(kinds.last(), Some(&"instance_completed"));
    }

    #[tokio::test]
    async fn uncorrelated_message_parks_then_retries() {
        let (engine, store) = engine();
        engine.register_definition(order_process()).await;
        engine.handle_inbound(submit("42", "m1")).await.unwrap();

        // no instance is waiting on order 99 yet
        let outcome = engine
            .handle_inbound(decide("99", true, "m2"))
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Parked));
        assert_eq!(store.load_all_parked().await.unwrap().len(), 1);

        // a second instance starts waiting on order 99
        engine.handle_inbound(submit("99", "m3")).await.unwrap();
        let outcomes = engine.retry_parked().await.unwrap();
        assert_eq!(outcomes.len(), 1);
        let DispatchOutcome::Delivered { outcome, .. } = &outcomes[0] else {
            panic!("expected delivery, got {:?}", outcomes[0]);
        };
        assert!(matches!(outcome.status, InstanceStatus::Completed { .. }));
        assert!(store.load_all_parked().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fault_preserves_snapshot_and_restores_routes() {
        let (engine, store) = engine();
        engine.register_definition(order_process()).await;
        let outcome = engine.handle_inbound(submit("42", "m1")).await.unwrap();
        let DispatchOutcome::Delivered { outcome, .. } = outcome else {
            panic!("expected delivery, got {outcome:?}");
        };
        let instance_id = outcome.instance_id;
        let before = store.load_soup(instance_id).await.unwrap().unwrap();

        // rejection faults the instance mid-cycle
        let outcome = engine
            .handle_inbound(decide("42", false, "m2"))
            .await
            .unwrap();
        let DispatchOutcome::Delivered { outcome, .. } = outcome else {
            panic!("expected delivery, got {outcome:?}");
        };
        let fault = outcome.fault.unwrap();
        assert_eq!(fault.fault.name, "order.rejected");
        assert!(outcome.outbound.is_empty());
        assert!(matches!(
            engine.instance_status(instance_id).await.unwrap(),
            InstanceStatus::Faulted { .. }
        ));
        // snapshot rolled back, claimed route handed back
        assert_eq!(store.load_soup(instance_id).await.unwrap().unwrap(), before);
        assert_eq!(engine.router().route_count().await, 2);

        // cycles are refused until the operator intervenes
        let err = engine.run_cycle(instance_id, None).await.unwrap_err();
        assert!(matches!(err, EngineError::NotActive { .. }));

        engine.retry_instance(instance_id).await.unwrap();
        let outcome = engine
            .handle_inbound(decide("42", true, "m3"))
            .await
            .unwrap();
        let DispatchOutcome::Delivered { outcome, .. } = outcome else {
            panic!("expected delivery, got {outcome:?}");
        };
        assert_eq!(outcome.outbound[0].operation, "ship");
        assert!(matches!(outcome.status, InstanceStatus::Completed { .. }));
    }

    #[tokio::test]
    async fn corrupt_snapshot_quarantines_the_instance() {
        let (engine, store) = engine();
        engine.register_definition(order_process()).await;
        let outcome = engine.handle_inbound(submit("42", "m1")).await.unwrap();
        let DispatchOutcome::Delivered { outcome, .. } = outcome else {
            panic!("expected delivery, got {outcome:?}");
        };
        let instance_id = outcome.instance_id;

        store.store_soup(instance_id, b"not a soup").await.unwrap();
        let err = engine.run_cycle(instance_id, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Quarantined(..)));
        assert!(matches!(
            engine.instance_status(instance_id).await.unwrap(),
            InstanceStatus::Quarantined { .. }
        ));
        // and it stays fenced off
        let err = engine.run_cycle(instance_id, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Quarantined(..)));
        let kinds = event_kinds(&store, instance_id).await;
        assert!(kinds.contains(&"instance_quarantined"));
    }

    #[tokio::test]
    async fn replacement_upgrades_waiting_checkpoints() {
        fn versioned(stage_logic: &'static str, output: &'static str) -> Arc<ProcessDefinition> {
            Arc::new(
                ProcessDefinition::build("upgradable")
                    .instantiating("client", "start")
                    .activity("main", move |ctx: &mut ReductionCtx, _act| {
                        let resp = ctx.new_channel(SELECT_TYPE, "start")?;
                        ctx.receive(resp, &[OP_SELECTED], "on-start", Value::Null)?;
                        ctx.select(resp, vec![Selector::one_shot("client", "start", None)])?;
                        Ok(())
                    })
                    .activity("on-start", move |ctx: &mut ReductionCtx, _act| {
                        let resp = ctx.new_channel(SELECT_TYPE, "poke")?;
                        ctx.receive(resp, &[OP_SELECTED], stage_logic, Value::Null)?;
                        ctx.select(resp, vec![Selector::one_shot("client", "poke", None)])?;
                        Ok(())
                    })
                    .activity(stage_logic, move |ctx: &mut ReductionCtx, _act| {
                        ctx.invoke("sink", output, Value::Null);
                        Ok(())
                    })
                    .finish(),
            )
        }

        let v1 = versioned("stage.v1", "v1-poke");
        let v2 = versioned("stage.v2", "v2-poke");
        let (engine, store) = engine();
        engine.register_definition(v1.clone()).await;
        let outcome = engine
            .handle_inbound(InboundMessage::new("client", "start", json!({}), "m1"))
            .await
            .unwrap();
        let DispatchOutcome::Delivered { outcome, .. } = outcome else {
            panic!("expected delivery, got {outcome:?}");
        };
        let instance_id = outcome.instance_id;

        let mut map = ReplacementMap::new(v1.version());
        map.insert("stage.v1", "stage.v2");
        engine.replace_definition(v2, map).await;

        let outcome = engine
            .handle_inbound(InboundMessage::new("client", "poke", json!({}), "m2"))
            .await
            .unwrap();
        let DispatchOutcome::Delivered { outcome, .. } = outcome else {
            panic!("expected delivery, got {outcome:?}");
        };
        assert_eq!(outcome.outbound[0].operation, "v2-poke");
        let kinds = event_kinds(&store, instance_id).await;
        assert!(kinds.contains(&"definition_replaced"));
    }

    #[tokio::test]
    async fn terminate_withdraws_routes_and_fences_cycles() {
        let (engine, store) = engine();
        engine.register_definition(order_process()).await;
        let outcome = engine.handle_inbound(submit("42", "m1")).await.unwrap();
        let DispatchOutcome::Delivered { outcome, .. } = outcome else {
            panic!("expected delivery, got {outcome:?}");
        };
        let instance_id = outcome.instance_id;

        let outcome = engine.terminate_instance(instance_id).await.unwrap();
        assert!(matches!(outcome.status, InstanceStatus::Terminated { .. }));
        assert_eq!(engine.router().route_count().await, 0);
        assert!(store.load_all_routes().await.unwrap().is_empty());

        // the waiting decide message now has nowhere to go
        let outcome = engine
            .handle_inbound(decide("42", true, "m2"))
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Parked));
        let err = engine.run_cycle(instance_id, None).await.unwrap_err();
        assert!(matches!(err, EngineError::NotActive { .. }));
    }

    #[tokio::test]
    async fn recovery_rebuilds_slots_and_routes() {
        let store = Arc::new(MemoryStore::new());
        {
            let engine = Engine::new(store.clone());
            engine.register_definition(order_process()).await;
            engine.handle_inbound(submit("42", "m1")).await.unwrap();
        }

        // a new engine over the same store picks the instance back up
        let engine = Engine::new(store.clone());
        engine.register_definition(order_process()).await;
        assert_eq!(engine.recover().await.unwrap(), 1);
        assert_eq!(engine.router().route_count().await, 2);

        let outcome = engine
            .handle_inbound(decide("42", true, "m2"))
            .await
            .unwrap();
        let DispatchOutcome::Delivered { outcome, .. } = outcome else {
            panic!("expected delivery, got {outcome:?}");
        };
        assert_eq!(outcome.outbound[0].operation, "ship");
        assert!(matches!(outcome.status, InstanceStatus::Completed { .. }));
    }

    #[tokio::test]
    async fn ambiguous_routes_reject_the_message() {
        let (engine, _store) = engine();
        engine.register_definition(order_process()).await;
        // two instances both hold the catch-all intake selector
        engine.start_instance("order").await.unwrap();
        engine.start_instance("order").await.unwrap();

        let outcome = engine.handle_inbound(submit("42", "m1")).await.unwrap();
        let DispatchOutcome::Ambiguous { candidates } = outcome else {
            panic!("expected ambiguity, got {outcome:?}");
        };
        assert_eq!(candidates.len(), 2);
        // nothing was consumed
        assert_eq!(engine.router().route_count().await, 2);
    }
}
