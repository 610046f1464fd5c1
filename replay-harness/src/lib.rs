//! Determinism drift checker for the BPEL-Lite kernel.
//!
//! Replays a script of inbound messages twice over separate stores: once on a
//! long-lived engine, and once with a cold restart (fresh engine, `recover()`
//! from the store) before every step. After each step both runs digest every
//! stored soup image; the digests must agree byte-for-byte. A divergence
//! pinpoints nondeterminism the kernel's own tests miss: wall-clock reads in
//! activities, unordered iteration, id reuse.
//!
//! Scripts are expected to replay cleanly; a step that quarantines or loses
//! an instance surfaces as an error, not a drift.

use anyhow::Result;
use bpel_lite_core::engine::Engine;
use bpel_lite_core::store::SoupStore;
use bpel_lite_core::store_memory::MemoryStore;
use bpel_lite_core::types::InboundMessage;
use bpel_lite_core::vpu::ProcessDefinition;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A replayable sequence of inbound messages.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Script {
    pub steps: Vec<InboundMessage>,
}

impl Script {
    pub fn new(steps: Vec<InboundMessage>) -> Self {
        Self { steps }
    }

    pub fn push(&mut self, message: InboundMessage) {
        self.steps.push(message);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Digest of the store-visible kernel state after one step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDigest {
    pub step: usize,
    pub mex_id: String,
    /// blake3 over the stored soup images.
    pub state: String,
}

/// Step-by-step comparison of a straight run against a restarted run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriftReport {
    pub straight: Vec<StepDigest>,
    pub restarted: Vec<StepDigest>,
}

impl DriftReport {
    /// First step whose digests disagree.
    pub fn divergence(&self) -> Option<usize> {
        self.straight
            .iter()
            .zip(&self.restarted)
            .find(|(a, b)| a.state != b.state)
            .map(|(a, _)| a.step)
    }

    pub fn is_clean(&self) -> bool {
        self.straight.len() == self.restarted.len() && self.divergence().is_none()
    }
}

/// blake3 over every stored soup image. Soup images carry no instance ids,
/// and instance uuids differ between runs, so the per-soup digests are
/// combined order-free.
pub async fn digest_state(store: &Arc<dyn SoupStore>) -> Result<String> {
    let mut parts = Vec::new();
    for record in store.list_instances().await? {
        if let Some(bytes) = store.load_soup(record.instance_id).await? {
            parts.push(blake3::hash(&bytes).to_hex().to_string());
        }
    }
    parts.sort();
    let mut hasher = blake3::Hasher::new();
    for part in &parts {
        hasher.update(part.as_bytes());
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Run the script on one long-lived engine, digesting after every step.
pub async fn run_straight(
    definitions: &[Arc<ProcessDefinition>],
    script: &Script,
) -> Result<Vec<StepDigest>> {
    let store: Arc<dyn SoupStore> = Arc::new(MemoryStore::new());
    let engine = Engine::new(store.clone());
    for definition in definitions {
        engine.register_definition(definition.clone()).await;
    }
    let mut digests = Vec::with_capacity(script.steps.len());
    for (step, message) in script.steps.iter().enumerate() {
        engine.handle_inbound(message.clone()).await?;
        digests.push(StepDigest {
            step,
            mex_id: message.mex_id.clone(),
            state: digest_state(&store).await?,
        });
    }
    Ok(digests)
}

/// Run the script with a cold restart before every step: a fresh engine is
/// built over the same store and recovered, as after a crash.
pub async fn run_restarted(
    definitions: &[Arc<ProcessDefinition>],
    script: &Script,
) -> Result<Vec<StepDigest>> {
    let store: Arc<dyn SoupStore> = Arc::new(MemoryStore::new());
    let mut digests = Vec::with_capacity(script.steps.len());
    for (step, message) in script.steps.iter().enumerate() {
        let engine = Engine::new(store.clone());
        for definition in definitions {
            engine.register_definition(definition.clone()).await;
        }
        engine.recover().await?;
        engine.handle_inbound(message.clone()).await?;
        digests.push(StepDigest {
            step,
            mex_id: message.mex_id.clone(),
            state: digest_state(&store).await?,
        });
    }
    Ok(digests)
}

/// Run both modes over the same script and pair the digests.
pub async fn compare(
    definitions: &[Arc<ProcessDefinition>],
    script: &Script,
) -> Result<DriftReport> {
    let straight = run_straight(definitions, script).await?;
    let restarted = run_restarted(definitions, script).await?;
    Ok(DriftReport {
        straight,
        restarted,
    })
}
