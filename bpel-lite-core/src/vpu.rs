//! The reduction engine.
//!
//! A [`Vpu`] owns one instance's soup and drains its ready queues one
//! reduction at a time: pop a reaction, look up its logic id in the
//! definition's logic table, run the activity against a [`ReductionCtx`].
//! Activities enqueue further work on the soup and record external side
//! effects into [`CycleEffects`]; nothing leaves the kernel until the caller
//! applies those effects at the cycle boundary.

use crate::error::{ReductionError, SoupError};
use crate::routing::Selector;
use crate::soup::{Reaction, ReceiveArm, Soup};
use crate::types::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Fault name the kernel uses when a reduction trips a structural error.
/// Structural faults bypass fault handlers.
pub const STRUCTURAL_FAULT: &str = "sys.structural";

// ─── Activities ───────────────────────────────────────────────

/// The message handed to an activity by a communication reduction.
#[derive(Clone, Debug, PartialEq)]
pub struct DeliveredMessage {
    pub channel: ChannelId,
    pub op: String,
    pub payload: Value,
}

/// Everything an activity wakes up with: its captured locals and, for
/// communication reductions, the delivered message.
#[derive(Clone, Debug, PartialEq)]
pub struct Activation {
    pub state: Value,
    pub message: Option<DeliveredMessage>,
}

/// One resumable unit of a process definition.
///
/// Implementations must be pure with respect to everything except the
/// [`ReductionCtx`] they are handed; reading clocks or randomness here
/// breaks replay.
pub trait Activity: Send + Sync {
    fn run(&self, ctx: &mut ReductionCtx<'_>, activation: Activation)
        -> Result<(), ReductionError>;
}

impl<F> Activity for F
where
    F: Fn(&mut ReductionCtx<'_>, Activation) -> Result<(), ReductionError> + Send + Sync,
{
    fn run(
        &self,
        ctx: &mut ReductionCtx<'_>,
        activation: Activation,
    ) -> Result<(), ReductionError> {
        self(ctx, activation)
    }
}

// ─── Process definitions ──────────────────────────────────────

/// A compiled process definition: the channel type table, the logic table of
/// resumable activities, the root unit, and which partner-link operations may
/// instantiate new instances.
pub struct ProcessDefinition {
    process_id: String,
    version: DefinitionVersion,
    channel_types: ChannelTypeTable,
    logic: BTreeMap<String, Arc<dyn Activity>>,
    root: Resumption,
    instantiating: BTreeSet<(String, String)>,
}

impl ProcessDefinition {
    pub fn build(process_id: impl Into<String>) -> DefinitionBuilder {
        DefinitionBuilder {
            process_id: process_id.into(),
            channel_types: ChannelTypeTable::new(),
            logic: BTreeMap::new(),
            root: None,
            instantiating: BTreeSet::new(),
        }
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Digest of the definition surface: process id, channel types, logic
    /// ids, root, and instantiating operations. Activity bodies are not
    /// hashed; republish under a new logic id when behavior changes.
    pub fn version(&self) -> DefinitionVersion {
        self.version
    }

    pub fn channel_types(&self) -> &ChannelTypeTable {
        &self.channel_types
    }

    pub fn root(&self) -> &Resumption {
        &self.root
    }

    pub fn activity(&self, logic: &str) -> Option<&Arc<dyn Activity>> {
        self.logic.get(logic)
    }

    pub fn is_instantiating(&self, partner_link: &str, operation: &str) -> bool {
        self.instantiating
            .contains(&(partner_link.to_string(), operation.to_string()))
    }

    /// Instantiating operations as `(partner_link, operation)` pairs.
    pub fn instantiating_operations(&self) -> impl Iterator<Item = &(String, String)> {
        self.instantiating.iter()
    }
}

impl fmt::Debug for ProcessDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessDefinition")
            .field("process_id", &self.process_id)
            .field("version", &version_hex(&self.version))
            .field("logic", &self.logic.keys().collect::<Vec<_>>())
            .field("root", &self.root.logic)
            .finish()
    }
}

/// Builder for [`ProcessDefinition`]. The root defaults to logic `main`
/// with null state.
pub struct DefinitionBuilder {
    process_id: String,
    channel_types: ChannelTypeTable,
    logic: BTreeMap<String, Arc<dyn Activity>>,
    root: Option<Resumption>,
    instantiating: BTreeSet<(String, String)>,
}

impl DefinitionBuilder {
    /// Declare a channel type with its operation set.
    pub fn channel_type(mut self, name: &str, ops: &[&str]) -> Self {
        self.channel_types.insert(ChannelType::new(name, ops));
        self
    }

    /// Register an activity under a logic id.
    pub fn activity<F>(mut self, logic: &str, activity: F) -> Self
    where
        F: Fn(&mut ReductionCtx<'_>, Activation) -> Result<(), ReductionError>
            + Send
            + Sync
            + 'static,
    {
        self.logic.insert(logic.to_string(), Arc::new(activity));
        self
    }

    /// Mark a partner-link operation as instance-creating.
    pub fn instantiating(mut self, partner_link: &str, operation: &str) -> Self {
        self.instantiating
            .insert((partner_link.to_string(), operation.to_string()));
        self
    }

    /// Set the root unit spawned into a fresh instance's soup.
    pub fn root(mut self, logic: &str, state: Value) -> Self {
        self.root = Some(Resumption::new(logic, state));
        self
    }

    pub fn finish(self) -> ProcessDefinition {
        let root = self
            .root
            .unwrap_or_else(|| Resumption::new("main", Value::Null));
        let version = compute_version(
            &self.process_id,
            &self.channel_types,
            &self.logic,
            &root,
            &self.instantiating,
        );
        ProcessDefinition {
            process_id: self.process_id,
            version,
            channel_types: self.channel_types,
            logic: self.logic,
            root,
            instantiating: self.instantiating,
        }
    }
}

fn compute_version(
    process_id: &str,
    channel_types: &ChannelTypeTable,
    logic: &BTreeMap<String, Arc<dyn Activity>>,
    root: &Resumption,
    instantiating: &BTreeSet<(String, String)>,
) -> DefinitionVersion {
    let mut hasher = Sha256::new();
    hasher.update(process_id.as_bytes());
    hasher.update([0u8]);
    for name in channel_types.names() {
        hasher.update(name.as_bytes());
        hasher.update([1u8]);
        if let Some(ty) = channel_types.get(name) {
            for op in &ty.ops {
                hasher.update(op.as_bytes());
                hasher.update([2u8]);
            }
        }
    }
    for id in logic.keys() {
        hasher.update(id.as_bytes());
        hasher.update([3u8]);
    }
    hasher.update(root.logic.as_bytes());
    hasher.update([4u8]);
    hasher.update(root.state.to_string().as_bytes());
    hasher.update([5u8]);
    for (partner_link, operation) in instantiating {
        hasher.update(partner_link.as_bytes());
        hasher.update([6u8]);
        hasher.update(operation.as_bytes());
        hasher.update([7u8]);
    }
    hasher.finalize().into()
}

// ─── Cycle effects ────────────────────────────────────────────

/// A batch of selectors awaiting routes, tied to one exported response
/// channel. The export token doubles as the select group id.
#[derive(Clone, Debug, PartialEq)]
pub struct SelectRegistration {
    pub select_group: String,
    pub selectors: Vec<Selector>,
}

/// External side effects collected while a cycle runs and applied by the
/// caller at the cycle boundary.
#[derive(Clone, Debug, Default)]
pub struct CycleEffects {
    pub outbound: Vec<OutboundRequest>,
    pub selections: Vec<SelectRegistration>,
    /// Select groups to withdraw, by export token.
    pub cancels: Vec<String>,
}

impl CycleEffects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.selections.is_empty() && self.cancels.is_empty()
    }
}

// ─── Reduction context ────────────────────────────────────────

/// The surface an activity programs against while its reduction runs.
///
/// Soup operations take effect immediately; `invoke`, `select` and
/// `cancel_select` only stage entries in [`CycleEffects`].
pub struct ReductionCtx<'a> {
    soup: &'a mut Soup,
    types: &'a ChannelTypeTable,
    effects: &'a mut CycleEffects,
    fault_handler: Option<ChannelId>,
    cycle: CycleId,
}

impl ReductionCtx<'_> {
    /// Create a channel of a declared type.
    pub fn new_channel(
        &mut self,
        type_name: &str,
        description: &str,
    ) -> Result<ChannelId, SoupError> {
        let ty = self
            .types
            .get(type_name)
            .ok_or_else(|| SoupError::UnknownChannelType(type_name.to_string()))?;
        Ok(self.soup.new_channel(ty, description))
    }

    /// Queue a structural reduction. The spawned unit inherits the current
    /// fault handler.
    pub fn spawn(&mut self, logic: &str, state: Value) {
        self.soup
            .spawn(Resumption::new(logic, state), self.fault_handler);
    }

    pub fn send(&mut self, channel: ChannelId, op: &str, payload: Value) -> Result<(), SoupError> {
        self.soup.send(channel, op, payload)
    }

    /// Send a message every present and future receiver observes.
    pub fn send_replicated(
        &mut self,
        channel: ChannelId,
        op: &str,
        payload: Value,
    ) -> Result<(), SoupError> {
        self.soup.send_replicated(channel, op, payload)
    }

    /// Register a single-arm receive group.
    pub fn receive(
        &mut self,
        channel: ChannelId,
        ops: &[&str],
        logic: &str,
        state: Value,
    ) -> Result<GroupId, SoupError> {
        self.soup.register(
            vec![ReceiveArm::new(channel, ops, logic, state)],
            false,
            self.fault_handler,
        )
    }

    /// Register a receive that survives matches (event-handler style).
    pub fn receive_replicated(
        &mut self,
        channel: ChannelId,
        ops: &[&str],
        logic: &str,
        state: Value,
    ) -> Result<GroupId, SoupError> {
        self.soup.register(
            vec![ReceiveArm::new(channel, ops, logic, state)],
            true,
            self.fault_handler,
        )
    }

    /// Register a multi-arm receive group; the first arm to match withdraws
    /// the whole group.
    pub fn pick(&mut self, arms: Vec<ReceiveArm>) -> Result<GroupId, SoupError> {
        self.soup.register(arms, false, self.fault_handler)
    }

    /// Withdraw a receive group. Returns false if it was already consumed.
    pub fn cancel_receive(&mut self, group: GroupId) -> bool {
        self.soup.cancel_group(group)
    }

    /// Pin a channel and return its export token.
    pub fn export_channel(&mut self, channel: ChannelId) -> Result<String, SoupError> {
        self.soup.export(channel)
    }

    /// Resolve an export token back to its channel, consuming the pin.
    pub fn import_channel(&mut self, token: &str) -> Result<ChannelId, SoupError> {
        self.soup.import(token)
    }

    /// Stage an outbound request. Returns its message-exchange id, derived
    /// from the cycle counter so replays assign the same ids.
    pub fn invoke(&mut self, endpoint: &str, operation: &str, payload: Value) -> String {
        let mex_id = format!("out-{}-{}", self.cycle, self.effects.outbound.len());
        self.effects.outbound.push(OutboundRequest {
            endpoint: endpoint.to_string(),
            operation: operation.to_string(),
            payload,
            mex_id: mex_id.clone(),
        });
        mex_id
    }

    /// Stage selector registration against an exported response channel.
    /// Routed messages arrive on `response` as op `selected`. Returns the
    /// select group id.
    pub fn select(
        &mut self,
        response: ChannelId,
        selectors: Vec<Selector>,
    ) -> Result<String, SoupError> {
        let select_group = self.soup.export(response)?;
        self.effects.selections.push(SelectRegistration {
            select_group: select_group.clone(),
            selectors,
        });
        Ok(select_group)
    }

    /// Stage withdrawal of a select group registered in an earlier cycle.
    pub fn cancel_select(&mut self, select_group: impl Into<String>) {
        self.effects.cancels.push(select_group.into());
    }

    /// Set the fault handler inherited by spawns and receives made after
    /// this call within the current reduction.
    pub fn set_fault_handler(&mut self, handler: Option<ChannelId>) -> Result<(), SoupError> {
        if let Some(channel) = handler {
            if self.soup.channel(channel).is_none() {
                return Err(SoupError::InvalidChannel(channel));
            }
        }
        self.fault_handler = handler;
        Ok(())
    }

    pub fn fault_handler(&self) -> Option<ChannelId> {
        self.fault_handler
    }

    pub fn control_channel(&self) -> ChannelId {
        self.soup.control_channel()
    }

    pub fn cycle(&self) -> CycleId {
        self.cycle
    }
}

// ─── The VPU ──────────────────────────────────────────────────

/// Counters accumulated across an instance's lifetime in memory. Not part
/// of the snapshot.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VpuStatistics {
    pub cycles: u64,
    pub reductions: u64,
    pub comm_reductions: u64,
    pub structural_reductions: u64,
    pub faults_raised: u64,
    pub faults_routed: u64,
}

/// What one drained cycle looked like from outside.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: CycleId,
    pub reductions: usize,
    /// True when the soup ran out of ready work; false when the cycle hit
    /// its reduction cap or an unhandled fault.
    pub quiesced: bool,
}

/// Drives one instance's soup. Pure with respect to I/O: every external
/// effect funnels through [`CycleEffects`].
pub struct Vpu {
    definition: Arc<ProcessDefinition>,
    soup: Soup,
    stats: VpuStatistics,
    fault: Option<InstanceFault>,
}

impl Vpu {
    /// Fresh instance with an empty soup.
    pub fn new(definition: Arc<ProcessDefinition>) -> Self {
        let soup = Soup::new(definition.version());
        Self {
            definition,
            soup,
            stats: VpuStatistics::default(),
            fault: None,
        }
    }

    /// Resume a restored soup. The caller is responsible for applying
    /// replacement maps first when versions diverge.
    pub fn resume(definition: Arc<ProcessDefinition>, soup: Soup) -> Self {
        Self {
            definition,
            soup,
            stats: VpuStatistics::default(),
            fault: None,
        }
    }

    pub fn soup(&self) -> &Soup {
        &self.soup
    }

    pub fn soup_mut(&mut self) -> &mut Soup {
        &mut self.soup
    }

    pub fn into_soup(self) -> Soup {
        self.soup
    }

    pub fn statistics(&self) -> &VpuStatistics {
        &self.stats
    }

    /// The unhandled fault that stopped this instance, if any.
    pub fn fault(&self) -> Option<&InstanceFault> {
        self.fault.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.soup.is_complete()
    }

    pub fn snapshot(&mut self) -> Result<Vec<u8>, SoupError> {
        self.soup.snapshot()
    }

    /// Queue the definition's root unit. Called once per fresh instance.
    pub fn inject_root(&mut self) {
        let root = self.definition.root().clone();
        self.soup.spawn(root, None);
    }

    /// Queue an arbitrary unit with no fault handler.
    pub fn inject(&mut self, resumption: Resumption) {
        self.soup.spawn(resumption, None);
    }

    /// Deliver a message from outside the soup.
    pub fn deliver(&mut self, channel: ChannelId, op: &str, payload: Value) -> Result<(), SoupError> {
        self.soup.send(channel, op, payload)
    }

    /// Signal termination on the control channel and drop pending structural
    /// work. Communication reductions already matched still run; drain with
    /// [`Vpu::run_cycle`] afterwards.
    pub fn terminate(&mut self) -> Result<usize, SoupError> {
        let control = self.soup.control_channel();
        self.soup.send(control, OP_TERMINATE, Value::Null)?;
        Ok(self.soup.drop_structural())
    }

    /// Run one ready reduction. Returns `Ok(false)` when none was ready.
    ///
    /// A fault raised by the activity is routed to its fault handler, or
    /// recorded as the instance's terminal fault when there is none.
    /// Structural errors always fault the instance. Only corruption-class
    /// errors surface as `Err`.
    pub fn execute(&mut self, effects: &mut CycleEffects) -> Result<bool, SoupError> {
        let Some(reaction) = self.soup.next_reaction() else {
            return Ok(false);
        };
        self.stats.reductions += 1;
        if reaction.is_comm() {
            self.stats.comm_reductions += 1;
        } else {
            self.stats.structural_reductions += 1;
        }
        let (resumption, fault_handler, message) = match reaction {
            Reaction::Spawn {
                resumption,
                fault_handler,
            } => (resumption, fault_handler, None),
            Reaction::Deliver {
                resumption,
                fault_handler,
                channel,
                op,
                payload,
            } => (
                resumption,
                fault_handler,
                Some(DeliveredMessage {
                    channel,
                    op,
                    payload,
                }),
            ),
        };
        trace!(
            "reduction: logic '{}' ({})",
            resumption.logic,
            if message.is_some() { "comm" } else { "structural" }
        );
        let Some(activity) = self.definition.activity(&resumption.logic) else {
            return Err(SoupError::UnknownLogic(resumption.logic));
        };
        let Resumption { logic, state } = resumption;
        let cycle = self.soup.cycle();
        let mut ctx = ReductionCtx {
            soup: &mut self.soup,
            types: self.definition.channel_types(),
            effects,
            fault_handler,
            cycle,
        };
        let activation = Activation { state, message };
        match activity.run(&mut ctx, activation) {
            Ok(()) => {}
            Err(ReductionError::Fault(fault)) => {
                self.stats.faults_raised += 1;
                self.record_fault(logic, fault, fault_handler);
            }
            Err(ReductionError::Soup(err)) if err.is_corruption() => return Err(err),
            Err(ReductionError::Soup(err)) => {
                debug!("structural error in logic '{}': {}", logic, err);
                let fault = FaultValue::new(STRUCTURAL_FAULT, json!({ "error": err.to_string() }));
                self.fault = Some(InstanceFault {
                    fault,
                    logic,
                    cycle,
                });
            }
        }
        Ok(true)
    }

    fn record_fault(&mut self, logic: String, fault: FaultValue, handler: Option<ChannelId>) {
        if let Some(channel) = handler {
            let payload = serde_json::to_value(&fault).unwrap_or(Value::Null);
            match self.soup.send(channel, OP_FAULT, payload) {
                Ok(()) => {
                    self.stats.faults_routed += 1;
                    debug!("fault '{}' routed to channel {}", fault.name, channel);
                    return;
                }
                Err(err) => debug!("fault handler {} rejected fault: {}", channel, err),
            }
        }
        self.fault = Some(InstanceFault {
            fault,
            logic,
            cycle: self.soup.cycle(),
        });
    }

    /// Drain ready reductions until quiescence, an unhandled fault, or
    /// `max_reductions`.
    pub fn run_cycle(
        &mut self,
        effects: &mut CycleEffects,
        max_reductions: usize,
    ) -> Result<CycleReport, SoupError> {
        let cycle = self.soup.bump_cycle();
        self.stats.cycles += 1;
        let mut reductions = 0usize;
        while self.fault.is_none() && reductions < max_reductions {
            if !self.execute(effects)? {
                break;
            }
            reductions += 1;
        }
        let quiesced = self.fault.is_none() && !self.soup.has_ready();
        trace!(
            "cycle {}: {} reductions, quiesced: {}",
            cycle,
            reductions,
            quiesced
        );
        Ok(CycleReport {
            cycle,
            reductions,
            quiesced,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{as_chan_ref, chan_ref};

    fn drain(vpu: &mut Vpu) -> (CycleEffects, CycleReport) {
        let mut effects = CycleEffects::new();
        let report = vpu.run_cycle(&mut effects, 1_000).unwrap();
        (effects, report)
    }

    fn ops_of(effects: &CycleEffects) -> Vec<String> {
        effects.outbound.iter().map(|o| o.operation.clone()).collect()
    }

    #[test]
    fn root_activity_runs_and_completes() {
        let def = Arc::new(
            ProcessDefinition::build("hello")
                .activity("main", |ctx: &mut ReductionCtx, _act| {
                    ctx.invoke("sink", "greet", json!("hello"));
                    Ok(())
                })
                .finish(),
        );
        let mut vpu = Vpu::new(def);
        vpu.inject_root();
        let (effects, report) = drain(&mut vpu);
        assert_eq!(report.reductions, 1);
        assert!(report.quiesced);
        assert_eq!(effects.outbound.len(), 1);
        assert_eq!(effects.outbound[0].mex_id, "out-1-0");
        assert!(vpu.is_complete());
        assert_eq!(vpu.statistics().structural_reductions, 1);
        assert_eq!(vpu.statistics().comm_reductions, 0);
    }

    #[test]
    fn communication_reductions_run_before_structural() {
        let def = Arc::new(
            ProcessDefinition::build("ordering")
                .channel_type("pair", &["ping"])
                .activity("main", |ctx: &mut ReductionCtx, _act| {
                    let ch = ctx.new_channel("pair", "pair")?;
                    ctx.receive(ch, &["ping"], "got", Value::Null)?;
                    ctx.send(ch, "ping", Value::Null)?;
                    ctx.spawn("later", Value::Null);
                    Ok(())
                })
                .activity("got", |ctx: &mut ReductionCtx, _act| {
                    ctx.invoke("sink", "first", Value::Null);
                    Ok(())
                })
                .activity("later", |ctx: &mut ReductionCtx, _act| {
                    ctx.invoke("sink", "second", Value::Null);
                    Ok(())
                })
                .finish(),
        );
        let mut vpu = Vpu::new(def);
        vpu.inject_root();
        let (effects, _) = drain(&mut vpu);
        assert_eq!(ops_of(&effects), vec!["first", "second"]);
    }

    #[test]
    fn messages_match_in_fifo_order() {
        let def = Arc::new(
            ProcessDefinition::build("fifo")
                .channel_type("stream", &["item"])
                .activity("main", |ctx: &mut ReductionCtx, _act| {
                    let ch = ctx.new_channel("stream", "items")?;
                    for n in 1..=3 {
                        ctx.send(ch, "item", json!(n))?;
                    }
                    ctx.receive(ch, &["item"], "reader", Value::Null)?;
                    Ok(())
                })
                .activity("reader", |ctx: &mut ReductionCtx, act| {
                    let msg = act.message.unwrap();
                    ctx.invoke("sink", "read", msg.payload);
                    ctx.receive(msg.channel, &["item"], "reader", Value::Null)?;
                    Ok(())
                })
                .finish(),
        );
        let mut vpu = Vpu::new(def);
        vpu.inject_root();
        let (effects, _) = drain(&mut vpu);
        let read: Vec<i64> = effects
            .outbound
            .iter()
            .map(|o| o.payload.as_i64().unwrap())
            .collect();
        assert_eq!(read, vec![1, 2, 3]);
        // the dangling receive has no export pin, so the instance has run out
        assert!(vpu.is_complete());
    }

    #[test]
    fn last_registered_receive_wins() {
        let def = Arc::new(
            ProcessDefinition::build("late-bind")
                .channel_type("pair", &["ping"])
                .activity("main", |ctx: &mut ReductionCtx, _act| {
                    let ch = ctx.new_channel("pair", "pair")?;
                    let state = json!({ "chan": chan_ref(ch) });
                    ctx.spawn("reg-early", state.clone());
                    ctx.spawn("reg-late", state.clone());
                    ctx.spawn("sender", state);
                    Ok(())
                })
                .activity("reg-early", |ctx: &mut ReductionCtx, act| {
                    let ch = as_chan_ref(&act.state["chan"]).unwrap();
                    ctx.receive(ch, &["ping"], "early-won", Value::Null)?;
                    Ok(())
                })
                .activity("reg-late", |ctx: &mut ReductionCtx, act| {
                    let ch = as_chan_ref(&act.state["chan"]).unwrap();
                    ctx.receive(ch, &["ping"], "late-won", Value::Null)?;
                    Ok(())
                })
                .activity("sender", |ctx: &mut ReductionCtx, act| {
                    let ch = as_chan_ref(&act.state["chan"]).unwrap();
                    ctx.send(ch, "ping", Value::Null)?;
                    Ok(())
                })
                .activity("early-won", |ctx: &mut ReductionCtx, _act| {
                    ctx.invoke("sink", "early", Value::Null);
                    Ok(())
                })
                .activity("late-won", |ctx: &mut ReductionCtx, _act| {
                    ctx.invoke("sink", "late", Value::Null);
                    Ok(())
                })
                .finish(),
        );
        let mut vpu = Vpu::new(def);
        vpu.inject_root();
        let (effects, _) = drain(&mut vpu);
        assert_eq!(ops_of(&effects), vec!["late"]);
    }

    #[test]
    fn fault_routes_to_enclosing_handler() {
        let def = Arc::new(
            ProcessDefinition::build("handled")
                .activity("main", |ctx: &mut ReductionCtx, _act| {
                    let fc = ctx.new_channel(FAULT_TYPE, "scope handler")?;
                    ctx.receive(fc, &[OP_FAULT], "on-fault", Value::Null)?;
                    ctx.set_fault_handler(Some(fc))?;
                    ctx.spawn("risky", Value::Null);
                    Ok(())
                })
                .activity("risky", |_ctx: &mut ReductionCtx, _act| {
                    Err(ReductionError::fault("boom", json!("payment declined")))
                })
                .activity("on-fault", |ctx: &mut ReductionCtx, act| {
                    let msg = act.message.unwrap();
                    ctx.invoke("sink", "handled", msg.payload);
                    Ok(())
                })
                .finish(),
        );
        let mut vpu = Vpu::new(def);
        vpu.inject_root();
        let (effects, report) = drain(&mut vpu);
        assert!(report.quiesced);
        assert!(vpu.fault().is_none());
        assert_eq!(effects.outbound.len(), 1);
        assert_eq!(effects.outbound[0].payload["name"], json!("boom"));
        assert_eq!(vpu.statistics().faults_raised, 1);
        assert_eq!(vpu.statistics().faults_routed, 1);
    }

    #[test]
    fn unhandled_fault_is_terminal() {
        let def = Arc::new(
            ProcessDefinition::build("unhandled")
                .activity("main", |_ctx: &mut ReductionCtx, _act| {
                    Err(ReductionError::fault("boom", Value::Null))
                })
                .finish(),
        );
        let mut vpu = Vpu::new(def);
        vpu.inject_root();
        let (_, report) = drain(&mut vpu);
        assert!(!report.quiesced);
        let fault = vpu.fault().unwrap();
        assert_eq!(fault.fault.name, "boom");
        assert_eq!(fault.logic, "main");
        // the fault latches: further cycles run nothing
        let (_, report) = drain(&mut vpu);
        assert_eq!(report.reductions, 0);
    }

    #[test]
    fn structural_error_bypasses_fault_handler() {
        let def = Arc::new(
            ProcessDefinition::build("structural")
                .channel_type("pair", &["ping"])
                .activity("main", |ctx: &mut ReductionCtx, _act| {
                    let fc = ctx.new_channel(FAULT_TYPE, "handler")?;
                    ctx.receive(fc, &[OP_FAULT], "on-fault", Value::Null)?;
                    ctx.set_fault_handler(Some(fc))?;
                    ctx.spawn("bad-send", Value::Null);
                    Ok(())
                })
                .activity("bad-send", |ctx: &mut ReductionCtx, _act| {
                    let ch = ctx.new_channel("pair", "pair")?;
                    // "zap" is not in the type's op set
                    ctx.send(ch, "zap", Value::Null)?;
                    Ok(())
                })
                .activity("on-fault", |ctx: &mut ReductionCtx, _act| {
                    ctx.invoke("sink", "handled", Value::Null);
                    Ok(())
                })
                .finish(),
        );
        let mut vpu = Vpu::new(def);
        vpu.inject_root();
        let (effects, _) = drain(&mut vpu);
        assert!(effects.outbound.is_empty());
        let fault = vpu.fault().unwrap();
        assert_eq!(fault.fault.name, STRUCTURAL_FAULT);
        assert_eq!(fault.logic, "bad-send");
    }

    #[test]
    fn unknown_logic_is_corruption() {
        let def = Arc::new(ProcessDefinition::build("empty").finish());
        let mut vpu = Vpu::new(def);
        vpu.inject(Resumption::new("ghost", Value::Null));
        let mut effects = CycleEffects::new();
        let err = vpu.run_cycle(&mut effects, 10).unwrap_err();
        assert_eq!(err, SoupError::UnknownLogic("ghost".into()));
        assert!(err.is_corruption());
    }

    #[test]
    fn terminate_drops_structural_but_delivers_control() {
        let def = Arc::new(
            ProcessDefinition::build("term")
                .activity("main", |ctx: &mut ReductionCtx, _act| {
                    let control = ctx.control_channel();
                    ctx.receive(control, &[OP_TERMINATE], "on-terminate", Value::Null)?;
                    ctx.spawn("never", Value::Null);
                    Ok(())
                })
                .activity("never", |ctx: &mut ReductionCtx, _act| {
                    ctx.invoke("sink", "never", Value::Null);
                    Ok(())
                })
                .activity("on-terminate", |ctx: &mut ReductionCtx, _act| {
                    ctx.invoke("sink", "cleanup", Value::Null);
                    Ok(())
                })
                .finish(),
        );
        let mut vpu = Vpu::new(def);
        vpu.inject_root();
        let mut effects = CycleEffects::new();
        // run only the root so "never" stays queued
        vpu.run_cycle(&mut effects, 1).unwrap();
        let dropped = vpu.terminate().unwrap();
        assert_eq!(dropped, 1);
        let (effects, _) = drain(&mut vpu);
        assert_eq!(ops_of(&effects), vec!["cleanup"]);
    }

    #[test]
    fn select_and_cancel_collect_boundary_effects() {
        let def = Arc::new(
            ProcessDefinition::build("selecting")
                .activity("main", |ctx: &mut ReductionCtx, _act| {
                    let resp = ctx.new_channel(SELECT_TYPE, "order replies")?;
                    ctx.receive(resp, &[OP_SELECTED], "on-reply", Value::Null)?;
                    let group = ctx.select(
                        resp,
                        vec![Selector::one_shot("customer", "reply", None)],
                    )?;
                    ctx.cancel_select(group);
                    Ok(())
                })
                .finish(),
        );
        let mut vpu = Vpu::new(def);
        vpu.inject_root();
        let (effects, _) = drain(&mut vpu);
        assert_eq!(effects.selections.len(), 1);
        let reg = &effects.selections[0];
        assert_eq!(reg.selectors.len(), 1);
        assert_eq!(effects.cancels, vec![reg.select_group.clone()]);
        // the export pins the response channel
        let pinned = vpu
            .soup()
            .channel(vpu.soup().control_channel() + 1)
            .unwrap();
        assert_eq!(pinned.exports(), 1);
    }

    #[test]
    fn identical_runs_produce_identical_snapshots() {
        fn build() -> Arc<ProcessDefinition> {
            Arc::new(
                ProcessDefinition::build("replay")
                    .channel_type("stream", &["item"])
                    .activity("main", |ctx: &mut ReductionCtx, _act| {
                        let ch = ctx.new_channel("stream", "items")?;
                        ctx.send(ch, "item", json!(1))?;
                        ctx.send(ch, "item", json!(2))?;
                        ctx.receive(ch, &["item"], "reader", Value::Null)?;
                        Ok(())
                    })
                    .activity("reader", |ctx: &mut ReductionCtx, act| {
                        let msg = act.message.unwrap();
                        ctx.invoke("sink", "read", msg.payload);
                        ctx.receive(msg.channel, &["item"], "reader", Value::Null)?;
                        Ok(())
                    })
                    .finish(),
            )
        }
        let run = |def: Arc<ProcessDefinition>| {
            let mut vpu = Vpu::new(def);
            vpu.inject_root();
            let (effects, _) = drain(&mut vpu);
            (vpu.snapshot().unwrap(), effects.outbound)
        };
        let (snap_a, out_a) = run(build());
        let (snap_b, out_b) = run(build());
        assert_eq!(snap_a, snap_b);
        assert_eq!(out_a, out_b);
    }

    #[test]
    fn replacement_map_revives_renamed_logic() {
        let v1 = Arc::new(
            ProcessDefinition::build("upgradable")
                .channel_type("pair", &["ping"])
                .activity("main", |ctx: &mut ReductionCtx, _act| {
                    let ch = ctx.new_channel("pair", "pair")?;
                    ctx.receive(ch, &["ping"], "step.v1", Value::Null)?;
                    // pin the channel so the snapshot keeps the waiter
                    ctx.export_channel(ch)?;
                    Ok(())
                })
                .activity("step.v1", |ctx: &mut ReductionCtx, act| {
                    ctx.invoke("sink", "old", act.message.unwrap().payload);
                    Ok(())
                })
                .finish(),
        );
        let v2 = Arc::new(
            ProcessDefinition::build("upgradable")
                .channel_type("pair", &["ping"])
                .activity("main", |ctx: &mut ReductionCtx, _act| {
                    let ch = ctx.new_channel("pair", "pair")?;
                    ctx.receive(ch, &["ping"], "step.v2", Value::Null)?;
                    Ok(())
                })
                .activity("step.v2", |ctx: &mut ReductionCtx, act| {
                    ctx.invoke("sink", "new", act.message.unwrap().payload);
                    Ok(())
                })
                .finish(),
        );
        assert_ne!(v1.version(), v2.version());

        let mut vpu = Vpu::new(v1.clone());
        vpu.inject_root();
        drain(&mut vpu);
        let bytes = vpu.snapshot().unwrap();

        let mut soup = Soup::restore(&bytes).unwrap();
        let mut map = ReplacementMap::new(v1.version());
        map.insert("step.v1", "step.v2");
        assert_eq!(soup.apply_replacements(&map), 1);
        soup.set_definition_version(v2.version());

        let mut vpu = Vpu::resume(v2, soup);
        let waiting = vpu.soup().control_channel() + 1;
        vpu.deliver(waiting, "ping", json!("hello")).unwrap();
        let (effects, _) = drain(&mut vpu);
        assert_eq!(ops_of(&effects), vec!["new"]);
    }

    #[test]
    fn version_digests_the_definition_surface() {
        let a = ProcessDefinition::build("p")
            .channel_type("pair", &["ping"])
            .activity("main", |_: &mut ReductionCtx, _| Ok(()))
            .finish();
        let b = ProcessDefinition::build("p")
            .channel_type("pair", &["ping"])
            .activity("main", |_: &mut ReductionCtx, _| Ok(()))
            .finish();
        let c = ProcessDefinition::build("p")
            .channel_type("pair", &["ping", "pong"])
            .activity("main", |_: &mut ReductionCtx, _| Ok(()))
            .finish();
        assert_eq!(a.version(), b.version());
        assert_ne!(a.version(), c.version());
        assert_ne!(version_hex(&a.version()), version_hex(&c.version()));
    }
}
