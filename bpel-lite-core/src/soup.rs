//! The execution queue ("soup"): every channel, registered receiver, queued
//! message and ready reduction of one process instance, plus its snapshot
//! and restore machinery.
//!
//! The soup is a passive data structure. Pairing a message with a receiver
//! only appends a ready reduction; running it is the reduction engine's job.

use crate::error::SoupError;
use crate::types::{
    collect_chan_refs, ChannelId, ChannelType, CycleId, DefinitionVersion, GroupId, ReplacementMap,
    Resumption, CONTROL_TYPE, OP_TERMINATE,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Image format tag; bumped on incompatible layout changes.
pub const SOUP_FORMAT: u32 = 1;

// ─── Frames ───────────────────────────────────────────────────

/// One queued message, waiting for an eligible receiver.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MessageFrame {
    pub op: String,
    pub payload: Value,
}

/// One registered receiver arm.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WaiterFrame {
    pub group: GroupId,
    /// Ops this arm accepts; a subset of the channel's capability set.
    pub ops: BTreeSet<String>,
    pub resumption: Resumption,
    pub fault_handler: Option<ChannelId>,
}

/// A live channel with its queued traffic.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChannelFrame {
    pub id: ChannelId,
    pub channel_type: String,
    /// Capability set snapshotted from the type table at creation.
    pub ops: BTreeSet<String>,
    pub description: String,
    export_count: u32,
    replicated_send: bool,
    replicated_recv: bool,
    /// Registration order; matching scans from the back.
    waiters: Vec<WaiterFrame>,
    /// Arrival order.
    messages: VecDeque<MessageFrame>,
}

impl ChannelFrame {
    pub fn queued(&self) -> usize {
        self.messages.len()
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    pub fn exports(&self) -> u32 {
        self.export_count
    }

    pub fn has_replicated_send(&self) -> bool {
        self.replicated_send
    }

    pub fn has_replicated_recv(&self) -> bool {
        self.replicated_recv
    }
}

/// Shared state of one receive group: a single receive, a pick's arms, or a
/// replicated (event-handler) receive.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GroupFrame {
    pub replicated: bool,
    /// Channels holding arms of this group.
    pub channels: BTreeSet<ChannelId>,
}

/// One arm of a receive registration.
#[derive(Clone, Debug, PartialEq)]
pub struct ReceiveArm {
    pub channel: ChannelId,
    pub ops: BTreeSet<String>,
    pub resumption: Resumption,
}

impl ReceiveArm {
    pub fn new(channel: ChannelId, ops: &[&str], logic: &str, state: Value) -> Self {
        Self {
            channel,
            ops: ops.iter().map(|s| s.to_string()).collect(),
            resumption: Resumption::new(logic, state),
        }
    }
}

// ─── Reactions ────────────────────────────────────────────────

/// A ready reduction.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Reaction {
    /// Structural: run a spawned unit.
    Spawn {
        resumption: Resumption,
        fault_handler: Option<ChannelId>,
    },
    /// Communication: deliver a matched message to a consumed receiver.
    Deliver {
        resumption: Resumption,
        fault_handler: Option<ChannelId>,
        channel: ChannelId,
        op: String,
        payload: Value,
    },
}

impl Reaction {
    pub fn resumption(&self) -> &Resumption {
        match self {
            Reaction::Spawn { resumption, .. } | Reaction::Deliver { resumption, .. } => resumption,
        }
    }

    fn resumption_mut(&mut self) -> &mut Resumption {
        match self {
            Reaction::Spawn { resumption, .. } | Reaction::Deliver { resumption, .. } => resumption,
        }
    }

    pub fn fault_handler(&self) -> Option<ChannelId> {
        match self {
            Reaction::Spawn { fault_handler, .. } | Reaction::Deliver { fault_handler, .. } => {
                *fault_handler
            }
        }
    }

    pub fn is_comm(&self) -> bool {
        matches!(self, Reaction::Deliver { .. })
    }

    fn channel_roots(&self, out: &mut BTreeSet<ChannelId>) {
        match self {
            Reaction::Spawn {
                resumption,
                fault_handler,
            } => {
                collect_chan_refs(&resumption.state, out);
                if let Some(fc) = fault_handler {
                    out.insert(*fc);
                }
            }
            Reaction::Deliver {
                resumption,
                fault_handler,
                channel,
                payload,
                ..
            } => {
                collect_chan_refs(&resumption.state, out);
                collect_chan_refs(payload, out);
                out.insert(*channel);
                if let Some(fc) = fault_handler {
                    out.insert(*fc);
                }
            }
        }
    }
}

// ─── Soup ─────────────────────────────────────────────────────

/// The execution queue of one process instance.
///
/// Serializing the struct is the snapshot format: all collections are
/// ordered, so equal state encodes to identical bytes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Soup {
    format: u32,
    definition_version: DefinitionVersion,
    next_channel: ChannelId,
    next_group: GroupId,
    cycle: CycleId,
    channels: BTreeMap<ChannelId, ChannelFrame>,
    groups: BTreeMap<GroupId, GroupFrame>,
    /// Ready communication reductions, drained before structural ones.
    ready_comm: VecDeque<Reaction>,
    /// Ready structural reductions.
    ready_spawn: VecDeque<Reaction>,
    /// Well-known termination channel, created with the soup.
    control: ChannelId,
}

impl Soup {
    pub fn new(definition_version: DefinitionVersion) -> Self {
        let mut soup = Self {
            format: SOUP_FORMAT,
            definition_version,
            next_channel: 1,
            next_group: 1,
            cycle: 0,
            channels: BTreeMap::new(),
            groups: BTreeMap::new(),
            ready_comm: VecDeque::new(),
            ready_spawn: VecDeque::new(),
            control: 0,
        };
        soup.control = soup.new_channel(
            &ChannelType::new(CONTROL_TYPE, &[OP_TERMINATE]),
            "instance control",
        );
        soup
    }

    pub fn definition_version(&self) -> DefinitionVersion {
        self.definition_version
    }

    pub fn set_definition_version(&mut self, version: DefinitionVersion) {
        self.definition_version = version;
    }

    pub fn cycle(&self) -> CycleId {
        self.cycle
    }

    pub(crate) fn bump_cycle(&mut self) -> CycleId {
        self.cycle += 1;
        self.cycle
    }

    pub fn control_channel(&self) -> ChannelId {
        self.control
    }

    pub fn channel(&self, id: ChannelId) -> Option<&ChannelFrame> {
        self.channels.get(&id)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// (communication, structural) ready reductions.
    pub fn ready_counts(&self) -> (usize, usize) {
        (self.ready_comm.len(), self.ready_spawn.len())
    }

    pub fn has_ready(&self) -> bool {
        !self.ready_comm.is_empty() || !self.ready_spawn.is_empty()
    }

    /// No ready work and no external pins: the instance has run out.
    pub fn is_complete(&self) -> bool {
        !self.has_ready() && self.channels.values().all(|f| f.export_count == 0)
    }

    // ─── Channel and group operations ─────────────────────────

    /// Create a channel of a resolved type. Ids are never reused.
    pub fn new_channel(&mut self, ty: &ChannelType, description: impl Into<String>) -> ChannelId {
        let id = self.next_channel;
        self.next_channel += 1;
        self.channels.insert(
            id,
            ChannelFrame {
                id,
                channel_type: ty.name.clone(),
                ops: ty.ops.clone(),
                description: description.into(),
                export_count: 0,
                replicated_send: false,
                replicated_recv: false,
                waiters: Vec::new(),
                messages: VecDeque::new(),
            },
        );
        id
    }

    /// Queue a structural reduction.
    pub fn spawn(&mut self, resumption: Resumption, fault_handler: Option<ChannelId>) {
        self.ready_spawn.push_back(Reaction::Spawn {
            resumption,
            fault_handler,
        });
    }

    /// Send a message. Pairs immediately with a waiting receiver when one is
    /// eligible, otherwise the message queues.
    pub fn send(&mut self, channel: ChannelId, op: &str, payload: Value) -> Result<(), SoupError> {
        let frame = self
            .channels
            .get_mut(&channel)
            .ok_or(SoupError::InvalidChannel(channel))?;
        if !frame.ops.contains(op) {
            return Err(SoupError::NoSuchCapability {
                channel,
                channel_type: frame.channel_type.clone(),
                op: op.to_string(),
            });
        }
        if frame.replicated_send {
            return Err(SoupError::ReplicatedSend(channel));
        }
        frame.messages.push_back(MessageFrame {
            op: op.to_string(),
            payload,
        });
        self.match_channel(channel);
        Ok(())
    }

    /// Attach a persistent message: every receiver registered on the channel
    /// gets a copy, and the message is never consumed. At most one per
    /// channel, and it cannot share a channel with ordinary messages or a
    /// replicated receive.
    pub fn send_replicated(
        &mut self,
        channel: ChannelId,
        op: &str,
        payload: Value,
    ) -> Result<(), SoupError> {
        let frame = self
            .channels
            .get_mut(&channel)
            .ok_or(SoupError::InvalidChannel(channel))?;
        if !frame.ops.contains(op) {
            return Err(SoupError::NoSuchCapability {
                channel,
                channel_type: frame.channel_type.clone(),
                op: op.to_string(),
            });
        }
        if frame.replicated_send || !frame.messages.is_empty() {
            return Err(SoupError::ReplicatedSend(channel));
        }
        if frame.replicated_recv {
            return Err(SoupError::ReplicatedReceive(channel));
        }
        frame.replicated_send = true;
        frame.messages.push_back(MessageFrame {
            op: op.to_string(),
            payload,
        });
        self.match_channel(channel);
        Ok(())
    }

    /// Register a receive group. All arms are validated before any is
    /// attached; a non-replicated group is consumed whole on first match.
    pub fn register(
        &mut self,
        arms: Vec<ReceiveArm>,
        replicated: bool,
        fault_handler: Option<ChannelId>,
    ) -> Result<GroupId, SoupError> {
        if arms.is_empty() {
            return Err(SoupError::EmptyReceive);
        }
        for arm in &arms {
            if arm.ops.is_empty() {
                return Err(SoupError::EmptyReceive);
            }
            let frame = self
                .channels
                .get(&arm.channel)
                .ok_or(SoupError::InvalidChannel(arm.channel))?;
            if let Some(op) = arm.ops.iter().find(|op| !frame.ops.contains(*op)) {
                return Err(SoupError::NoSuchCapability {
                    channel: arm.channel,
                    channel_type: frame.channel_type.clone(),
                    op: op.clone(),
                });
            }
            if replicated {
                if frame.replicated_recv {
                    return Err(SoupError::ReplicatedReceive(arm.channel));
                }
                if frame.replicated_send {
                    return Err(SoupError::ReplicatedSend(arm.channel));
                }
            }
        }

        let group = self.next_group;
        self.next_group += 1;
        self.groups.insert(
            group,
            GroupFrame {
                replicated,
                channels: arms.iter().map(|a| a.channel).collect(),
            },
        );
        let mut touched = Vec::new();
        for arm in arms {
            let frame = self
                .channels
                .get_mut(&arm.channel)
                .ok_or(SoupError::InvalidChannel(arm.channel))?;
            frame.waiters.push(WaiterFrame {
                group,
                ops: arm.ops,
                resumption: arm.resumption,
                fault_handler,
            });
            if replicated {
                frame.replicated_recv = true;
            }
            if !touched.contains(&arm.channel) {
                touched.push(arm.channel);
            }
        }
        for channel in touched {
            self.match_channel(channel);
        }
        Ok(group)
    }

    /// Withdraw a receive group (a cancelled pick or event handler).
    /// Returns false if the group was already gone.
    pub fn cancel_group(&mut self, group: GroupId) -> bool {
        let existed = self.groups.contains_key(&group);
        self.consume_group(group);
        existed
    }

    fn consume_group(&mut self, group: GroupId) {
        let Some(g) = self.groups.remove(&group) else {
            return;
        };
        for channel in g.channels {
            if let Some(frame) = self.channels.get_mut(&channel) {
                frame.waiters.retain(|w| w.group != group);
                if g.replicated {
                    frame.replicated_recv = false;
                }
            }
        }
    }

    /// Pair queued messages with eligible receivers on one channel until no
    /// pair remains. The earliest eligible message goes first; among eligible
    /// receivers the most recently registered wins.
    fn match_channel(&mut self, channel: ChannelId) {
        loop {
            let Some((m_idx, w_idx, group)) = self.find_pair(channel) else {
                break;
            };
            let replicated_group = self.groups.get(&group).is_some_and(|g| g.replicated);
            let Some(frame) = self.channels.get_mut(&channel) else {
                break;
            };
            let message = if frame.replicated_send {
                frame.messages.get(m_idx).cloned()
            } else {
                frame.messages.remove(m_idx)
            };
            let (Some(message), Some(waiter)) = (message, frame.waiters.get(w_idx).cloned())
            else {
                break;
            };
            if !replicated_group {
                self.consume_group(group);
            }
            self.ready_comm.push_back(Reaction::Deliver {
                resumption: waiter.resumption,
                fault_handler: waiter.fault_handler,
                channel,
                op: message.op,
                payload: message.payload,
            });
            if replicated_group && self.channels.get(&channel).is_some_and(|f| f.replicated_send) {
                // a replicated message facing a replicated receive would
                // re-pair forever
                break;
            }
        }
    }

    fn find_pair(&self, channel: ChannelId) -> Option<(usize, usize, GroupId)> {
        let frame = self.channels.get(&channel)?;
        for (m_idx, message) in frame.messages.iter().enumerate() {
            let eligible = frame
                .waiters
                .iter()
                .enumerate()
                .rev()
                .find(|(_, w)| w.ops.contains(&message.op));
            if let Some((w_idx, waiter)) = eligible {
                return Some((m_idx, w_idx, waiter.group));
            }
        }
        None
    }

    /// Pop the next ready reduction: communication first, then structural,
    /// FIFO within each kind.
    pub fn next_reaction(&mut self) -> Option<Reaction> {
        self.ready_comm
            .pop_front()
            .or_else(|| self.ready_spawn.pop_front())
    }

    /// Drop all pending structural reductions (termination). Queued
    /// communication reductions still run. Returns how many were dropped.
    pub fn drop_structural(&mut self) -> usize {
        let dropped = self.ready_spawn.len();
        self.ready_spawn.clear();
        dropped
    }

    // ─── Exports ──────────────────────────────────────────────

    /// Pin a channel for external reference and return its stable token.
    pub fn export(&mut self, channel: ChannelId) -> Result<String, SoupError> {
        let frame = self
            .channels
            .get_mut(&channel)
            .ok_or(SoupError::InvalidChannel(channel))?;
        frame.export_count += 1;
        Ok(channel.to_string())
    }

    /// Resolve an export token without consuming the pin.
    pub fn peek_import(&self, token: &str) -> Result<ChannelId, SoupError> {
        let id: ChannelId = token
            .parse()
            .map_err(|_| SoupError::UnknownExport(token.to_string()))?;
        match self.channels.get(&id) {
            Some(frame) if frame.export_count > 0 => Ok(id),
            _ => Err(SoupError::UnknownExport(token.to_string())),
        }
    }

    /// Resolve an export token and consume one pin.
    pub fn import(&mut self, token: &str) -> Result<ChannelId, SoupError> {
        let id = self.peek_import(token)?;
        if let Some(frame) = self.channels.get_mut(&id) {
            frame.export_count -= 1;
        }
        Ok(id)
    }

    // ─── Garbage collection ───────────────────────────────────

    fn live_set(&self) -> BTreeSet<ChannelId> {
        let mut seed = BTreeSet::new();
        seed.insert(self.control);
        for reaction in self.ready_comm.iter().chain(self.ready_spawn.iter()) {
            reaction.channel_roots(&mut seed);
        }
        for (id, frame) in &self.channels {
            if frame.export_count > 0 {
                seed.insert(*id);
            }
        }

        let mut live = BTreeSet::new();
        let mut work: Vec<ChannelId> = seed.into_iter().collect();
        while let Some(id) = work.pop() {
            if !self.channels.contains_key(&id) || !live.insert(id) {
                continue;
            }
            let frame = &self.channels[&id];
            let mut refs = BTreeSet::new();
            for waiter in &frame.waiters {
                collect_chan_refs(&waiter.resumption.state, &mut refs);
                if let Some(fc) = waiter.fault_handler {
                    refs.insert(fc);
                }
            }
            for message in &frame.messages {
                collect_chan_refs(&message.payload, &mut refs);
            }
            work.extend(refs);
        }
        live
    }

    /// Drop channels no export, ready reduction or live continuation can
    /// reach. A waiter on a dead channel can never fire, so it dies with the
    /// channel. Returns how many channels were collected.
    pub fn gc(&mut self) -> usize {
        let live = self.live_set();
        let dead: Vec<ChannelId> = self
            .channels
            .keys()
            .filter(|id| !live.contains(id))
            .copied()
            .collect();
        for id in &dead {
            self.channels.remove(id);
        }
        if !dead.is_empty() {
            let empty: Vec<GroupId> = self
                .groups
                .iter_mut()
                .filter_map(|(gid, g)| {
                    g.channels.retain(|c| live.contains(c));
                    g.channels.is_empty().then_some(*gid)
                })
                .collect();
            for gid in empty {
                self.groups.remove(&gid);
            }
        }
        dead.len()
    }

    // ─── Snapshot and restore ─────────────────────────────────

    /// Garbage-collect, then encode the whole soup. Equal state yields
    /// identical bytes.
    pub fn snapshot(&mut self) -> Result<Vec<u8>, SoupError> {
        self.gc();
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode an image and verify its referential integrity.
    pub fn restore(bytes: &[u8]) -> Result<Soup, SoupError> {
        let soup: Soup = serde_json::from_slice(bytes)?;
        soup.verify_integrity()?;
        Ok(soup)
    }

    /// Rewrite resumption logic ids through `map` (definition upgrade).
    /// Returns the number of substitutions.
    pub fn apply_replacements(&mut self, map: &ReplacementMap) -> usize {
        fn rewrite(resumption: &mut Resumption, map: &ReplacementMap) -> usize {
            match map.resolve(&resumption.logic) {
                Some(to) => {
                    resumption.logic = to.to_string();
                    1
                }
                None => 0,
            }
        }

        let mut count = 0;
        for frame in self.channels.values_mut() {
            for waiter in &mut frame.waiters {
                count += rewrite(&mut waiter.resumption, map);
            }
        }
        for reaction in self.ready_comm.iter_mut().chain(self.ready_spawn.iter_mut()) {
            count += rewrite(reaction.resumption_mut(), map);
        }
        count
    }

    fn verify_integrity(&self) -> Result<(), SoupError> {
        fn corrupt(detail: String) -> SoupError {
            SoupError::CorruptSoup(detail)
        }

        if self.format != SOUP_FORMAT {
            return Err(corrupt(format!("unknown image format {}", self.format)));
        }
        if !self.channels.contains_key(&self.control) {
            return Err(corrupt("control channel missing".into()));
        }
        for (id, frame) in &self.channels {
            if frame.id != *id {
                return Err(corrupt(format!("channel {} keyed as {id}", frame.id)));
            }
            if *id >= self.next_channel {
                return Err(corrupt(format!("channel {id} above allocator watermark")));
            }
            for waiter in &frame.waiters {
                let Some(group) = self.groups.get(&waiter.group) else {
                    return Err(corrupt(format!(
                        "waiter on channel {id} references dead group {}",
                        waiter.group
                    )));
                };
                if !group.channels.contains(id) {
                    return Err(corrupt(format!(
                        "group {} does not cover channel {id}",
                        waiter.group
                    )));
                }
                self.check_refs(&waiter.resumption.state)?;
                if let Some(fc) = waiter.fault_handler {
                    if !self.channels.contains_key(&fc) {
                        return Err(corrupt(format!("dead fault handler {fc} on channel {id}")));
                    }
                }
            }
            for message in &frame.messages {
                if !frame.ops.contains(&message.op) {
                    return Err(corrupt(format!(
                        "queued op '{}' outside capability set of channel {id}",
                        message.op
                    )));
                }
                self.check_refs(&message.payload)?;
            }
        }
        for (gid, group) in &self.groups {
            if *gid >= self.next_group {
                return Err(corrupt(format!("group {gid} above allocator watermark")));
            }
            if group.channels.is_empty() {
                return Err(corrupt(format!("group {gid} has no channels")));
            }
            for channel in &group.channels {
                let Some(frame) = self.channels.get(channel) else {
                    return Err(corrupt(format!(
                        "group {gid} references dead channel {channel}"
                    )));
                };
                if !frame.waiters.iter().any(|w| w.group == *gid) {
                    return Err(corrupt(format!(
                        "group {gid} has no arm on channel {channel}"
                    )));
                }
            }
        }
        for reaction in self.ready_comm.iter().chain(self.ready_spawn.iter()) {
            let mut refs = BTreeSet::new();
            reaction.channel_roots(&mut refs);
            for channel in refs {
                if !self.channels.contains_key(&channel) {
                    return Err(corrupt(format!(
                        "ready reduction references dead channel {channel}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_refs(&self, value: &Value) -> Result<(), SoupError> {
        let mut refs = BTreeSet::new();
        collect_chan_refs(value, &mut refs);
        for channel in refs {
            if !self.channels.contains_key(&channel) {
                return Err(SoupError::CorruptSoup(format!(
                    "reference to dead channel {channel}"
                )));
            }
        }
        Ok(())
    }
}
