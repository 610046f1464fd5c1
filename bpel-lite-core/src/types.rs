use crate::correlation::CorrelationKeySet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Channel identifier, scoped to one soup. Never reused within a soup.
pub type ChannelId = u32;

/// Receive-group identifier (a pick's arms share one), scoped to one soup.
pub type GroupId = u32;

/// Reduction-cycle counter, scoped to one soup.
pub type CycleId = u32;

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// SHA-256 digest identifying a process-definition version.
pub type DefinitionVersion = [u8; 32];

/// Hex form of a definition version, for logs and events.
pub fn version_hex(version: &DefinitionVersion) -> String {
    hex::encode(version)
}

// ─── Channel capability tables ────────────────────────────────

/// Built-in channel type for the soup's control channel.
pub const CONTROL_TYPE: &str = "sys.control";
/// Built-in channel type for fault-handler channels.
pub const FAULT_TYPE: &str = "sys.fault";
/// Built-in channel type for selector (pick) response channels.
pub const SELECT_TYPE: &str = "sys.select";

/// Operation delivered on the control channel by termination.
pub const OP_TERMINATE: &str = "terminate";
/// Operation delivered on fault-handler channels.
pub const OP_FAULT: &str = "fault";
/// Operation delivered on selector response channels by routed messages.
pub const OP_SELECTED: &str = "selected";

/// The declared message signatures of one channel type.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChannelType {
    pub name: String,
    /// Operation names channels of this type accept.
    pub ops: BTreeSet<String>,
}

impl ChannelType {
    pub fn new(name: impl Into<String>, ops: &[&str]) -> Self {
        Self {
            name: name.into(),
            ops: ops.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Every channel type a definition declares, plus the `sys.*` built-ins.
///
/// Channels snapshot their type's op set at creation; sends and receives are
/// checked against that set by plain value comparison.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChannelTypeTable {
    types: BTreeMap<String, ChannelType>,
}

impl ChannelTypeTable {
    pub fn new() -> Self {
        let mut table = Self {
            types: BTreeMap::new(),
        };
        table.insert(ChannelType::new(CONTROL_TYPE, &[OP_TERMINATE]));
        table.insert(ChannelType::new(FAULT_TYPE, &[OP_FAULT]));
        table.insert(ChannelType::new(SELECT_TYPE, &[OP_SELECTED]));
        table
    }

    pub fn insert(&mut self, ty: ChannelType) {
        self.types.insert(ty.name.clone(), ty);
    }

    pub fn get(&self, name: &str) -> Option<&ChannelType> {
        self.types.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }
}

impl Default for ChannelTypeTable {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Resumptions ──────────────────────────────────────────────

/// Serializable stand-in for a suspended closure: which logic block to run
/// and the locals it captured.
///
/// `logic` keys into the definition's logic table and is the unit identity a
/// [`ReplacementMap`] rewrites. `state` is an opaque JSON value; channel
/// references inside it use the `{"$chan": id}` marker so the soup can trace
/// them.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Resumption {
    pub logic: String,
    pub state: Value,
}

impl Resumption {
    pub fn new(logic: impl Into<String>, state: Value) -> Self {
        Self {
            logic: logic.into(),
            state,
        }
    }
}

const CHAN_REF_KEY: &str = "$chan";

/// Encode a channel reference for storage inside resumption state.
pub fn chan_ref(id: ChannelId) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(CHAN_REF_KEY.to_string(), Value::from(id));
    Value::Object(map)
}

/// Decode a channel reference produced by [`chan_ref`].
pub fn as_chan_ref(value: &Value) -> Option<ChannelId> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    let id = map.get(CHAN_REF_KEY)?.as_u64()?;
    u32::try_from(id).ok()
}

/// Collect every channel reference reachable in `value`.
pub fn collect_chan_refs(value: &Value, out: &mut BTreeSet<ChannelId>) {
    if let Some(id) = as_chan_ref(value) {
        out.insert(id);
        return;
    }
    match value {
        Value::Array(items) => {
            for item in items {
                collect_chan_refs(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_chan_refs(item, out);
            }
        }
        _ => {}
    }
}

// ─── Faults ───────────────────────────────────────────────────

/// A named fault raised by definition logic.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FaultValue {
    pub name: String,
    pub detail: Value,
}

impl FaultValue {
    pub fn new(name: impl Into<String>, detail: Value) -> Self {
        Self {
            name: name.into(),
            detail,
        }
    }
}

/// Record of a fault that escaped every handler.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InstanceFault {
    pub fault: FaultValue,
    /// Logic id that raised it.
    pub logic: String,
    pub cycle: CycleId,
}

// ─── Messages ─────────────────────────────────────────────────

/// An inbound message as handed over by a transport adapter. Correlation
/// keys are derived by the caller (property aliases are not evaluated here).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InboundMessage {
    pub partner_link: String,
    pub operation: String,
    pub payload: Value,
    pub keys: CorrelationKeySet,
    /// Transport-assigned exchange id, echoed in deliveries and events.
    pub mex_id: String,
}

impl InboundMessage {
    pub fn new(
        partner_link: impl Into<String>,
        operation: impl Into<String>,
        payload: Value,
        mex_id: impl Into<String>,
    ) -> Self {
        Self {
            partner_link: partner_link.into(),
            operation: operation.into(),
            payload,
            keys: CorrelationKeySet::new(),
            mex_id: mex_id.into(),
        }
    }

    pub fn with_keys(mut self, keys: CorrelationKeySet) -> Self {
        self.keys = keys;
        self
    }
}

/// An outbound request captured during a cycle. Fire-and-forget from the
/// kernel's point of view; responses come back as new inbound messages.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OutboundRequest {
    pub endpoint: String,
    pub operation: String,
    pub payload: Value,
    pub mex_id: String,
}

/// A routed message addressed to one selector arm of one instance.
///
/// The kernel injects it on the select group's response channel as op
/// `selected` with payload `{"index", "op", "payload", "mex_id"}`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Delivery {
    /// Export token of the select group's response channel.
    pub select_group: String,
    /// Which selector arm matched.
    pub index: u32,
    pub operation: String,
    pub payload: Value,
    pub mex_id: String,
    /// Release the response channel's export pin after injection. Set for
    /// one-shot routes, whose select group is spent by this delivery.
    pub consume: bool,
}

// ─── Replacement map ──────────────────────────────────────────

/// Rename table applied to resumption logic ids at restore time, so
/// checkpoints written under an older definition version stay runnable.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ReplacementMap {
    /// Version the renames lead away from.
    pub from_version: DefinitionVersion,
    renames: BTreeMap<String, String>,
}

impl ReplacementMap {
    pub fn new(from_version: DefinitionVersion) -> Self {
        Self {
            from_version,
            renames: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.renames.insert(from.into(), to.into());
    }

    pub fn resolve(&self, logic: &str) -> Option<&str> {
        self.renames.get(logic).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.renames.is_empty()
    }
}

// ─── Instance lifecycle ───────────────────────────────────────

/// Lifecycle states of a process instance.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum InstanceStatus {
    Active,
    Completed {
        at: Timestamp,
    },
    /// An unhandled fault stopped the instance; the last good snapshot is
    /// retained and `retry_instance` may re-activate it.
    Faulted {
        fault: InstanceFault,
        at: Timestamp,
    },
    Terminated {
        at: Timestamp,
    },
    /// The stored soup failed integrity checks; excluded from cycles until
    /// an operator intervenes.
    Quarantined {
        reason: String,
        at: Timestamp,
    },
}

impl InstanceStatus {
    /// True if no further cycles will run without operator action.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstanceStatus::Active)
    }

    pub fn label(&self) -> &'static str {
        match self {
            InstanceStatus::Active => "active",
            InstanceStatus::Completed { .. } => "completed",
            InstanceStatus::Faulted { .. } => "faulted",
            InstanceStatus::Terminated { .. } => "terminated",
            InstanceStatus::Quarantined { .. } => "quarantined",
        }
    }
}

/// Store-visible record of one instance.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub instance_id: Uuid,
    pub process_id: String,
    pub status: InstanceStatus,
    pub definition_version: DefinitionVersion,
    pub created_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chan_ref_round_trip() {
        let v = chan_ref(42);
        assert_eq!(as_chan_ref(&v), Some(42));
        assert_eq!(as_chan_ref(&json!({"$chan": 1, "x": 2})), None);
        assert_eq!(as_chan_ref(&json!({"chan": 1})), None);
        assert_eq!(as_chan_ref(&json!(7)), None);
    }

    #[test]
    fn collects_nested_chan_refs() {
        let state = json!({
            "out": chan_ref(3),
            "arms": [chan_ref(9), {"reply": chan_ref(4)}],
            "n": 17,
        });
        let mut refs = BTreeSet::new();
        collect_chan_refs(&state, &mut refs);
        assert_eq!(refs.into_iter().collect::<Vec<_>>(), vec![3, 4, 9]);
    }

    #[test]
    fn builtin_types_always_present() {
        let table = ChannelTypeTable::new();
        assert!(table.get(CONTROL_TYPE).is_some());
        assert!(table.get(FAULT_TYPE).is_some());
        assert!(table.get(SELECT_TYPE).is_some());
        assert!(table
            .get(CONTROL_TYPE)
            .is_some_and(|t| t.ops.contains(OP_TERMINATE)));
    }

    #[test]
    fn replacement_map_resolves() {
        let mut map = ReplacementMap::new([0u8; 32]);
        map.insert("order.approve", "order.approve-v2");
        assert_eq!(map.resolve("order.approve"), Some("order.approve-v2"));
        assert_eq!(map.resolve("order.reject"), None);
    }

    #[test]
    fn status_terminality() {
        assert!(!InstanceStatus::Active.is_terminal());
        assert!(InstanceStatus::Completed { at: 0 }.is_terminal());
        assert!(InstanceStatus::Quarantined {
            reason: "bad image".into(),
            at: 0
        }
        .is_terminal());
    }
}
