//! Engine events, appended per instance to the store's event log. The log
//! is the audit trail replay tooling diffs against.

use crate::types::{CycleId, InstanceFault, Timestamp};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    InstanceStarted {
        process_id: String,
        definition_version: String,
    },
    /// An inbound message was claimed by one of this instance's selectors.
    MessageRouted {
        mex_id: String,
        correlator: String,
        select_group: String,
        index: u32,
    },
    SelectorsRegistered {
        select_group: String,
        count: usize,
    },
    SelectorsCancelled {
        select_group: String,
    },
    /// A checkpoint written under an older definition was upgraded.
    DefinitionReplaced {
        from_version: String,
        to_version: String,
        substitutions: usize,
    },
    CycleCompleted {
        cycle: CycleId,
        reductions: usize,
        outbound: usize,
        quiesced: bool,
    },
    SnapshotStored {
        cycle: CycleId,
        bytes: usize,
        digest: String,
    },
    InstanceCompleted {
        at: Timestamp,
    },
    InstanceFaulted {
        fault: InstanceFault,
    },
    InstanceTerminated {
        at: Timestamp,
        dropped_reductions: usize,
    },
    InstanceQuarantined {
        reason: String,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InstanceStarted { .. } => "instance_started",
            Self::MessageRouted { .. } => "message_routed",
            Self::SelectorsRegistered { .. } => "selectors_registered",
            Self::SelectorsCancelled { .. } => "selectors_cancelled",
            Self::DefinitionReplaced { .. } => "definition_replaced",
            Self::CycleCompleted { .. } => "cycle_completed",
            Self::SnapshotStored { .. } => "snapshot_stored",
            Self::InstanceCompleted { .. } => "instance_completed",
            Self::InstanceFaulted { .. } => "instance_faulted",
            Self::InstanceTerminated { .. } => "instance_terminated",
            Self::InstanceQuarantined { .. } => "instance_quarantined",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_under_a_stable_tag() {
        let event = EngineEvent::MessageRouted {
            mex_id: "m1".into(),
            correlator: "customer.submit".into(),
            select_group: "3".into(),
            index: 0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "message_routed");
        assert_eq!(json["correlator"], "customer.submit");
        assert_eq!(event.kind(), "message_routed");

        let back: EngineEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
