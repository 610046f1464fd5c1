//! Kernel error taxonomy.
//!
//! Routing dispositions (no match, ambiguous match) are ordinary values on
//! `RouteDecision`, not errors. The enums here cover structural misuse of the
//! soup, corrupted snapshots, selector registration conflicts, and the
//! engine-level dispositions built on top of them.

use crate::types::{ChannelId, FaultValue};
use thiserror::Error;
use uuid::Uuid;

/// Structural error raised by soup operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SoupError {
    /// Channel id is not live in this soup.
    #[error("channel {0} is not live in this soup")]
    InvalidChannel(ChannelId),

    /// Operation is outside the channel's declared capability set.
    #[error("channel {channel} ({channel_type}) does not accept op '{op}'")]
    NoSuchCapability {
        channel: ChannelId,
        channel_type: String,
        op: String,
    },

    /// Channel type missing from the definition's capability table.
    #[error("unknown channel type '{0}'")]
    UnknownChannelType(String),

    /// The channel already carries a replicated send.
    #[error("channel {0} already carries a replicated send")]
    ReplicatedSend(ChannelId),

    /// The channel already carries a replicated receive.
    #[error("channel {0} already carries a replicated receive")]
    ReplicatedReceive(ChannelId),

    /// Export token does not name a pinned channel in this soup.
    #[error("unknown channel export '{0}'")]
    UnknownExport(String),

    /// A receive was registered with no arms.
    #[error("receive group has no arms")]
    EmptyReceive,

    /// A restored resumption names logic the current definition lacks.
    #[error("resumption names unknown logic '{0}'")]
    UnknownLogic(String),

    /// Snapshot decoded but references dead or inconsistent state.
    #[error("corrupt soup image: {0}")]
    CorruptSoup(String),

    /// Snapshot bytes are not a valid soup image.
    #[error("soup codec: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for SoupError {
    fn from(e: serde_json::Error) -> Self {
        SoupError::Codec(e.to_string())
    }
}

impl SoupError {
    /// True when the error indicates a corrupted or undecodable image rather
    /// than caller misuse. Corruption quarantines the instance instead of
    /// faulting it.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            SoupError::CorruptSoup(_) | SoupError::Codec(_) | SoupError::UnknownLogic(_)
        )
    }
}

/// Failure of a single reduction.
///
/// Activities either raise a named fault, which the kernel routes to the
/// enclosing fault handler, or trip a structural error, which is never
/// catchable and faults the instance.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReductionError {
    #[error("fault '{}' raised", .0.name)]
    Fault(FaultValue),

    #[error(transparent)]
    Soup(#[from] SoupError),
}

impl ReductionError {
    /// Shorthand for raising a named fault from activity code.
    pub fn fault(name: impl Into<String>, detail: serde_json::Value) -> Self {
        Self::Fault(FaultValue::new(name, detail))
    }
}

impl From<FaultValue> for ReductionError {
    fn from(fault: FaultValue) -> Self {
        Self::Fault(fault)
    }
}

/// Error applying selector registrations at a cycle boundary.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RoutingError {
    /// Two live two-way selectors of one instance share
    /// (partner link, operation, message exchange).
    #[error(
        "conflicting receive on '{partner_link}.{operation}' \
         (message exchange '{message_exchange}')"
    )]
    ConflictingReceive {
        partner_link: String,
        operation: String,
        message_exchange: String,
    },

    /// The instance already holds a live select group under this id.
    #[error("select group '{0}' is already registered")]
    DuplicateGroup(String),
}

/// Engine-level failure dispositions.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown process '{0}'")]
    UnknownProcess(String),

    #[error("unknown instance {0}")]
    UnknownInstance(Uuid),

    /// Instance is excluded from further cycles until an operator acts.
    #[error("instance {0} is quarantined: {1}")]
    Quarantined(Uuid, String),

    #[error("instance {instance} is not active ({status})")]
    NotActive { instance: Uuid, status: String },

    #[error("no snapshot stored for instance {0}")]
    MissingSnapshot(Uuid),

    /// Snapshot was written by a definition version with no replacement map
    /// leading to the current one.
    #[error("instance {instance} snapshot has unbridged definition version {version}")]
    VersionMismatch { instance: Uuid, version: String },

    #[error(transparent)]
    Soup(#[from] SoupError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error("store: {0}")]
    Store(#[from] anyhow::Error),
}
