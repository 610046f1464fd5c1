//! BPEL-Lite process-execution kernel.
//!
//! Orchestration control flow is modeled as a persistable "soup" of channels,
//! waiting continuations and queued messages. A reduction engine (the VPU)
//! drains the soup one matched pair or spawned unit at a time; a cycle of
//! reductions is the atomic unit the outside world observes. Between cycles
//! the soup serializes to a snapshot, so instances survive restarts and
//! replay byte-identically.
//!
//! ## Layers
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │ engine      per-instance cycles, dispatch,      │
//! │             quarantine, hot replacement         │
//! ├───────────────────────┬─────────────────────────┤
//! │ routing/correlation   │ store (SoupStore seam)  │
//! │ shared message router │ snapshots, routes, log  │
//! ├───────────────────────┴─────────────────────────┤
//! │ vpu         one reduction at a time             │
//! ├─────────────────────────────────────────────────┤
//! │ soup        channels, waiters, messages, GC     │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Ground rules
//!
//! 1. Suspended control flow is data: [`types::Resumption`] descriptors, not
//!    serialized closures. Activities are pure against [`vpu::ReductionCtx`].
//! 2. Deterministic containers everywhere (`BTreeMap`, FIFO queues) so equal
//!    inputs produce byte-equal snapshots.
//! 3. All I/O happens at cycle boundaries. The VPU never blocks.

pub mod correlation;
pub mod demo;
pub mod engine;
pub mod error;
pub mod events;
pub mod routing;
pub mod soup;
pub mod store;
pub mod store_memory;
pub mod types;
pub mod vpu;

// Re-export the embedding surface
pub use engine::{CycleOutcome, DispatchOutcome, Engine};
pub use error::{EngineError, ReductionError, RoutingError, SoupError};
pub use events::EngineEvent;
pub use routing::{CorrelationRouter, RoutePolicy, Selector};
pub use soup::Soup;
pub use store::SoupStore;
pub use store_memory::MemoryStore;
pub use types::{
    Delivery, FaultValue, InboundMessage, InstanceRecord, InstanceStatus, OutboundRequest,
    ReplacementMap, Resumption,
};
pub use vpu::{Activation, Activity, CycleEffects, ProcessDefinition, ReductionCtx, Vpu};
