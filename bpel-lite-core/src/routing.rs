//! Correlator registry: matches inbound messages to registered selectors.
//!
//! A correlator exists per `partner_link.operation` pair. Instances register
//! selector batches (select groups) against correlators; inbound messages
//! route to the selector whose correlation key set the message's keys
//! satisfy, most specific first. Catch-all selectors only see messages no
//! keyed selector claimed. When several equally specific routes survive, the
//! ambiguity is surfaced to the caller instead of picking one silently.
//!
//! Messages that match nothing are parked for a retry window, keyed under
//! their correlator, and handed back out when a newly registered selector
//! could accept them.

use crate::correlation::CorrelationKeySet;
use crate::error::RoutingError;
use crate::types::{InboundMessage, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Correlator identity for a partner-link operation.
pub fn correlator_id(partner_link: &str, operation: &str) -> String {
    format!("{partner_link}.{operation}")
}

// ─── Selectors and routes ─────────────────────────────────────

/// How long a matched route lives.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RoutePolicy {
    /// The first matching message consumes the whole select group.
    OneShot,
    /// The route persists across matches (event-handler receives).
    All,
}

/// One receive arm awaiting an inbound message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Selector {
    pub partner_link: String,
    pub operation: String,
    /// Correlation constraint; `None` is a catch-all.
    pub key_set: Option<CorrelationKeySet>,
    /// Two-way selectors participate in conflicting-receive detection.
    pub one_way: bool,
    /// Declared message-exchange name, `""` when unnamed.
    pub message_exchange: String,
    pub route_policy: RoutePolicy,
}

impl Selector {
    pub fn one_shot(
        partner_link: &str,
        operation: &str,
        key_set: Option<CorrelationKeySet>,
    ) -> Self {
        Self {
            partner_link: partner_link.to_string(),
            operation: operation.to_string(),
            key_set,
            one_way: true,
            message_exchange: String::new(),
            route_policy: RoutePolicy::OneShot,
        }
    }

    pub fn all(partner_link: &str, operation: &str, key_set: Option<CorrelationKeySet>) -> Self {
        Self {
            route_policy: RoutePolicy::All,
            ..Self::one_shot(partner_link, operation, key_set)
        }
    }

    /// Mark the selector as expecting a reply on the same exchange.
    pub fn two_way(mut self) -> Self {
        self.one_way = false;
        self
    }

    pub fn with_message_exchange(mut self, message_exchange: &str) -> Self {
        self.message_exchange = message_exchange.to_string();
        self
    }

    pub fn correlator_id(&self) -> String {
        correlator_id(&self.partner_link, &self.operation)
    }
}

/// A registered route: one selector arm of one instance's select group.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RouteEntry {
    pub instance_id: Uuid,
    pub select_group: String,
    /// Arm position within the select group.
    pub index: u32,
    pub selector: Selector,
    /// Registration stamp; recovery restores claim order from it.
    pub seq: u64,
}

/// A message waiting for a route within its retry window.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ParkedMessage {
    pub message: InboundMessage,
    pub parked_at: Timestamp,
    pub expires_at: Timestamp,
}

/// Where a routed message should go.
#[derive(Clone, Debug, PartialEq)]
pub struct MatchedRoute {
    pub instance_id: Uuid,
    pub select_group: String,
    pub index: u32,
    pub policy: RoutePolicy,
    /// Routes withdrawn by this match (one-shot claims). Re-register these
    /// when the delivery is abandoned.
    pub consumed: Vec<RouteEntry>,
}

/// Disposition of one inbound message.
#[derive(Clone, Debug, PartialEq)]
pub enum RouteDecision {
    Matched(MatchedRoute),
    /// An instantiating operation with no live route: the caller creates an
    /// instance and routes again.
    CreateInstance,
    Parked(ParkedMessage),
    /// Several equally specific routes survived; nothing was consumed.
    Ambiguous(Vec<MatchedRoute>),
}

// ─── The router ───────────────────────────────────────────────

#[derive(Debug, Default)]
struct Correlator {
    routes: Vec<RouteEntry>,
    parked: VecDeque<ParkedMessage>,
}

#[derive(Debug, Default)]
struct RouterInner {
    seq: u64,
    correlators: BTreeMap<String, Correlator>,
}

/// Shared route registry. The lock is held per call, never across a cycle.
#[derive(Debug, Default)]
pub struct CorrelationRouter {
    inner: Mutex<RouterInner>,
}

impl CorrelationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a select group's arms. Group ids are export tokens, unique
    /// only within their instance. The whole batch is validated before any
    /// route becomes visible; returns the entries for persistence.
    pub async fn register(
        &self,
        instance_id: Uuid,
        select_group: &str,
        selectors: &[Selector],
    ) -> Result<Vec<RouteEntry>, RoutingError> {
        let mut inner = self.inner.lock().await;
        if inner
            .correlators
            .values()
            .flat_map(|c| &c.routes)
            .any(|r| r.instance_id == instance_id && r.select_group == select_group)
        {
            return Err(RoutingError::DuplicateGroup(select_group.to_string()));
        }
        for (i, selector) in selectors.iter().enumerate() {
            if selector.one_way {
                continue;
            }
            let same = |other: &Selector| {
                !other.one_way
                    && other.partner_link == selector.partner_link
                    && other.operation == selector.operation
                    && other.message_exchange == selector.message_exchange
            };
            let dup_in_batch = selectors[..i].iter().any(same);
            let dup_live = inner
                .correlators
                .values()
                .flat_map(|c| &c.routes)
                .any(|r| r.instance_id == instance_id && same(&r.selector));
            if dup_in_batch || dup_live {
                return Err(RoutingError::ConflictingReceive {
                    partner_link: selector.partner_link.clone(),
                    operation: selector.operation.clone(),
                    message_exchange: selector.message_exchange.clone(),
                });
            }
        }
        let mut entries = Vec::with_capacity(selectors.len());
        for (index, selector) in selectors.iter().enumerate() {
            inner.seq += 1;
            let entry = RouteEntry {
                instance_id,
                select_group: select_group.to_string(),
                index: index as u32,
                selector: selector.clone(),
                seq: inner.seq,
            };
            debug!(
                "route registered: {} -> instance {} group {} arm {}",
                entry.selector.correlator_id(),
                instance_id,
                select_group,
                index
            );
            inner
                .correlators
                .entry(entry.selector.correlator_id())
                .or_default()
                .routes
                .push(entry.clone());
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Route one inbound message. One-shot matches claim their whole select
    /// group atomically; unroutable non-instantiating messages are parked
    /// until `now + park_ttl_ms`.
    pub async fn route(
        &self,
        message: &InboundMessage,
        instantiating: bool,
        now: Timestamp,
        park_ttl_ms: i64,
    ) -> RouteDecision {
        let correlator = correlator_id(&message.partner_link, &message.operation);
        let mut inner = self.inner.lock().await;
        if let Some(c) = inner.correlators.get_mut(&correlator) {
            c.parked.retain(|p| p.expires_at > now);
        }
        let mut survivors: Vec<MatchedRoute> = match inner.correlators.get(&correlator) {
            None => Vec::new(),
            Some(c) => {
                let mut keyed: Vec<&RouteEntry> = Vec::new();
                let mut catch_all: Vec<&RouteEntry> = Vec::new();
                for entry in &c.routes {
                    match &entry.selector.key_set {
                        Some(_) if route_accepts(entry, message) => keyed.push(entry),
                        Some(_) => {}
                        None => catch_all.push(entry),
                    }
                }
                let pool = if keyed.is_empty() {
                    catch_all
                } else {
                    let max = keyed.iter().map(|e| key_len(e)).max().unwrap_or(0);
                    keyed.into_iter().filter(|e| key_len(e) == max).collect()
                };
                pool.into_iter()
                    .map(|e| MatchedRoute {
                        instance_id: e.instance_id,
                        select_group: e.select_group.clone(),
                        index: e.index,
                        policy: e.selector.route_policy,
                        consumed: Vec::new(),
                    })
                    .collect()
            }
        };
        match survivors.len() {
            0 if instantiating => RouteDecision::CreateInstance,
            0 => {
                let parked = park_locked(&mut inner, message.clone(), now, park_ttl_ms);
                debug!("no route for '{}' ({}); parked", correlator, message.mex_id);
                RouteDecision::Parked(parked)
            }
            1 => {
                let mut matched = survivors.remove(0);
                if matched.policy == RoutePolicy::OneShot {
                    matched.consumed = remove_group_locked(
                        &mut inner,
                        matched.instance_id,
                        &matched.select_group,
                    );
                }
                debug!(
                    "message {} routed to instance {} arm {}",
                    message.mex_id, matched.instance_id, matched.index
                );
                RouteDecision::Matched(matched)
            }
            _ => RouteDecision::Ambiguous(survivors),
        }
    }

    /// Park a message directly, outside of a route decision.
    pub async fn park(
        &self,
        message: InboundMessage,
        now: Timestamp,
        park_ttl_ms: i64,
    ) -> ParkedMessage {
        let mut inner = self.inner.lock().await;
        park_locked(&mut inner, message, now, park_ttl_ms)
    }

    /// Withdraw one instance's select group. Returns the removed routes.
    pub async fn remove_group(&self, instance_id: Uuid, select_group: &str) -> Vec<RouteEntry> {
        let mut inner = self.inner.lock().await;
        remove_group_locked(&mut inner, instance_id, select_group)
    }

    /// Drop every route of an instance. Parked messages stay.
    pub async fn remove_instance(&self, instance_id: Uuid) -> usize {
        let mut inner = self.inner.lock().await;
        let mut removed = 0;
        for c in inner.correlators.values_mut() {
            let before = c.routes.len();
            c.routes.retain(|r| r.instance_id != instance_id);
            removed += before - c.routes.len();
        }
        removed
    }

    /// Pop parked messages a current route could accept, expired ones
    /// pruned. The caller re-routes them; order is by park time.
    pub async fn take_parked(&self, now: Timestamp) -> Vec<ParkedMessage> {
        let mut inner = self.inner.lock().await;
        let mut taken = Vec::new();
        for c in inner.correlators.values_mut() {
            c.parked.retain(|p| p.expires_at > now);
            let matchable: Vec<bool> = c
                .parked
                .iter()
                .map(|p| c.routes.iter().any(|r| route_accepts(r, &p.message)))
                .collect();
            let mut kept = VecDeque::new();
            for (i, parked) in c.parked.drain(..).enumerate() {
                if matchable.get(i).copied().unwrap_or(false) {
                    taken.push(parked);
                } else {
                    kept.push_back(parked);
                }
            }
            c.parked = kept;
        }
        taken.sort_by(|a, b| {
            (a.parked_at, &a.message.mex_id).cmp(&(b.parked_at, &b.message.mex_id))
        });
        taken
    }

    /// Re-insert previously issued routes, preserving their claim order.
    /// Used on recovery and when a delivery is abandoned.
    pub async fn load_routes(&self, entries: Vec<RouteEntry>) {
        let mut inner = self.inner.lock().await;
        for entry in entries {
            inner.seq = inner.seq.max(entry.seq);
            inner
                .correlators
                .entry(entry.selector.correlator_id())
                .or_default()
                .routes
                .push(entry);
        }
        for c in inner.correlators.values_mut() {
            c.routes.sort_by_key(|r| r.seq);
        }
    }

    /// Re-insert parked messages on recovery, skipping expired ones.
    pub async fn load_parked(&self, parked: Vec<ParkedMessage>, now: Timestamp) {
        let mut inner = self.inner.lock().await;
        for p in parked.into_iter().filter(|p| p.expires_at > now) {
            let correlator = correlator_id(&p.message.partner_link, &p.message.operation);
            inner
                .correlators
                .entry(correlator)
                .or_default()
                .parked
                .push_back(p);
        }
        for c in inner.correlators.values_mut() {
            c.parked.make_contiguous().sort_by(|a, b| {
                (a.parked_at, &a.message.mex_id).cmp(&(b.parked_at, &b.message.mex_id))
            });
        }
    }

    pub async fn routes_for_instance(&self, instance_id: Uuid) -> Vec<RouteEntry> {
        let inner = self.inner.lock().await;
        let mut routes: Vec<RouteEntry> = inner
            .correlators
            .values()
            .flat_map(|c| &c.routes)
            .filter(|r| r.instance_id == instance_id)
            .cloned()
            .collect();
        routes.sort_by_key(|r| r.seq);
        routes
    }

    pub async fn route_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.correlators.values().map(|c| c.routes.len()).sum()
    }

    pub async fn parked_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.correlators.values().map(|c| c.parked.len()).sum()
    }
}

fn key_len(entry: &RouteEntry) -> usize {
    entry.selector.key_set.as_ref().map(|k| k.len()).unwrap_or(0)
}

fn route_accepts(entry: &RouteEntry, message: &InboundMessage) -> bool {
    match &entry.selector.key_set {
        Some(key_set) => message
            .keys
            .is_routable_to(key_set, entry.selector.route_policy == RoutePolicy::All),
        None => true,
    }
}

fn park_locked(
    inner: &mut RouterInner,
    message: InboundMessage,
    now: Timestamp,
    park_ttl_ms: i64,
) -> ParkedMessage {
    let parked = ParkedMessage {
        parked_at: now,
        expires_at: now + park_ttl_ms,
        message,
    };
    let correlator = correlator_id(&parked.message.partner_link, &parked.message.operation);
    inner
        .correlators
        .entry(correlator)
        .or_default()
        .parked
        .push_back(parked.clone());
    parked
}

fn remove_group_locked(
    inner: &mut RouterInner,
    instance_id: Uuid,
    select_group: &str,
) -> Vec<RouteEntry> {
    let mut removed = Vec::new();
    for c in inner.correlators.values_mut() {
        let mut kept = Vec::with_capacity(c.routes.len());
        for route in c.routes.drain(..) {
            if route.instance_id == instance_id && route.select_group == select_group {
                removed.push(route);
            } else {
                kept.push(route);
            }
        }
        c.routes = kept;
    }
    removed.sort_by_key(|r| r.seq);
    removed
}
