//! Ready-made process definitions used by tests and the replay harness.
//!
//! `sieve_process` is the classic concurrent sieve of Eratosthenes: a counter
//! unit streams candidates through a growing chain of filter units, one per
//! prime found. It exercises deep spawn chains, channel-reference state and
//! mid-stream checkpointing without touching the router. `echo_process` and
//! `order_process` are engine-level flows: the former is the smallest
//! instantiating definition, the latter adds correlation, a repeating
//! event-handler arm and a rejection fault.

use crate::correlation::{CorrelationKey, CorrelationKeySet};
use crate::error::ReductionError;
use crate::routing::Selector;
use crate::types::{as_chan_ref, chan_ref, OP_SELECTED, SELECT_TYPE};
use crate::vpu::{ProcessDefinition, ReductionCtx};
use serde_json::{json, Value};
use std::sync::Arc;

const STREAM_TYPE: &str = "sieve.stream";
const OP_VALUE: &str = "value";

/// Correlation key set carrying one `order` key.
pub fn order_keys(order_id: &str) -> CorrelationKeySet {
    CorrelationKeySet::of([CorrelationKey::new("order", vec![order_id.to_string()])])
}

/// One instantiating receive, one reply. Completes after a single message.
pub fn echo_process() -> Arc<ProcessDefinition> {
    Arc::new(
        ProcessDefinition::build("echo")
            .instantiating("client", "echo")
            .activity("main", |ctx: &mut ReductionCtx, _activation| {
                let resp = ctx.new_channel(SELECT_TYPE, "echo request")?;
                ctx.receive(resp, &[OP_SELECTED], "reply", Value::Null)?;
                ctx.select(resp, vec![Selector::one_shot("client", "echo", None)])?;
                Ok(())
            })
            .activity("reply", |ctx: &mut ReductionCtx, activation| {
                let Some(message) = activation.message else {
                    return Ok(());
                };
                ctx.invoke("client", "echo-reply", message.payload["payload"].clone());
                Ok(())
            })
            .finish(),
    )
}

/// Order intake, keyed on the submitted order id. Status queries hit a
/// repeating event-handler arm until the approval decision arrives; a
/// rejection raises `order.rejected`.
pub fn order_process() -> Arc<ProcessDefinition> {
    Arc::new(
        ProcessDefinition::build("order")
            .instantiating("customer", "submit")
            .activity("main", |ctx: &mut ReductionCtx, _activation| {
                let resp = ctx.new_channel(SELECT_TYPE, "order intake")?;
                ctx.receive(resp, &[OP_SELECTED], "intake", Value::Null)?;
                ctx.select(resp, vec![Selector::one_shot("customer", "submit", None)])?;
                Ok(())
            })
            .activity("intake", |ctx: &mut ReductionCtx, activation| {
                let Some(message) = activation.message else {
                    return Ok(());
                };
                let order_id = message.payload["payload"]["order_id"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let keys = order_keys(&order_id);

                let status = ctx.new_channel(SELECT_TYPE, "status queries")?;
                ctx.receive_replicated(
                    status,
                    &[OP_SELECTED],
                    "status-query",
                    json!({ "order_id": order_id }),
                )?;
                let status_group = ctx.select(
                    status,
                    vec![Selector::all("customer", "status", Some(keys.clone()))],
                )?;

                let decision = ctx.new_channel(SELECT_TYPE, "approval decision")?;
                ctx.receive(
                    decision,
                    &[OP_SELECTED],
                    "decide",
                    json!({ "order_id": order_id, "status_group": status_group }),
                )?;
                ctx.select(
                    decision,
                    vec![Selector::one_shot("approver", "decide", Some(keys))],
                )?;
                ctx.invoke("crm", "ack", json!({ "order_id": order_id }));
                Ok(())
            })
            .activity("status-query", |ctx: &mut ReductionCtx, activation| {
                let Some(message) = activation.message else {
                    return Ok(());
                };
                ctx.invoke(
                    "customer",
                    "status-report",
                    json!({
                        "order_id": activation.state["order_id"],
                        "query": message.payload["payload"],
                    }),
                );
                Ok(())
            })
            .activity("decide", |ctx: &mut ReductionCtx, activation| {
                let Some(message) = activation.message else {
                    return Ok(());
                };
                // the status arm dies with the decision
                if let Some(group) = activation.state["status_group"].as_str() {
                    ctx.cancel_select(group);
                }
                let body = message.payload["payload"].clone();
                if body["approved"].as_bool().unwrap_or(false) {
                    ctx.invoke("fulfillment", "ship", body);
                    Ok(())
                } else {
                    Err(ReductionError::fault("order.rejected", body))
                }
            })
            .finish(),
    )
}

/// Concurrent sieve of Eratosthenes over the candidates `2..=limit`. Each
/// prime found is reported as an outbound `sink.prime` request and inserts a
/// filter unit into the stream.
pub fn sieve_process(limit: i64) -> Arc<ProcessDefinition> {
    Arc::new(
        ProcessDefinition::build("sieve")
            .channel_type(STREAM_TYPE, &[OP_VALUE])
            .root("main", json!({ "limit": limit }))
            .activity("main", |ctx: &mut ReductionCtx, activation| {
                let limit = activation.state["limit"].as_i64().unwrap_or(0);
                let head = ctx.new_channel(STREAM_TYPE, "candidate stream")?;
                ctx.spawn(
                    "count",
                    json!({ "out": chan_ref(head), "n": 2, "limit": limit }),
                );
                ctx.receive(
                    head,
                    &[OP_VALUE],
                    "prime",
                    json!({ "in": chan_ref(head) }),
                )?;
                Ok(())
            })
            .activity("count", |ctx: &mut ReductionCtx, activation| {
                let n = activation.state["n"].as_i64().unwrap_or(0);
                let limit = activation.state["limit"].as_i64().unwrap_or(0);
                if n > limit {
                    return Ok(());
                }
                let Some(out) = as_chan_ref(&activation.state["out"]) else {
                    return Ok(());
                };
                ctx.send(out, OP_VALUE, json!(n))?;
                ctx.spawn(
                    "count",
                    json!({ "out": chan_ref(out), "n": n + 1, "limit": limit }),
                );
                Ok(())
            })
            .activity("prime", |ctx: &mut ReductionCtx, activation| {
                let Some(message) = activation.message else {
                    return Ok(());
                };
                let p = message.payload.as_i64().unwrap_or(0);
                ctx.invoke("sink", "prime", json!(p));
                let Some(input) = as_chan_ref(&activation.state["in"]) else {
                    return Ok(());
                };
                // everything surviving the new filter is prime again
                let rest = ctx.new_channel(STREAM_TYPE, "filtered stream")?;
                ctx.receive(
                    input,
                    &[OP_VALUE],
                    "filter",
                    json!({ "prime": p, "in": chan_ref(input), "out": chan_ref(rest) }),
                )?;
                ctx.receive(rest, &[OP_VALUE], "prime", json!({ "in": chan_ref(rest) }))?;
                Ok(())
            })
            .activity("filter", |ctx: &mut ReductionCtx, activation| {
                let Some(message) = activation.message else {
                    return Ok(());
                };
                let v = message.payload.as_i64().unwrap_or(0);
                let prime = activation.state["prime"].as_i64().unwrap_or(1);
                let Some(out) = as_chan_ref(&activation.state["out"]) else {
                    return Ok(());
                };
                let Some(input) = as_chan_ref(&activation.state["in"]) else {
                    return Ok(());
                };
                if v % prime != 0 {
                    ctx.send(out, OP_VALUE, json!(v))?;
                }
                ctx.receive(input, &[OP_VALUE], "filter", activation.state.clone())?;
                Ok(())
            })
            .finish(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DispatchOutcome, Engine};
    use crate::soup::Soup;
    use crate::store_memory::MemoryStore;
    use crate::types::{InboundMessage, InstanceStatus, OutboundRequest};
    use crate::vpu::{CycleEffects, Vpu};

    fn primes(outbound: &[OutboundRequest]) -> Vec<i64> {
        outbound
            .iter()
            .filter(|o| o.endpoint == "sink" && o.operation == "prime")
            .map(|o| o.payload.as_i64().unwrap())
            .collect()
    }

    /// Drain in capped slices until quiescence.
    fn drive(vpu: &mut Vpu, cap: usize) -> Vec<OutboundRequest> {
        let mut collected = Vec::new();
        for _ in 0..10_000 {
            let mut effects = CycleEffects::new();
            let report = vpu.run_cycle(&mut effects, cap).unwrap();
            collected.extend(effects.outbound);
            assert!(vpu.fault().is_none());
            if report.quiesced {
                return collected;
            }
        }
        panic!("sieve did not quiesce");
    }

    #[test]
    fn sieve_emits_the_primes_in_order() {
        let mut vpu = Vpu::new(sieve_process(30));
        vpu.inject_root();
        let outbound = drive(&mut vpu, 100_000);
        assert_eq!(primes(&outbound), vec![2, 3, 5, 7, 11, 13, 17, 19, 23, 29]);
        assert!(vpu.is_complete());
    }

    #[test]
    fn sieve_resumes_midway_without_drift() {
        let definition = sieve_process(60);
        let mut straight = Vpu::new(definition.clone());
        straight.inject_root();
        let expected = drive(&mut straight, 25);

        let mut first = Vpu::new(definition.clone());
        first.inject_root();
        let mut effects = CycleEffects::new();
        let report = first.run_cycle(&mut effects, 25).unwrap();
        assert!(!report.quiesced);
        let mut outbound = effects.outbound;

        // move the half-run soup into a fresh VPU, as the engine would
        let image = first.snapshot().unwrap();
        let soup = Soup::restore(&image).unwrap();
        let mut resumed = Vpu::resume(definition, soup);
        outbound.extend(drive(&mut resumed, 25));

        assert_eq!(outbound, expected);
        assert!(resumed.is_complete());
    }

    #[tokio::test]
    async fn echo_replies_and_completes() {
        let engine = Engine::new(Arc::new(MemoryStore::new()));
        engine.register_definition(echo_process()).await;
        let outcome = engine
            .handle_inbound(InboundMessage::new(
                "client",
                "echo",
                json!({ "text": "hi" }),
                "e1",
            ))
            .await
            .unwrap();
        let DispatchOutcome::Delivered { outcome, created } = outcome else {
            panic!("expected delivery, got {outcome:?}");
        };
        assert!(created);
        assert_eq!(outcome.outbound.len(), 1);
        assert_eq!(outcome.outbound[0].operation, "echo-reply");
        assert_eq!(outcome.outbound[0].payload, json!({ "text": "hi" }));
        assert!(matches!(outcome.status, InstanceStatus::Completed { .. }));
    }

    #[tokio::test]
    async fn order_status_queries_repeat_until_decision() {
        let engine = Engine::new(Arc::new(MemoryStore::new()));
        engine.register_definition(order_process()).await;
        let outcome = engine
            .handle_inbound(InboundMessage::new(
                "customer",
                "submit",
                json!({ "order_id": "7" }),
                "m1",
            ))
            .await
            .unwrap();
        let DispatchOutcome::Delivered { outcome, .. } = outcome else {
            panic!("expected delivery, got {outcome:?}");
        };
        assert_eq!(outcome.outbound[0].operation, "ack");

        // the replicated status arm answers as often as asked
        for mex in ["q1", "q2"] {
            let outcome = engine
                .handle_inbound(
                    InboundMessage::new("customer", "status", json!({ "full": true }), mex)
                        .with_keys(order_keys("7")),
                )
                .await
                .unwrap();
            let DispatchOutcome::Delivered { outcome, .. } = outcome else {
                panic!("expected delivery, got {outcome:?}");
            };
            assert_eq!(outcome.outbound[0].operation, "status-report");
            assert_eq!(outcome.outbound[0].payload["order_id"], json!("7"));
            assert_eq!(outcome.status, InstanceStatus::Active);
        }
        assert_eq!(engine.router().route_count().await, 2);

        let outcome = engine
            .handle_inbound(
                InboundMessage::new("approver", "decide", json!({ "approved": true }), "m2")
                    .with_keys(order_keys("7")),
            )
            .await
            .unwrap();
        let DispatchOutcome::Delivered { outcome, .. } = outcome else {
            panic!("expected delivery, got {outcome:?}");
        };
        assert_eq!(outcome.outbound[0].operation, "ship");
        assert!(matches!(outcome.status, InstanceStatus::Completed { .. }));
        assert_eq!(engine.router().route_count().await, 0);
    }
}
