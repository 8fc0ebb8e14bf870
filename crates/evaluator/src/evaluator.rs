use chrono::{DateTime, Utc};
use tracing::debug;

use voyage_core::types::{Criteria, CustomerSnapshot, Journey, Node, NodeKind};
use voyage_core::{EngineError, EngineResult};

use crate::compare::compare_values;

/// Everything a criteria evaluation may read. Evaluation is a pure function
/// of this context, with no side effects, so it is safe to re-run on retry.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub snapshot: &'a CustomerSnapshot,
    /// Payload of the triggering event, when the advancement was event-driven.
    pub event: Option<&'a serde_json::Value>,
    pub now: DateTime<Utc>,
}

impl<'a> EvalContext<'a> {
    pub fn new(snapshot: &'a CustomerSnapshot) -> Self {
        Self {
            snapshot,
            event: None,
            now: Utc::now(),
        }
    }

    pub fn with_event(mut self, event: &'a serde_json::Value) -> Self {
        self.event = Some(event);
        self
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }
}

/// Evaluates a criteria tree against the given context.
pub fn evaluate(criteria: &Criteria, ctx: &EvalContext<'_>) -> bool {
    match criteria {
        Criteria::AllCustomers => true,
        Criteria::Attribute {
            key,
            operator,
            value,
        } => {
            let actual = ctx
                .snapshot
                .attributes
                .get(key)
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            compare_values(&actual, operator, value)
        }
        Criteria::EventAttribute {
            key,
            operator,
            value,
        } => {
            let actual = ctx
                .event
                .and_then(|e| e.get(key))
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            compare_values(&actual, operator, value)
        }
        Criteria::InSegment {
            segment_id,
            is_member,
        } => ctx.snapshot.segment_ids.contains(segment_id) == *is_member,
        Criteria::TimeWindow {
            not_before,
            not_after,
        } => {
            not_before.map_or(true, |t| ctx.now >= t) && not_after.map_or(true, |t| ctx.now <= t)
        }
        Criteria::All { clauses } => clauses.iter().all(|c| evaluate(c, ctx)),
        Criteria::Any { clauses } => clauses.iter().any(|c| evaluate(c, ctx)),
        Criteria::Not { clause } => !evaluate(clause, ctx),
    }
}

/// Whether the customer currently qualifies to enter the journey.
///
/// For dynamic journeys the caller re-invokes this on relevant customer
/// events; for non-dynamic journeys it is called once against the snapshot
/// taken at journey start. The decision itself is the same pure evaluation.
pub fn qualifies_for_entry(
    journey: &Journey,
    snapshot: &CustomerSnapshot,
    now: DateTime<Utc>,
) -> bool {
    let ctx = EvalContext::new(snapshot).at(now);
    let qualifies = evaluate(&journey.inclusion_criteria, &ctx);
    debug!(
        journey_id = %journey.id,
        customer_id = %snapshot.customer_id,
        qualifies,
        "Evaluated inclusion criteria"
    );
    qualifies
}

/// Selects the branch key for a branch node: arms are evaluated in
/// declaration order and the first match wins. When nothing matches, an arm
/// keyed `"default"` acts as the fallback; with no match and no default the
/// journey is misconfigured for this customer.
pub fn select_branch<'n>(node: &'n Node, ctx: &EvalContext<'_>) -> EngineResult<&'n str> {
    let NodeKind::Branch { branches } = &node.kind else {
        return Err(EngineError::MalformedGraph(format!(
            "node {} is not a branch node",
            node.id
        )));
    };

    for arm in branches {
        if evaluate(&arm.condition, ctx) {
            return Ok(arm.key.as_str());
        }
    }

    if let Some(fallback) = branches.iter().find(|a| a.key == "default") {
        return Ok(fallback.key.as_str());
    }

    Err(EngineError::MalformedGraph(format!(
        "branch node {} matched no arm for customer {}",
        node.id, ctx.snapshot.customer_id
    )))
}
