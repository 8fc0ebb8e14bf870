use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A journey definition: a directed graph of steps that customers are
/// progressed through, plus lifecycle and entry metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Journey {
    pub id: Uuid,
    pub name: String,
    pub workspace_id: Uuid,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    /// Dynamic journeys evaluate entry continuously on customer events;
    /// non-dynamic journeys evaluate once against a snapshot at start.
    pub is_dynamic: bool,
    pub inclusion_criteria: Criteria,
    pub entry_settings: EntrySettings,
    pub status: JourneyStatus,
    /// Monotonic counter bumped on every lifecycle transition.
    pub status_version: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub latest_pause: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub latest_save: DateTime<Utc>,
    pub latest_changer: Option<String>,
}

impl Journey {
    /// A fresh draft journey with default entry criteria (all customers).
    pub fn new(
        name: impl Into<String>,
        workspace_id: Uuid,
        nodes: Vec<Node>,
        edges: Vec<Edge>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            workspace_id,
            nodes,
            edges,
            is_dynamic: false,
            inclusion_criteria: Criteria::AllCustomers,
            entry_settings: EntrySettings::default(),
            status: JourneyStatus::Draft,
            status_version: 0,
            created_at: now,
            started_at: None,
            latest_pause: None,
            stopped_at: None,
            deleted_at: None,
            latest_save: now,
            latest_changer: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.status == JourneyStatus::Deleted
    }

    pub fn is_stopped(&self) -> bool {
        self.status == JourneyStatus::Stopped
    }

    pub fn is_paused(&self) -> bool {
        self.status == JourneyStatus::Paused
    }

    /// Whether dequeued advancement requests for this journey may proceed.
    /// Paused journeys are alive but frozen; the processor defers instead.
    pub fn accepts_advancement(&self) -> bool {
        self.status == JourneyStatus::Active
    }
}

/// Lifecycle state of a journey definition. `Deleted` is terminal and
/// overrides everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyStatus {
    Draft,
    Active,
    Paused,
    Stopped,
    Deleted,
}

/// Journey-level entry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySettings {
    /// Whether a customer who exited may enter the journey again.
    pub allow_reentry: bool,
}

impl Default for EntrySettings {
    fn default() -> Self {
        Self {
            allow_reentry: false,
        }
    }
}

/// A vertex in the journey graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub name: String,
    pub kind: NodeKind,
}

/// The kind-specific behavior of a journey step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum NodeKind {
    /// Where customers land when they qualify for the journey.
    Entry,
    /// Side-effecting message send, delegated to the effect executor.
    Send {
        channel: Channel,
        template_id: String,
    },
    /// Hold the customer in place until the scheduler re-triggers.
    Delay { duration_secs: u64 },
    /// Multi-way split; each arm's condition is evaluated in declaration
    /// order and the first match wins.
    Branch { branches: Vec<BranchArm> },
    /// Terminal node; reaching it tombstones the customer's location.
    Exit,
}

/// Delivery channel for a send step. Actual transport is external.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Push,
    InApp,
    Webhook,
}

/// One arm of a branch node. The edge carrying the matching `branch_key`
/// determines where the customer goes next.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchArm {
    pub key: String,
    pub condition: Criteria,
}

/// A directed, possibly branch-keyed transition between nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from: Uuid,
    pub to: Uuid,
    pub branch_key: Option<String>,
}

/// The durable record of one customer's position inside one journey.
/// The single source of truth for position; mutated only under the
/// distributed lease and the compare-and-move check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyLocation {
    pub journey_id: Uuid,
    pub customer_id: String,
    pub current_node_id: Uuid,
    pub step_entered_at: DateTime<Utc>,
    /// Worker currently holding the lease for this customer, if any.
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub move_started_at: Option<DateTime<Utc>>,
    /// When the scheduler should wake this customer at a delay node.
    pub next_scheduled_at: Option<DateTime<Utc>>,
}

/// Read-only customer attribute snapshot used by criteria evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerSnapshot {
    pub customer_id: String,
    pub attributes: serde_json::Map<String, serde_json::Value>,
    /// Segments the customer belongs to, as computed by the external
    /// segmentation system at snapshot time.
    #[serde(default)]
    pub segment_ids: Vec<Uuid>,
}

impl CustomerSnapshot {
    pub fn new(customer_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            attributes: serde_json::Map::new(),
            segment_ids: Vec::new(),
        }
    }

    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn in_segment(mut self, segment_id: Uuid) -> Self {
        self.segment_ids.push(segment_id);
        self
    }
}

/// A queued instruction to re-evaluate and potentially move a customer's
/// location. Transient; owned by the broker between producers and consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancementRequest {
    pub journey_id: Uuid,
    pub customer_id: String,
    pub triggering_node_id: Uuid,
    pub reason: AdvanceReason,
    pub enqueued_at: DateTime<Utc>,
    /// Starts at 0, incremented on every requeue, capped by configuration.
    pub attempt: u32,
    /// Event payload evaluated by branch conditions, when `reason` is Event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_context: Option<serde_json::Value>,
}

impl AdvancementRequest {
    pub fn new(
        journey_id: Uuid,
        customer_id: impl Into<String>,
        triggering_node_id: Uuid,
        reason: AdvanceReason,
    ) -> Self {
        Self {
            journey_id,
            customer_id: customer_id.into(),
            triggering_node_id,
            reason,
            enqueued_at: Utc::now(),
            attempt: 0,
            event_context: None,
        }
    }

    /// Copy for requeueing with the attempt counter bumped.
    pub fn requeued(&self) -> Self {
        let mut next = self.clone();
        next.attempt += 1;
        next.enqueued_at = Utc::now();
        next
    }
}

/// Why an advancement request was enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvanceReason {
    Entry,
    DelayElapsed,
    Event,
    BranchContinue,
}

/// Outcome reported by the external side-effect executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum EffectOutcome {
    Success,
    Retryable { reason: String },
    Fatal { reason: String },
}

/// Tagged criteria expression tree, parsed once at journey save time and
/// evaluated by a pure interpreter. Replaces free-form criteria payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Criteria {
    /// Everyone qualifies.
    AllCustomers,
    /// Compare a customer attribute against a literal.
    Attribute {
        key: String,
        operator: CompareOp,
        value: serde_json::Value,
    },
    /// Compare an attribute of the triggering event context.
    EventAttribute {
        key: String,
        operator: CompareOp,
        value: serde_json::Value,
    },
    /// Segment membership as maintained by the external segmentation system.
    InSegment { segment_id: Uuid, is_member: bool },
    /// Wall-clock window; open ends are unbounded.
    TimeWindow {
        not_before: Option<DateTime<Utc>>,
        not_after: Option<DateTime<Utc>>,
    },
    All { clauses: Vec<Criteria> },
    Any { clauses: Vec<Criteria> },
    Not { clause: Box<Criteria> },
}

/// Comparison operators supported by attribute criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    IsSet,
    IsNotSet,
    InList,
    NotInList,
}
