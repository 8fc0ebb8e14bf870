//! Side-effect executor seam. The engine's responsibility ends at "invoke
//! effect, observe outcome"; actual message delivery (email, SMS, push,
//! webhooks) is owned outside this core.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use voyage_core::types::{CustomerSnapshot, EffectOutcome, Node};

#[async_trait]
pub trait EffectExecutor: Send + Sync {
    async fn execute(&self, node: &Node, customer: &CustomerSnapshot) -> EffectOutcome;
}

/// Executor that succeeds without doing anything. Useful for dry runs and
/// journeys whose steps carry no engine-visible effects.
pub struct NoOpExecutor;

#[async_trait]
impl EffectExecutor for NoOpExecutor {
    async fn execute(&self, _node: &Node, _customer: &CustomerSnapshot) -> EffectOutcome {
        EffectOutcome::Success
    }
}

/// Test executor: records every execution and replays scripted outcomes in
/// order, defaulting to `Success` once the script runs out.
#[derive(Default)]
pub struct RecordingExecutor {
    executions: Mutex<Vec<(Uuid, String)>>,
    script: Mutex<VecDeque<EffectOutcome>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_outcome(&self, outcome: EffectOutcome) {
        self.script
            .lock()
            .expect("executor mutex poisoned")
            .push_back(outcome);
    }

    /// `(node_id, customer_id)` pairs, in execution order.
    pub fn executions(&self) -> Vec<(Uuid, String)> {
        self.executions
            .lock()
            .expect("executor mutex poisoned")
            .clone()
    }

    pub fn count(&self) -> usize {
        self.executions.lock().expect("executor mutex poisoned").len()
    }
}

#[async_trait]
impl EffectExecutor for RecordingExecutor {
    async fn execute(&self, node: &Node, customer: &CustomerSnapshot) -> EffectOutcome {
        self.executions
            .lock()
            .expect("executor mutex poisoned")
            .push((node.id, customer.customer_id.clone()));
        self.script
            .lock()
            .expect("executor mutex poisoned")
            .pop_front()
            .unwrap_or(EffectOutcome::Success)
    }
}
