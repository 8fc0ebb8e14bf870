//! Journey execution engine — the step processor that advances customers
//! through journey graphs exactly once per step, the queue and side-effect
//! seams it consumes, the worker pool hosting it, and the journey lifecycle
//! controller.

pub mod broker;
pub mod effect;
pub mod lifecycle;
pub mod pool;
pub mod processor;
pub mod worker;

pub use broker::{Broker, MemoryBroker, NatsBroker};
pub use effect::{EffectExecutor, NoOpExecutor, RecordingExecutor};
pub use lifecycle::LifecycleController;
pub use pool::WorkerPool;
pub use processor::{Disposition, StepProcessor};
pub use worker::JourneyWorker;
