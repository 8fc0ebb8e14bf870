//! Journey graph model — immutable, validated snapshot of a journey's nodes
//! and edges with the traversal operations the step processor needs.

pub mod graph;

pub use graph::{JourneyGraph, MAX_DELAY_SECS};
