//! Inclusion/trigger evaluator — pure interpretation of criteria expression
//! trees against customer snapshots, for journey entry and branch selection.

pub mod compare;
pub mod evaluator;

pub use evaluator::{evaluate, qualifies_for_entry, select_branch, EvalContext};
