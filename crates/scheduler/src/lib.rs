//! Delay scheduler — periodically scans for journey locations whose wake-up
//! time has elapsed and enqueues the matching advancement requests.
//!
//! The scanner is deliberately dumb: it does not claim, lock or clear
//! anything. A location may be picked up by consecutive scans, or by two
//! replicas in the same scan; the resulting duplicate requests are absorbed
//! downstream by the per-customer lease and the compare-and-move check, and
//! the schedule itself is cleared by the advance that consumes it.

pub mod scanner;

pub use scanner::Scheduler;
