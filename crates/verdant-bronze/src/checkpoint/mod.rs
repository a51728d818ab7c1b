//! Engine checkpoint.
//!
//! The checkpoint holds everything a restarted engine needs to continue
//! exactly where the last committed batch left off: the next offset of every
//! partition, the maximum observed event time, the open windows and the
//! schema stall counters. It is committed in the same sink transaction as the
//! aggregates it produced, so a replayed batch starts from the same state and
//! recomputes the same output.

pub mod state;

pub use state::EngineCheckpoint;
