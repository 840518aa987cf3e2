//! Engine-side plumbing: fabric environment configuration, the cooperative
//! scheduling contract, and the local domain-socket control protocol.
//!
//! The engine is single-threaded and cooperative: work units yield only at
//! explicit checkpoints, so cross-task state needs no locks. Bootstrap
//! order matters — [`init`] wires the clock before any epoch is taken.

pub mod drpc;
pub mod env;
pub mod sched;

use tidepool_error::Result;

/// Deterministic engine bootstrap: validate the clock range and prime the
/// global HLC state. Call once before any other engine entry point.
pub fn init() -> Result<()> {
    tidepool_common::hlc::init()
}
