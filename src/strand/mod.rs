//! The strand/action micro-scheduler (spec §4.1).
//!
//! A strand parks one suspended event plus its queued continuations; the
//! table indexes many strands in a bit-summarized tree so the worker loop
//! can find runnable work without a linear scan.

mod action;
mod strand;
mod table;

pub use action::Action;
pub use strand::{Strand, StrandGuard, StrandProperties};
pub use table::{StrandHandle, StrandTable};
