//! Silent-store elimination over a small textual LIR.
//!
//! The crate builds a program dependence graph for each function, computes
//! the set of instructions that can accompany a store into a guarded block,
//! and rewrites the control-flow graph so the store only executes when the
//! value it would write actually changed.  A separate identity-counter
//! facility records how often arithmetic instructions execute with an
//! identity operand, which is what makes the guard profitable in practice.

pub mod commons;
pub mod front_end;
pub mod middle_end;
