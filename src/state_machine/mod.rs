//! Transform lifecycle state machine
//!
//! The disposition of one update tick is computed as a pure function of the
//! transform status and the work's terminal predicates; the handlers apply
//! the side effects.

mod transition;

pub use transition::{evaluate, operator_action, processing_status_for, Disposition};
