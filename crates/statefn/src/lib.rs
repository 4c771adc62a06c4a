//! Exposes a small engine for running a reconciliation pass as a state machine.
//!
//! A pass is a sequence of stages. Each stage gets exclusive access to the
//! pass's state and returns a [`Transition`]: either the next stage to run or
//! a terminal marker. [`run_to_completion`] drives the stages until one of them
//! stops the pass, or until a shutdown signal cancels it. The engine never
//! retries; it hands a [`Directive`] back to whatever scheduler invoked it.

#![deny(missing_docs)]

pub mod state;

pub use state::{run_to_completion, Directive, StateMachine, Stopped, Transition};
