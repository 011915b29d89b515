//! The bytecode virtual machine.
//!
//! - `interpreter` — the dispatch loop and everything it drives: calls,
//!   property access, exceptions, generators, and the collection trigger
//! - `frame` — call frames and per-frame exception-handler stacks

pub mod frame;
mod interpreter;

pub use interpreter::{RuntimeError, Vm};
