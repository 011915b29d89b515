//! Garbage collection.
//!
//! A precise tracing mark-sweep collector over a handle-addressed arena.
//! Tracing (rather than reference counting) is required because the object
//! graph is intentionally cyclic: a class's method table holds closures that
//! may capture instances of that same class.

mod heap;

pub use heap::{Handle, Heap, HeapStats};
