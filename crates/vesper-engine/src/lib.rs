// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 The Vesper Project Developers

//! # vesper-engine
//!
//! The Vesper language engine: a dynamically-typed, class-based scripting
//! language implemented in Rust.
//!
//! ## Overview
//!
//! This crate provides the complete execution pipeline:
//! - Lexer producing tokens on demand
//! - Single-pass bytecode compiler (no AST)
//! - Stack-based virtual machine with closures, exceptions, and generators
//! - Tracing mark-sweep garbage collector over a handle-addressed heap
//! - Native-extension ABI for building packages on top of the engine
//!
//! ## Quick Start
//!
//! ```rust
//! use vesper_engine::{Engine, Value};
//!
//! let mut engine = Engine::new();
//! let result = engine.eval("1 + 2;").unwrap();
//! assert_eq!(result, Value::Int(3));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compiler;
pub mod gc;
pub mod lexer;
pub mod runtime;
pub mod vm;

// Re-exports for convenience
pub use compiler::Diagnostic;
pub use runtime::native::{NativeError, NativeFn};
pub use runtime::value::Value;
pub use vm::{RuntimeError, Vm};

/// The main Vesper engine instance.
///
/// Encapsulates the whole execution environment: the heap, both global
/// tables, and the interpreter state. Engines are independent; several can
/// coexist in one process.
pub struct Engine {
    vm: Vm,
}

impl Engine {
    /// Creates a new engine instance with the core natives registered.
    pub fn new() -> Self {
        Self { vm: Vm::new() }
    }

    /// Evaluates Vesper source code and returns the result.
    ///
    /// The source is compiled to bytecode, wrapped in a closure, and called
    /// with zero arguments at the VM's top level. A trailing expression
    /// statement becomes the unit's value, so REPL input echoes naturally.
    ///
    /// # Errors
    ///
    /// [`Error::Compile`] carries every syntax error found (nothing ran);
    /// [`Error::Runtime`] carries the message and stack trace of an
    /// uncaught exception.
    pub fn eval(&mut self, source: &str) -> Result<Value, Error> {
        let function =
            compiler::compile(source, self.vm.heap_mut()).map_err(Error::Compile)?;
        self.vm.interpret(function).map_err(Error::Runtime)
    }

    /// Evaluates Vesper source code from a file.
    pub fn eval_file(&mut self, path: &std::path::Path) -> Result<Value, Error> {
        let source = std::fs::read_to_string(path).map_err(|e| Error::Io(e.to_string()))?;
        self.eval(&source)
    }

    /// Renders a value for display, following references into the heap.
    pub fn render(&self, value: &Value) -> String {
        self.vm.format_value(value)
    }

    /// Access to the underlying VM, for native-extension registration.
    pub fn vm(&mut self) -> &mut Vm {
        &mut self.vm
    }

    /// Forces a full garbage-collection cycle.
    pub fn collect_garbage(&mut self) {
        self.vm.collect_garbage();
    }

    /// Current heap counters: live objects, live bytes, completed cycles.
    pub fn heap_stats(&self) -> gc::HeapStats {
        self.vm.heap_stats()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors that can occur during evaluation.
#[derive(Debug, Clone)]
pub enum Error {
    /// Syntax errors collected during compilation; nothing was executed
    Compile(Vec<Diagnostic>),
    /// An uncaught runtime exception
    Runtime(RuntimeError),
    /// I/O error reading a source file
    Io(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Compile(diagnostics) => {
                for (i, diagnostic) in diagnostics.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}", diagnostic)?;
                }
                Ok(())
            }
            Error::Runtime(error) => write!(f, "{}", error),
            Error::Io(message) => write!(f, "IOError: {}", message),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_eval_expression() {
        let mut engine = Engine::new();
        assert_eq!(engine.eval("2 + 2;").unwrap(), Value::Int(4));
    }

    #[test]
    fn test_engine_reports_all_compile_errors() {
        let mut engine = Engine::new();
        match engine.eval("let = 1; 1 +;") {
            Err(Error::Compile(diagnostics)) => assert!(diagnostics.len() >= 2),
            other => panic!("expected compile errors, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_engine_state_persists_between_evals() {
        let mut engine = Engine::new();
        engine.eval("let counter = 0;").unwrap();
        engine.eval("counter = counter + 1;").unwrap();
        assert_eq!(engine.eval("counter;").unwrap(), Value::Int(1));
    }

    #[test]
    fn test_engine_render() {
        let mut engine = Engine::new();
        let value = engine.eval("[1, \"two\", 3.5];").unwrap();
        assert_eq!(engine.render(&value), "[1, two, 3.5]");
    }

    #[test]
    fn test_independent_engines() {
        let mut a = Engine::new();
        let mut b = Engine::new();
        a.eval("let x = 1;").unwrap();
        assert!(matches!(b.eval("x;"), Err(Error::Runtime(_))));
    }
}
