//! The bytecode compiler.
//!
//! A single pass turns source text directly into bytecode: the parser climbs
//! operator precedence and emits instructions as it goes, with jump operands
//! patched in place once targets are known.

mod chunk;
mod codegen;
mod opcode;

pub use chunk::{Chunk, NO_TARGET};
pub use codegen::{Diagnostic, compile};
pub use opcode::OpCode;
