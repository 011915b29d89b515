//! Lexical analysis for Vesper source code.
//!
//! The lexer converts raw source text into a lazy stream of tokens: the
//! compiler pulls one token at a time via [`Scanner::next_token`], so no
//! token buffer is ever materialized. Lexical errors are reported as
//! [`TokenKind::Error`] tokens rather than failures; recovery policy belongs
//! to the compiler.

mod scanner;
mod token;

pub use scanner::{MAX_INTERPOLATION_DEPTH, Scanner};
pub use token::{Span, Token, TokenKind};
