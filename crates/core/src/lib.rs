//! Talon Core: source cache, diagnostic rendering, and the token model
//! shared by the lexer, parser, and type checker.
//!
//! This crate is deliberately tiny and has no knowledge of the AST or type
//! system — those live in `talon-compiler`, which depends on this crate.

pub mod diagnostics;
pub mod source;
pub mod token;

pub use diagnostics::{Diagnostic, DiagnosticSink, Level};
pub use source::{SourceCache, SourceLocation};
pub use token::{Literal, Token, TokenKind};
