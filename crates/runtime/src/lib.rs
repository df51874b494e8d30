//! Talon Runtime: layout constants and reference implementations shared
//! between `talon-compiler`'s code generator and its tests.
//!
//! This crate is never linked into a compiled Talon executable — everything
//! it describes (the GC, synchronization object layouts, the `Result`
//! tagging scheme, the Win32 import table) is emitted directly as x64
//! machine code by `talonc::codegen`. Keeping the layout constants
//! here means the emitter and the tests that check emitted bytes against
//! expected offsets can't drift apart silently.

pub mod gc;
pub mod result_tag;
pub mod sync_layout;
pub mod win32;
