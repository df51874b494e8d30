//! Diagnostic rendering, shared by the lexer, parser, and type checker.
//!
//! Per spec §7: the lexer and parser raise a diagnostic-bearing error and
//! stop (or, for the parser, `synchronize` to the next statement boundary);
//! the type checker never throws — it pushes into a [`DiagnosticSink`] and
//! always finishes its walk. Rendering is identical across all three so a
//! user sees one consistent error format regardless of which pass found the
//! problem.

use crate::source::{SourceCache, SourceLocation};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Note,
    Warning,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Note => write!(f, "note"),
            Level::Warning => write!(f, "warning"),
            Level::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub level: Level,
    pub message: String,
    pub location: SourceLocation,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, location: SourceLocation) -> Self {
        Diagnostic {
            level: Level::Error,
            message: message.into(),
            location,
        }
    }

    pub fn warning(message: impl Into<String>, location: SourceLocation) -> Self {
        Diagnostic {
            level: Level::Warning,
            message: message.into(),
            location,
        }
    }

    pub fn note(message: impl Into<String>, location: SourceLocation) -> Self {
        Diagnostic {
            level: Level::Note,
            message: message.into(),
            location,
        }
    }

    /// Render as `<file>:<line>:<column>: <level>: <message>`, optionally
    /// followed by the source line and a caret under the column.
    pub fn render(&self, cache: Option<&SourceCache>) -> String {
        let mut out = format!(
            "{}: {}: {}",
            self.location, self.level, self.message
        );
        if let Some(cache) = cache {
            if let Some(line) = cache.line_text(&self.location.file, self.location.line) {
                out.push('\n');
                out.push_str(line);
                out.push('\n');
                let col = self.location.column.saturating_sub(1) as usize;
                out.push_str(&" ".repeat(col));
                out.push('^');
            }
        }
        out
    }
}

/// Accumulates diagnostics across a pass that must not abort early (the
/// type checker). Lexer/parser errors skip this and return `Result`
/// directly, since those passes are specified as fatal-on-first-error
/// (aside from parser statement-level recovery).
#[derive(Debug, Default)]
pub struct DiagnosticSink {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticSink {
    pub fn new() -> Self {
        DiagnosticSink::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn error(&mut self, message: impl Into<String>, location: SourceLocation) {
        self.push(Diagnostic::error(message, location));
    }

    pub fn warning(&mut self, message: impl Into<String>, location: SourceLocation) {
        self.push(Diagnostic::warning(message, location));
    }

    /// True if any `Error`-level diagnostic was recorded. Per spec §7, the
    /// driver aborts before monomorphization iff this is true.
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.level == Level::Error)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter()
    }

    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::rc::Rc;

    fn loc() -> SourceLocation {
        SourceLocation::new(Rc::new(PathBuf::from("x.tl")), 1, 1)
    }

    #[test]
    fn sink_reports_errors_present() {
        let mut sink = DiagnosticSink::new();
        assert!(!sink.has_errors());
        sink.warning("unused variable 'x'", loc());
        assert!(!sink.has_errors());
        sink.error("unresolved identifier 'y'", loc());
        assert!(sink.has_errors());
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn render_without_cache_has_no_caret_line() {
        let d = Diagnostic::error("boom", loc());
        let rendered = d.render(None);
        assert_eq!(rendered, "x.tl:1:1: error: boom");
    }

    #[test]
    fn render_with_cache_includes_caret() {
        let mut cache = SourceCache::new();
        cache.insert(PathBuf::from("x.tl"), "let y = z\n".to_string());
        let d = Diagnostic::error(
            "unresolved identifier 'z'",
            SourceLocation::new(Rc::new(PathBuf::from("x.tl")), 1, 9),
        );
        let rendered = d.render(Some(&cache));
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[1], "let y = z");
        assert_eq!(lines[2], "        ^");
    }
}
