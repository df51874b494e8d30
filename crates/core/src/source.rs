//! Source locations and a cache of loaded source files.
//!
//! Every AST node and token carries a [`SourceLocation`]; diagnostics use it
//! to print `file:line:column` and, via [`SourceCache`], the offending
//! source line with a caret underneath the column.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// A 1-based line/column position within a named file.
///
/// 1-based to match the rendering in spec: `<file>:<line>:<column>`.
/// Internal scanners track 0-based offsets and convert at token-creation
/// time (see `talonc::lexer`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    pub file: Rc<PathBuf>,
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn new(file: Rc<PathBuf>, line: u32, column: u32) -> Self {
        SourceLocation { file, line, column }
    }

    /// A placeholder location for synthesized nodes (e.g. monomorphized
    /// specializations) that don't correspond to a literal source span.
    pub fn synthetic() -> Self {
        SourceLocation {
            file: Rc::new(PathBuf::from("<synthetic>")),
            line: 0,
            column: 0,
        }
    }
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.file.display(), self.line, self.column)
    }
}

/// Caches source text by path so diagnostics can re-render the offending
/// line without re-reading the filesystem. Also used by the driver to
/// detect import cycles (a file is "cached" the moment it's first read).
#[derive(Debug, Default)]
pub struct SourceCache {
    files: HashMap<PathBuf, Rc<String>>,
}

impl SourceCache {
    pub fn new() -> Self {
        SourceCache::default()
    }

    /// Insert (or overwrite) the text for `path`. Returns a cheaply-clonable
    /// handle to the stored text.
    pub fn insert(&mut self, path: impl Into<PathBuf>, text: String) -> Rc<String> {
        let rc = Rc::new(text);
        self.files.insert(path.into(), Rc::clone(&rc));
        rc
    }

    pub fn get(&self, path: &Path) -> Option<&Rc<String>> {
        self.files.get(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    /// Extract the 1-based `line` from the cached text for `path`, if both
    /// the file and the line exist. Used to print the caret line under a
    /// diagnostic's column.
    pub fn line_text(&self, path: &Path, line: u32) -> Option<&str> {
        let text = self.files.get(path)?;
        text.lines().nth(line.saturating_sub(1) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_display_matches_file_line_column() {
        let loc = SourceLocation::new(Rc::new(PathBuf::from("a.tl")), 3, 7);
        assert_eq!(loc.to_string(), "a.tl:3:7");
    }

    #[test]
    fn cache_round_trips_line_text() {
        let mut cache = SourceCache::new();
        cache.insert("a.tl", "fn main():\n    print(1)\n".to_string());
        assert_eq!(cache.line_text(Path::new("a.tl"), 2), Some("    print(1)"));
        assert_eq!(cache.line_text(Path::new("a.tl"), 99), None);
    }

    #[test]
    fn cache_tracks_import_presence() {
        let mut cache = SourceCache::new();
        assert!(!cache.contains(Path::new("a.tl")));
        cache.insert("a.tl", String::new());
        assert!(cache.contains(Path::new("a.tl")));
    }
}
