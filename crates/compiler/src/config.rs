//! Compiler configuration (spec §6 CLI surface, SPEC_FULL §1 "AMBIENT
//! STACK" — a `talon.toml` project file parsed with `toml`/`serde`).
//!
//! Generalizes the teacher's `CompilerConfig` (a serde-free builder that
//! let external projects register additional builtins) into a
//! `serde`-derived struct that can additionally be loaded from a
//! `talon.toml` on disk, carrying the optimization level, requested
//! output kind, and `use`-import search paths.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Spec §6: `-O0..-O3 / -Os / -Oz / -Ofast`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OptimizationLevel {
    O0,
    #[default]
    O1,
    O2,
    O3,
    Os,
    Oz,
    Ofast,
}

impl OptimizationLevel {
    pub fn parse(flag: &str) -> Option<Self> {
        match flag {
            "0" => Some(OptimizationLevel::O0),
            "1" => Some(OptimizationLevel::O1),
            "2" => Some(OptimizationLevel::O2),
            "3" => Some(OptimizationLevel::O3),
            "s" => Some(OptimizationLevel::Os),
            "z" => Some(OptimizationLevel::Oz),
            "fast" => Some(OptimizationLevel::Ofast),
            _ => None,
        }
    }
}

/// Spec §6: `-r/--run`, `-c/--compile`, `-S/--obj`, `--link`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputKind {
    /// Compile to bytecode and run in the VM. Out of scope for this core
    /// (spec §1); `talonc` reports this and exits nonzero.
    #[default]
    RunVm,
    /// Compile to a native `.exe`.
    Executable,
    /// Compile to a `.to` object file.
    Object,
    /// Link previously compiled `.to` object files into an executable.
    Link,
}

/// Project-level configuration, generalizing the teacher's
/// `CompilerConfig` builder pattern. Defaults match the CLI flag
/// defaults in spec §6; a `talon.toml` file or explicit CLI flags
/// override fields via [`CompilerConfig::merge_cli`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompilerConfig {
    #[serde(default)]
    pub optimization: OptimizationLevel,
    /// Directories searched for `use "path":` imports beyond the
    /// importing file's own directory.
    #[serde(default)]
    pub import_search_paths: Vec<PathBuf>,
    /// Spec §6 `--no-typecheck`: skip type checking entirely.
    #[serde(default)]
    pub no_typecheck: bool,
    /// Spec §6 `--map`: emit a linker map file alongside link output.
    #[serde(default)]
    pub emit_map: bool,
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Toml(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "{e}"),
            ConfigError::Toml(e) => write!(f, "invalid talon.toml: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl CompilerConfig {
    pub fn new() -> Self {
        CompilerConfig::default()
    }

    /// Loads `talon.toml` from `dir` if present; returns the default
    /// configuration otherwise (a missing project file is not an error —
    /// `talonc` works fine on a single loose source file).
    pub fn load_from_dir(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join("talon.toml");
        if !path.exists() {
            return Ok(CompilerConfig::default());
        }
        let text = std::fs::read_to_string(&path).map_err(ConfigError::Io)?;
        toml::from_str(&text).map_err(ConfigError::Toml)
    }

    pub fn with_optimization(mut self, level: OptimizationLevel) -> Self {
        self.optimization = level;
        self
    }

    pub fn with_import_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.import_search_paths.push(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_optimization_is_o1() {
        assert_eq!(CompilerConfig::new().optimization, OptimizationLevel::O1);
    }

    #[test]
    fn parses_cli_optimization_flags() {
        assert_eq!(OptimizationLevel::parse("0"), Some(OptimizationLevel::O0));
        assert_eq!(OptimizationLevel::parse("fast"), Some(OptimizationLevel::Ofast));
        assert_eq!(OptimizationLevel::parse("bogus"), None);
    }

    #[test]
    fn missing_talon_toml_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CompilerConfig::load_from_dir(dir.path()).unwrap();
        assert_eq!(config.optimization, OptimizationLevel::O1);
    }

    #[test]
    fn loads_talon_toml_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("talon.toml"), "optimization = \"O2\"\nno_typecheck = false\n").unwrap();
        let config = CompilerConfig::load_from_dir(dir.path()).unwrap();
        assert_eq!(config.optimization, OptimizationLevel::O2);
    }
}
