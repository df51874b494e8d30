//! Talon Compiler Library.
//!
//! Owns the full pipeline described by spec §2: lex -> parse -> splice
//! `use` imports -> type-check -> monomorphize -> native codegen -> PE
//! write, plus `-S/--obj` and `--link` variants that stop at / resume
//! from the object-file boundary (spec §6, §4.11).
//!
//! Grounded in the teacher's `seqc` library root (`compile_file_with_config`
//! as the single public entry point, a `CompilerConfig` threaded through
//! every phase) generalized from "parse -> typecheck -> codegen to LLVM
//! IR -> shell out to clang" to "parse -> splice imports -> typecheck ->
//! monomorphize -> emit x64 directly -> write PE" with no external
//! toolchain dependency.

pub mod ast;
pub mod codegen;
pub mod config;
pub mod lexer;
pub mod linker;
pub mod monomorphize;
pub mod objfile;
pub mod parser;
pub mod symtab;
pub mod typechecker;
pub mod types;

pub use ast::Program;
pub use config::{CompilerConfig, OptimizationLevel, OutputKind};
pub use typechecker::TypeChecker;
pub use types::{Type, TypeRegistry};

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use talon_core::{Diagnostic, SourceLocation};

#[derive(Debug)]
pub enum DriverError {
    Io { path: PathBuf, source: std::io::Error },
    Lex(lexer::LexError),
    /// Spec §6: "Circular imports (A imports B imports A) are detected via
    /// a chain stack and reported as an error citing the full cycle path."
    CircularImport { cycle: Vec<PathBuf> },
    TypeCheckFailed { diagnostics: Vec<Diagnostic> },
    Codegen(codegen::CodegenError),
    Link(linker::LinkError),
    Obj(objfile::ObjError),
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverError::Io { path, source } => write!(f, "{}: {source}", path.display()),
            DriverError::Lex(e) => write!(f, "{e}"),
            DriverError::CircularImport { cycle } => {
                let path = cycle.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(" -> ");
                write!(f, "Circular import detected: {path}")
            }
            DriverError::TypeCheckFailed { diagnostics } => {
                for d in diagnostics {
                    writeln!(f, "{}", d.render(None))?;
                }
                write!(f, "compilation aborted: type errors present")
            }
            DriverError::Codegen(e) => write!(f, "{e}"),
            DriverError::Link(e) => write!(f, "{e}"),
            DriverError::Obj(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for DriverError {}

impl From<codegen::CodegenError> for DriverError {
    fn from(e: codegen::CodegenError) -> Self {
        DriverError::Codegen(e)
    }
}

impl From<linker::LinkError> for DriverError {
    fn from(e: linker::LinkError) -> Self {
        DriverError::Link(e)
    }
}

impl From<objfile::ObjError> for DriverError {
    fn from(e: objfile::ObjError) -> Self {
        DriverError::Obj(e)
    }
}

/// Reads and parses one source file, recursively splicing `use "path":`
/// imports in at the import site (spec §6 "Import statement semantics").
/// `chain` tracks the in-progress import stack for cycle detection;
/// `visited` tracks already-spliced files so a non-cyclic revisit is
/// skipped silently, exactly as spec §6 requires.
fn load_and_splice(path: &Path, search_paths: &[PathBuf], chain: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<Vec<ast::Stmt>, DriverError> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if let Some(pos) = chain.iter().position(|p| p == &canonical) {
        let mut cycle: Vec<PathBuf> = chain[pos..].to_vec();
        cycle.push(canonical);
        return Err(DriverError::CircularImport { cycle });
    }
    if !visited.insert(canonical.clone()) {
        return Ok(Vec::new());
    }

    let src = std::fs::read_to_string(path).map_err(|source| DriverError::Io { path: path.to_path_buf(), source })?;
    let (program, _parse_errors) = parser::parse_source(&src, path.to_path_buf()).map_err(DriverError::Lex)?;

    chain.push(canonical);
    let mut spliced = Vec::with_capacity(program.statements.len());
    for stmt in program.statements {
        if let ast::Stmt::Import { path: import_path, location } = &stmt {
            let resolved = resolve_import_path(path, import_path, search_paths, location)?;
            let nested = load_and_splice(&resolved, search_paths, chain, visited)?;
            spliced.extend(nested);
        } else {
            spliced.push(stmt);
        }
    }
    chain.pop();
    Ok(spliced)
}

fn resolve_import_path(importing_file: &Path, import_path: &str, search_paths: &[PathBuf], location: &SourceLocation) -> Result<PathBuf, DriverError> {
    let base_dir = importing_file.parent().unwrap_or_else(|| Path::new("."));
    let direct = base_dir.join(import_path);
    if direct.exists() {
        return Ok(direct);
    }
    for dir in search_paths {
        let candidate = dir.join(import_path);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(DriverError::Io {
        path: PathBuf::from(import_path),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, format!("import not found (referenced at {location})")),
    })
}

/// Parses `path`, splicing every `use` import, producing one flat
/// [`Program`].
pub fn load_program(path: &Path, config: &CompilerConfig) -> Result<Program, DriverError> {
    let mut chain = Vec::new();
    let mut visited = HashSet::new();
    let statements = load_and_splice(path, &config.import_search_paths, &mut chain, &mut visited)?;
    Ok(Program { statements })
}

pub struct CompiledModule {
    pub program: Program,
    pub types: TypeRegistry,
}

/// Runs lex -> parse -> splice -> type-check -> monomorphize (spec §2
/// pipeline, up to but not including codegen). Shared by `-c`, `-S`, and
/// the `-t/-a` debug dumps, which all need a fully checked program.
pub fn check_program(path: &Path, config: &CompilerConfig) -> Result<CompiledModule, DriverError> {
    let program = load_program(path, config)?;

    if config.no_typecheck {
        return Ok(CompiledModule { program, types: TypeRegistry::new() });
    }

    let result = TypeChecker::new().check(&program);
    if !result.ok() {
        return Err(DriverError::TypeCheckFailed { diagnostics: result.diagnostics.into_vec() });
    }

    let types = result.types;
    let program = monomorphize::monomorphize(&program, &result.generic_call_sites).map_err(|e| {
        DriverError::TypeCheckFailed { diagnostics: vec![Diagnostic::error(e.to_string(), SourceLocation::synthetic())] }
    })?;

    Ok(CompiledModule { program, types })
}

/// Spec §6 `-c/--compile`: compiles `path` straight to a native `.exe`.
pub fn compile_to_executable(path: &Path, config: &CompilerConfig) -> Result<Vec<u8>, DriverError> {
    let module = check_program(path, config)?;
    let image = codegen::generate(&module.program, &module.types)?;
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(dir: &std::path::Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_a_single_file_with_no_imports() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(dir.path(), "a.tln", "fn main():\n    return\n");
        let program = load_program(&path, &CompilerConfig::new()).unwrap();
        assert_eq!(program.statements.len(), 1);
    }

    #[test]
    fn splices_a_single_import_in_place() {
        let dir = tempfile::tempdir().unwrap();
        write_temp(dir.path(), "b.tln", "fn helper():\n    return\n");
        let a = write_temp(dir.path(), "a.tln", "use \"b.tln\"\nfn main():\n    return\n");
        let program = load_program(&a, &CompilerConfig::new()).unwrap();
        assert_eq!(program.statements.len(), 2);
    }

    #[test]
    fn non_cyclic_revisit_is_skipped_silently() {
        let dir = tempfile::tempdir().unwrap();
        write_temp(dir.path(), "c.tln", "fn shared():\n    return\n");
        write_temp(dir.path(), "b.tln", "use \"c.tln\"\nfn b_fn():\n    return\n");
        let a = write_temp(dir.path(), "a.tln", "use \"b.tln\"\nuse \"c.tln\"\nfn main():\n    return\n");
        let program = load_program(&a, &CompilerConfig::new()).unwrap();
        // shared (from b's import), b_fn, main -- c's second import is a no-op
        assert_eq!(program.statements.len(), 3);
    }

    #[test]
    fn circular_import_is_reported_with_the_full_cycle() {
        let dir = tempfile::tempdir().unwrap();
        write_temp(dir.path(), "b.tln", "use \"a.tln\"\nfn b_fn():\n    return\n");
        let a = write_temp(dir.path(), "a.tln", "use \"b.tln\"\nfn main():\n    return\n");
        let err = load_program(&a, &CompilerConfig::new()).unwrap_err();
        assert!(matches!(err, DriverError::CircularImport { .. }));
    }

    #[test]
    fn compiles_hello_world_to_a_pe_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(dir.path(), "hello.tln", "fn main():\n    println(\"Hello, world!\")\n");
        let image = compile_to_executable(&path, &CompilerConfig::new()).unwrap();
        assert_eq!(&image[0..2], b"MZ");
    }

    #[test]
    fn no_typecheck_skips_straight_to_codegen() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(dir.path(), "hello.tln", "fn main():\n    return\n");
        let config = CompilerConfig::new();
        let mut no_check = config.clone();
        no_check.no_typecheck = true;
        let module = check_program(&path, &no_check).unwrap();
        assert_eq!(module.program.statements.len(), 1);
    }
}
