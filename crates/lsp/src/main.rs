//! `talon-lsp` — a minimal Language Server Protocol front end for Talon.
//!
//! The LSP is an external collaborator to the native compilation core
//! (spec §1 "Out of scope"); this crate is specified only at its
//! interface (SPEC_FULL §2: "`talon-repl` and `talon-lsp` sit outside the
//! pipeline"). It runs the same lex -> parse -> type-check prefix the
//! `talonc` driver runs, and republishes whatever diagnostics come back as
//! LSP `Diagnostic`s on every document open/change — no completion,
//! hover, or go-to-definition, which the teacher's `seq-lsp` built on top
//! of a stack-effect inference pass that has no analogue here.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use tower_lsp::jsonrpc::Result as RpcResult;
use tower_lsp::lsp_types::*;
use tower_lsp::{Client, LanguageServer, LspService, Server};
use tracing::info;

use talonc::parser;
use talonc::typechecker::TypeChecker;
use talon_core::{Diagnostic as TalonDiagnostic, Level};

struct TalonLanguageServer {
    client: Client,
    documents: RwLock<HashMap<Url, String>>,
}

impl TalonLanguageServer {
    fn new(client: Client) -> Self {
        TalonLanguageServer { client, documents: RwLock::new(HashMap::new()) }
    }

    async fn publish_diagnostics(&self, uri: Url, text: &str) {
        let path = uri.to_file_path().unwrap_or_else(|_| PathBuf::from(uri.path()));
        let diagnostics = check_text(text, path);
        self.client.publish_diagnostics(uri, diagnostics, None).await;
    }
}

/// Runs lex -> parse -> type-check over `text` and converts every
/// diagnostic/error into an LSP `Diagnostic`. Lex/parse errors are fatal
/// (spec §7) so they short-circuit before type-checking runs.
fn check_text(text: &str, path: PathBuf) -> Vec<Diagnostic> {
    let (program, parse_errors) = match parser::parse_source(text, path) {
        Ok(result) => result,
        Err(e) => return vec![to_lsp_diagnostic_from_location(e.to_string(), talon_core::SourceLocation::synthetic(), DiagnosticSeverity::ERROR)],
    };

    if !parse_errors.is_empty() {
        return parse_errors.into_iter().map(|e| to_lsp_diagnostic_from_location(e.to_string(), talon_core::SourceLocation::synthetic(), DiagnosticSeverity::ERROR)).collect();
    }

    let result = TypeChecker::new().check(&program);
    result.diagnostics.iter().map(to_lsp_diagnostic).collect()
}

fn to_lsp_diagnostic(d: &TalonDiagnostic) -> Diagnostic {
    let severity = match d.level {
        Level::Error => DiagnosticSeverity::ERROR,
        Level::Warning => DiagnosticSeverity::WARNING,
        Level::Note => DiagnosticSeverity::HINT,
    };
    to_lsp_diagnostic_from_location(d.message.clone(), d.location.clone(), severity)
}

fn to_lsp_diagnostic_from_location(message: String, location: talon_core::SourceLocation, severity: DiagnosticSeverity) -> Diagnostic {
    // LSP positions are 0-based; our source locations are 1-based (spec §3).
    let line = location.line.saturating_sub(1);
    let character = location.column.saturating_sub(1);
    let position = Position::new(line, character);
    Diagnostic {
        range: Range::new(position, Position::new(line, character + 1)),
        severity: Some(severity),
        source: Some("talonc".to_string()),
        message,
        ..Default::default()
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for TalonLanguageServer {
    async fn initialize(&self, _params: InitializeParams) -> RpcResult<InitializeResult> {
        Ok(InitializeResult {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Kind(TextDocumentSyncKind::FULL)),
                ..Default::default()
            },
            server_info: Some(ServerInfo { name: "talon-lsp".to_string(), version: Some(env!("CARGO_PKG_VERSION").to_string()) }),
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        info!("talon-lsp initialized");
    }

    async fn shutdown(&self) -> RpcResult<()> {
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let uri = params.text_document.uri;
        let text = params.text_document.text;
        self.documents.write().unwrap().insert(uri.clone(), text.clone());
        self.publish_diagnostics(uri, &text).await;
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let uri = params.text_document.uri;
        // `TextDocumentSyncKind::FULL` guarantees exactly one change event
        // carrying the entire new document text.
        let Some(change) = params.content_changes.into_iter().next() else { return };
        self.documents.write().unwrap().insert(uri.clone(), change.text.clone());
        self.publish_diagnostics(uri, &change.text).await;
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        self.documents.write().unwrap().remove(&params.text_document.uri);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    let (service, socket) = LspService::new(TalonLanguageServer::new);
    Server::new(stdin, stdout, socket).serve(service).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_program_has_no_diagnostics() {
        let diags = check_text("fn main():\n    return\n", PathBuf::from("t.tln"));
        assert!(diags.is_empty());
    }

    #[test]
    fn unresolved_identifier_produces_a_diagnostic() {
        let diags = check_text("fn main():\n    return unknown_name\n", PathBuf::from("t.tln"));
        assert!(!diags.is_empty());
    }

    #[test]
    fn diagnostic_positions_are_zero_based() {
        let diags = check_text("fn main():\n    return unknown_name\n", PathBuf::from("t.tln"));
        let d = &diags[0];
        assert_eq!(d.range.start.line, 1);
    }
}
