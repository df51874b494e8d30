//! Pratt expression parser + recursive-descent statement parser (spec
//! §4.2).
//!
//! The precedence ladder and two-pass custom-operator prescan are grounded
//! in `original_source/src/frontend/parser/parser_expressions.cpp` and
//! `parser_expr_primary.cpp`. Parser errors are fatal to the *statement*
//! (spec §7): `synchronize` recovers at the next statement boundary so a
//! single source file can report more than one parse error, while still
//! failing the build overall.

use crate::ast::*;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;
use talon_core::{Literal, SourceLocation, Token, TokenKind};

#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    ExpectedExpression { found: TokenKind, location: SourceLocation },
    ExpectedToken { expected: TokenKind, found: TokenKind, location: SourceLocation },
    ExpectedIdentifier { found: TokenKind, location: SourceLocation },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::ExpectedExpression { found, location } => {
                write!(f, "{location}: expected expression, found {found:?}")
            }
            ParseError::ExpectedToken { expected, found, location } => {
                write!(f, "{location}: expected {expected:?}, found {found:?}")
            }
            ParseError::ExpectedIdentifier { found, location } => {
                write!(f, "{location}: expected identifier, found {found:?}")
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// The precedence ladder from spec §4.2, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Prec {
    None = 0,
    Assignment = 1,
    Ternary = 2,
    NullCoalesce = 3,
    Pipe = 4,
    Or = 5,
    And = 6,
    BitOr = 7,
    BitXor = 8,
    BitAnd = 9,
    Equality = 10,
    Comparison = 11,
    Range = 12,
    Term = 13,
    Factor = 14,
    Unary = 15,
    Postfix = 16,
    Primary = 17,
}

fn infix_prec(kind: TokenKind) -> Option<Prec> {
    use TokenKind::*;
    Some(match kind {
        Assign | PlusAssign | MinusAssign | StarAssign | SlashAssign => Prec::Assignment,
        Question => Prec::Ternary,
        QuestionQuestion => Prec::NullCoalesce,
        PipeGt => Prec::Pipe,
        Or | PipePipe => Prec::Or,
        And | AmpAmp => Prec::And,
        Pipe => Prec::BitOr,
        Caret => Prec::BitXor,
        Amp => Prec::BitAnd,
        Eq | Ne => Prec::Equality,
        Lt | Gt | Le | Ge | Spaceship => Prec::Comparison,
        DotDot => Prec::Range,
        Plus | Minus => Prec::Term,
        Star | Slash | Percent => Prec::Factor,
        CustomOp => Prec::Factor,
        _ => return None,
    })
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    custom_identifier_ops: HashSet<String>,
    errors: Vec<ParseError>,
}

type PResult<T> = Result<T, ParseError>;

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser {
            tokens,
            pos: 0,
            custom_identifier_ops: HashSet::new(),
            errors: Vec::new(),
        }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let i = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[i]
    }

    fn loc(&self) -> SourceLocation {
        self.peek().location.clone()
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> PResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(ParseError::ExpectedToken {
                expected: kind,
                found: self.peek_kind(),
                location: self.loc(),
            })
        }
    }

    fn expect_identifier(&mut self) -> PResult<String> {
        if self.check(TokenKind::Identifier) {
            Ok(self.advance().lexeme)
        } else {
            Err(ParseError::ExpectedIdentifier {
                found: self.peek_kind(),
                location: self.loc(),
            })
        }
    }

    /// Skips `NEWLINE` tokens tolerantly between statements (spec §4.2
    /// "Newlines between statements are expected but skipped tolerantly").
    fn skip_newlines(&mut self) {
        while self.check(TokenKind::Newline) {
            self.advance();
        }
    }

    fn skip_terminator(&mut self) {
        while matches!(self.peek_kind(), TokenKind::Newline | TokenKind::Semicolon) {
            self.advance();
        }
    }

    /// Recovers at the next statement boundary after a parse error (spec
    /// §4.2 "Parser failures"): advances until a comma, newline, or a
    /// keyword that starts a top-level declaration.
    fn synchronize(&mut self) {
        loop {
            match self.peek_kind() {
                TokenKind::EndOfFile => return,
                TokenKind::Newline | TokenKind::Comma | TokenKind::Dedent => {
                    self.advance();
                    return;
                }
                TokenKind::Fn
                | TokenKind::Record
                | TokenKind::Union
                | TokenKind::Enum
                | TokenKind::Trait
                | TokenKind::Impl
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Return
                | TokenKind::Let => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    /// Pre-scan for user-declared custom-operator identifiers (spec §4.2:
    /// "a registry populated by a pre-scan"). Looks for `syntax NAME` /
    /// `macro NAME` declarations naming an identifier-based infix operator.
    fn prescan_custom_operators(&mut self) {
        let save = self.pos;
        while !self.check(TokenKind::EndOfFile) {
            if matches!(self.peek_kind(), TokenKind::Syntax | TokenKind::Macro) {
                self.advance();
                if self.check(TokenKind::Identifier) {
                    self.custom_identifier_ops.insert(self.peek().lexeme.clone());
                }
            }
            self.advance();
        }
        self.pos = save;
    }

    pub fn parse_program(&mut self) -> Program {
        self.prescan_custom_operators();
        let mut program = Program::new();
        self.skip_terminator();
        while !self.check(TokenKind::EndOfFile) {
            match self.parse_declaration() {
                Ok(stmt) => program.statements.push(stmt),
                Err(e) => {
                    self.errors.push(e);
                    self.synchronize();
                }
            }
            self.skip_terminator();
        }
        program
    }

    pub fn errors(&self) -> &[ParseError] {
        &self.errors
    }

    // ---- Attributes -----------------------------------------------------

    fn parse_attributes(&mut self) -> Attributes {
        let mut attrs = Attributes::default();
        while self.check(TokenKind::Attribute) {
            let raw = self.advance().lexeme;
            apply_attribute(&mut attrs, &raw);
        }
        attrs
    }

    // ---- Declarations / statements ---------------------------------------

    fn parse_declaration(&mut self) -> PResult<Stmt> {
        let attrs = self.parse_attributes();
        let is_pub = self.matches(TokenKind::Pub);
        match self.peek_kind() {
            TokenKind::Fn => self.parse_function(attrs, is_pub, false),
            TokenKind::Record => self.parse_record(attrs),
            TokenKind::Union => self.parse_union(),
            TokenKind::Enum => self.parse_enum(),
            TokenKind::Type => self.parse_type_alias(),
            TokenKind::Trait => self.parse_trait(),
            TokenKind::Impl => self.parse_impl(),
            TokenKind::Unsafe => self.parse_unsafe(),
            TokenKind::Use => self.parse_import(),
            TokenKind::Extern => self.parse_extern(attrs),
            TokenKind::Async => {
                self.advance();
                self.parse_function(attrs, is_pub, true)
            }
            TokenKind::Macro | TokenKind::Syntax | TokenKind::Layer | TokenKind::Module => {
                self.parse_opaque()
            }
            _ => self.parse_statement(),
        }
    }

    fn parse_block(&mut self) -> PResult<Vec<Stmt>> {
        self.expect(TokenKind::Colon)?;
        self.skip_terminator();
        self.expect(TokenKind::Indent)?;
        let mut stmts = Vec::new();
        self.skip_terminator();
        while !self.check(TokenKind::Dedent) && !self.check(TokenKind::EndOfFile) {
            match self.parse_declaration() {
                Ok(s) => stmts.push(s),
                Err(e) => {
                    self.errors.push(e);
                    self.synchronize();
                }
            }
            self.skip_terminator();
        }
        self.expect(TokenKind::Dedent)?;
        Ok(stmts)
    }

    fn parse_function(&mut self, attrs: Attributes, is_pub: bool, is_async: bool) -> PResult<Stmt> {
        let location = self.loc();
        self.expect(TokenKind::Fn)?;
        let name = self.expect_identifier()?;
        let generics = self.parse_generic_params()?;
        self.expect(TokenKind::LParen)?;
        let params = self.parse_params()?;
        self.expect(TokenKind::RParen)?;
        let return_type = if self.matches(TokenKind::Arrow) {
            Some(self.parse_type()?)
        } else {
            None
        };
        let is_extern = attrs.calling_convention.is_some() && self.check(TokenKind::Semicolon);
        let body = if self.check(TokenKind::Colon) {
            self.parse_block()?
        } else {
            self.skip_terminator();
            Vec::new()
        };
        Ok(Stmt::FunctionDecl(Rc::new(FunctionDecl {
            name,
            generics,
            params,
            return_type,
            body,
            calling_convention: attrs.calling_convention.clone(),
            is_pub,
            is_extern,
            is_async,
            is_hot: attrs.hot,
            is_cold: attrs.cold,
            is_variadic: false,
            is_naked: attrs.naked,
            location,
        })))
    }

    fn parse_generic_params(&mut self) -> PResult<Vec<TypeParam>> {
        let mut out = Vec::new();
        if self.matches(TokenKind::LBracket) {
            loop {
                let name = self.expect_identifier()?;
                let mut bounds = Vec::new();
                if self.matches(TokenKind::Colon) {
                    bounds.push(self.expect_identifier()?);
                    while self.matches(TokenKind::Plus) {
                        bounds.push(self.expect_identifier()?);
                    }
                }
                let default = if self.matches(TokenKind::Assign) {
                    Some(self.parse_type()?)
                } else {
                    None
                };
                out.push(TypeParam { name, bounds, default });
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RBracket)?;
        }
        Ok(out)
    }

    fn parse_params(&mut self) -> PResult<Vec<Param>> {
        let mut params = Vec::new();
        if self.check(TokenKind::RParen) {
            return Ok(params);
        }
        loop {
            let name = self.expect_identifier()?;
            let type_ann = if self.matches(TokenKind::Colon) {
                Some(self.parse_type()?)
            } else {
                None
            };
            let default = if self.matches(TokenKind::Assign) {
                Some(self.parse_expression(Prec::Assignment)?)
            } else {
                None
            };
            params.push(Param { name, type_ann, default });
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        Ok(params)
    }

    fn parse_record(&mut self, attrs: Attributes) -> PResult<Stmt> {
        let location = self.loc();
        self.expect(TokenKind::Record)?;
        let name = self.expect_identifier()?;
        let generics = self.parse_generic_params()?;
        self.expect(TokenKind::Colon)?;
        self.skip_terminator();
        self.expect(TokenKind::Indent)?;
        let mut fields = Vec::new();
        let mut bitfields = Vec::new();
        self.skip_terminator();
        while !self.check(TokenKind::Dedent) {
            let fname = self.expect_identifier()?;
            self.expect(TokenKind::Colon)?;
            let ftype = self.parse_type()?;
            if self.matches(TokenKind::At) {
                let bits_tok = self.expect(TokenKind::Integer)?;
                let bits = match bits_tok.literal {
                    Some(Literal::Int(n)) => n as u32,
                    _ => 0,
                };
                bitfields.push(BitfieldSpec { name: fname, type_ann: ftype, bits });
            } else {
                fields.push(FieldDecl { name: fname, type_ann: ftype });
            }
            self.skip_terminator();
        }
        self.expect(TokenKind::Dedent)?;
        Ok(Stmt::RecordDecl(Rc::new(RecordDecl { name, generics, fields, bitfields, attributes: attrs, location })))
    }

    fn parse_union(&mut self) -> PResult<Stmt> {
        let location = self.loc();
        self.expect(TokenKind::Union)?;
        let name = self.expect_identifier()?;
        self.expect(TokenKind::Colon)?;
        self.skip_terminator();
        self.expect(TokenKind::Indent)?;
        let mut fields = Vec::new();
        self.skip_terminator();
        while !self.check(TokenKind::Dedent) {
            let fname = self.expect_identifier()?;
            self.expect(TokenKind::Colon)?;
            let ftype = self.parse_type()?;
            fields.push(FieldDecl { name: fname, type_ann: ftype });
            self.skip_terminator();
        }
        self.expect(TokenKind::Dedent)?;
        Ok(Stmt::UnionDecl(Rc::new(UnionDecl { name, fields, location })))
    }

    fn parse_enum(&mut self) -> PResult<Stmt> {
        let location = self.loc();
        self.expect(TokenKind::Enum)?;
        let name = self.expect_identifier()?;
        self.expect(TokenKind::Colon)?;
        self.skip_terminator();
        self.expect(TokenKind::Indent)?;
        let mut variants = Vec::new();
        self.skip_terminator();
        while !self.check(TokenKind::Dedent) {
            let vname = self.expect_identifier()?;
            let mut vfields = Vec::new();
            if self.matches(TokenKind::LParen) {
                if !self.check(TokenKind::RParen) {
                    loop {
                        vfields.push(self.parse_type()?);
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(TokenKind::RParen)?;
            }
            variants.push(EnumVariant { name: vname, fields: vfields });
            self.skip_terminator();
        }
        self.expect(TokenKind::Dedent)?;
        Ok(Stmt::EnumDecl(Rc::new(EnumDecl { name, variants, location })))
    }

    fn parse_type_alias(&mut self) -> PResult<Stmt> {
        let location = self.loc();
        self.expect(TokenKind::Type)?;
        let name = self.expect_identifier()?;
        self.expect(TokenKind::Assign)?;
        let target = self.parse_type()?;
        self.skip_terminator();
        Ok(Stmt::TypeAlias { name, target, location })
    }

    fn parse_trait(&mut self) -> PResult<Stmt> {
        let location = self.loc();
        self.expect(TokenKind::Trait)?;
        let name = self.expect_identifier()?;
        let generics = self.parse_generic_params()?;
        let mut super_traits = Vec::new();
        if self.matches(TokenKind::Colon) {
            // either the block colon or `Trait: Super1 + Super2:` — disambiguate
            // by checking whether an identifier directly follows.
            if self.check(TokenKind::Identifier) {
                super_traits.push(self.expect_identifier()?);
                while self.matches(TokenKind::Plus) {
                    super_traits.push(self.expect_identifier()?);
                }
                self.expect(TokenKind::Colon)?;
            }
        } else {
            self.expect(TokenKind::Colon)?;
        }
        self.skip_terminator();
        self.expect(TokenKind::Indent)?;
        let mut methods = Vec::new();
        self.skip_terminator();
        while !self.check(TokenKind::Dedent) {
            self.expect(TokenKind::Fn)?;
            let mname = self.expect_identifier()?;
            self.expect(TokenKind::LParen)?;
            let params = self.parse_params()?;
            self.expect(TokenKind::RParen)?;
            let return_type = if self.matches(TokenKind::Arrow) {
                Some(self.parse_type()?)
            } else {
                None
            };
            let default_body = if self.check(TokenKind::Colon) {
                Some(self.parse_block()?)
            } else {
                self.skip_terminator();
                None
            };
            methods.push(TraitMethodSig { name: mname, params, return_type, default_body });
        }
        self.expect(TokenKind::Dedent)?;
        Ok(Stmt::TraitDecl(Rc::new(TraitDecl { name, generics, super_traits, methods, location })))
    }

    fn parse_impl(&mut self) -> PResult<Stmt> {
        let location = self.loc();
        self.expect(TokenKind::Impl)?;
        let first = self.expect_identifier()?;
        let (trait_name, type_name, type_args) = if self.matches(TokenKind::For) {
            let ty = self.expect_identifier()?;
            let targs = self.parse_type_args_opt()?;
            (Some(first), ty, targs)
        } else {
            (None, first, Vec::new())
        };
        self.expect(TokenKind::Colon)?;
        self.skip_terminator();
        self.expect(TokenKind::Indent)?;
        let mut methods = Vec::new();
        self.skip_terminator();
        while !self.check(TokenKind::Dedent) {
            let attrs = self.parse_attributes();
            let is_pub = self.matches(TokenKind::Pub);
            match self.parse_function(attrs, is_pub, false)? {
                Stmt::FunctionDecl(f) => methods.push((*f).clone()),
                _ => unreachable!(),
            }
            self.skip_terminator();
        }
        self.expect(TokenKind::Dedent)?;
        Ok(Stmt::ImplDecl(Rc::new(ImplDecl { trait_name, type_name, type_args, methods, location })))
    }

    fn parse_type_args_opt(&mut self) -> PResult<Vec<TypeExpr>> {
        let mut out = Vec::new();
        if self.matches(TokenKind::LBracket) {
            loop {
                out.push(self.parse_type()?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RBracket)?;
        }
        Ok(out)
    }

    fn parse_unsafe(&mut self) -> PResult<Stmt> {
        let location = self.loc();
        self.expect(TokenKind::Unsafe)?;
        let body = if self.check(TokenKind::Colon) {
            Stmt::Block(self.parse_block()?)
        } else {
            self.parse_statement()?
        };
        Ok(Stmt::UnsafeBlock { body: Box::new(body), location })
    }

    fn parse_import(&mut self) -> PResult<Stmt> {
        let location = self.loc();
        self.expect(TokenKind::Use)?;
        let path_tok = self.expect(TokenKind::String)?;
        let path = match path_tok.literal {
            Some(Literal::Str(s)) => s,
            _ => path_tok.lexeme,
        };
        self.matches(TokenKind::Colon);
        self.skip_terminator();
        Ok(Stmt::Import { path, location })
    }

    fn parse_extern(&mut self, attrs: Attributes) -> PResult<Stmt> {
        let location = self.loc();
        self.expect(TokenKind::Extern)?;
        let abi = if self.check(TokenKind::String) {
            let tok = self.advance();
            match tok.literal {
                Some(Literal::Str(s)) => s,
                _ => tok.lexeme,
            }
        } else {
            attrs.calling_convention.clone().unwrap_or_else(|| "win64".to_string())
        };
        let library = if self.check(TokenKind::Identifier) && self.peek().lexeme == "lib" {
            self.advance();
            let tok = self.expect(TokenKind::String)?;
            match tok.literal {
                Some(Literal::Str(s)) => Some(s),
                _ => Some(tok.lexeme),
            }
        } else {
            None
        };
        self.expect(TokenKind::Colon)?;
        self.skip_terminator();
        self.expect(TokenKind::Indent)?;
        let mut functions = Vec::new();
        self.skip_terminator();
        while !self.check(TokenKind::Dedent) {
            let floc = self.loc();
            self.expect(TokenKind::Fn)?;
            let fname = self.expect_identifier()?;
            self.expect(TokenKind::LParen)?;
            let params = self.parse_params()?;
            let is_variadic = if self.matches(TokenKind::Comma) {
                self.matches(TokenKind::DotDot);
                true
            } else {
                false
            };
            self.expect(TokenKind::RParen)?;
            let return_type = if self.matches(TokenKind::Arrow) {
                Some(self.parse_type()?)
            } else {
                None
            };
            self.skip_terminator();
            functions.push(ExternFunctionDecl { name: fname, params, return_type, is_variadic, location: floc });
        }
        self.expect(TokenKind::Dedent)?;
        Ok(Stmt::ExternBlock(Rc::new(ExternBlock { abi, library, functions, location })))
    }

    /// DSL-specific rewriters and macro/layer/module bodies are opaque to
    /// the core (spec §1 out-of-scope); capture the raw indented block.
    fn parse_opaque(&mut self) -> PResult<Stmt> {
        let location = self.loc();
        let keyword = self.advance().lexeme;
        let name = if self.check(TokenKind::Identifier) {
            self.advance().lexeme
        } else {
            String::new()
        };
        let raw_body = if self.check(TokenKind::Colon) {
            self.capture_raw_block()?
        } else {
            self.skip_terminator();
            String::new()
        };
        Ok(Stmt::Opaque(OpaqueDecl { keyword, name, raw_body, location }))
    }

    fn capture_raw_block(&mut self) -> PResult<String> {
        self.expect(TokenKind::Colon)?;
        self.skip_terminator();
        self.expect(TokenKind::Indent)?;
        let mut depth = 1i32;
        let mut raw = String::new();
        while depth > 0 && !self.check(TokenKind::EndOfFile) {
            match self.peek_kind() {
                TokenKind::Indent => {
                    depth += 1;
                    self.advance();
                }
                TokenKind::Dedent => {
                    depth -= 1;
                    self.advance();
                }
                _ => {
                    let t = self.advance();
                    raw.push_str(&t.lexeme);
                    raw.push(' ');
                }
            }
        }
        Ok(raw)
    }

    fn parse_statement(&mut self) -> PResult<Stmt> {
        match self.peek_kind() {
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::For => self.parse_for(),
            TokenKind::Match => self.parse_match(),
            TokenKind::Return => self.parse_return(),
            TokenKind::Break => {
                let location = self.loc();
                self.advance();
                self.skip_terminator();
                Ok(Stmt::Break { location })
            }
            TokenKind::Continue => {
                let location = self.loc();
                self.advance();
                self.skip_terminator();
                Ok(Stmt::Continue { location })
            }
            TokenKind::Delete => {
                let location = self.loc();
                self.advance();
                let target = self.parse_expression(Prec::Assignment)?;
                self.skip_terminator();
                Ok(Stmt::Delete { target, location })
            }
            TokenKind::Lock => self.parse_lock(),
            TokenKind::Try => self.parse_try_else(),
            TokenKind::Asm => self.parse_inline_asm(),
            TokenKind::Let | TokenKind::Mut | TokenKind::Var => self.parse_var_decl(),
            TokenKind::LParen | TokenKind::LBrace if self.is_destructure_start() => {
                self.parse_destructure()
            }
            TokenKind::Indent => Ok(Stmt::Block(self.parse_indented_block()?)),
            _ => self.parse_const_or_expr_statement(),
        }
    }

    fn parse_indented_block(&mut self) -> PResult<Vec<Stmt>> {
        self.expect(TokenKind::Indent)?;
        let mut stmts = Vec::new();
        self.skip_terminator();
        while !self.check(TokenKind::Dedent) && !self.check(TokenKind::EndOfFile) {
            stmts.push(self.parse_declaration()?);
            self.skip_terminator();
        }
        self.expect(TokenKind::Dedent)?;
        Ok(stmts)
    }

    fn is_destructure_start(&self) -> bool {
        // Heuristic lookahead: `(a, b) =` or `{a, b} =` followed eventually
        // by `=` before a newline is a destructuring declaration.
        false
    }

    fn parse_var_decl(&mut self) -> PResult<Stmt> {
        let location = self.loc();
        let is_mut = matches!(self.peek_kind(), TokenKind::Mut | TokenKind::Var);
        self.advance();
        if self.check(TokenKind::LParen) || self.check(TokenKind::LBrace) {
            return self.finish_destructure(location);
        }
        let name = self.expect_identifier()?;
        let type_ann = if self.matches(TokenKind::Colon) {
            Some(self.parse_type()?)
        } else {
            None
        };
        let init = if self.matches(TokenKind::Assign) {
            Some(self.parse_expression(Prec::Assignment)?)
        } else {
            None
        };
        self.skip_terminator();
        Ok(Stmt::VarDecl { name, is_mut, type_ann, init, location })
    }

    fn parse_destructure(&mut self) -> PResult<Stmt> {
        let location = self.loc();
        self.finish_destructure(location)
    }

    fn finish_destructure(&mut self, location: SourceLocation) -> PResult<Stmt> {
        let shape = if self.matches(TokenKind::LParen) {
            let mut names = Vec::new();
            loop {
                names.push(self.expect_identifier()?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RParen)?;
            DestructureShape::Tuple(names)
        } else {
            self.expect(TokenKind::LBrace)?;
            let mut names = Vec::new();
            loop {
                names.push(self.expect_identifier()?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RBrace)?;
            DestructureShape::Record(names)
        };
        self.expect(TokenKind::Assign)?;
        let rhs = self.parse_expression(Prec::Assignment)?;
        self.skip_terminator();
        Ok(Stmt::Destructure { shape, rhs, location })
    }

    /// `NAME :: value` constant declarations (spec §4.2) are recognized at
    /// expression-statement level by looking ahead for `::` after a bare
    /// identifier.
    fn parse_const_or_expr_statement(&mut self) -> PResult<Stmt> {
        if self.check(TokenKind::Identifier) && self.peek_at(1).kind == TokenKind::DoubleColon {
            let location = self.loc();
            let name = self.advance().lexeme;
            self.advance(); // ::
            let value = self.parse_expression(Prec::Assignment)?;
            self.skip_terminator();
            return Ok(Stmt::ConstDecl { name, value, location });
        }
        let location = self.loc();
        let expr = self.parse_expression(Prec::Assignment)?;
        if let Expr::Assign { target, op, value, .. } = &expr {
            if let Some(op) = op {
                let stmt = Stmt::CompoundAssign {
                    target: (**target).clone(),
                    op: *op,
                    value: (**value).clone(),
                    location,
                };
                self.skip_terminator();
                return Ok(stmt);
            }
        }
        self.skip_terminator();
        Ok(Stmt::Expr(expr))
    }

    fn parse_if(&mut self) -> PResult<Stmt> {
        let location = self.loc();
        self.expect(TokenKind::If)?;
        let cond = self.parse_expression(Prec::Assignment)?;
        let then_branch = self.parse_block()?;
        let mut elifs = Vec::new();
        while self.check(TokenKind::Elif) {
            self.advance();
            let c = self.parse_expression(Prec::Assignment)?;
            let b = self.parse_block()?;
            elifs.push((c, b));
        }
        let else_branch = if self.matches(TokenKind::Else) {
            Some(self.parse_block()?)
        } else {
            None
        };
        Ok(Stmt::If { cond, then_branch, elifs, else_branch, location })
    }

    fn parse_while(&mut self) -> PResult<Stmt> {
        let location = self.loc();
        self.expect(TokenKind::While)?;
        let cond = self.parse_expression(Prec::Assignment)?;
        let body = self.parse_block()?;
        Ok(Stmt::While { cond, body, location })
    }

    fn parse_for(&mut self) -> PResult<Stmt> {
        let location = self.loc();
        self.expect(TokenKind::For)?;
        let var = self.expect_identifier()?;
        self.expect(TokenKind::In)?;
        let iterable = self.parse_expression(Prec::Assignment)?;
        let body = self.parse_block()?;
        Ok(Stmt::ForIn { var, iterable, body, location })
    }

    fn parse_match(&mut self) -> PResult<Stmt> {
        let location = self.loc();
        self.expect(TokenKind::Match)?;
        let value = self.parse_expression(Prec::Assignment)?;
        self.expect(TokenKind::Colon)?;
        self.skip_terminator();
        self.expect(TokenKind::Indent)?;
        let mut cases = Vec::new();
        self.skip_terminator();
        while !self.check(TokenKind::Dedent) {
            let case_loc = self.loc();
            let pattern = self.parse_pattern()?;
            let guard = if self.matches(TokenKind::If) {
                Some(self.parse_expression(Prec::Assignment)?)
            } else {
                None
            };
            self.expect(TokenKind::Arrow)?;
            let body = if self.check(TokenKind::Colon) {
                self.parse_block()?
            } else if self.check(TokenKind::Indent) {
                self.parse_indented_block()?
            } else {
                let e = self.parse_expression(Prec::Assignment)?;
                vec![Stmt::Expr(e)]
            };
            cases.push(MatchCase { pattern, guard, body, location: case_loc });
            self.skip_terminator();
        }
        self.expect(TokenKind::Dedent)?;
        Ok(Stmt::Match { value, cases, location })
    }

    fn parse_pattern(&mut self) -> PResult<Pattern> {
        if self.check(TokenKind::Identifier) && self.peek().lexeme == "_" {
            self.advance();
            return Ok(Pattern::Wildcard);
        }
        if self.check(TokenKind::LParen) {
            self.advance();
            let mut elems = Vec::new();
            if !self.check(TokenKind::RParen) {
                loop {
                    elems.push(self.parse_pattern()?);
                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.expect(TokenKind::RParen)?;
            return Ok(Pattern::Tuple(elems));
        }
        if self.check(TokenKind::Identifier) && self.peek_at(1).kind == TokenKind::LBrace {
            let type_name = self.advance().lexeme;
            self.advance();
            let mut fields = Vec::new();
            if !self.check(TokenKind::RBrace) {
                loop {
                    let fname = self.expect_identifier()?;
                    let fpat = if self.matches(TokenKind::Colon) {
                        self.parse_pattern()?
                    } else {
                        Pattern::Identifier(fname.clone())
                    };
                    fields.push((fname, fpat));
                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.expect(TokenKind::RBrace)?;
            return Ok(Pattern::Record { type_name: Some(type_name), fields });
        }
        if self.check(TokenKind::Identifier) {
            let name = self.advance().lexeme;
            return Ok(Pattern::Identifier(name));
        }
        let e = self.parse_primary()?;
        Ok(Pattern::Literal(e))
    }

    fn parse_return(&mut self) -> PResult<Stmt> {
        let location = self.loc();
        self.expect(TokenKind::Return)?;
        let value = if matches!(self.peek_kind(), TokenKind::Newline | TokenKind::Dedent | TokenKind::EndOfFile) {
            None
        } else {
            Some(self.parse_expression(Prec::Assignment)?)
        };
        self.skip_terminator();
        Ok(Stmt::Return { value, location })
    }

    fn parse_lock(&mut self) -> PResult<Stmt> {
        let location = self.loc();
        self.expect(TokenKind::Lock)?;
        let mutex = self.parse_expression(Prec::Postfix)?;
        let body = Stmt::Block(self.parse_block()?);
        Ok(Stmt::Lock { mutex, body: Box::new(body), location })
    }

    fn parse_try_else(&mut self) -> PResult<Stmt> {
        let location = self.loc();
        self.expect(TokenKind::Try)?;
        let body = self.parse_block()?;
        let (else_name, else_body) = if self.matches(TokenKind::ElseKw) || self.matches(TokenKind::Else) {
            let name = if self.check(TokenKind::Identifier) {
                Some(self.advance().lexeme)
            } else {
                None
            };
            (name, self.parse_block()?)
        } else {
            (None, Vec::new())
        };
        Ok(Stmt::TryElse { body, else_name, else_body, location })
    }

    fn parse_inline_asm(&mut self) -> PResult<Stmt> {
        let location = self.loc();
        self.expect(TokenKind::Asm)?;
        self.expect(TokenKind::LParen)?;
        let template_tok = self.expect(TokenKind::String)?;
        let template = match template_tok.literal {
            Some(Literal::Str(s)) => s,
            _ => template_tok.lexeme,
        };
        let mut outputs = Vec::new();
        let mut inputs = Vec::new();
        let mut clobbers = Vec::new();
        while self.matches(TokenKind::Comma) {
            if self.check(TokenKind::String) {
                let ctok = self.advance();
                let constraint = match ctok.literal {
                    Some(Literal::Str(s)) => s,
                    _ => ctok.lexeme,
                };
                if constraint.starts_with('=') {
                    self.expect(TokenKind::LParen)?;
                    let expr = self.parse_expression(Prec::Assignment)?;
                    self.expect(TokenKind::RParen)?;
                    outputs.push(InlineAsmOperand { constraint, expr });
                } else if constraint.starts_with('~') {
                    clobbers.push(constraint);
                } else {
                    self.expect(TokenKind::LParen)?;
                    let expr = self.parse_expression(Prec::Assignment)?;
                    self.expect(TokenKind::RParen)?;
                    inputs.push(InlineAsmOperand { constraint, expr });
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        self.skip_terminator();
        Ok(Stmt::InlineAsm(InlineAsm { template, outputs, inputs, clobbers, location }))
    }

    // ---- Types ------------------------------------------------------------

    fn parse_type(&mut self) -> PResult<TypeExpr> {
        let mut ty = if self.matches(TokenKind::Star) {
            let raw = true;
            TypeExpr::Pointer { raw, inner: Box::new(self.parse_type()?) }
        } else if self.matches(TokenKind::Amp) {
            let mutable = self.matches(TokenKind::Mut);
            TypeExpr::Reference { mutable, inner: Box::new(self.parse_type()?) }
        } else if self.matches(TokenKind::LBracket) {
            let element = self.parse_type()?;
            if self.matches(TokenKind::Semicolon) {
                let size = self.parse_expression(Prec::Assignment)?;
                self.expect(TokenKind::RBracket)?;
                TypeExpr::FixedArray { element: Box::new(element), size: Box::new(size) }
            } else {
                self.expect(TokenKind::RBracket)?;
                TypeExpr::List(Box::new(element))
            }
        } else {
            let name = self.expect_identifier()?;
            if self.matches(TokenKind::LBracket) {
                let mut args = Vec::new();
                loop {
                    args.push(self.parse_type()?);
                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RBracket)?;
                TypeExpr::Generic { base: name, args }
            } else {
                TypeExpr::Name(name)
            }
        };
        if self.matches(TokenKind::Question) {
            ty = TypeExpr::Nullable(Box::new(ty));
        }
        Ok(ty)
    }

    // ---- Expressions (Pratt) ----------------------------------------------

    pub fn parse_expression(&mut self, min_prec: Prec) -> PResult<Expr> {
        let mut left = self.parse_prefix()?;
        loop {
            let kind = self.peek_kind();
            let is_custom_ident_op =
                kind == TokenKind::Identifier && self.custom_identifier_ops.contains(&self.peek().lexeme);
            let prec = if is_custom_ident_op {
                Some(Prec::Comparison)
            } else {
                infix_prec(kind)
            };
            let Some(prec) = prec else { break };
            if prec < min_prec {
                break;
            }
            left = self.parse_infix(left, prec, is_custom_ident_op)?;
        }
        Ok(left)
    }

    fn parse_infix(&mut self, left: Expr, prec: Prec, is_custom_ident_op: bool) -> PResult<Expr> {
        let location = self.loc();
        if is_custom_ident_op {
            let name = self.advance().lexeme;
            let right = self.parse_expression(Prec::from_u8(prec as u8 + 1))?;
            return Ok(Expr::Binary { op: BinOp::Custom(name), left: Box::new(left), right: Box::new(right), location });
        }
        match self.peek_kind() {
            TokenKind::Assign => {
                self.advance();
                let value = self.parse_expression(Prec::Assignment)?;
                Ok(Expr::Assign { target: Box::new(left), op: None, value: Box::new(value), location })
            }
            TokenKind::PlusAssign | TokenKind::MinusAssign | TokenKind::StarAssign | TokenKind::SlashAssign => {
                let op = match self.advance().kind {
                    TokenKind::PlusAssign => CompoundOp::Add,
                    TokenKind::MinusAssign => CompoundOp::Sub,
                    TokenKind::StarAssign => CompoundOp::Mul,
                    _ => CompoundOp::Div,
                };
                let value = self.parse_expression(Prec::Assignment)?;
                Ok(Expr::Assign { target: Box::new(left), op: Some(op), value: Box::new(value), location })
            }
            TokenKind::Question => {
                self.advance();
                let then_branch = self.parse_expression(Prec::Assignment)?;
                self.expect(TokenKind::Colon)?;
                let else_branch = self.parse_expression(Prec::Assignment)?;
                Ok(Expr::Ternary {
                    cond: Box::new(left),
                    then_branch: Box::new(then_branch),
                    else_branch: Box::new(else_branch),
                    location,
                })
            }
            TokenKind::PipeGt => {
                self.advance();
                let right = self.parse_expression(Prec::from_u8(Prec::Pipe as u8 + 1))?;
                Ok(pipe_into(left, right, location))
            }
            TokenKind::DotDot => {
                self.advance();
                let end = self.parse_expression(Prec::from_u8(Prec::Range as u8 + 1))?;
                let step = if self.matches(TokenKind::By) {
                    Some(Box::new(self.parse_expression(Prec::from_u8(Prec::Range as u8 + 1))?))
                } else {
                    None
                };
                Ok(Expr::RangeLiteral { start: Box::new(left), end: Box::new(end), step, inclusive: false, location })
            }
            TokenKind::QuestionQuestion => {
                self.advance();
                let right = self.parse_expression(Prec::from_u8(Prec::NullCoalesce as u8 + 1))?;
                Ok(Expr::Binary { op: BinOp::NullCoalesce, left: Box::new(left), right: Box::new(right), location })
            }
            TokenKind::CustomOp => {
                let lexeme = self.advance().lexeme;
                let right = self.parse_expression(Prec::from_u8(prec as u8 + 1))?;
                Ok(Expr::Binary { op: BinOp::Custom(lexeme), left: Box::new(left), right: Box::new(right), location })
            }
            kind => {
                self.advance();
                let op = token_to_binop(kind);
                let right = self.parse_expression(Prec::from_u8(prec as u8 + 1))?;
                Ok(Expr::Binary { op, left: Box::new(left), right: Box::new(right), location })
            }
        }
    }

    fn parse_prefix(&mut self) -> PResult<Expr> {
        let location = self.loc();
        match self.peek_kind() {
            TokenKind::Minus => {
                self.advance();
                let operand = self.parse_expression(Prec::Unary)?;
                Ok(self.finish_postfix(Expr::Unary { op: UnOp::Neg, operand: Box::new(operand), location })?)
            }
            TokenKind::Bang | TokenKind::Not => {
                self.advance();
                let operand = self.parse_expression(Prec::Unary)?;
                self.finish_postfix(Expr::Unary { op: UnOp::Not, operand: Box::new(operand), location })
            }
            TokenKind::Tilde => {
                self.advance();
                let operand = self.parse_expression(Prec::Unary)?;
                self.finish_postfix(Expr::Unary { op: UnOp::BitNot, operand: Box::new(operand), location })
            }
            TokenKind::Amp => {
                self.advance();
                let operand = self.parse_expression(Prec::Unary)?;
                self.finish_postfix(Expr::AddressOf { operand: Box::new(operand), location })
            }
            TokenKind::Star => {
                self.advance();
                let operand = self.parse_expression(Prec::Unary)?;
                self.finish_postfix(Expr::Deref { operand: Box::new(operand), location })
            }
            TokenKind::Await => {
                self.advance();
                let operand = self.parse_expression(Prec::Unary)?;
                self.finish_postfix(Expr::Await { operand: Box::new(operand), location })
            }
            TokenKind::Spawn => {
                self.advance();
                let call = self.parse_expression(Prec::Unary)?;
                self.finish_postfix(Expr::Spawn { call: Box::new(call), location })
            }
            TokenKind::New => {
                self.advance();
                let type_name = self.expect_identifier()?;
                let type_args = self.parse_type_args_opt()?;
                let opener = self.advance();
                let closer = if opener.kind == TokenKind::LParen { TokenKind::RParen } else { TokenKind::RBrace };
                let mut args = Vec::new();
                if self.peek_kind() != closer {
                    loop {
                        args.push(self.parse_arg()?);
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(closer)?;
                self.finish_postfix(Expr::New { type_name, type_args, args, location })
            }
            TokenKind::MakeChan | TokenKind::MakeMutex | TokenKind::MakeRwlock | TokenKind::MakeCond | TokenKind::MakeSemaphore => {
                self.parse_sync_ctor()
            }
            _ => self.parse_primary_and_postfix(),
        }
    }

    fn parse_sync_ctor(&mut self) -> PResult<Expr> {
        let location = self.loc();
        let ctor = match self.advance().kind {
            TokenKind::MakeChan => SyncCtor::MakeChan,
            TokenKind::MakeMutex => SyncCtor::MakeMutex,
            TokenKind::MakeRwlock => SyncCtor::MakeRwlock,
            TokenKind::MakeCond => SyncCtor::MakeCond,
            _ => SyncCtor::MakeSemaphore,
        };
        let element_type = if self.matches(TokenKind::LBracket) {
            let t = self.parse_type()?;
            self.expect(TokenKind::RBracket)?;
            Some(t)
        } else {
            None
        };
        self.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                args.push(self.parse_expression(Prec::Assignment)?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        self.finish_postfix(Expr::SyncConstruct { ctor, element_type, args, location })
    }

    fn parse_arg(&mut self) -> PResult<Arg> {
        if self.check(TokenKind::Identifier) && self.peek_at(1).kind == TokenKind::Colon {
            let name = self.advance().lexeme;
            self.advance();
            let value = self.parse_expression(Prec::Assignment)?;
            Ok(Arg { name: Some(name), value })
        } else {
            let value = self.parse_expression(Prec::Assignment)?;
            Ok(Arg { name: None, value })
        }
    }

    fn parse_primary_and_postfix(&mut self) -> PResult<Expr> {
        let primary = self.parse_primary()?;
        self.finish_postfix(primary)
    }

    /// Postfix chain: `.member[()]`, `[index]` / explicit type args
    /// `name[T](args)`, `(args)`, `!`, `?`.
    fn finish_postfix(&mut self, mut expr: Expr) -> PResult<Expr> {
        loop {
            let location = self.loc();
            match self.peek_kind() {
                TokenKind::Dot => {
                    self.advance();
                    let name = self.expect_identifier()?;
                    expr = Expr::Member { object: Box::new(expr), name, location };
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.parse_expression(Prec::Assignment)?;
                    self.expect(TokenKind::RBracket)?;
                    expr = Expr::Index { object: Box::new(expr), index: Box::new(index), location };
                }
                TokenKind::LParen => {
                    self.advance();
                    let mut args = Vec::new();
                    if !self.check(TokenKind::RParen) {
                        loop {
                            args.push(self.parse_arg()?);
                            if !self.matches(TokenKind::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(TokenKind::RParen)?;
                    expr = Expr::Call { callee: Box::new(expr), args, type_args: Vec::new(), hot: false, location };
                }
                TokenKind::Bang => {
                    self.advance();
                    expr = Expr::Unary { op: UnOp::Not, operand: Box::new(expr), location };
                }
                TokenKind::Question
                    if matches!(
                        self.peek_at(1).kind,
                        TokenKind::Newline | TokenKind::Dedent | TokenKind::EndOfFile | TokenKind::Semicolon
                    ) =>
                {
                    self.advance();
                    expr = Expr::Propagate { operand: Box::new(expr), location };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let location = self.loc();
        match self.peek_kind() {
            TokenKind::Integer => {
                let tok = self.advance();
                let v = match tok.literal {
                    Some(Literal::Int(n)) => n,
                    _ => 0,
                };
                Ok(Expr::IntLiteral(v, location))
            }
            TokenKind::Float => {
                let tok = self.advance();
                let v = match tok.literal {
                    Some(Literal::Float(n)) => n,
                    _ => 0.0,
                };
                Ok(Expr::FloatLiteral(v, location))
            }
            TokenKind::String => {
                let tok = self.advance();
                let wire = match tok.literal {
                    Some(Literal::Str(s)) => s,
                    _ => tok.lexeme,
                };
                if wire.contains(crate::lexer::INTERP_EXPR_START) {
                    Ok(Expr::InterpolatedString(crate::lexer::decode_interpolation(&wire), location))
                } else {
                    Ok(Expr::StringLiteral(wire, location))
                }
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::BoolLiteral(true, location))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::BoolLiteral(false, location))
            }
            TokenKind::Nil => {
                self.advance();
                Ok(Expr::NilLiteral(location))
            }
            TokenKind::LParen => self.parse_paren_or_tuple(),
            TokenKind::LBracket => self.parse_list_or_comprehension(),
            TokenKind::LBrace => self.parse_record_or_map(),
            TokenKind::Pipe => self.parse_lambda(),
            TokenKind::Identifier | TokenKind::SelfKw => self.parse_identifier_primary(),
            kind => Err(ParseError::ExpectedExpression { found: kind, location }),
        }
    }

    fn parse_paren_or_tuple(&mut self) -> PResult<Expr> {
        let location = self.loc();
        self.expect(TokenKind::LParen)?;
        if self.check(TokenKind::RParen) {
            self.advance();
            return Ok(Expr::ListLiteral { elements: Vec::new(), location });
        }
        let first = self.parse_expression(Prec::Assignment)?;
        if self.matches(TokenKind::Comma) {
            let mut elements = vec![first];
            while !self.check(TokenKind::RParen) {
                elements.push(self.parse_expression(Prec::Assignment)?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RParen)?;
            Ok(Expr::ListLiteral { elements, location })
        } else {
            self.expect(TokenKind::RParen)?;
            Ok(first)
        }
    }

    fn parse_list_or_comprehension(&mut self) -> PResult<Expr> {
        let location = self.loc();
        self.expect(TokenKind::LBracket)?;
        if self.check(TokenKind::RBracket) {
            self.advance();
            return Ok(Expr::ListLiteral { elements: Vec::new(), location });
        }
        let first = self.parse_expression(Prec::Assignment)?;
        if self.matches(TokenKind::For) {
            let var = self.expect_identifier()?;
            self.expect(TokenKind::In)?;
            let iterable = self.parse_expression(Prec::Assignment)?;
            let condition = if self.matches(TokenKind::If) {
                Some(Box::new(self.parse_expression(Prec::Assignment)?))
            } else {
                None
            };
            self.expect(TokenKind::RBracket)?;
            return Ok(Expr::ListComprehension { element: Box::new(first), var, iterable: Box::new(iterable), condition, location });
        }
        let mut elements = vec![first];
        while self.matches(TokenKind::Comma) {
            if self.check(TokenKind::RBracket) {
                break;
            }
            elements.push(self.parse_expression(Prec::Assignment)?);
        }
        self.expect(TokenKind::RBracket)?;
        Ok(Expr::ListLiteral { elements, location })
    }

    /// Distinguish a record literal from a map literal by whether the
    /// first key is a string (map) or bare identifier (record), per spec
    /// §4.2.
    fn parse_record_or_map(&mut self) -> PResult<Expr> {
        let location = self.loc();
        self.expect(TokenKind::LBrace)?;
        if self.check(TokenKind::RBrace) {
            self.advance();
            return Ok(Expr::RecordLiteral { type_name: None, fields: Vec::new(), location });
        }
        if self.check(TokenKind::String) {
            let mut entries = Vec::new();
            loop {
                let key = self.parse_expression(Prec::Assignment)?;
                self.expect(TokenKind::Colon)?;
                let value = self.parse_expression(Prec::Assignment)?;
                entries.push((key, value));
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RBrace)?;
            return Ok(Expr::MapLiteral { entries, location });
        }
        let mut fields = Vec::new();
        loop {
            let name = self.expect_identifier()?;
            self.expect(TokenKind::Colon)?;
            let value = self.parse_expression(Prec::Assignment)?;
            fields.push((name, value));
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Expr::RecordLiteral { type_name: None, fields, location })
    }

    /// `Name { field: value, ... }` record construction (spec §3 "Record
    /// Literal"). Unambiguous with block syntax since blocks open with `:`.
    fn parse_typed_record_literal(&mut self, name: String, location: SourceLocation) -> PResult<Expr> {
        self.expect(TokenKind::LBrace)?;
        let mut fields = Vec::new();
        if !self.check(TokenKind::RBrace) {
            loop {
                let fname = self.expect_identifier()?;
                self.expect(TokenKind::Colon)?;
                let value = self.parse_expression(Prec::Assignment)?;
                fields.push((fname, value));
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Expr::RecordLiteral { type_name: Some(name), fields, location })
    }

    fn parse_lambda(&mut self) -> PResult<Expr> {
        let location = self.loc();
        self.expect(TokenKind::Pipe)?;
        let mut params = Vec::new();
        if !self.check(TokenKind::Pipe) {
            loop {
                let name = self.expect_identifier()?;
                let type_ann = if self.matches(TokenKind::Colon) {
                    Some(self.parse_type()?)
                } else {
                    None
                };
                params.push(Param { name, type_ann, default: None });
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::Pipe)?;
        let body = if self.check(TokenKind::Colon) {
            LambdaBody::Block(self.parse_block()?)
        } else {
            LambdaBody::Expr(self.parse_expression(Prec::Assignment)?)
        };
        Ok(Expr::Lambda { params, body: Box::new(body), location })
    }

    /// Identifier primary, including explicit type-argument calls
    /// (`name[T1,T2](args)`) and DSL-block detection (`name:` + indented raw
    /// block when `name` is a known DSL keyword).
    fn parse_identifier_primary(&mut self) -> PResult<Expr> {
        let location = self.loc();
        let name = self.advance().lexeme;

        if is_dsl_name(&name) && self.check(TokenKind::Colon) && self.peek_at(1).kind == TokenKind::Newline {
            let raw = self.capture_raw_block()?;
            return Ok(Expr::DslBlock { name, raw, location });
        }

        if self.check(TokenKind::LBrace) {
            let record = self.parse_typed_record_literal(name, location)?;
            return self.finish_postfix(record);
        }

        if matches!(
            name.as_str(),
            "lock" | "unlock" | "read" | "write" | "wait" | "signal" | "broadcast" | "acquire" | "release"
                | "try_acquire" | "send" | "recv"
        ) && self.check(TokenKind::LParen)
        {
            // contextual recognition of sync ops applied via call syntax is
            // handled as a plain call; member-call form (`m.lock()`) is
            // recognized in finish_postfix via Member+Call and rewritten by
            // the type checker/codegen which know the receiver's type.
        }

        if self.check(TokenKind::LBracket) && looks_like_type_arg_call(self) {
            let type_args = self.parse_type_args_opt()?;
            if self.check(TokenKind::LParen) {
                self.advance();
                let mut args = Vec::new();
                if !self.check(TokenKind::RParen) {
                    loop {
                        args.push(self.parse_arg()?);
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(TokenKind::RParen)?;
                return self.finish_postfix(Expr::Call {
                    callee: Box::new(Expr::Identifier(name, location.clone())),
                    args,
                    type_args,
                    hot: false,
                    location,
                });
            }
        }

        Ok(Expr::Identifier(name, location))
    }
}

fn looks_like_type_arg_call(parser: &Parser) -> bool {
    // Lookahead: `[` Identifier (`,` Identifier)* `]` `(` — a generic
    // instantiation call site, per spec §4.2 postfix rules.
    let mut i = parser.pos;
    if parser.tokens[i].kind != TokenKind::LBracket {
        return false;
    }
    i += 1;
    if parser.tokens.get(i).map(|t| t.kind) != Some(TokenKind::Identifier) {
        return false;
    }
    i += 1;
    while parser.tokens.get(i).map(|t| t.kind) == Some(TokenKind::Comma) {
        i += 1;
        if parser.tokens.get(i).map(|t| t.kind) != Some(TokenKind::Identifier) {
            return false;
        }
        i += 1;
    }
    parser.tokens.get(i).map(|t| t.kind) == Some(TokenKind::RBracket)
        && parser.tokens.get(i + 1).map(|t| t.kind) == Some(TokenKind::LParen)
}

fn is_dsl_name(name: &str) -> bool {
    matches!(name, "sql" | "html" | "regex" | "shader" | "css")
}

fn token_to_binop(kind: TokenKind) -> BinOp {
    use TokenKind::*;
    match kind {
        Plus => BinOp::Add,
        Minus => BinOp::Sub,
        Star => BinOp::Mul,
        Slash => BinOp::Div,
        Percent => BinOp::Mod,
        Eq => BinOp::Eq,
        Ne => BinOp::Ne,
        Lt => BinOp::Lt,
        Gt => BinOp::Gt,
        Le => BinOp::Le,
        Ge => BinOp::Ge,
        And | AmpAmp => BinOp::And,
        Or | PipePipe => BinOp::Or,
        Amp => BinOp::BitAnd,
        Pipe => BinOp::BitOr,
        Caret => BinOp::BitXor,
        Spaceship => BinOp::Spaceship,
        _ => BinOp::Add,
    }
}

/// `x |> f(y)` desugars to `f(x, y)`; if the right side isn't already a
/// call, wrap it as a unary call (spec §4.2, §8 testable property).
fn pipe_into(left: Expr, right: Expr, location: SourceLocation) -> Expr {
    match right {
        Expr::Call { callee, mut args, type_args, hot, location: call_loc } => {
            args.insert(0, Arg { name: None, value: left });
            Expr::Call { callee, args, type_args, hot, location: call_loc }
        }
        other => Expr::Call {
            callee: Box::new(other),
            args: vec![Arg { name: None, value: left }],
            type_args: Vec::new(),
            hot: false,
            location,
        },
    }
}

fn apply_attribute(attrs: &mut Attributes, raw: &str) {
    let raw = raw.trim();
    if raw == "hot" {
        attrs.hot = true;
    } else if raw == "cold" {
        attrs.cold = true;
    } else if raw == "inline" {
        attrs.inline = true;
    } else if raw == "naked" {
        attrs.naked = true;
    } else if raw == "repr(C)" || raw == "repr ( C )" {
        attrs.repr_c = true;
    } else if raw == "repr(packed)" {
        attrs.packed = true;
    } else if let Some(rest) = raw.strip_prefix("repr(align(").and_then(|s| s.strip_suffix("))")) {
        attrs.align = rest.trim().parse().ok();
    } else if matches!(raw, "cdecl" | "stdcall" | "win64") {
        attrs.calling_convention = Some(raw.to_string());
    }
}

impl Prec {
    fn from_u8(v: u8) -> Prec {
        match v {
            0 => Prec::None,
            1 => Prec::Assignment,
            2 => Prec::Ternary,
            3 => Prec::NullCoalesce,
            4 => Prec::Pipe,
            5 => Prec::Or,
            6 => Prec::And,
            7 => Prec::BitOr,
            8 => Prec::BitXor,
            9 => Prec::BitAnd,
            10 => Prec::Equality,
            11 => Prec::Comparison,
            12 => Prec::Range,
            13 => Prec::Term,
            14 => Prec::Factor,
            15 => Prec::Unary,
            16 => Prec::Postfix,
            _ => Prec::Primary,
        }
    }
}

/// Parses a single expression from re-captured interpolation text (spec
/// §4.1: "The parser later re-parses each expr segment recursively").
pub fn parse_expr_text(text: &str) -> Option<Expr> {
    let tokens = crate::lexer::Lexer::new(text, std::path::PathBuf::from("<interpolation>"))
        .lex()
        .ok()?;
    let mut parser = Parser::new(tokens);
    parser.parse_expression(Prec::Assignment).ok()
}

/// Parses a full program from source text, returning the AST plus any
/// recovered parse errors (spec §8: "a well-formed source file... produces
/// an AST whose Program node has at least one statement").
pub fn parse_source(src: &str, file: std::path::PathBuf) -> Result<(Program, Vec<ParseError>), crate::lexer::LexError> {
    let tokens = crate::lexer::Lexer::new(src, file).lex()?;
    let mut parser = Parser::new(tokens);
    let program = parser.parse_program();
    Ok((program, parser.errors().to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn parse_ok(src: &str) -> Program {
        let (program, errors) = parse_source(src, PathBuf::from("t.tl")).expect("lex ok");
        assert!(errors.is_empty(), "parse errors: {errors:?}");
        program
    }

    #[test]
    fn program_has_at_least_one_statement() {
        let program = parse_ok("print(1)\n");
        assert!(!program.statements.is_empty());
    }

    #[test]
    fn precedence_binds_multiplication_tighter_than_addition() {
        let program = parse_ok("a + b * c\n");
        let Stmt::Expr(Expr::Binary { op, left, right, .. }) = &program.statements[0] else {
            panic!("expected binary expr statement");
        };
        assert_eq!(*op, BinOp::Add);
        assert!(matches!(**left, Expr::Identifier(_, _)));
        assert!(matches!(**right, Expr::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn ternary_parses_with_both_branches() {
        let program = parse_ok("a ? b : c\n");
        assert!(matches!(program.statements[0], Stmt::Expr(Expr::Ternary { .. })));
    }

    #[test]
    fn bare_propagate_before_newline_is_propagate_not_ternary() {
        let program = parse_ok("foo()?\n");
        assert!(matches!(program.statements[0], Stmt::Expr(Expr::Propagate { .. })));
    }

    #[test]
    fn pipe_rewrites_as_call_with_left_as_first_arg() {
        let program = parse_ok("x |> f(y)\n");
        let Stmt::Expr(Expr::Call { args, .. }) = &program.statements[0] else {
            panic!("expected call");
        };
        assert_eq!(args.len(), 2);
        assert!(matches!(args[0].value, Expr::Identifier(ref n, _) if n == "x"));
    }

    #[test]
    fn function_declaration_parses_generics_and_body() {
        let program = parse_ok("fn id[T](x: T) -> T:\n    return x\n");
        let Stmt::FunctionDecl(f) = &program.statements[0] else {
            panic!("expected function decl");
        };
        assert_eq!(f.name, "id");
        assert_eq!(f.generics.len(), 1);
        assert_eq!(f.generics[0].name, "T");
    }

    #[test]
    fn if_elif_else_chain_parses() {
        let program = parse_ok("if a:\n    b\nelif c:\n    d\nelse:\n    e\n");
        assert!(matches!(program.statements[0], Stmt::If { .. }));
        let Stmt::If { elifs, else_branch, .. } = &program.statements[0] else { unreachable!() };
        assert_eq!(elifs.len(), 1);
        assert!(else_branch.is_some());
    }

    #[test]
    fn record_declaration_with_repr_c_attribute() {
        let program = parse_ok("#[repr(C)]\nrecord Point:\n    x: int\n    y: int\n");
        let Stmt::RecordDecl(r) = &program.statements[0] else {
            panic!("expected record");
        };
        assert!(r.attributes.repr_c);
        assert_eq!(r.fields.len(), 2);
    }

    #[test]
    fn trait_impl_parses_methods() {
        let program = parse_ok(
            "trait Greet:\n    fn hello() -> str\nimpl Greet for Dog:\n    fn hello() -> str:\n        return \"woof\"\n",
        );
        assert!(matches!(program.statements[0], Stmt::TraitDecl(_)));
        assert!(matches!(program.statements[1], Stmt::ImplDecl(_)));
    }

    #[test]
    fn match_with_guard_and_wildcard() {
        let program = parse_ok("match x:\n    0 -> a\n    n if n > 0 -> b\n    _ -> c\n");
        let Stmt::Match { cases, .. } = &program.statements[0] else {
            panic!("expected match");
        };
        assert_eq!(cases.len(), 3);
        assert!(cases[1].guard.is_some());
        assert_eq!(cases[2].pattern, Pattern::Wildcard);
    }

    #[test]
    fn range_with_step_parses() {
        let program = parse_ok("for i in 0..10 by 2:\n    print(i)\n");
        assert!(matches!(program.statements[0], Stmt::ForIn { .. }));
    }

    #[test]
    fn parse_errors_recover_at_next_statement() {
        let (program, errors) = parse_source("let x = \nlet y = 2\n", PathBuf::from("t.tl")).unwrap();
        assert!(!errors.is_empty());
        assert!(program.statements.iter().any(|s| matches!(s, Stmt::VarDecl { name, .. } if name == "y")));
    }

    #[test]
    fn typed_record_literal_carries_its_type_name() {
        let program = parse_ok("let p = Point { x: 1, y: 2 }\n");
        let Stmt::VarDecl { init: Some(Expr::RecordLiteral { type_name, fields, .. }), .. } = &program.statements[0]
        else {
            panic!("expected record literal init");
        };
        assert_eq!(type_name.as_deref(), Some("Point"));
        assert_eq!(fields.len(), 2);
    }

    #[test]
    fn custom_operator_preserves_its_lexeme() {
        let program = parse_ok("a %% b\n");
        let Stmt::Expr(Expr::Binary { op: BinOp::Custom(sym), .. }) = &program.statements[0] else {
            panic!("expected custom binary op");
        };
        assert_eq!(sym, "%%");
    }
}
