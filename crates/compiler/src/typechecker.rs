//! Type checker (spec §4.5, §3 invariants I1-I4).
//!
//! Walks the program once, infers a [`Type`] for every expression, and
//! validates calls/fields/trait impls against the [`TypeRegistry`] and
//! [`TraitRegistry`] built up along the way. Per spec §7 ("the type checker
//! does not throw"), every problem becomes a [`Diagnostic`] pushed to a
//! [`DiagnosticSink`]; the walk always finishes. Grounded in the teacher's
//! `typechecker.rs`, which is likewise a single-pass visitor threading a
//! scope stack and a diagnostics list rather than raising exceptions.

use crate::ast::*;
use crate::symtab::{ScopeKind, Storage, Symbol, SymbolKind, SymbolTable};
use crate::types::{FloatKind, IntKind, TraitImpl, TraitMethod, TraitRegistry, TraitType, Type, TypeRegistry};
use std::collections::HashMap;
use talon_core::{Diagnostic, DiagnosticSink, SourceLocation};

/// A resolved function signature, kept for call-site checking and generic
/// inference (spec §4.6 "Monomorphizer" reads the same table).
#[derive(Debug, Clone)]
pub struct FunctionSig {
    pub name: String,
    pub generics: Vec<String>,
    pub bounds: HashMap<String, Vec<String>>,
    pub params: Vec<(String, Type)>,
    pub ret: Type,
    pub is_variadic: bool,
}

/// One generic call site discovered during checking, handed to the
/// monomorphizer (spec §4.6).
#[derive(Debug, Clone)]
pub struct GenericCallSite {
    pub callee: String,
    pub type_args: Vec<Type>,
}

/// The result of a completed type-check pass: whether it's safe to proceed
/// to monomorphization (spec §7: "If any ERROR-level diagnostic exists
/// after the walk, compilation aborts"), the expression type map, and every
/// generic call site discovered along the way.
pub struct CheckResult {
    pub diagnostics: DiagnosticSink,
    pub type_map: HashMap<usize, Type>,
    pub generic_call_sites: Vec<GenericCallSite>,
    pub functions: HashMap<String, FunctionSig>,
    pub types: TypeRegistry,
}

impl CheckResult {
    pub fn ok(&self) -> bool {
        !self.diagnostics.has_errors()
    }
}

pub struct TypeChecker {
    symtab: SymbolTable,
    types: TypeRegistry,
    traits: TraitRegistry,
    diagnostics: DiagnosticSink,
    type_map: HashMap<usize, Type>,
    functions: HashMap<String, FunctionSig>,
    generic_call_sites: Vec<GenericCallSite>,
    current_return: Vec<Type>,
    /// Type parameters in scope for the function body currently being
    /// checked (spec §4.4 "within a generic function body a bare name
    /// matching a declared type parameter resolves to `TypeParam`").
    current_type_params: Vec<String>,
}

impl Default for TypeChecker {
    fn default() -> Self {
        TypeChecker {
            symtab: SymbolTable::new(),
            types: TypeRegistry::new(),
            traits: TraitRegistry::new(),
            diagnostics: DiagnosticSink::new(),
            type_map: HashMap::new(),
            functions: HashMap::new(),
            generic_call_sites: Vec::new(),
            current_return: Vec::new(),
            current_type_params: Vec::new(),
        }
    }
}

/// Pointer-identity key into [`CheckResult::type_map`] (spec §3 invariant
/// I1: "every expression node ... has a unique entry in the type map").
/// `pub` so later passes (codegen's runtime `print`/`println` lowering)
/// can look up an already-inferred expression type without re-inferring it.
pub fn expr_key(e: &Expr) -> usize {
    e as *const Expr as usize
}

impl TypeChecker {
    pub fn new() -> Self {
        TypeChecker::default()
    }

    /// Runs the full pass (spec §4.5) and consumes `self` into the result
    /// the monomorphizer and code generator need.
    pub fn check(mut self, program: &Program) -> CheckResult {
        self.collect_declarations(&program.statements);
        for stmt in &program.statements {
            self.check_stmt(stmt);
        }
        self.report_unused_in_scope(ScopeKind::Global);
        CheckResult {
            diagnostics: self.diagnostics,
            type_map: self.type_map,
            generic_call_sites: self.generic_call_sites,
            functions: self.functions,
            types: self.types,
        }
    }

    // ---- declaration collection (forward references, spec I3) ----------

    /// Registers every top-level record/enum/trait/function signature
    /// before checking any body, so mutual and forward recursion (e.g.
    /// `fib` calling itself) resolves (spec §8 "Fibonacci" scenario).
    fn collect_declarations(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            match stmt {
                Stmt::RecordDecl(r) => self.collect_record(r),
                Stmt::EnumDecl(e) => self.collect_enum(e),
                Stmt::UnionDecl(u) => self.collect_union(u),
                Stmt::TypeAlias { name, target, location } => {
                    match self.types.resolve(target, &[]) {
                        Ok(ty) => self.types.define_alias(name.clone(), ty),
                        Err(err) => self.diagnostics.error(err.to_string(), location.clone()),
                    }
                }
                Stmt::TraitDecl(t) => self.collect_trait(t),
                Stmt::FunctionDecl(f) => self.collect_function(f, None),
                _ => {}
            }
        }
        // impls are resolved in a second pass so a trait/record defined
        // later in the file is still visible (spec §4.4 "impl block
        // registration").
        for stmt in stmts {
            if let Stmt::ImplDecl(i) = stmt {
                self.collect_impl(i);
            }
        }
    }

    fn collect_record(&mut self, r: &RecordDecl) {
        let generics: Vec<String> = r.generics.iter().map(|g| g.name.clone()).collect();
        let mut fields = Vec::new();
        for f in &r.fields {
            match self.types.resolve(&f.type_ann, &generics) {
                Ok(ty) => fields.push((f.name.clone(), ty)),
                Err(err) => self.diagnostics.error(err.to_string(), r.location.clone()),
            }
        }
        self.types.define_record(crate::types::RecordInfo {
            name: r.name.clone(),
            generics,
            fields,
            repr_c: r.attributes.repr_c,
            packed: r.attributes.packed,
        });
    }

    fn collect_union(&mut self, u: &UnionDecl) {
        let mut fields = Vec::new();
        for f in &u.fields {
            match self.types.resolve(&f.type_ann, &[]) {
                Ok(ty) => fields.push((f.name.clone(), ty)),
                Err(err) => self.diagnostics.error(err.to_string(), u.location.clone()),
            }
        }
        self.types.define_record(crate::types::RecordInfo {
            name: u.name.clone(),
            generics: vec![],
            fields,
            repr_c: true,
            packed: false,
        });
    }

    fn collect_enum(&mut self, e: &EnumDecl) {
        let mut variants = Vec::new();
        for v in &e.variants {
            let tys: Vec<Type> = v
                .fields
                .iter()
                .filter_map(|t| self.types.resolve(t, &[]).ok())
                .collect();
            variants.push((v.name.clone(), tys));
        }
        self.types.define_enum(crate::types::EnumInfo { name: e.name.clone(), variants });
    }

    fn collect_trait(&mut self, t: &TraitDecl) {
        let generics: Vec<String> = t.generics.iter().map(|g| g.name.clone()).collect();
        let mut methods = Vec::new();
        for m in &t.methods {
            let params = m
                .params
                .iter()
                .filter_map(|p| p.type_ann.as_ref().and_then(|t| self.types.resolve(t, &generics).ok()))
                .collect();
            let ret = m
                .return_type
                .as_ref()
                .map(|t| self.types.resolve(t, &generics).unwrap_or(Type::Void))
                .unwrap_or(Type::Void);
            methods.push(TraitMethod { name: m.name.clone(), params, ret, has_default: m.default_body.is_some() });
        }
        self.traits.define_trait(TraitType { name: t.name.clone(), super_traits: t.super_traits.clone(), methods });
    }

    fn collect_impl(&mut self, i: &ImplDecl) {
        let for_type = self.types.from_string(&i.type_name).unwrap_or_else(|| Type::Record(i.type_name.clone()));
        let method_names: Vec<String> = i.methods.iter().map(|m| m.name.clone()).collect();
        for m in &i.methods {
            let qualified = format!("{}::{}", i.type_name, m.name);
            self.collect_function(m, Some(qualified));
        }
        let Some(trait_name) = &i.trait_name else {
            return;
        };
        let type_args = i.type_args.iter().filter_map(|t| self.types.resolve(t, &[]).ok()).collect();
        if let Err(err) = self.traits.add_impl(TraitImpl {
            trait_name: trait_name.clone(),
            for_type,
            type_args,
            methods: method_names,
        }) {
            self.diagnostics.error(err.to_string(), i.location.clone());
        }
    }

    fn collect_function(&mut self, f: &FunctionDecl, qualified_name: Option<String>) {
        let generics: Vec<String> = f.generics.iter().map(|g| g.name.clone()).collect();
        let bounds: HashMap<String, Vec<String>> =
            f.generics.iter().map(|g| (g.name.clone(), g.bounds.clone())).collect();
        let mut params = Vec::new();
        for p in &f.params {
            let ty = p
                .type_ann
                .as_ref()
                .map(|t| self.types.resolve(t, &generics).unwrap_or(Type::Any))
                .unwrap_or(Type::Any);
            params.push((p.name.clone(), ty));
        }
        let ret = f
            .return_type
            .as_ref()
            .map(|t| self.types.resolve(t, &generics).unwrap_or(Type::Void))
            .unwrap_or(Type::Void);
        let name = qualified_name.unwrap_or_else(|| f.name.clone());
        self.functions.insert(
            name.clone(),
            FunctionSig { name, generics, bounds, params, ret, is_variadic: f.is_variadic },
        );
    }

    // ---- statements -------------------------------------------------

    fn check_block(&mut self, stmts: &[Stmt], kind: ScopeKind) {
        self.symtab.push_scope(kind);
        for s in stmts {
            self.check_stmt(s);
        }
        self.report_unused_in_scope(kind);
        self.symtab.pop_scope();
    }

    fn report_unused_in_scope(&mut self, _kind: ScopeKind) {
        // Unused-variable warnings (spec §4.5 "after popping a scope"):
        // names starting with `_` or `$` are exempt.
        let unused: Vec<(String, SourceLocation)> = self
            .symtab
            .unused_locals()
            .into_iter()
            .filter(|s| !s.name.starts_with('_') && !s.name.starts_with('$'))
            .map(|s| (s.name.clone(), s.location.clone()))
            .collect();
        for (name, loc) in unused {
            self.diagnostics.warning(format!("unused variable `{name}`"), loc);
        }
    }

    fn check_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Expr(e) => {
                self.infer_expr(e);
            }
            Stmt::VarDecl { name, is_mut, type_ann, init, location } => {
                let declared = type_ann.as_ref().map(|t| self.resolve_or_error(t, location));
                let init_ty = init.as_ref().map(|e| self.infer_expr(e));
                let ty = match (declared, init_ty) {
                    (Some(d), _) => d,
                    (None, Some(i)) => i,
                    (None, None) => Type::Unknown,
                };
                let mut sym = Symbol::new(name.clone(), SymbolKind::Variable, ty, location.clone());
                sym.is_mutable = *is_mut;
                sym.is_initialized = init.is_some();
                if let Err(err) = self.symtab.define(sym) {
                    self.diagnostics.error(err.to_string(), location.clone());
                }
            }
            Stmt::ConstDecl { name, value, location } => {
                let ty = self.infer_expr(value);
                let mut sym = Symbol::new(name.clone(), SymbolKind::Constant, ty, location.clone());
                sym.is_initialized = true;
                sym.is_used = true; // constants aren't flagged unused (spec is silent; matches compile-time-fold usage)
                if let Err(err) = self.symtab.define(sym) {
                    self.diagnostics.error(err.to_string(), location.clone());
                }
            }
            Stmt::Destructure { shape, rhs, location } => self.check_destructure(shape, rhs, location),
            Stmt::CompoundAssign { target, op: _, value, location } => {
                let target_ty = self.infer_expr(target);
                let value_ty = self.infer_expr(value);
                if !self.assignable(&target_ty, &value_ty) {
                    self.diagnostics.error(
                        format!("cannot assign `{value_ty}` to `{target_ty}`"),
                        location.clone(),
                    );
                }
                self.mark_identifier_used(target);
            }
            Stmt::Block(body) => self.check_block(body, ScopeKind::Block),
            Stmt::If { cond, then_branch, elifs, else_branch, location } => {
                self.expect_bool(cond, location);
                self.check_block(then_branch, ScopeKind::Block);
                for (c, branch) in elifs {
                    self.expect_bool(c, location);
                    self.check_block(branch, ScopeKind::Block);
                }
                if let Some(branch) = else_branch {
                    self.check_block(branch, ScopeKind::Block);
                }
            }
            Stmt::While { cond, body, location } => {
                self.expect_bool(cond, location);
                self.check_block(body, ScopeKind::Loop);
            }
            Stmt::ForIn { var, iterable, body, location } => {
                let iter_ty = self.infer_expr(iterable);
                let elem_ty = match &iter_ty {
                    Type::List(e) => (**e).clone(),
                    Type::Generic { base, args } if base == "range" => args.first().cloned().unwrap_or(Type::int()),
                    _ => Type::int(),
                };
                self.symtab.push_scope(ScopeKind::Loop);
                let mut sym = Symbol::new(var.clone(), SymbolKind::Variable, elem_ty, location.clone());
                sym.is_initialized = true;
                let _ = self.symtab.define(sym);
                for s in body {
                    self.check_stmt(s);
                }
                self.report_unused_in_scope(ScopeKind::Loop);
                self.symtab.pop_scope();
            }
            Stmt::Match { value, cases, location } => self.check_match(value, cases, location),
            Stmt::Return { value, location: _ } => {
                let ty = value.as_ref().map(|e| self.infer_expr(e)).unwrap_or(Type::Void);
                if let Some(expected) = self.current_return.last().cloned() {
                    if !self.assignable(&expected, &ty) && expected != Type::Void {
                        if let Some(e) = value {
                            self.diagnostics.error(
                                format!("expected return type `{expected}`, found `{ty}`"),
                                e.location(),
                            );
                        }
                    }
                }
            }
            Stmt::Break { location } | Stmt::Continue { location } => {
                if !self.symtab.in_loop() {
                    self.diagnostics.error("break/continue outside of a loop".to_string(), location.clone());
                }
            }
            Stmt::TryElse { body, else_name, else_body, location: _ } => {
                self.check_block(body, ScopeKind::Block);
                self.symtab.push_scope(ScopeKind::Block);
                if let Some(name) = else_name {
                    let mut sym = Symbol::new(name.clone(), SymbolKind::Variable, Type::Any, SourceLocation::synthetic());
                    sym.is_initialized = true;
                    let _ = self.symtab.define(sym);
                }
                for s in else_body {
                    self.check_stmt(s);
                }
                self.symtab.pop_scope();
            }
            Stmt::FunctionDecl(f) => self.check_function(f, None),
            Stmt::RecordDecl(_) | Stmt::UnionDecl(_) | Stmt::EnumDecl(_) | Stmt::TypeAlias { .. } | Stmt::TraitDecl(_) => {
                // Already handled in collect_declarations; nothing further
                // to check structurally.
            }
            Stmt::ImplDecl(i) => {
                for m in &i.methods {
                    self.check_function(m, Some(i.type_name.clone()));
                }
            }
            Stmt::UnsafeBlock { body, location: _ } => {
                self.symtab.push_scope(ScopeKind::Unsafe);
                self.check_stmt(body);
                self.symtab.pop_scope();
            }
            Stmt::Import { .. } => {
                // Splicing happens at the compile-driver level (spec §6);
                // by the time the checker runs, imported statements have
                // already been merged into the program.
            }
            Stmt::ExternBlock(_) | Stmt::Opaque(_) | Stmt::InlineAsm(_) => {
                // Out of scope for semantic checking (spec §1): extern
                // signatures are trusted, opaque/DSL bodies are untyped,
                // inline asm is unchecked by design.
            }
            Stmt::Delete { target, location } => {
                let ty = self.infer_expr(target);
                if !ty.is_pointer() {
                    self.diagnostics.error("`delete` requires a raw pointer".to_string(), location.clone());
                }
            }
            Stmt::Lock { mutex, body, location } => {
                let ty = self.infer_expr(mutex);
                if !matches!(ty, Type::Mutex(_) | Type::Error | Type::Unknown) {
                    self.diagnostics.error(format!("`lock` requires a mutex, found `{ty}`"), location.clone());
                }
                self.check_stmt(body);
            }
        }
    }

    fn check_function(&mut self, f: &FunctionDecl, owner: Option<String>) {
        let generics: Vec<String> = f.generics.iter().map(|g| g.name.clone()).collect();
        self.current_type_params = generics.clone();
        let ret = f
            .return_type
            .as_ref()
            .map(|t| self.resolve_or_error(t, &f.location))
            .unwrap_or(Type::Void);
        self.current_return.push(ret.clone());
        self.symtab.push_scope(ScopeKind::Function);
        if let Some(owner) = &owner {
            let self_ty = self.types.from_string(owner).unwrap_or(Type::Record(owner.clone()));
            let mut sym = Symbol::new("self", SymbolKind::Parameter, self_ty, f.location.clone());
            sym.is_initialized = true;
            sym.is_used = true;
            let _ = self.symtab.define(sym);
        }
        for p in &f.params {
            let ty = p
                .type_ann
                .as_ref()
                .map(|t| self.resolve_or_error(t, &f.location))
                .unwrap_or(Type::Any);
            let mut sym = Symbol::new(p.name.clone(), SymbolKind::Parameter, ty, f.location.clone());
            sym.is_initialized = true;
            if let Err(err) = self.symtab.define(sym) {
                self.diagnostics.error(err.to_string(), f.location.clone());
            }
        }
        for s in &f.body {
            self.check_stmt(s);
        }
        self.report_unused_in_scope(ScopeKind::Function);
        self.symtab.pop_scope();
        self.current_return.pop();
        self.current_type_params.clear();
    }

    fn check_destructure(&mut self, shape: &DestructureShape, rhs: &Expr, location: &SourceLocation) {
        let rhs_ty = self.infer_expr(rhs);
        match shape {
            DestructureShape::Tuple(names) => {
                let elem = match &rhs_ty {
                    Type::List(e) => (**e).clone(),
                    _ => Type::Unknown,
                };
                for name in names {
                    let mut sym = Symbol::new(name.clone(), SymbolKind::Variable, elem.clone(), location.clone());
                    sym.is_initialized = true;
                    if let Err(err) = self.symtab.define(sym) {
                        self.diagnostics.error(err.to_string(), location.clone());
                    }
                }
            }
            DestructureShape::Record(names) => {
                let record_name = match &rhs_ty {
                    Type::Record(n) => Some(n.clone()),
                    _ => None,
                };
                for name in names {
                    let field_ty = record_name
                        .as_ref()
                        .and_then(|n| self.types.record(n))
                        .and_then(|r| r.field_type(name))
                        .cloned()
                        .unwrap_or(Type::Unknown);
                    let mut sym = Symbol::new(name.clone(), SymbolKind::Variable, field_ty, location.clone());
                    sym.is_initialized = true;
                    if let Err(err) = self.symtab.define(sym) {
                        self.diagnostics.error(err.to_string(), location.clone());
                    }
                }
            }
        }
    }

    fn check_match(&mut self, value: &Expr, cases: &[MatchCase], location: &SourceLocation) {
        let scrutinee = self.infer_expr(value);
        let mut result: Option<Type> = None;
        for case in cases {
            self.symtab.push_scope(ScopeKind::Block);
            self.bind_pattern(&case.pattern, &scrutinee);
            if let Some(guard) = &case.guard {
                self.expect_bool(guard, location);
            }
            let mut case_ty = Type::Void;
            for (idx, s) in case.body.iter().enumerate() {
                if idx + 1 == case.body.len() {
                    if let Stmt::Expr(e) = s {
                        case_ty = self.infer_expr(e);
                        continue;
                    }
                }
                self.check_stmt(s);
            }
            self.symtab.pop_scope();
            result = Some(match result {
                None => case_ty,
                Some(prev) => self.unify(&prev, &case_ty),
            });
        }
        let _ = result;
    }

    /// Wildcard identifiers (`_`) don't participate in type inference of
    /// the pattern (spec §4.5 "match").
    fn bind_pattern(&mut self, pattern: &Pattern, scrutinee: &Type) {
        match pattern {
            Pattern::Wildcard => {}
            Pattern::Literal(_) => {}
            Pattern::Identifier(name) if name == "_" => {}
            Pattern::Identifier(name) => {
                let mut sym = Symbol::new(name.clone(), SymbolKind::Variable, scrutinee.clone(), SourceLocation::synthetic());
                sym.is_initialized = true;
                let _ = self.symtab.define(sym);
            }
            Pattern::Tuple(elems) => {
                let elem_ty = match scrutinee {
                    Type::List(e) => (**e).clone(),
                    other => other.clone(),
                };
                for e in elems {
                    self.bind_pattern(e, &elem_ty);
                }
            }
            Pattern::Record { type_name, fields } => {
                let record_name = type_name.clone().or_else(|| match scrutinee {
                    Type::Record(n) => Some(n.clone()),
                    _ => None,
                });
                for (field_name, sub) in fields {
                    let field_ty = record_name
                        .as_ref()
                        .and_then(|n| self.types.record(n))
                        .and_then(|r| r.field_type(field_name))
                        .cloned()
                        .unwrap_or(Type::Unknown);
                    self.bind_pattern(sub, &field_ty);
                }
            }
        }
    }

    // ---- expressions --------------------------------------------------

    fn infer_expr(&mut self, expr: &Expr) -> Type {
        let ty = self.infer_expr_inner(expr);
        self.type_map.insert(expr_key(expr), ty.clone());
        ty
    }

    fn infer_expr_inner(&mut self, expr: &Expr) -> Type {
        match expr {
            Expr::IntLiteral(_, _) => Type::int(),
            Expr::FloatLiteral(_, _) => Type::float(),
            Expr::BoolLiteral(_, _) => Type::Bool,
            Expr::NilLiteral(_) => Type::Nullable(Box::new(Type::Any)),
            Expr::StringLiteral(_, _) => Type::Str,
            Expr::InterpolatedString(parts, _) => {
                for p in parts {
                    if let StringPart::Expr(e) = p {
                        self.infer_expr(e);
                    }
                }
                Type::Str
            }
            Expr::Identifier(name, location) => self.lookup_identifier(name, location),
            Expr::Binary { op, left, right, location } => self.check_binary(op, left, right, location),
            Expr::Unary { op, operand, location } => {
                let ty = self.infer_expr(operand);
                match op {
                    UnOp::Not => Type::Bool,
                    UnOp::Neg if ty.is_numeric() => ty,
                    UnOp::BitNot if ty.is_integer() => ty,
                    _ => {
                        self.diagnostics.error(format!("operator not applicable to `{ty}`"), location.clone());
                        Type::Error
                    }
                }
            }
            Expr::Ternary { cond, then_branch, else_branch, location } => {
                self.expect_bool(cond, location);
                let t = self.infer_expr(then_branch);
                let e = self.infer_expr(else_branch);
                self.unify(&t, &e)
            }
            Expr::Call { callee, args, type_args, hot: _, location } => self.check_call(callee, args, type_args, location),
            Expr::Member { object, name, location } => self.check_member(object, name, location),
            Expr::Index { object, index, location } => {
                let obj_ty = self.infer_expr(object);
                let idx_ty = self.infer_expr(index);
                if !idx_ty.is_integer() && !matches!(obj_ty, Type::Map(_, _)) {
                    self.diagnostics.warning("index expression is not an integer".to_string(), location.clone());
                }
                match obj_ty {
                    Type::List(e) => *e,
                    Type::FixedArray { element, .. } => *element,
                    Type::Map(_, v) => *v,
                    Type::Str => Type::Str,
                    _ => Type::Unknown,
                }
            }
            Expr::ListLiteral { elements, location: _ } => {
                let mut elem_ty = Type::Unknown;
                for e in elements {
                    let t = self.infer_expr(e);
                    elem_ty = if matches!(elem_ty, Type::Unknown) { t } else { self.unify(&elem_ty, &t) };
                }
                Type::List(Box::new(if elements.is_empty() { Type::Any } else { elem_ty }))
            }
            Expr::RecordLiteral { type_name, fields, location } => {
                for (_, v) in fields {
                    self.infer_expr(v);
                }
                match type_name {
                    Some(name) => {
                        if !self.types.is_known_type_name(name) {
                            self.diagnostics.error(format!("unknown record type `{name}`"), location.clone());
                            Type::Error
                        } else {
                            Type::Record(name.clone())
                        }
                    }
                    None => Type::Unknown,
                }
            }
            Expr::MapLiteral { entries, location: _ } => {
                let mut kt = Type::Unknown;
                let mut vt = Type::Unknown;
                for (k, v) in entries {
                    let k_ty = self.infer_expr(k);
                    let v_ty = self.infer_expr(v);
                    kt = if matches!(kt, Type::Unknown) { k_ty } else { self.unify(&kt, &k_ty) };
                    vt = if matches!(vt, Type::Unknown) { v_ty } else { self.unify(&vt, &v_ty) };
                }
                Type::Map(
                    Box::new(if entries.is_empty() { Type::Any } else { kt }),
                    Box::new(if entries.is_empty() { Type::Any } else { vt }),
                )
            }
            Expr::RangeLiteral { start, end, step, inclusive: _, location } => {
                let s = self.infer_expr(start);
                let e = self.infer_expr(end);
                if let Some(step) = step {
                    self.infer_expr(step);
                }
                if !s.is_integer() || !e.is_integer() {
                    self.diagnostics.warning("range bounds should be integers".to_string(), location.clone());
                }
                Type::Generic { base: "range".to_string(), args: vec![Type::int()] }
            }
            Expr::Lambda { params, body, location: _ } => self.check_lambda(params, body),
            Expr::ListComprehension { element, var, iterable, condition, location: _ } => {
                let iter_ty = self.infer_expr(iterable);
                let elem_ty = match iter_ty {
                    Type::List(e) => *e,
                    _ => Type::int(),
                };
                self.symtab.push_scope(ScopeKind::Block);
                let mut sym = Symbol::new(var.clone(), SymbolKind::Variable, elem_ty, SourceLocation::synthetic());
                sym.is_initialized = true;
                let _ = self.symtab.define(sym);
                if let Some(cond) = condition {
                    self.infer_expr(cond);
                }
                let result_ty = self.infer_expr(element);
                self.symtab.pop_scope();
                Type::List(Box::new(result_ty))
            }
            Expr::AddressOf { operand, location } => {
                if !self.symtab.in_unsafe() {
                    self.diagnostics.error("`&` requires an unsafe scope".to_string(), location.clone());
                }
                self.mark_identifier_used(operand);
                let inner = self.infer_expr(operand);
                Type::Ptr { raw: false, mutable: false, inner: Box::new(inner) }
            }
            Expr::Deref { operand, location } => {
                if !self.symtab.in_unsafe() {
                    self.diagnostics.error("`*` requires an unsafe scope".to_string(), location.clone());
                }
                let ty = self.infer_expr(operand);
                match ty {
                    Type::Ptr { inner, .. } => *inner,
                    _ => {
                        self.diagnostics.error(format!("cannot dereference non-pointer `{ty}`"), location.clone());
                        Type::Error
                    }
                }
            }
            Expr::New { type_name, type_args, args, location } => {
                for a in args {
                    self.infer_expr(&a.value);
                }
                if !self.types.is_known_type_name(type_name) {
                    self.diagnostics.error(format!("unknown type `{type_name}` in `new`"), location.clone());
                    return Type::Error;
                }
                let resolved_args: Vec<Type> =
                    type_args.iter().filter_map(|t| self.types.resolve(t, &self.current_type_params).ok()).collect();
                if resolved_args.is_empty() {
                    Type::Record(type_name.clone())
                } else {
                    self.types.instantiate_generic(type_name, &resolved_args).unwrap_or(Type::Record(type_name.clone()))
                }
            }
            Expr::Cast { operand, target, location } => {
                self.infer_expr(operand);
                self.resolve_or_error(target, location)
            }
            Expr::Await { operand, location: _ } => {
                let ty = self.infer_expr(operand);
                match ty {
                    Type::Generic { base, mut args } if base == "task" && !args.is_empty() => args.remove(0),
                    other => other,
                }
            }
            Expr::Spawn { call, location } => {
                let ty = self.infer_expr(call);
                if !matches!(call.as_ref(), Expr::Call { .. }) {
                    self.diagnostics.error("`spawn` requires a call expression".to_string(), location.clone());
                }
                Type::Generic { base: "task".to_string(), args: vec![ty] }
            }
            Expr::Assign { target, op: _, value, location } => {
                let target_ty = self.infer_expr(target);
                let value_ty = self.infer_expr(value);
                if !self.assignable(&target_ty, &value_ty) {
                    self.diagnostics.error(
                        format!("cannot assign `{value_ty}` to `{target_ty}`"),
                        location.clone(),
                    );
                }
                target_ty
            }
            Expr::Propagate { operand, location: _ } => {
                let ty = self.infer_expr(operand);
                match ty {
                    Type::Generic { base, mut args } if base == "Result" && !args.is_empty() => args.remove(0),
                    other => other,
                }
            }
            Expr::DslBlock { .. } => Type::Any,
            Expr::SyncConstruct { ctor, element_type, args, location } => {
                for a in args {
                    self.infer_expr(a);
                }
                let elem = element_type
                    .as_ref()
                    .map(|t| self.resolve_or_error(t, location))
                    .unwrap_or(Type::Any);
                match ctor {
                    SyncCtor::MakeChan => Type::Channel(Box::new(elem)),
                    SyncCtor::MakeMutex => Type::Mutex(Box::new(elem)),
                    SyncCtor::MakeRwlock => Type::RwLock(Box::new(elem)),
                    SyncCtor::MakeCond => Type::Cond,
                    SyncCtor::MakeSemaphore => Type::Semaphore,
                }
            }
            Expr::SyncOperation { op, target, args, location: _ } => {
                let target_ty = self.infer_expr(target);
                for a in args {
                    self.infer_expr(a);
                }
                match op {
                    SyncOp::Read | SyncOp::Recv => match target_ty {
                        Type::Channel(e) | Type::RwLock(e) | Type::Mutex(e) => *e,
                        _ => Type::Unknown,
                    },
                    SyncOp::TryAcquire => Type::Bool,
                    _ => Type::Void,
                }
            }
        }
    }

    fn lookup_identifier(&mut self, name: &str, location: &SourceLocation) -> Type {
        if let Some(sym) = self.symtab.lookup(name) {
            let ty = sym.ty.clone();
            self.symtab.mark_used(name);
            return ty;
        }
        if let Some(sig) = self.functions.get(name) {
            return Type::Function {
                params: sig.params.iter().map(|(_, t)| t.clone()).collect(),
                ret: Box::new(sig.ret.clone()),
                is_closure: false,
            };
        }
        if self.current_type_params.iter().any(|p| p == name) {
            return Type::TypeParam(name.to_string());
        }
        // Spec I2: unresolved identifiers are reported, not guessed.
        self.diagnostics.error(format!("undefined name `{name}`"), location.clone());
        Type::Error
    }

    fn mark_identifier_used(&mut self, expr: &Expr) {
        if let Expr::Identifier(name, _) = expr {
            self.symtab.mark_used(name);
        }
    }

    fn check_binary(&mut self, op: &BinOp, left: &Expr, right: &Expr, location: &SourceLocation) -> Type {
        let lt = self.infer_expr(left);
        let rt = self.infer_expr(right);
        match op {
            BinOp::Add if lt == Type::Str || rt == Type::Str => Type::Str,
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
                if lt.is_numeric() && rt.is_numeric() {
                    self.promote_numeric(&lt, &rt)
                } else if matches!(lt, Type::Error) || matches!(rt, Type::Error) {
                    Type::Error
                } else {
                    self.diagnostics.error(
                        format!("cannot apply `{}` to `{lt}` and `{rt}`", bin_op_symbol(op)),
                        location.clone(),
                    );
                    Type::Error
                }
            }
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge | BinOp::Spaceship => {
                // Incomparable types are a warning, not an error (spec §4.5
                // "for flexibility").
                if lt != rt && !lt.is_numeric() && !rt.is_numeric() && lt != Type::Error && rt != Type::Error {
                    self.diagnostics.warning(format!("comparing unrelated types `{lt}` and `{rt}`"), location.clone());
                }
                if *op == BinOp::Spaceship { Type::int() } else { Type::Bool }
            }
            BinOp::And | BinOp::Or => Type::Bool,
            BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Shl | BinOp::Shr => {
                if lt.is_integer() { lt } else { Type::int() }
            }
            BinOp::NullCoalesce => {
                if let Type::Nullable(inner) = &lt {
                    self.unify(inner, &rt)
                } else {
                    lt
                }
            }
            BinOp::Range => Type::Generic { base: "range".to_string(), args: vec![Type::int()] },
            BinOp::Custom(_) => self.unify(&lt, &rt),
        }
    }

    fn promote_numeric(&self, a: &Type, b: &Type) -> Type {
        match (a, b) {
            (Type::Float(_), _) | (_, Type::Float(_)) => Type::float(),
            _ => a.clone(),
        }
    }

    fn check_call(&mut self, callee: &Expr, args: &[Arg], type_args: &[TypeExpr], location: &SourceLocation) -> Type {
        for a in args {
            self.infer_expr(&a.value);
        }
        let Expr::Identifier(name, _) = callee else {
            // Method/computed callees (`obj.method()`, lambdas) were already
            // inferred through the preceding `Member`/identifier lookup; we
            // don't re-validate arity for those here.
            let ty = self.infer_expr(callee);
            return match ty {
                Type::Function { ret, .. } => *ret,
                _ => Type::Unknown,
            };
        };
        self.mark_identifier_used(callee);
        let Some(sig) = self.functions.get(name).cloned() else {
            if crate::codegen::builtins::is_builtin(name) {
                return crate::codegen::builtins::builtin_return_type(name);
            }
            self.diagnostics.error(format!("call to undefined function `{name}`"), location.clone());
            return Type::Error;
        };
        if !sig.is_variadic && args.len() != sig.params.len() {
            self.diagnostics.error(
                format!("`{name}` expects {} argument(s), found {}", sig.params.len(), args.len()),
                location.clone(),
            );
        }
        if sig.generics.is_empty() {
            return sig.ret;
        }
        // Generic inference: collect `TypeParam` bindings from argument
        // types by position, unifying repeats (spec §4.5 "Function call").
        let mut bindings: HashMap<String, Type> = HashMap::new();
        if !type_args.is_empty() {
            for (g, t) in sig.generics.iter().zip(type_args.iter()) {
                if let Ok(resolved) = self.types.resolve(t, &self.current_type_params) {
                    bindings.insert(g.clone(), resolved);
                }
            }
        } else {
            for ((_, param_ty), arg) in sig.params.iter().zip(args.iter()) {
                if let Type::TypeParam(p) = param_ty {
                    let arg_ty = self.type_map.get(&expr_key(&arg.value)).cloned().unwrap_or(Type::Any);
                    bindings
                        .entry(p.clone())
                        .and_modify(|existing| *existing = self.unify(existing, &arg_ty))
                        .or_insert(arg_ty);
                }
            }
        }
        for g in &sig.generics {
            let Some(bound_ty) = bindings.get(g) else { continue };
            for bound in sig.bounds.get(g).into_iter().flatten() {
                if let Err(err) = self.traits.check_bound(bound_ty, bound) {
                    self.diagnostics.error(err.to_string(), location.clone());
                }
            }
        }
        self.generic_call_sites.push(GenericCallSite {
            callee: name.clone(),
            type_args: sig.generics.iter().map(|g| bindings.get(g).cloned().unwrap_or(Type::Any)).collect(),
        });
        TypeRegistry::substitute_type_params(&sig.ret, &bindings)
    }

    fn check_member(&mut self, object: &Expr, name: &str, location: &SourceLocation) -> Type {
        let obj_ty = self.infer_expr(object);
        let record_name = match obj_ty.strip_nullable() {
            Type::Record(n) => Some(n.clone()),
            Type::Ptr { inner, .. } => match inner.as_ref() {
                Type::Record(n) => Some(n.clone()),
                _ => None,
            },
            _ => None,
        };
        let Some(record_name) = record_name else {
            // Could be a trait-object method or a dynamically-typed (`any`)
            // field access; best-effort resolve to `Unknown` rather than
            // erroring, mirroring codegen's "best effort" policy for member
            // access through `any`.
            return Type::Unknown;
        };
        if let Some(record) = self.types.record(&record_name) {
            if let Some(ty) = record.field_type(name) {
                return ty.clone();
            }
        }
        // Method lookup: `T::name` registered by `collect_impl`.
        let qualified = format!("{record_name}::{name}");
        if let Some(sig) = self.functions.get(&qualified) {
            return Type::Function {
                params: sig.params.iter().map(|(_, t)| t.clone()).collect(),
                ret: Box::new(sig.ret.clone()),
                is_closure: false,
            };
        }
        self.diagnostics.error(format!("`{record_name}` has no field or method `{name}`"), location.clone());
        Type::Error
    }

    fn check_lambda(&mut self, params: &[Param], body: &LambdaBody) -> Type {
        self.symtab.push_scope(ScopeKind::Function);
        let mut param_tys = Vec::new();
        for p in params {
            let ty = p.type_ann.as_ref().map(|t| self.resolve_or_error(t, &SourceLocation::synthetic())).unwrap_or(Type::Any);
            param_tys.push(ty.clone());
            let mut sym = Symbol::new(p.name.clone(), SymbolKind::Parameter, ty, SourceLocation::synthetic());
            sym.is_initialized = true;
            let _ = self.symtab.define(sym);
        }
        let ret = match body {
            LambdaBody::Expr(e) => self.infer_expr(e),
            LambdaBody::Block(stmts) => {
                let mut ret = Type::Void;
                for s in stmts {
                    if let Stmt::Return { value: Some(e), .. } = s {
                        ret = self.infer_expr(e);
                    } else {
                        self.check_stmt(s);
                    }
                }
                ret
            }
        };
        self.symtab.pop_scope();
        Type::Function { params: param_tys, ret: Box::new(ret), is_closure: true }
    }

    fn expect_bool(&mut self, expr: &Expr, location: &SourceLocation) {
        let ty = self.infer_expr(expr);
        if ty != Type::Bool && ty != Type::Error && ty != Type::Unknown {
            self.diagnostics.warning(format!("condition has non-bool type `{ty}`"), location.clone());
        }
    }

    fn resolve_or_error(&mut self, type_expr: &TypeExpr, location: &SourceLocation) -> Type {
        match self.types.resolve(type_expr, &self.current_type_params) {
            Ok(ty) => ty,
            Err(err) => {
                self.diagnostics.error(err.to_string(), location.clone());
                Type::Error
            }
        }
    }

    fn assignable(&self, target: &Type, value: &Type) -> bool {
        if *target == *value || *target == Type::Any || *value == Type::Any {
            return true;
        }
        if *value == Type::Error || *target == Type::Error || *value == Type::Never || *target == Type::Unknown {
            return true;
        }
        if target.is_numeric() && value.is_numeric() {
            return true;
        }
        if let Type::Nullable(inner) = target {
            return **inner == *value || matches!(value, Type::Nullable(_)) || *value == Type::Any;
        }
        false
    }

    /// Unifies two branch/arm types to a common type (spec §4.5 "match:
    /// ...all arms unified to a common type").
    fn unify(&self, a: &Type, b: &Type) -> Type {
        if a == b {
            return a.clone();
        }
        match (a, b) {
            (Type::Never, other) | (other, Type::Never) => other.clone(),
            (Type::Unknown, other) | (other, Type::Unknown) => other.clone(),
            (t, Type::Float(_)) | (Type::Float(_), t) if t.is_numeric() => Type::float(),
            _ if a.is_numeric() && b.is_numeric() => Type::int(),
            _ => Type::Any,
        }
    }
}

fn bin_op_symbol(op: &BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Mod => "%",
        _ => "?",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;
    use std::path::PathBuf;

    fn check(src: &str) -> CheckResult {
        let (program, parse_errors) = parse_source(src, PathBuf::from("t.tl")).unwrap();
        assert!(parse_errors.is_empty(), "parse errors: {parse_errors:?}");
        TypeChecker::new().check(&program)
    }

    #[test]
    fn simple_program_passes() {
        let result = check("fn main():\n    let x = 1\n    print(x)\n");
        assert!(result.ok(), "{:?}", result.diagnostics.iter().collect::<Vec<_>>());
    }

    #[test]
    fn recursive_function_resolves_itself() {
        let result = check(
            "fn fib(n: int) -> int:\n    if n < 2:\n        return n\n    return fib(n - 1) + fib(n - 2)\n",
        );
        assert!(result.ok());
    }

    #[test]
    fn generic_call_infers_type_argument() {
        let result = check("fn id[T](x: T) -> T:\n    return x\nlet y = id(5)\n");
        assert!(result.ok());
        assert_eq!(result.generic_call_sites.len(), 1);
        assert_eq!(result.generic_call_sites[0].type_args, vec![Type::int()]);
    }

    #[test]
    fn unresolved_identifier_is_an_error() {
        let result = check("fn main():\n    print(nonexistent)\n");
        assert!(!result.ok());
    }

    #[test]
    fn unsafe_required_for_address_of() {
        let result = check("fn main():\n    let x = 1\n    let p = &x\n");
        assert!(!result.ok());
    }

    #[test]
    fn address_of_inside_unsafe_block_passes() {
        let result = check("fn main():\n    let x = 1\n    unsafe:\n        let p = &x\n");
        assert!(result.ok(), "{:?}", result.diagnostics.iter().collect::<Vec<_>>());
    }

    #[test]
    fn impl_missing_method_is_an_error_naming_method_and_trait() {
        let result = check(
            "trait Greet:\n    fn hello() -> str\nrecord Dog:\n    name: str\nimpl Greet for Dog:\n    fn bye() -> str:\n        return \"bye\"\n",
        );
        assert!(!result.ok());
        let msg = result.diagnostics.iter().find(|d| d.message.contains("Greet")).unwrap();
        assert!(msg.message.contains("hello"));
    }

    #[test]
    fn unused_variable_emits_warning_not_error() {
        let result = check("fn main():\n    let unused = 1\n");
        assert!(result.ok());
        assert!(result.diagnostics.iter().any(|d| d.message.contains("unused")));
    }
}
