//! Monomorphizer (spec §4.6 "Monomorphizer").
//!
//! Consumes the generic call sites the type checker collected and produces
//! one concrete [`FunctionDecl`] per distinct `(base name, type args)` pair
//! actually called, substituting [`Type::TypeParam`] occurrences with the
//! concrete argument types everywhere a generic parameter's name appears in
//! the body. Mangled names are `base_name + "$" + dollar-joined type-arg
//! strings` (spec §4.6 "Mangling"), computed once per call site so the same
//! instantiation is never emitted twice (spec I5 "idempotence").
//!
//! Grounded in the teacher's specialization pass
//! (`navicore-cem3/crates/compiler/src/codegen/specialization.rs`): a
//! registry keyed by mangled name, populated lazily as call sites are
//! discovered, walked once more at the end to catch specializations that
//! were themselves discovered while specializing another generic.

use crate::ast::{Arg, Expr, FunctionDecl, ImplDecl, LambdaBody, MatchCase, Param, Program, Stmt, TypeExpr};
use crate::typechecker::GenericCallSite;
use crate::types::Type;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// Turns a concrete [`Type`] into the mangle-safe fragment used in
/// specialized names (spec §4.6: "each type argument rendered as its
/// canonical name, illegal identifier characters replaced").
pub fn mangle_type(ty: &Type) -> String {
    match ty {
        Type::Void => "void".to_string(),
        Type::Bool => "bool".to_string(),
        Type::Str => "str".to_string(),
        Type::Int(k) => format!("{k:?}").to_lowercase(),
        Type::Float(k) => format!("{k:?}").to_lowercase(),
        Type::List(e) => format!("list_{}", mangle_type(e)),
        Type::Map(k, v) => format!("map_{}_{}", mangle_type(k), mangle_type(v)),
        Type::Record(n) => n.clone(),
        Type::Ptr { raw, inner, .. } => format!("{}{}", if *raw { "ptr_" } else { "ref_" }, mangle_type(inner)),
        Type::Nullable(t) => format!("opt_{}", mangle_type(t)),
        Type::FixedArray { element, size } => format!("arr_{}_{}", mangle_type(element), size),
        Type::Generic { base, args } => {
            let parts: Vec<String> = args.iter().map(mangle_type).collect();
            format!("{base}_{}", parts.join("_"))
        }
        Type::Trait(n) | Type::TraitObject(n) => n.clone(),
        Type::Channel(t) => format!("chan_{}", mangle_type(t)),
        Type::Mutex(t) => format!("mutex_{}", mangle_type(t)),
        Type::RwLock(t) => format!("rwlock_{}", mangle_type(t)),
        Type::Cond => "cond".to_string(),
        Type::Semaphore => "semaphore".to_string(),
        Type::Function { .. } => "fn".to_string(),
        Type::TypeParam(n) => n.clone(),
        Type::Any => "any".to_string(),
        Type::Never => "never".to_string(),
        Type::Unknown | Type::Error => "unknown".to_string(),
    }
}

/// Mangled name for `base` instantiated with `type_args`, in call-site
/// order (spec §4.6 "Mangling": `base_name + "$" + dollar-joined type-arg
/// strings`).
pub fn mangled_name(base: &str, type_args: &[Type]) -> String {
    if type_args.is_empty() {
        return base.to_string();
    }
    let parts: Vec<String> = type_args.iter().map(mangle_type).collect();
    format!("{base}${}", parts.join("$"))
}

#[derive(Debug)]
pub enum MonoError {
    UnknownGenericFunction(String),
    ArityMismatch { name: String, expected: usize, found: usize },
}

impl std::fmt::Display for MonoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonoError::UnknownGenericFunction(n) => write!(f, "no generic function named `{n}` to specialize"),
            MonoError::ArityMismatch { name, expected, found } => {
                write!(f, "`{name}` expects {expected} type arguments, call site supplied {found}")
            }
        }
    }
}

impl std::error::Error for MonoError {}

/// Substitutes every [`TypeExpr::Name`] that names a type parameter with
/// the concrete type's rendered name, leaving everything else as written
/// (spec §4.6 "Substitution walks the AST copy, rewriting type
/// annotations and any `TypeExpr` referencing a bound parameter").
fn substitute_type_expr(expr: &TypeExpr, bindings: &HashMap<String, Type>) -> TypeExpr {
    match expr {
        TypeExpr::Name(n) => match bindings.get(n) {
            Some(ty) => TypeExpr::Name(ty.to_string()),
            None => expr.clone(),
        },
        TypeExpr::Pointer { raw, inner } => TypeExpr::Pointer { raw: *raw, inner: Box::new(substitute_type_expr(inner, bindings)) },
        TypeExpr::Reference { mutable, inner } => {
            TypeExpr::Reference { mutable: *mutable, inner: Box::new(substitute_type_expr(inner, bindings)) }
        }
        TypeExpr::List(inner) => TypeExpr::List(Box::new(substitute_type_expr(inner, bindings))),
        TypeExpr::FixedArray { element, size } => {
            TypeExpr::FixedArray { element: Box::new(substitute_type_expr(element, bindings)), size: size.clone() }
        }
        TypeExpr::Generic { base, args } => TypeExpr::Generic {
            base: bindings.get(base).map(|t| t.to_string()).unwrap_or_else(|| base.clone()),
            args: args.iter().map(|a| substitute_type_expr(a, bindings)).collect(),
        },
        TypeExpr::Nullable(inner) => TypeExpr::Nullable(Box::new(substitute_type_expr(inner, bindings))),
        TypeExpr::Function { params, ret } => TypeExpr::Function {
            params: params.iter().map(|p| substitute_type_expr(p, bindings)).collect(),
            ret: Box::new(substitute_type_expr(ret, bindings)),
        },
    }
}

fn substitute_param(param: &Param, bindings: &HashMap<String, Type>) -> Param {
    Param { name: param.name.clone(), type_ann: param.type_ann.as_ref().map(|t| substitute_type_expr(t, bindings)), default: param.default.clone() }
}

fn substitute_stmts(stmts: &[Stmt], bindings: &HashMap<String, Type>) -> Vec<Stmt> {
    stmts.iter().map(|s| substitute_stmt(s, bindings)).collect()
}

fn substitute_stmt(stmt: &Stmt, bindings: &HashMap<String, Type>) -> Stmt {
    match stmt {
        Stmt::Expr(e) => Stmt::Expr(substitute_expr(e, bindings)),
        Stmt::VarDecl { name, is_mut, type_ann, init, location } => Stmt::VarDecl {
            name: name.clone(),
            is_mut: *is_mut,
            type_ann: type_ann.as_ref().map(|t| substitute_type_expr(t, bindings)),
            init: init.as_ref().map(|e| substitute_expr(e, bindings)),
            location: location.clone(),
        },
        Stmt::ConstDecl { name, value, location } => {
            Stmt::ConstDecl { name: name.clone(), value: substitute_expr(value, bindings), location: location.clone() }
        }
        Stmt::Destructure { shape, rhs, location } => {
            Stmt::Destructure { shape: shape.clone(), rhs: substitute_expr(rhs, bindings), location: location.clone() }
        }
        Stmt::CompoundAssign { target, op, value, location } => Stmt::CompoundAssign {
            target: substitute_expr(target, bindings),
            op: *op,
            value: substitute_expr(value, bindings),
            location: location.clone(),
        },
        Stmt::Block(body) => Stmt::Block(substitute_stmts(body, bindings)),
        Stmt::If { cond, then_branch, elifs, else_branch, location } => Stmt::If {
            cond: substitute_expr(cond, bindings),
            then_branch: substitute_stmts(then_branch, bindings),
            elifs: elifs.iter().map(|(c, b)| (substitute_expr(c, bindings), substitute_stmts(b, bindings))).collect(),
            else_branch: else_branch.as_ref().map(|b| substitute_stmts(b, bindings)),
            location: location.clone(),
        },
        Stmt::While { cond, body, location } => {
            Stmt::While { cond: substitute_expr(cond, bindings), body: substitute_stmts(body, bindings), location: location.clone() }
        }
        Stmt::ForIn { var, iterable, body, location } => Stmt::ForIn {
            var: var.clone(),
            iterable: substitute_expr(iterable, bindings),
            body: substitute_stmts(body, bindings),
            location: location.clone(),
        },
        Stmt::Match { value, cases, location } => Stmt::Match {
            value: substitute_expr(value, bindings),
            cases: cases
                .iter()
                .map(|c| crate::ast::MatchCase {
                    pattern: c.pattern.clone(),
                    guard: c.guard.as_ref().map(|g| substitute_expr(g, bindings)),
                    body: substitute_stmts(&c.body, bindings),
                    location: c.location.clone(),
                })
                .collect(),
            location: location.clone(),
        },
        Stmt::Return { value, location } => Stmt::Return { value: value.as_ref().map(|e| substitute_expr(e, bindings)), location: location.clone() },
        Stmt::Break { location } => Stmt::Break { location: location.clone() },
        Stmt::Continue { location } => Stmt::Continue { location: location.clone() },
        Stmt::TryElse { body, else_name, else_body, location } => Stmt::TryElse {
            body: substitute_stmts(body, bindings),
            else_name: else_name.clone(),
            else_body: substitute_stmts(else_body, bindings),
            location: location.clone(),
        },
        Stmt::UnsafeBlock { body, location } => {
            Stmt::UnsafeBlock { body: Box::new(substitute_stmt(body, bindings)), location: location.clone() }
        }
        Stmt::Delete { target, location } => Stmt::Delete { target: substitute_expr(target, bindings), location: location.clone() },
        Stmt::Lock { mutex, body, location } => {
            Stmt::Lock { mutex: substitute_expr(mutex, bindings), body: Box::new(substitute_stmt(body, bindings)), location: location.clone() }
        }
        // Nested declarations, imports, extern blocks, and inline asm carry
        // no references to the enclosing function's type parameters.
        other => other.clone(),
    }
}

fn substitute_expr(expr: &Expr, bindings: &HashMap<String, Type>) -> Expr {
    match expr {
        Expr::Binary { op, left, right, location } => Expr::Binary {
            op: op.clone(),
            left: Box::new(substitute_expr(left, bindings)),
            right: Box::new(substitute_expr(right, bindings)),
            location: location.clone(),
        },
        Expr::Unary { op, operand, location } => {
            Expr::Unary { op: *op, operand: Box::new(substitute_expr(operand, bindings)), location: location.clone() }
        }
        Expr::Ternary { cond, then_branch, else_branch, location } => Expr::Ternary {
            cond: Box::new(substitute_expr(cond, bindings)),
            then_branch: Box::new(substitute_expr(then_branch, bindings)),
            else_branch: Box::new(substitute_expr(else_branch, bindings)),
            location: location.clone(),
        },
        Expr::Call { callee, args, type_args, hot, location } => Expr::Call {
            callee: Box::new(substitute_expr(callee, bindings)),
            args: args.iter().map(|a| crate::ast::Arg { name: a.name.clone(), value: substitute_expr(&a.value, bindings) }).collect(),
            type_args: type_args.iter().map(|t| substitute_type_expr(t, bindings)).collect(),
            hot: *hot,
            location: location.clone(),
        },
        Expr::Member { object, name, location } => {
            Expr::Member { object: Box::new(substitute_expr(object, bindings)), name: name.clone(), location: location.clone() }
        }
        Expr::Index { object, index, location } => Expr::Index {
            object: Box::new(substitute_expr(object, bindings)),
            index: Box::new(substitute_expr(index, bindings)),
            location: location.clone(),
        },
        Expr::ListLiteral { elements, location } => {
            Expr::ListLiteral { elements: elements.iter().map(|e| substitute_expr(e, bindings)).collect(), location: location.clone() }
        }
        Expr::RecordLiteral { type_name, fields, location } => Expr::RecordLiteral {
            type_name: type_name.clone(),
            fields: fields.iter().map(|(n, e)| (n.clone(), substitute_expr(e, bindings))).collect(),
            location: location.clone(),
        },
        Expr::MapLiteral { entries, location } => Expr::MapLiteral {
            entries: entries.iter().map(|(k, v)| (substitute_expr(k, bindings), substitute_expr(v, bindings))).collect(),
            location: location.clone(),
        },
        Expr::RangeLiteral { start, end, step, inclusive, location } => Expr::RangeLiteral {
            start: Box::new(substitute_expr(start, bindings)),
            end: Box::new(substitute_expr(end, bindings)),
            step: step.as_ref().map(|s| Box::new(substitute_expr(s, bindings))),
            inclusive: *inclusive,
            location: location.clone(),
        },
        Expr::Lambda { params, body, location } => Expr::Lambda {
            params: params.iter().map(|p| substitute_param(p, bindings)).collect(),
            body: Box::new(match body.as_ref() {
                LambdaBody::Expr(e) => LambdaBody::Expr(substitute_expr(e, bindings)),
                LambdaBody::Block(b) => LambdaBody::Block(substitute_stmts(b, bindings)),
            }),
            location: location.clone(),
        },
        Expr::ListComprehension { element, var, iterable, condition, location } => Expr::ListComprehension {
            element: Box::new(substitute_expr(element, bindings)),
            var: var.clone(),
            iterable: Box::new(substitute_expr(iterable, bindings)),
            condition: condition.as_ref().map(|c| Box::new(substitute_expr(c, bindings))),
            location: location.clone(),
        },
        Expr::AddressOf { operand, location } => Expr::AddressOf { operand: Box::new(substitute_expr(operand, bindings)), location: location.clone() },
        Expr::Deref { operand, location } => Expr::Deref { operand: Box::new(substitute_expr(operand, bindings)), location: location.clone() },
        Expr::New { type_name, type_args, args, location } => Expr::New {
            type_name: bindings.get(type_name).map(|t| t.to_string()).unwrap_or_else(|| type_name.clone()),
            type_args: type_args.iter().map(|t| substitute_type_expr(t, bindings)).collect(),
            args: args.iter().map(|a| crate::ast::Arg { name: a.name.clone(), value: substitute_expr(&a.value, bindings) }).collect(),
            location: location.clone(),
        },
        Expr::Cast { operand, target, location } => {
            Expr::Cast { operand: Box::new(substitute_expr(operand, bindings)), target: substitute_type_expr(target, bindings), location: location.clone() }
        }
        Expr::Await { operand, location } => Expr::Await { operand: Box::new(substitute_expr(operand, bindings)), location: location.clone() },
        Expr::Spawn { call, location } => Expr::Spawn { call: Box::new(substitute_expr(call, bindings)), location: location.clone() },
        Expr::Assign { target, op, value, location } => Expr::Assign {
            target: Box::new(substitute_expr(target, bindings)),
            op: *op,
            value: Box::new(substitute_expr(value, bindings)),
            location: location.clone(),
        },
        Expr::Propagate { operand, location } => Expr::Propagate { operand: Box::new(substitute_expr(operand, bindings)), location: location.clone() },
        Expr::SyncConstruct { ctor, element_type, args, location } => Expr::SyncConstruct {
            ctor: *ctor,
            element_type: element_type.as_ref().map(|t| substitute_type_expr(t, bindings)),
            args: args.iter().map(|a| substitute_expr(a, bindings)).collect(),
            location: location.clone(),
        },
        Expr::SyncOperation { op, target, args, location } => Expr::SyncOperation {
            op: *op,
            target: Box::new(substitute_expr(target, bindings)),
            args: args.iter().map(|a| substitute_expr(a, bindings)).collect(),
            location: location.clone(),
        },
        // Literals, identifiers, and DSL blocks carry no type parameters
        // of their own.
        other => other.clone(),
    }
}

/// Per-callee-name FIFO queues of the call sites the checker discovered,
/// consumed in the same left-to-right, top-to-bottom order the checker's
/// single-pass walk produced them in. Rewriting re-walks the flattened,
/// non-generic statements in that same order so the Nth call to a given
/// generic name picks up the Nth recorded instantiation (spec §4.6:
/// "Call sites use the mangled name when calling").
type CallQueues = HashMap<String, VecDeque<GenericCallSite>>;

fn build_call_queues(call_sites: &[GenericCallSite]) -> CallQueues {
    let mut queues: CallQueues = HashMap::new();
    for site in call_sites {
        queues.entry(site.callee.clone()).or_default().push_back(site.clone());
    }
    queues
}

/// Rewrites every `Expr::Call` whose callee identifier names a generic
/// function to call the mangled specialization instead, threading the
/// per-name queues through the whole statement list so recursive descent
/// into nested bodies consumes sites in visitation order.
fn rewrite_calls_in_stmts(stmts: &[Stmt], queues: &mut CallQueues) -> Vec<Stmt> {
    stmts.iter().map(|s| rewrite_calls_in_stmt(s, queues)).collect()
}

fn rewrite_calls_in_stmt(stmt: &Stmt, queues: &mut CallQueues) -> Stmt {
    match stmt {
        Stmt::Expr(e) => Stmt::Expr(rewrite_calls_in_expr(e, queues)),
        Stmt::VarDecl { name, is_mut, type_ann, init, location } => Stmt::VarDecl {
            name: name.clone(),
            is_mut: *is_mut,
            type_ann: type_ann.clone(),
            init: init.as_ref().map(|e| rewrite_calls_in_expr(e, queues)),
            location: location.clone(),
        },
        Stmt::ConstDecl { name, value, location } => {
            Stmt::ConstDecl { name: name.clone(), value: rewrite_calls_in_expr(value, queues), location: location.clone() }
        }
        Stmt::Destructure { shape, rhs, location } => {
            Stmt::Destructure { shape: shape.clone(), rhs: rewrite_calls_in_expr(rhs, queues), location: location.clone() }
        }
        Stmt::CompoundAssign { target, op, value, location } => Stmt::CompoundAssign {
            target: rewrite_calls_in_expr(target, queues),
            op: *op,
            value: rewrite_calls_in_expr(value, queues),
            location: location.clone(),
        },
        Stmt::Block(body) => Stmt::Block(rewrite_calls_in_stmts(body, queues)),
        Stmt::If { cond, then_branch, elifs, else_branch, location } => Stmt::If {
            cond: rewrite_calls_in_expr(cond, queues),
            then_branch: rewrite_calls_in_stmts(then_branch, queues),
            elifs: elifs.iter().map(|(c, b)| (rewrite_calls_in_expr(c, queues), rewrite_calls_in_stmts(b, queues))).collect(),
            else_branch: else_branch.as_ref().map(|b| rewrite_calls_in_stmts(b, queues)),
            location: location.clone(),
        },
        Stmt::While { cond, body, location } => {
            Stmt::While { cond: rewrite_calls_in_expr(cond, queues), body: rewrite_calls_in_stmts(body, queues), location: location.clone() }
        }
        Stmt::ForIn { var, iterable, body, location } => Stmt::ForIn {
            var: var.clone(),
            iterable: rewrite_calls_in_expr(iterable, queues),
            body: rewrite_calls_in_stmts(body, queues),
            location: location.clone(),
        },
        Stmt::Match { value, cases, location } => Stmt::Match {
            value: rewrite_calls_in_expr(value, queues),
            cases: cases
                .iter()
                .map(|c| MatchCase {
                    pattern: c.pattern.clone(),
                    guard: c.guard.as_ref().map(|g| rewrite_calls_in_expr(g, queues)),
                    body: rewrite_calls_in_stmts(&c.body, queues),
                    location: c.location.clone(),
                })
                .collect(),
            location: location.clone(),
        },
        Stmt::Return { value, location } => Stmt::Return { value: value.as_ref().map(|e| rewrite_calls_in_expr(e, queues)), location: location.clone() },
        Stmt::Break { location } => Stmt::Break { location: location.clone() },
        Stmt::Continue { location } => Stmt::Continue { location: location.clone() },
        Stmt::TryElse { body, else_name, else_body, location } => Stmt::TryElse {
            body: rewrite_calls_in_stmts(body, queues),
            else_name: else_name.clone(),
            else_body: rewrite_calls_in_stmts(else_body, queues),
            location: location.clone(),
        },
        Stmt::FunctionDecl(f) => Stmt::FunctionDecl(Rc::new(FunctionDecl {
            name: f.name.clone(),
            generics: f.generics.clone(),
            params: f.params.clone(),
            return_type: f.return_type.clone(),
            body: rewrite_calls_in_stmts(&f.body, queues),
            calling_convention: f.calling_convention.clone(),
            is_pub: f.is_pub,
            is_extern: f.is_extern,
            is_async: f.is_async,
            is_hot: f.is_hot,
            is_cold: f.is_cold,
            is_variadic: f.is_variadic,
            is_naked: f.is_naked,
            location: f.location.clone(),
        })),
        Stmt::ImplDecl(i) => Stmt::ImplDecl(Rc::new(ImplDecl {
            trait_name: i.trait_name.clone(),
            type_name: i.type_name.clone(),
            type_args: i.type_args.clone(),
            methods: i
                .methods
                .iter()
                .map(|m| FunctionDecl { body: rewrite_calls_in_stmts(&m.body, queues), ..m.clone() })
                .collect(),
            location: i.location.clone(),
        })),
        Stmt::UnsafeBlock { body, location } => {
            Stmt::UnsafeBlock { body: Box::new(rewrite_calls_in_stmt(body, queues)), location: location.clone() }
        }
        Stmt::Delete { target, location } => Stmt::Delete { target: rewrite_calls_in_expr(target, queues), location: location.clone() },
        Stmt::Lock { mutex, body, location } => {
            Stmt::Lock { mutex: rewrite_calls_in_expr(mutex, queues), body: Box::new(rewrite_calls_in_stmt(body, queues)), location: location.clone() }
        }
        other => other.clone(),
    }
}

fn rewrite_calls_in_expr(expr: &Expr, queues: &mut CallQueues) -> Expr {
    match expr {
        Expr::Binary { op, left, right, location } => Expr::Binary {
            op: op.clone(),
            left: Box::new(rewrite_calls_in_expr(left, queues)),
            right: Box::new(rewrite_calls_in_expr(right, queues)),
            location: location.clone(),
        },
        Expr::Unary { op, operand, location } => {
            Expr::Unary { op: *op, operand: Box::new(rewrite_calls_in_expr(operand, queues)), location: location.clone() }
        }
        Expr::Ternary { cond, then_branch, else_branch, location } => Expr::Ternary {
            cond: Box::new(rewrite_calls_in_expr(cond, queues)),
            then_branch: Box::new(rewrite_calls_in_expr(then_branch, queues)),
            else_branch: Box::new(rewrite_calls_in_expr(else_branch, queues)),
            location: location.clone(),
        },
        Expr::Call { callee, args, type_args, hot, location } => {
            let new_args: Vec<Arg> = args.iter().map(|a| Arg { name: a.name.clone(), value: rewrite_calls_in_expr(&a.value, queues) }).collect();
            // Recurse into the callee first (covers `f()()`-style chains),
            // then, if it names a generic directly, pop this call's
            // instantiation off that name's queue and mangle it.
            let rewritten_callee = rewrite_calls_in_expr(callee, queues);
            let new_callee = match &rewritten_callee {
                Expr::Identifier(name, loc) => match queues.get_mut(name).and_then(VecDeque::pop_front) {
                    Some(site) => Expr::Identifier(mangled_name(&site.callee, &site.type_args), loc.clone()),
                    None => rewritten_callee,
                },
                _ => rewritten_callee,
            };
            Expr::Call { callee: Box::new(new_callee), args: new_args, type_args: type_args.clone(), hot: *hot, location: location.clone() }
        }
        Expr::Member { object, name, location } => {
            Expr::Member { object: Box::new(rewrite_calls_in_expr(object, queues)), name: name.clone(), location: location.clone() }
        }
        Expr::Index { object, index, location } => Expr::Index {
            object: Box::new(rewrite_calls_in_expr(object, queues)),
            index: Box::new(rewrite_calls_in_expr(index, queues)),
            location: location.clone(),
        },
        Expr::ListLiteral { elements, location } => {
            Expr::ListLiteral { elements: elements.iter().map(|e| rewrite_calls_in_expr(e, queues)).collect(), location: location.clone() }
        }
        Expr::RecordLiteral { type_name, fields, location } => Expr::RecordLiteral {
            type_name: type_name.clone(),
            fields: fields.iter().map(|(n, e)| (n.clone(), rewrite_calls_in_expr(e, queues))).collect(),
            location: location.clone(),
        },
        Expr::MapLiteral { entries, location } => Expr::MapLiteral {
            entries: entries.iter().map(|(k, v)| (rewrite_calls_in_expr(k, queues), rewrite_calls_in_expr(v, queues))).collect(),
            location: location.clone(),
        },
        Expr::RangeLiteral { start, end, step, inclusive, location } => Expr::RangeLiteral {
            start: Box::new(rewrite_calls_in_expr(start, queues)),
            end: Box::new(rewrite_calls_in_expr(end, queues)),
            step: step.as_ref().map(|s| Box::new(rewrite_calls_in_expr(s, queues))),
            inclusive: *inclusive,
            location: location.clone(),
        },
        Expr::Lambda { params, body, location } => Expr::Lambda {
            params: params.clone(),
            body: Box::new(match body.as_ref() {
                LambdaBody::Expr(e) => LambdaBody::Expr(rewrite_calls_in_expr(e, queues)),
                LambdaBody::Block(b) => LambdaBody::Block(rewrite_calls_in_stmts(b, queues)),
            }),
            location: location.clone(),
        },
        Expr::ListComprehension { element, var, iterable, condition, location } => Expr::ListComprehension {
            element: Box::new(rewrite_calls_in_expr(element, queues)),
            var: var.clone(),
            iterable: Box::new(rewrite_calls_in_expr(iterable, queues)),
            condition: condition.as_ref().map(|c| Box::new(rewrite_calls_in_expr(c, queues))),
            location: location.clone(),
        },
        Expr::AddressOf { operand, location } => Expr::AddressOf { operand: Box::new(rewrite_calls_in_expr(operand, queues)), location: location.clone() },
        Expr::Deref { operand, location } => Expr::Deref { operand: Box::new(rewrite_calls_in_expr(operand, queues)), location: location.clone() },
        Expr::New { type_name, type_args, args, location } => Expr::New {
            type_name: type_name.clone(),
            type_args: type_args.clone(),
            args: args.iter().map(|a| Arg { name: a.name.clone(), value: rewrite_calls_in_expr(&a.value, queues) }).collect(),
            location: location.clone(),
        },
        Expr::Cast { operand, target, location } => {
            Expr::Cast { operand: Box::new(rewrite_calls_in_expr(operand, queues)), target: target.clone(), location: location.clone() }
        }
        Expr::Await { operand, location } => Expr::Await { operand: Box::new(rewrite_calls_in_expr(operand, queues)), location: location.clone() },
        Expr::Spawn { call, location } => Expr::Spawn { call: Box::new(rewrite_calls_in_expr(call, queues)), location: location.clone() },
        Expr::Assign { target, op, value, location } => Expr::Assign {
            target: Box::new(rewrite_calls_in_expr(target, queues)),
            op: *op,
            value: Box::new(rewrite_calls_in_expr(value, queues)),
            location: location.clone(),
        },
        Expr::Propagate { operand, location } => Expr::Propagate { operand: Box::new(rewrite_calls_in_expr(operand, queues)), location: location.clone() },
        Expr::SyncConstruct { ctor, element_type, args, location } => Expr::SyncConstruct {
            ctor: *ctor,
            element_type: element_type.clone(),
            args: args.iter().map(|a| rewrite_calls_in_expr(a, queues)).collect(),
            location: location.clone(),
        },
        Expr::SyncOperation { op, target, args, location } => Expr::SyncOperation {
            op: *op,
            target: Box::new(rewrite_calls_in_expr(target, queues)),
            args: args.iter().map(|a| rewrite_calls_in_expr(a, queues)).collect(),
            location: location.clone(),
        },
        other => other.clone(),
    }
}

/// Drives specialization to a fixed point: instantiating one generic may
/// itself call another generic function, so newly produced bodies are
/// scanned for further call sites until none remain (spec I5 "a call site
/// reachable only through another specialization is still specialized").
pub struct Monomorphizer<'a> {
    generics: HashMap<String, &'a FunctionDecl>,
    produced: HashMap<String, Rc<FunctionDecl>>,
}

impl<'a> Monomorphizer<'a> {
    pub fn new(generics: HashMap<String, &'a FunctionDecl>) -> Self {
        Monomorphizer { generics, produced: HashMap::new() }
    }

    /// Runs monomorphization over the initial call sites the checker found,
    /// returning every specialized function keyed by its mangled name.
    pub fn run(mut self, call_sites: &[GenericCallSite]) -> Result<Vec<Rc<FunctionDecl>>, MonoError> {
        let mut pending: Vec<GenericCallSite> = call_sites.to_vec();
        while let Some(site) = pending.pop() {
            let mangled = mangled_name(&site.callee, &site.type_args);
            if self.produced.contains_key(&mangled) {
                continue;
            }
            let template = *self
                .generics
                .get(&site.callee)
                .ok_or_else(|| MonoError::UnknownGenericFunction(site.callee.clone()))?;
            if template.generics.len() != site.type_args.len() {
                return Err(MonoError::ArityMismatch { name: site.callee.clone(), expected: template.generics.len(), found: site.type_args.len() });
            }
            let bindings: HashMap<String, Type> =
                template.generics.iter().map(|p| p.name.clone()).zip(site.type_args.iter().cloned()).collect();

            let specialized = FunctionDecl {
                name: mangled.clone(),
                generics: Vec::new(),
                params: template.params.iter().map(|p| substitute_param(p, &bindings)).collect(),
                return_type: template.return_type.as_ref().map(|t| substitute_type_expr(t, &bindings)),
                body: substitute_stmts(&template.body, &bindings),
                calling_convention: template.calling_convention.clone(),
                is_pub: template.is_pub,
                is_extern: template.is_extern,
                is_async: template.is_async,
                is_hot: template.is_hot,
                is_cold: template.is_cold,
                is_variadic: template.is_variadic,
                is_naked: template.is_naked,
                location: template.location.clone(),
            };
            self.produced.insert(mangled, Rc::new(specialized));
        }
        let mut out: Vec<Rc<FunctionDecl>> = self.produced.into_values().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

/// Top-level entry point (spec §4.6): walks `program` for the generic
/// function templates named by `call_sites`, specializes each one, and
/// returns the flattened program — every generic [`Stmt::FunctionDecl`]
/// template removed, every concrete instantiation appended — ready for the
/// code generator, which never sees an unresolved type parameter.
pub fn monomorphize(program: &Program, call_sites: &[GenericCallSite]) -> Result<Program, MonoError> {
    let mut generics: HashMap<String, &FunctionDecl> = HashMap::new();
    let mut statements = Vec::with_capacity(program.statements.len());
    for stmt in &program.statements {
        if let Stmt::FunctionDecl(f) = stmt {
            if !f.generics.is_empty() {
                generics.insert(f.name.clone(), f.as_ref());
                continue;
            }
        }
        statements.push(stmt.clone());
    }

    let specialized = Monomorphizer::new(generics).run(call_sites)?;

    // Rewrite call sites in the surviving (non-generic) statements to
    // target the mangled specializations before appending the
    // specialized bodies themselves -- the specializations' own call
    // sites were never recorded against the (now-removed) generic
    // template, so there is nothing in `queues` for them to consume.
    let mut queues = build_call_queues(call_sites);
    let mut statements = rewrite_calls_in_stmts(&statements, &mut queues);
    statements.extend(specialized.into_iter().map(Stmt::FunctionDecl));
    Ok(Program { statements })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;
    use crate::typechecker::TypeChecker;
    use std::path::PathBuf;

    fn check(src: &str) -> (Program, crate::typechecker::CheckResult) {
        let (program, errors) = parse_source(src, PathBuf::from("test.tln")).unwrap();
        assert!(errors.is_empty(), "{errors:?}");
        let result = TypeChecker::new().check(&program);
        (program, result)
    }

    #[test]
    fn mangled_name_joins_type_args_with_dollar_signs() {
        let name = mangled_name("identity", &[Type::int(), Type::Bool]);
        assert_eq!(name, "identity$i64$bool");
    }

    #[test]
    fn non_generic_call_site_is_left_unmangled() {
        assert_eq!(mangled_name("plain", &[]), "plain");
    }

    #[test]
    fn same_call_site_specialized_only_once() {
        let src = "fn identity[T](x: T) -> T:\n    return x\nfn main():\n    let a = identity(1)\n    let b = identity(2)\n    return\n";
        let (program, result) = check(src);
        assert!(result.ok());
        let out = monomorphize(&program, &result.generic_call_sites).unwrap();
        let count = out
            .statements
            .iter()
            .filter(|s| matches!(s, Stmt::FunctionDecl(f) if f.name.starts_with("identity$")))
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn distinct_type_arguments_produce_distinct_specializations() {
        let src = "fn identity[T](x: T) -> T:\n    return x\nfn main():\n    let a = identity(1)\n    let b = identity(true)\n    return\n";
        let (program, result) = check(src);
        assert!(result.ok());
        let out = monomorphize(&program, &result.generic_call_sites).unwrap();
        let names: Vec<&str> = out
            .statements
            .iter()
            .filter_map(|s| match s {
                Stmt::FunctionDecl(f) if f.name.starts_with("identity$") => Some(f.name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn generic_template_is_removed_from_the_flattened_program() {
        let src = "fn identity[T](x: T) -> T:\n    return x\nfn main():\n    let a = identity(1)\n    return\n";
        let (program, result) = check(src);
        let out = monomorphize(&program, &result.generic_call_sites).unwrap();
        let has_template = out.statements.iter().any(|s| matches!(s, Stmt::FunctionDecl(f) if f.name == "identity"));
        assert!(!has_template);
    }

    /// The monomorphizer must not just produce `identity$i64`/`identity$bool`
    /// specializations -- `main`'s own calls have to be rewritten to target
    /// them, or codegen would still try to call a `identity` label that no
    /// longer exists (spec §4.6: "Call sites use the mangled name when
    /// calling").
    #[test]
    fn caller_call_sites_are_rewritten_to_the_mangled_names() {
        let src = "fn identity[T](x: T) -> T:\n    return x\nfn main():\n    let a = identity(1)\n    let b = identity(true)\n    return\n";
        let (program, result) = check(src);
        assert!(result.ok());
        let out = monomorphize(&program, &result.generic_call_sites).unwrap();
        let main_fn = out
            .statements
            .iter()
            .find_map(|s| match s {
                Stmt::FunctionDecl(f) if f.name == "main" => Some(f.clone()),
                _ => None,
            })
            .unwrap();
        let callee_names: Vec<String> = main_fn
            .body
            .iter()
            .filter_map(|s| match s {
                Stmt::VarDecl { init: Some(Expr::Call { callee, .. }), .. } => match callee.as_ref() {
                    Expr::Identifier(name, _) => Some(name.clone()),
                    _ => None,
                },
                _ => None,
            })
            .collect();
        assert_eq!(callee_names, vec!["identity$i64".to_string(), "identity$bool".to_string()]);
    }
}
