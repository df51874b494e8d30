//! The type system: canonical [`Type`] values, the [`TypeRegistry`] that
//! resolves names and generics to them, and the [`TraitRegistry`] that
//! tracks trait declarations and their implementations (spec §3 "Type",
//! §4.4 "Type System").
//!
//! Grounded in the teacher's `types.rs`: a plain `#[derive(... Hash)]` sum
//! type walked with `match`, the same shape as `navicore-cem3`'s `Type`/
//! `StackType`/`Effect`, generalized from a row-polymorphic stack-effect
//! model to a nominal+structural type system with generics, pointers,
//! closures, and trait objects (`original_source/src/semantic/types/types.h`).

use crate::ast::TypeExpr;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntKind {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
}

impl IntKind {
    pub fn size(self) -> u32 {
        match self {
            IntKind::I8 | IntKind::U8 => 1,
            IntKind::I16 | IntKind::U16 => 2,
            IntKind::I32 | IntKind::U32 => 4,
            IntKind::I64 | IntKind::U64 => 8,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, IntKind::I8 | IntKind::I16 | IntKind::I32 | IntKind::I64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatKind {
    F32,
    F64,
}

impl FloatKind {
    pub fn size(self) -> u32 {
        match self {
            FloatKind::F32 => 4,
            FloatKind::F64 => 8,
        }
    }
}

/// A canonical, resolved type (spec §3 "Type"). Unlike [`TypeExpr`] (the
/// as-written syntax), values of this type are what the checker, the
/// monomorphizer, and the code generator actually reason about — two
/// `Type` values that are `==` are the same type, full stop.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    Bool,
    Int(IntKind),
    Float(FloatKind),
    Str,
    List(Box<Type>),
    Map(Box<Type>, Box<Type>),
    Record(String),
    Function {
        params: Vec<Type>,
        ret: Box<Type>,
        is_closure: bool,
    },
    /// `*T` (raw=true) or `&T`/`&mut T` (raw=false); `mutable` only applies
    /// to the `&mut` case and is ignored for raw pointers, which carry no
    /// mutability of their own (spec §4.7 "References lower to pointers").
    Ptr {
        raw: bool,
        mutable: bool,
        inner: Box<Type>,
    },
    Nullable(Box<Type>),
    FixedArray {
        element: Box<Type>,
        size: u64,
    },
    TypeParam(String),
    Generic {
        base: String,
        args: Vec<Type>,
    },
    Trait(String),
    TraitObject(String),
    Channel(Box<Type>),
    Mutex(Box<Type>),
    RwLock(Box<Type>),
    Cond,
    Semaphore,
    /// The top type: assignable to/from anything, used for `any`-typed
    /// slots and as the element type of untyped empty collection literals
    /// until the checker narrows them.
    Any,
    /// The bottom type: the type of `return`/`break`/diverging calls. Unifies
    /// with any other type.
    Never,
    /// Placeholder for a slot the checker hasn't inferred yet.
    Unknown,
    /// Sentinel produced after a type error; swallows further cascading
    /// diagnostics about the same expression (spec §7 "Type errors").
    Error,
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Bool => write!(f, "bool"),
            Type::Int(IntKind::I8) => write!(f, "i8"),
            Type::Int(IntKind::I16) => write!(f, "i16"),
            Type::Int(IntKind::I32) => write!(f, "i32"),
            Type::Int(IntKind::I64) => write!(f, "int"),
            Type::Int(IntKind::U8) => write!(f, "u8"),
            Type::Int(IntKind::U16) => write!(f, "u16"),
            Type::Int(IntKind::U32) => write!(f, "u32"),
            Type::Int(IntKind::U64) => write!(f, "u64"),
            Type::Float(FloatKind::F32) => write!(f, "f32"),
            Type::Float(FloatKind::F64) => write!(f, "float"),
            Type::Str => write!(f, "str"),
            Type::List(e) => write!(f, "[{e}]"),
            Type::Map(k, v) => write!(f, "map[{k}, {v}]"),
            Type::Record(n) => write!(f, "{n}"),
            Type::Function { params, ret, is_closure } => {
                let kw = if *is_closure { "closure" } else { "fn" };
                write!(f, "{kw}(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{p}")?;
                }
                write!(f, ") -> {ret}")
            }
            Type::Ptr { raw, mutable, inner } => {
                if *raw {
                    write!(f, "*{inner}")
                } else if *mutable {
                    write!(f, "&mut {inner}")
                } else {
                    write!(f, "&{inner}")
                }
            }
            Type::Nullable(t) => write!(f, "{t}?"),
            Type::FixedArray { element, size } => write!(f, "[{element}; {size}]"),
            Type::TypeParam(n) => write!(f, "{n}"),
            Type::Generic { base, args } => {
                write!(f, "{base}[")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, "]")
            }
            Type::Trait(n) => write!(f, "{n}"),
            Type::TraitObject(n) => write!(f, "dyn {n}"),
            Type::Channel(t) => write!(f, "chan[{t}]"),
            Type::Mutex(t) => write!(f, "mutex[{t}]"),
            Type::RwLock(t) => write!(f, "rwlock[{t}]"),
            Type::Cond => write!(f, "cond"),
            Type::Semaphore => write!(f, "semaphore"),
            Type::Any => write!(f, "any"),
            Type::Never => write!(f, "never"),
            Type::Unknown => write!(f, "?"),
            Type::Error => write!(f, "<error>"),
        }
    }
}

/// Pointer-sized on the Windows x64 target (spec §4.7: 8-byte words
/// everywhere except sub-word integer fields).
pub const POINTER_SIZE: u32 = 8;
pub const POINTER_ALIGN: u32 = 8;

impl Type {
    pub fn int() -> Type {
        Type::Int(IntKind::I64)
    }

    pub fn float() -> Type {
        Type::Float(FloatKind::F64)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Type::Int(_))
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Type::Float(_))
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integer() || self.is_float()
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Ptr { raw: true, .. })
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Type::Ptr { raw: false, .. })
    }

    pub fn is_nullable(&self) -> bool {
        matches!(self, Type::Nullable(_))
    }

    pub fn strip_nullable(&self) -> &Type {
        match self {
            Type::Nullable(inner) => inner,
            other => other,
        }
    }

    pub fn is_never(&self) -> bool {
        matches!(self, Type::Never)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Type::Error)
    }

    /// Size in bytes (spec §4.7 "Record layout", §4.9 GC header sizing).
    /// Trait objects and closures are fat references: a data pointer plus
    /// a vtable/function pointer, so they're two pointer-words wide.
    pub fn size(&self) -> u32 {
        match self {
            Type::Void => 0,
            Type::Bool => 1,
            Type::Int(k) => k.size(),
            Type::Float(k) => k.size(),
            Type::Str
            | Type::List(_)
            | Type::Map(_, _)
            | Type::Record(_)
            | Type::Generic { .. }
            | Type::Channel(_)
            | Type::Mutex(_)
            | Type::RwLock(_)
            | Type::Cond
            | Type::Semaphore
            | Type::Ptr { .. }
            | Type::Any
            | Type::TypeParam(_)
            | Type::Trait(_)
            | Type::Unknown
            | Type::Error => POINTER_SIZE,
            Type::Nullable(inner) => inner.size().max(POINTER_SIZE),
            Type::FixedArray { element, size } => element.size() * (*size as u32),
            Type::Function { is_closure, .. } => {
                if *is_closure {
                    POINTER_SIZE * 2
                } else {
                    POINTER_SIZE
                }
            }
            Type::TraitObject(_) => POINTER_SIZE * 2,
            Type::Never => 0,
        }
    }

    /// Alignment in bytes; everything aligns to its own size up to the
    /// machine word (spec §4.7 "natural alignment, word-capped").
    pub fn alignment(&self) -> u32 {
        match self {
            Type::FixedArray { element, .. } => element.alignment(),
            _ => self.size().clamp(1, POINTER_SIZE),
        }
    }
}

/// A named record's field layout, kept by the registry so `size_of`,
/// field-offset computation, and `new Record{...}` validation share one
/// source of truth.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordInfo {
    pub name: String,
    pub generics: Vec<String>,
    pub fields: Vec<(String, Type)>,
    pub repr_c: bool,
    pub packed: bool,
}

impl RecordInfo {
    pub fn field_type(&self, name: &str) -> Option<&Type> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    /// Field byte offsets, applying `repr(C)`/`packed` rules (spec §4.7
    /// "Records"): `repr(C)` lays out fields in declaration order with
    /// natural alignment padding; `packed` removes padding entirely.
    pub fn field_offsets(&self) -> Vec<(String, u32)> {
        let mut offsets = Vec::with_capacity(self.fields.len());
        let mut cursor = 0u32;
        for (name, ty) in &self.fields {
            if !self.packed {
                let align = ty.alignment();
                cursor = (cursor + align - 1) / align * align;
            }
            offsets.push((name.clone(), cursor));
            cursor += ty.size();
        }
        offsets
    }

    pub fn total_size(&self) -> u32 {
        let offsets = self.field_offsets();
        match (offsets.last(), self.fields.last()) {
            (Some((_, off)), Some((_, ty))) => {
                let end = off + ty.size();
                if self.packed {
                    end
                } else {
                    let align = self.alignment();
                    (end + align - 1) / align * align
                }
            }
            _ => 0,
        }
    }

    pub fn alignment(&self) -> u32 {
        if self.packed {
            1
        } else {
            self.fields.iter().map(|(_, t)| t.alignment()).max().unwrap_or(1)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumInfo {
    pub name: String,
    pub variants: Vec<(String, Vec<Type>)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeError {
    UnknownType(String),
    WrongGenericArity { name: String, expected: usize, found: usize },
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeError::UnknownType(name) => write!(f, "unknown type `{name}`"),
            TypeError::WrongGenericArity { name, expected, found } => {
                write!(f, "`{name}` expects {expected} type argument(s), found {found}")
            }
        }
    }
}

/// Resolves [`TypeExpr`] syntax and bare names to canonical [`Type`]
/// values, and tracks every named record/union/enum/type-alias declared in
/// a compilation (spec §4.4 "Type resolution").
#[derive(Debug, Default)]
pub struct TypeRegistry {
    records: HashMap<String, RecordInfo>,
    enums: HashMap<String, EnumInfo>,
    aliases: HashMap<String, Type>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        TypeRegistry::default()
    }

    pub fn define_record(&mut self, info: RecordInfo) {
        self.records.insert(info.name.clone(), info);
    }

    pub fn define_enum(&mut self, info: EnumInfo) {
        self.enums.insert(info.name.clone(), info);
    }

    pub fn define_alias(&mut self, name: String, target: Type) {
        self.aliases.insert(name, target);
    }

    pub fn record(&self, name: &str) -> Option<&RecordInfo> {
        self.records.get(name)
    }

    pub fn enum_info(&self, name: &str) -> Option<&EnumInfo> {
        self.enums.get(name)
    }

    pub fn is_known_type_name(&self, name: &str) -> bool {
        self.records.contains_key(name) || self.enums.contains_key(name) || self.aliases.contains_key(name)
    }

    /// Resolves a bare name (no `[...]`, no `*`/`&`) — a primitive keyword,
    /// a declared record/enum/union, or an alias target.
    pub fn from_string(&self, name: &str) -> Option<Type> {
        Some(match name {
            "void" => Type::Void,
            "bool" => Type::Bool,
            "i8" => Type::Int(IntKind::I8),
            "i16" => Type::Int(IntKind::I16),
            "i32" => Type::Int(IntKind::I32),
            "int" | "i64" => Type::Int(IntKind::I64),
            "u8" => Type::Int(IntKind::U8),
            "u16" => Type::Int(IntKind::U16),
            "u32" => Type::Int(IntKind::U32),
            "u64" => Type::Int(IntKind::U64),
            "f32" => Type::Float(FloatKind::F32),
            "float" | "f64" => Type::Float(FloatKind::F64),
            "str" => Type::Str,
            "any" => Type::Any,
            "never" => Type::Never,
            "cond" => Type::Cond,
            "semaphore" => Type::Semaphore,
            other => {
                if let Some(alias) = self.aliases.get(other) {
                    return Some(alias.clone());
                }
                if self.records.contains_key(other) {
                    return Some(Type::Record(other.to_string()));
                }
                if self.enums.contains_key(other) {
                    return Some(Type::Record(other.to_string()));
                }
                return None;
            }
        })
    }

    /// Resolves a parsed [`TypeExpr`] into a canonical [`Type`], looking up
    /// generic type parameters in `type_params` first (spec §4.4: "within a
    /// generic function's body, a bare name matching one of its declared
    /// type parameters resolves to `Type::TypeParam`").
    pub fn resolve(&self, expr: &TypeExpr, type_params: &[String]) -> Result<Type, TypeError> {
        match expr {
            TypeExpr::Name(name) => {
                if type_params.iter().any(|p| p == name) {
                    return Ok(Type::TypeParam(name.clone()));
                }
                self.from_string(name).ok_or_else(|| TypeError::UnknownType(name.clone()))
            }
            TypeExpr::Pointer { raw, inner } => Ok(Type::Ptr {
                raw: *raw,
                mutable: false,
                inner: Box::new(self.resolve(inner, type_params)?),
            }),
            TypeExpr::Reference { mutable, inner } => Ok(Type::Ptr {
                raw: false,
                mutable: *mutable,
                inner: Box::new(self.resolve(inner, type_params)?),
            }),
            TypeExpr::List(inner) => Ok(Type::List(Box::new(self.resolve(inner, type_params)?))),
            TypeExpr::FixedArray { element, size } => {
                let size = const_eval_array_size(size).unwrap_or(0);
                Ok(Type::FixedArray { element: Box::new(self.resolve(element, type_params)?), size })
            }
            TypeExpr::Nullable(inner) => Ok(Type::Nullable(Box::new(self.resolve(inner, type_params)?))),
            TypeExpr::Function { params, ret } => {
                let params = params
                    .iter()
                    .map(|p| self.resolve(p, type_params))
                    .collect::<Result<_, _>>()?;
                Ok(Type::Function { params, ret: Box::new(self.resolve(ret, type_params)?), is_closure: false })
            }
            TypeExpr::Generic { base, args } => match base.as_str() {
                "chan" if args.len() == 1 => Ok(Type::Channel(Box::new(self.resolve(&args[0], type_params)?))),
                "mutex" if args.len() == 1 => Ok(Type::Mutex(Box::new(self.resolve(&args[0], type_params)?))),
                "rwlock" if args.len() == 1 => Ok(Type::RwLock(Box::new(self.resolve(&args[0], type_params)?))),
                "map" if args.len() == 2 => Ok(Type::Map(
                    Box::new(self.resolve(&args[0], type_params)?),
                    Box::new(self.resolve(&args[1], type_params)?),
                )),
                "dyn" if args.len() == 1 => {
                    if let TypeExpr::Name(trait_name) = &args[0] {
                        Ok(Type::TraitObject(trait_name.clone()))
                    } else {
                        Err(TypeError::UnknownType(base.clone()))
                    }
                }
                _ => {
                    let resolved = args
                        .iter()
                        .map(|a| self.resolve(a, type_params))
                        .collect::<Result<_, _>>()?;
                    Ok(Type::Generic { base: base.clone(), args: resolved })
                }
            },
        }
    }

    /// Substitutes `TypeParam` occurrences in `ty` per `bindings` (spec
    /// §4.6 "Monomorphizer"), recursing through every structural position.
    pub fn substitute_type_params(ty: &Type, bindings: &HashMap<String, Type>) -> Type {
        match ty {
            Type::TypeParam(name) => bindings.get(name).cloned().unwrap_or_else(|| ty.clone()),
            Type::List(e) => Type::List(Box::new(Self::substitute_type_params(e, bindings))),
            Type::Map(k, v) => Type::Map(
                Box::new(Self::substitute_type_params(k, bindings)),
                Box::new(Self::substitute_type_params(v, bindings)),
            ),
            Type::Ptr { raw, mutable, inner } => Type::Ptr {
                raw: *raw,
                mutable: *mutable,
                inner: Box::new(Self::substitute_type_params(inner, bindings)),
            },
            Type::Nullable(inner) => Type::Nullable(Box::new(Self::substitute_type_params(inner, bindings))),
            Type::FixedArray { element, size } => Type::FixedArray {
                element: Box::new(Self::substitute_type_params(element, bindings)),
                size: *size,
            },
            Type::Function { params, ret, is_closure } => Type::Function {
                params: params.iter().map(|p| Self::substitute_type_params(p, bindings)).collect(),
                ret: Box::new(Self::substitute_type_params(ret, bindings)),
                is_closure: *is_closure,
            },
            Type::Generic { base, args } => Type::Generic {
                base: base.clone(),
                args: args.iter().map(|a| Self::substitute_type_params(a, bindings)).collect(),
            },
            Type::Channel(t) => Type::Channel(Box::new(Self::substitute_type_params(t, bindings))),
            Type::Mutex(t) => Type::Mutex(Box::new(Self::substitute_type_params(t, bindings))),
            Type::RwLock(t) => Type::RwLock(Box::new(Self::substitute_type_params(t, bindings))),
            other => other.clone(),
        }
    }

    /// Instantiates `Generic { base, args }` into the concrete `Type` the
    /// monomorphizer should mangle a specialization name from — for a
    /// known record, substitutes the record's own generic parameters with
    /// `args` throughout its field types.
    pub fn instantiate_generic(&self, base: &str, args: &[Type]) -> Result<Type, TypeError> {
        let Some(record) = self.records.get(base) else {
            return Ok(Type::Generic { base: base.to_string(), args: args.to_vec() });
        };
        if record.generics.len() != args.len() {
            return Err(TypeError::WrongGenericArity {
                name: base.to_string(),
                expected: record.generics.len(),
                found: args.len(),
            });
        }
        Ok(Type::Generic { base: base.to_string(), args: args.to_vec() })
    }
}

fn const_eval_array_size(expr: &crate::ast::Expr) -> Option<u64> {
    match expr {
        crate::ast::Expr::IntLiteral(n, _) => Some(*n as u64),
        _ => None,
    }
}

/// A trait's method signatures (spec §4.4 "Trait").
#[derive(Debug, Clone, PartialEq)]
pub struct TraitMethod {
    pub name: String,
    pub params: Vec<Type>,
    pub ret: Type,
    pub has_default: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraitType {
    pub name: String,
    pub super_traits: Vec<String>,
    pub methods: Vec<TraitMethod>,
}

impl TraitType {
    pub fn method(&self, name: &str) -> Option<&TraitMethod> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn required_methods(&self) -> impl Iterator<Item = &TraitMethod> {
        self.methods.iter().filter(|m| !m.has_default)
    }
}

/// One `impl Trait for Type` block (spec §4.4 "impl").
#[derive(Debug, Clone, PartialEq)]
pub struct TraitImpl {
    pub trait_name: String,
    pub for_type: Type,
    pub type_args: Vec<Type>,
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TraitBoundError {
    UnknownTrait(String),
    MissingMethod { trait_name: String, method: String },
    NoImpl { trait_name: String, for_type: Type },
}

impl fmt::Display for TraitBoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraitBoundError::UnknownTrait(name) => write!(f, "unknown trait `{name}`"),
            TraitBoundError::MissingMethod { trait_name, method } => {
                write!(f, "impl of `{trait_name}` is missing method `{method}`")
            }
            TraitBoundError::NoImpl { trait_name, for_type } => {
                write!(f, "`{for_type}` does not implement `{trait_name}`")
            }
        }
    }
}

/// Tracks trait declarations and their implementations, and answers bound
/// checks (`T: Comparable`) for the type checker and the vtable layout
/// pass in code generation (spec §4.4, §4.7 "Trait objects").
#[derive(Debug, Default)]
pub struct TraitRegistry {
    traits: HashMap<String, TraitType>,
    impls: Vec<TraitImpl>,
}

impl TraitRegistry {
    pub fn new() -> Self {
        TraitRegistry::default()
    }

    pub fn define_trait(&mut self, trait_type: TraitType) {
        self.traits.insert(trait_type.name.clone(), trait_type);
    }

    pub fn trait_by_name(&self, name: &str) -> Option<&TraitType> {
        self.traits.get(name)
    }

    /// Validates an `impl` block against its trait's required-method list
    /// (spec I4: "an `impl` block must provide every non-defaulted method
    /// of the trait it implements") and records it if valid.
    pub fn add_impl(&mut self, trait_impl: TraitImpl) -> Result<(), TraitBoundError> {
        let trait_type = self
            .traits
            .get(&trait_impl.trait_name)
            .ok_or_else(|| TraitBoundError::UnknownTrait(trait_impl.trait_name.clone()))?;
        for required in trait_type.required_methods() {
            if !trait_impl.methods.iter().any(|m| m == &required.name) {
                return Err(TraitBoundError::MissingMethod {
                    trait_name: trait_impl.trait_name.clone(),
                    method: required.name.clone(),
                });
            }
        }
        self.impls.push(trait_impl);
        Ok(())
    }

    pub fn implements(&self, ty: &Type, trait_name: &str) -> bool {
        self.impls.iter().any(|i| &i.for_type == ty && i.trait_name == trait_name)
    }

    /// Checks a generic parameter's trait bounds against a concrete type
    /// argument (spec §4.4 "Bound checking").
    pub fn check_bound(&self, ty: &Type, trait_name: &str) -> Result<(), TraitBoundError> {
        if !self.traits.contains_key(trait_name) {
            return Err(TraitBoundError::UnknownTrait(trait_name.to_string()));
        }
        if self.implements(ty, trait_name) {
            Ok(())
        } else {
            Err(TraitBoundError::NoImpl { trait_name: trait_name.to_string(), for_type: ty.clone() })
        }
    }

    pub fn impls_for_type(&self, ty: &Type) -> Vec<&TraitImpl> {
        self.impls.iter().filter(|i| &i.for_type == ty).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_names_resolve() {
        let reg = TypeRegistry::new();
        assert_eq!(reg.from_string("int"), Some(Type::Int(IntKind::I64)));
        assert_eq!(reg.from_string("f32"), Some(Type::Float(FloatKind::F32)));
        assert_eq!(reg.from_string("bogus"), None);
    }

    #[test]
    fn type_expr_pointer_and_nullable_resolve_recursively() {
        let reg = TypeRegistry::new();
        let expr = TypeExpr::Nullable(Box::new(TypeExpr::Pointer {
            raw: true,
            inner: Box::new(TypeExpr::Name("int".to_string())),
        }));
        let ty = reg.resolve(&expr, &[]).unwrap();
        assert_eq!(ty, Type::Nullable(Box::new(Type::Ptr { raw: true, mutable: false, inner: Box::new(Type::int()) })));
    }

    #[test]
    fn bare_name_matching_type_param_resolves_to_type_param() {
        let reg = TypeRegistry::new();
        let ty = reg.resolve(&TypeExpr::Name("T".to_string()), &["T".to_string()]).unwrap();
        assert_eq!(ty, Type::TypeParam("T".to_string()));
    }

    #[test]
    fn record_field_offsets_respect_alignment_padding() {
        let info = RecordInfo {
            name: "Packed".to_string(),
            generics: vec![],
            fields: vec![("flag".to_string(), Type::Bool), ("value".to_string(), Type::int())],
            repr_c: true,
            packed: false,
        };
        let offsets = info.field_offsets();
        assert_eq!(offsets[0], ("flag".to_string(), 0));
        assert_eq!(offsets[1], ("value".to_string(), 8));
        assert_eq!(info.total_size(), 16);
    }

    #[test]
    fn packed_record_has_no_padding() {
        let info = RecordInfo {
            name: "Tight".to_string(),
            generics: vec![],
            fields: vec![("flag".to_string(), Type::Bool), ("value".to_string(), Type::int())],
            repr_c: true,
            packed: true,
        };
        let offsets = info.field_offsets();
        assert_eq!(offsets[1], ("value".to_string(), 1));
        assert_eq!(info.total_size(), 9);
    }

    #[test]
    fn substitute_type_params_recurses_into_generics() {
        let mut bindings = HashMap::new();
        bindings.insert("T".to_string(), Type::int());
        let ty = Type::List(Box::new(Type::TypeParam("T".to_string())));
        let substituted = TypeRegistry::substitute_type_params(&ty, &bindings);
        assert_eq!(substituted, Type::List(Box::new(Type::int())));
    }

    #[test]
    fn trait_impl_missing_required_method_is_rejected() {
        let mut traits = TraitRegistry::new();
        traits.define_trait(TraitType {
            name: "Greet".to_string(),
            super_traits: vec![],
            methods: vec![TraitMethod { name: "hello".to_string(), params: vec![], ret: Type::Str, has_default: false }],
        });
        let err = traits
            .add_impl(TraitImpl { trait_name: "Greet".to_string(), for_type: Type::Record("Dog".to_string()), type_args: vec![], methods: vec![] })
            .unwrap_err();
        assert!(matches!(err, TraitBoundError::MissingMethod { .. }));
    }

    #[test]
    fn bound_check_passes_once_impl_is_registered() {
        let mut traits = TraitRegistry::new();
        traits.define_trait(TraitType {
            name: "Greet".to_string(),
            super_traits: vec![],
            methods: vec![TraitMethod { name: "hello".to_string(), params: vec![], ret: Type::Str, has_default: false }],
        });
        let dog = Type::Record("Dog".to_string());
        traits
            .add_impl(TraitImpl { trait_name: "Greet".to_string(), for_type: dog.clone(), type_args: vec![], methods: vec!["hello".to_string()] })
            .unwrap();
        assert!(traits.check_bound(&dog, "Greet").is_ok());
    }
}
