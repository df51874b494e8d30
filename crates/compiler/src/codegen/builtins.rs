//! The builtin function table (spec §4.10.4).
//!
//! Builtins are compiled directly into code at call sites rather than
//! linked against a runtime library — each has a constant-folded fast path
//! (used when every argument is a compile-time constant) and a runtime
//! fallback the native code generator emits inline. This module is the
//! catalog both the type checker (for call-site return types) and
//! `codegen::mod` (for the actual emission) consult.

use crate::types::{IntKind, Type};

/// Which inline lowering strategy a builtin needs. The code generator
/// switches on this rather than re-deriving it from the name at every call
/// site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinCategory {
    StringOp,
    Math,
    Conversion,
    ListOp,
    TimeSystem,
    Io,
    Memory,
    Gc,
    Result,
    Sync,
}

#[derive(Debug, Clone, Copy)]
pub struct BuiltinSig {
    pub name: &'static str,
    pub category: BuiltinCategory,
    pub arity: Arity,
    pub ret: fn() -> Type,
    /// True if this builtin has a compile-time constant-folding fast path
    /// (spec §4.10.4: "Constant strings are folded at compile time").
    pub const_foldable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    Variadic,
}

fn t_int() -> Type {
    Type::int()
}
fn t_float() -> Type {
    Type::float()
}
fn t_str() -> Type {
    Type::Str
}
fn t_bool() -> Type {
    Type::Bool
}
fn t_void() -> Type {
    Type::Void
}
fn t_any() -> Type {
    Type::Any
}
fn t_list_any() -> Type {
    Type::List(Box::new(Type::Any))
}

macro_rules! table {
    ($( $name:expr => ($cat:expr, $arity:expr, $ret:expr, $fold:expr) ),* $(,)?) => {
        &[ $( BuiltinSig { name: $name, category: $cat, arity: $arity, ret: $ret, const_foldable: $fold } ),* ]
    };
}

/// Every builtin the native code generator knows how to inline, grouped
/// per spec §4.10.4's category list.
pub static BUILTINS: &[BuiltinSig] = table! {
    // ---- String ----
    "len" => (BuiltinCategory::StringOp, Arity::Exact(1), t_int, true),
    "upper" => (BuiltinCategory::StringOp, Arity::Exact(1), t_str, true),
    "lower" => (BuiltinCategory::StringOp, Arity::Exact(1), t_str, true),
    "trim" => (BuiltinCategory::StringOp, Arity::Exact(1), t_str, true),
    "ltrim" => (BuiltinCategory::StringOp, Arity::Exact(1), t_str, true),
    "rtrim" => (BuiltinCategory::StringOp, Arity::Exact(1), t_str, true),
    "starts_with" => (BuiltinCategory::StringOp, Arity::Exact(2), t_bool, true),
    "ends_with" => (BuiltinCategory::StringOp, Arity::Exact(2), t_bool, true),
    "substring" => (BuiltinCategory::StringOp, Arity::Exact(3), t_str, true),
    "replace" => (BuiltinCategory::StringOp, Arity::Exact(3), t_str, true),
    "split" => (BuiltinCategory::StringOp, Arity::Exact(2), t_list_any, true),
    "join" => (BuiltinCategory::StringOp, Arity::Exact(2), t_str, true),
    "index_of" => (BuiltinCategory::StringOp, Arity::Exact(2), t_int, true),
    "last_index_of" => (BuiltinCategory::StringOp, Arity::Exact(2), t_int, true),
    "contains" => (BuiltinCategory::StringOp, Arity::Exact(2), t_bool, true),
    "reverse" => (BuiltinCategory::StringOp, Arity::Exact(1), t_str, true),
    "repeat" => (BuiltinCategory::StringOp, Arity::Exact(2), t_str, true),
    "char_at" => (BuiltinCategory::StringOp, Arity::Exact(2), t_str, true),
    "ord" => (BuiltinCategory::StringOp, Arity::Exact(1), t_int, true),
    "chr" => (BuiltinCategory::StringOp, Arity::Exact(1), t_str, true),
    "is_digit" => (BuiltinCategory::StringOp, Arity::Exact(1), t_bool, true),
    "is_alpha" => (BuiltinCategory::StringOp, Arity::Exact(1), t_bool, true),

    // ---- Math ----
    "abs" => (BuiltinCategory::Math, Arity::Exact(1), t_float, true),
    "min" => (BuiltinCategory::Math, Arity::Exact(2), t_float, true),
    "max" => (BuiltinCategory::Math, Arity::Exact(2), t_float, true),
    "sqrt" => (BuiltinCategory::Math, Arity::Exact(1), t_float, true),
    "floor" => (BuiltinCategory::Math, Arity::Exact(1), t_float, true),
    "ceil" => (BuiltinCategory::Math, Arity::Exact(1), t_float, true),
    "round" => (BuiltinCategory::Math, Arity::Exact(1), t_float, true),
    "pow" => (BuiltinCategory::Math, Arity::Exact(2), t_float, true),
    "sin" => (BuiltinCategory::Math, Arity::Exact(1), t_float, true),
    "cos" => (BuiltinCategory::Math, Arity::Exact(1), t_float, true),
    "tan" => (BuiltinCategory::Math, Arity::Exact(1), t_float, true),
    "exp" => (BuiltinCategory::Math, Arity::Exact(1), t_float, true),
    "log" => (BuiltinCategory::Math, Arity::Exact(1), t_float, true),
    "trunc" => (BuiltinCategory::Math, Arity::Exact(1), t_float, true),
    "sign" => (BuiltinCategory::Math, Arity::Exact(1), t_int, true),
    "clamp" => (BuiltinCategory::Math, Arity::Exact(3), t_float, true),
    "lerp" => (BuiltinCategory::Math, Arity::Exact(3), t_float, true),
    "gcd" => (BuiltinCategory::Math, Arity::Exact(2), t_int, true),
    "lcm" => (BuiltinCategory::Math, Arity::Exact(2), t_int, true),
    "factorial" => (BuiltinCategory::Math, Arity::Exact(1), t_int, true),
    "fib" => (BuiltinCategory::Math, Arity::Exact(1), t_int, true),
    "random" => (BuiltinCategory::Math, Arity::Exact(0), t_float, false),
    "isnan" => (BuiltinCategory::Math, Arity::Exact(1), t_bool, true),
    "isinf" => (BuiltinCategory::Math, Arity::Exact(1), t_bool, true),

    // ---- Conversion ----
    "int" => (BuiltinCategory::Conversion, Arity::Exact(1), t_int, true),
    "float" => (BuiltinCategory::Conversion, Arity::Exact(1), t_float, true),
    "bool" => (BuiltinCategory::Conversion, Arity::Exact(1), t_bool, true),
    "str" => (BuiltinCategory::Conversion, Arity::Exact(1), t_str, true),

    // ---- List ----
    "push" => (BuiltinCategory::ListOp, Arity::Exact(2), t_list_any, false),
    "pop" => (BuiltinCategory::ListOp, Arity::Exact(1), t_any, false),
    "range" => (BuiltinCategory::ListOp, Arity::AtLeast(1), t_list_any, false),
    "first" => (BuiltinCategory::ListOp, Arity::Exact(1), t_any, false),
    "last" => (BuiltinCategory::ListOp, Arity::Exact(1), t_any, false),
    "get" => (BuiltinCategory::ListOp, Arity::Exact(2), t_any, false),
    "index" => (BuiltinCategory::ListOp, Arity::Exact(2), t_int, false),
    "includes" => (BuiltinCategory::ListOp, Arity::Exact(2), t_bool, false),
    "take" => (BuiltinCategory::ListOp, Arity::Exact(2), t_list_any, false),
    "drop" => (BuiltinCategory::ListOp, Arity::Exact(2), t_list_any, false),
    "min_of" => (BuiltinCategory::ListOp, Arity::Exact(1), t_any, false),
    "max_of" => (BuiltinCategory::ListOp, Arity::Exact(1), t_any, false),

    // ---- Time/System ----
    "now" => (BuiltinCategory::TimeSystem, Arity::Exact(0), t_int, false),
    "now_ms" => (BuiltinCategory::TimeSystem, Arity::Exact(0), t_int, false),
    "now_us" => (BuiltinCategory::TimeSystem, Arity::Exact(0), t_int, false),
    "year" => (BuiltinCategory::TimeSystem, Arity::Exact(0), t_int, false),
    "month" => (BuiltinCategory::TimeSystem, Arity::Exact(0), t_int, false),
    "day" => (BuiltinCategory::TimeSystem, Arity::Exact(0), t_int, false),
    "hour" => (BuiltinCategory::TimeSystem, Arity::Exact(0), t_int, false),
    "minute" => (BuiltinCategory::TimeSystem, Arity::Exact(0), t_int, false),
    "second" => (BuiltinCategory::TimeSystem, Arity::Exact(0), t_int, false),
    "weekday" => (BuiltinCategory::TimeSystem, Arity::Exact(0), t_int, false),
    "platform" => (BuiltinCategory::TimeSystem, Arity::Exact(0), t_str, true),
    "arch" => (BuiltinCategory::TimeSystem, Arity::Exact(0), t_str, true),
    "hostname" => (BuiltinCategory::TimeSystem, Arity::Exact(0), t_str, false),
    "username" => (BuiltinCategory::TimeSystem, Arity::Exact(0), t_str, false),
    "cpu_count" => (BuiltinCategory::TimeSystem, Arity::Exact(0), t_int, false),
    "env" => (BuiltinCategory::TimeSystem, Arity::Exact(1), t_str, false),
    "sleep" => (BuiltinCategory::TimeSystem, Arity::Exact(1), t_void, false),
    "panic" => (BuiltinCategory::TimeSystem, Arity::Exact(1), t_void, false),
    "assert" => (BuiltinCategory::TimeSystem, Arity::AtLeast(1), t_void, false),

    // ---- I/O ----
    "print" => (BuiltinCategory::Io, Arity::Variadic, t_void, false),
    "println" => (BuiltinCategory::Io, Arity::Variadic, t_void, false),
    "read" => (BuiltinCategory::Io, Arity::Exact(1), t_str, false),
    "open" => (BuiltinCategory::Io, Arity::Exact(2), t_int, false),
    "close" => (BuiltinCategory::Io, Arity::Exact(1), t_void, false),
    "write" => (BuiltinCategory::Io, Arity::Exact(2), t_int, false),
    "file_size" => (BuiltinCategory::Io, Arity::Exact(1), t_int, false),

    // ---- Memory ----
    "alloc" => (BuiltinCategory::Memory, Arity::Exact(1), t_any, false),
    "free" => (BuiltinCategory::Memory, Arity::Exact(1), t_void, false),
    "stackalloc" => (BuiltinCategory::Memory, Arity::Exact(1), t_any, false),
    "sizeof" => (BuiltinCategory::Memory, Arity::Exact(1), t_int, true),
    "alignof" => (BuiltinCategory::Memory, Arity::Exact(1), t_int, true),
    "offsetof" => (BuiltinCategory::Memory, Arity::Exact(2), t_int, true),
    "placement_new" => (BuiltinCategory::Memory, Arity::Exact(2), t_void, false),
    "memcpy" => (BuiltinCategory::Memory, Arity::Exact(3), t_void, false),
    "memset" => (BuiltinCategory::Memory, Arity::Exact(3), t_void, false),
    "memmove" => (BuiltinCategory::Memory, Arity::Exact(3), t_void, false),
    "memcmp" => (BuiltinCategory::Memory, Arity::Exact(3), t_int, false),

    // ---- GC ----
    "gc_collect" => (BuiltinCategory::Gc, Arity::Exact(0), t_void, false),
    "gc_stats" => (BuiltinCategory::Gc, Arity::Exact(0), t_any, false),
    "gc_count" => (BuiltinCategory::Gc, Arity::Exact(0), t_int, false),
    "gc_pin" => (BuiltinCategory::Gc, Arity::Exact(1), t_void, false),
    "gc_unpin" => (BuiltinCategory::Gc, Arity::Exact(1), t_void, false),
    "gc_add_root" => (BuiltinCategory::Gc, Arity::Exact(1), t_void, false),
    "gc_remove_root" => (BuiltinCategory::Gc, Arity::Exact(1), t_void, false),
    "set_allocator" => (BuiltinCategory::Gc, Arity::Exact(2), t_void, false),
    "reset_allocator" => (BuiltinCategory::Gc, Arity::Exact(0), t_void, false),
    "allocator_stats" => (BuiltinCategory::Gc, Arity::Exact(0), t_any, false),
    "allocator_peak" => (BuiltinCategory::Gc, Arity::Exact(0), t_int, false),

    // ---- Result ----
    "Ok" => (BuiltinCategory::Result, Arity::Exact(1), t_any, false),
    "Err" => (BuiltinCategory::Result, Arity::Exact(1), t_any, false),
    "is_ok" => (BuiltinCategory::Result, Arity::Exact(1), t_bool, false),
    "is_err" => (BuiltinCategory::Result, Arity::Exact(1), t_bool, false),
    "unwrap" => (BuiltinCategory::Result, Arity::Exact(1), t_any, false),
    "unwrap_or" => (BuiltinCategory::Result, Arity::Exact(2), t_any, false),

    // ---- Sync ----
    "make_chan" => (BuiltinCategory::Sync, Arity::AtLeast(0), t_any, false),
    "make_mutex" => (BuiltinCategory::Sync, Arity::AtLeast(0), t_any, false),
    "make_rwlock" => (BuiltinCategory::Sync, Arity::AtLeast(0), t_any, false),
    "make_cond" => (BuiltinCategory::Sync, Arity::Exact(0), t_any, false),
    "make_semaphore" => (BuiltinCategory::Sync, Arity::Exact(1), t_any, false),
};

pub fn lookup(name: &str) -> Option<&'static BuiltinSig> {
    BUILTINS.iter().find(|b| b.name == name)
}

pub fn is_builtin(name: &str) -> bool {
    lookup(name).is_some()
}

pub fn builtin_return_type(name: &str) -> Type {
    lookup(name).map(|b| (b.ret)()).unwrap_or(Type::Any)
}

/// Integer-conversion constant fold (spec §4.10.4 "Conversion"): parses a
/// digit sequence at compile time exactly like the runtime `atoi`-style
/// scanner would (skip whitespace, optional sign, digits), so the folded
/// and unfolded paths agree.
pub fn const_fold_int(s: &str) -> Option<i64> {
    let trimmed = s.trim_start();
    let mut chars = trimmed.chars().peekable();
    let neg = match chars.peek() {
        Some('-') => {
            chars.next();
            true
        }
        Some('+') => {
            chars.next();
            false
        }
        _ => false,
    };
    let digits: String = chars.take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let value: i64 = digits.parse().ok()?;
    Some(if neg { -value } else { value })
}

pub fn const_fold_upper(s: &str) -> String {
    s.to_uppercase()
}

pub fn const_fold_lower(s: &str) -> String {
    s.to_lowercase()
}

/// Width (in bytes) of the inline stack buffer the runtime fallback for a
/// given string builtin writes into (spec §9 "Open questions": the
/// original used fixed small buffers; here growth is explicit so overflow
/// is a defined, generous bound rather than undefined truncation).
pub fn runtime_buffer_size(name: &str) -> usize {
    match name {
        "upper" | "lower" | "trim" | "ltrim" | "rtrim" | "reverse" | "char_at" | "chr" => 256,
        "substring" | "replace" | "repeat" => 1024,
        "split" | "join" => 4096,
        _ => 64,
    }
}

/// Win32 import names a given builtin category lowers to (spec §4.10.4
/// I/O, Time/System, Sync) — used by the code generator to request the
/// right `addImport` entries from the PE writer (spec §4.8).
pub fn win32_imports_for(name: &str) -> &'static [(&'static str, &'static str)] {
    match name {
        "print" | "println" => &[("kernel32.dll", "WriteConsoleA"), ("kernel32.dll", "GetStdHandle")],
        "now" | "now_ms" | "now_us" => &[("kernel32.dll", "GetSystemTimeAsFileTime")],
        "sleep" => &[("kernel32.dll", "Sleep")],
        "hostname" => &[("kernel32.dll", "GetComputerNameA")],
        "username" => &[("advapi32.dll", "GetUserNameA")],
        "cpu_count" => &[("kernel32.dll", "GetSystemInfo")],
        "env" => &[("kernel32.dll", "GetEnvironmentVariableA")],
        "open" => &[("kernel32.dll", "CreateFileA")],
        "close" => &[("kernel32.dll", "CloseHandle")],
        "read" => &[("kernel32.dll", "ReadFile")],
        "write" => &[("kernel32.dll", "WriteFile")],
        "file_size" => &[("kernel32.dll", "GetFileSize")],
        "alloc" | "free" | "stackalloc" => &[("kernel32.dll", "HeapAlloc"), ("kernel32.dll", "GetProcessHeap")],
        "make_mutex" => &[("kernel32.dll", "CreateMutexA")],
        "make_rwlock" => &[("kernel32.dll", "InitializeSRWLock")],
        "make_cond" => &[("kernel32.dll", "InitializeConditionVariable")],
        "make_semaphore" => &[("kernel32.dll", "CreateSemaphoreA")],
        "panic" => &[("kernel32.dll", "ExitProcess")],
        _ => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_builtin_name_is_unique() {
        let mut seen = std::collections::HashSet::new();
        for b in BUILTINS {
            assert!(seen.insert(b.name), "duplicate builtin `{}`", b.name);
        }
    }

    #[test]
    fn lookup_finds_known_builtins_and_rejects_unknown() {
        assert!(lookup("sqrt").is_some());
        assert!(lookup("not_a_builtin").is_none());
    }

    #[test]
    fn const_fold_int_parses_signed_digits_and_skips_leading_whitespace() {
        assert_eq!(const_fold_int("  42"), Some(42));
        assert_eq!(const_fold_int("-7"), Some(-7));
        assert_eq!(const_fold_int("abc"), None);
    }

    #[test]
    fn println_requires_console_imports() {
        let imports = win32_imports_for("println");
        assert!(imports.iter().any(|(_, f)| *f == "WriteConsoleA"));
    }
}
