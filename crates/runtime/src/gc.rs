//! GC object header layout (spec §3 "GC object header", §4.9).
//!
//! The collector is not a linked library: `talonc::codegen::gc`
//! emits its mark-and-sweep routine directly as x64 bytes into `.text`. This
//! module is the single source of truth for the byte offsets and constants
//! both the emitter and its tests need, so the two never drift apart.

/// Every heap allocation is preceded by this 16-byte header. User data
/// begins at `header_ptr + HEADER_SIZE`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcHeader {
    pub size_in_bytes: u32,
    pub type_tag: u16,
    pub marked: u8,
    pub flags: u8,
    pub next: u64,
}

pub const HEADER_SIZE: u32 = 16;

pub const OFFSET_SIZE: i32 = 0;
pub const OFFSET_TYPE_TAG: i32 = 4;
pub const OFFSET_MARKED: i32 = 6;
pub const OFFSET_FLAGS: i32 = 7;
pub const OFFSET_NEXT: i32 = 8;

/// Low bit of `flags`: setting it pins the object (never collected).
pub const FLAG_PINNED: u8 = 0b0000_0001;

/// Object type tags distinguishing heap allocations for the conservative
/// scanner and for runtime introspection (`gc_stats`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TypeTag {
    List = 0,
    Record = 1,
    Closure = 2,
    Str = 3,
    Map = 4,
    MapEntry = 5,
    TraitObject = 6,
    SyncObject = 7,
}

/// Lists' user payload starts with `{ count:u64, capacity:u64, [slots] }`.
pub mod list_layout {
    pub const OFFSET_COUNT: i32 = 0;
    pub const OFFSET_CAPACITY: i32 = 8;
    pub const OFFSET_SLOTS: i32 = 16;
    pub const SLOT_SIZE: i32 = 8;
}

/// Records' user payload starts with `{ field_count:u64, [slots] }`.
pub mod record_layout {
    pub const OFFSET_FIELD_COUNT: i32 = 0;
    pub const OFFSET_FIELDS: i32 = 8;
    pub const SLOT_SIZE: i32 = 8;
}

/// Closures: `{ fn_ptr:u64, capture_count:u64, [captures] }`.
pub mod closure_layout {
    pub const OFFSET_FN_PTR: i32 = 0;
    pub const OFFSET_CAPTURE_COUNT: i32 = 8;
    pub const OFFSET_CAPTURES: i32 = 16;
    pub const SLOT_SIZE: i32 = 8;
}

/// Map entries: `{ hash:u64, key_ptr:u64, value:u64, next:u64 }`.
pub mod map_entry_layout {
    pub const OFFSET_HASH: i32 = 0;
    pub const OFFSET_KEY_PTR: i32 = 8;
    pub const OFFSET_VALUE: i32 = 16;
    pub const OFFSET_NEXT: i32 = 24;
    pub const SIZE: u32 = 32;
}

/// Trait-object fat pointer: `{ vtable_ptr, data_ptr }` (spec §4.10.8).
pub mod trait_object_layout {
    pub const OFFSET_VTABLE_PTR: i32 = 0;
    pub const OFFSET_DATA_PTR: i32 = 8;
    pub const SIZE: u32 = 16;
}

/// Default collection threshold before the next allocation triggers a
/// mark-and-sweep pass (spec §4.9 item 2). Reconfigurable by the emitted
/// `--no-typecheck`-independent runtime globals; this is just the default
/// the code generator seeds into `.data`.
pub const DEFAULT_COLLECTION_THRESHOLD_BYTES: u64 = 1024 * 1024;

/// Round `n` up to the next multiple of 8, as the allocation-site emitter
/// does for `total = 16 + user_size` before calling `HeapAlloc`.
pub const fn align_up_8(n: u32) -> u32 {
    (n + 7) & !7
}

/// Reference (non-emitted) implementation of the mark phase, used by tests
/// to check the emitted routine's behavior against a known-correct model.
/// `roots` are stack words that might be pointers; `objects` maps an
/// object's header address to `(next, marked)`. Returns the set of header
/// addresses transitively reachable from `roots` by walking `next` chains
/// and matching `candidate - HEADER_SIZE` against a live header address,
/// exactly as spec §4.9 step 3 describes ("check whether it plausibly
/// points to a known object header").
pub fn reference_mark(roots: &[u64], live_headers: &[u64]) -> std::collections::HashSet<u64> {
    let mut marked = std::collections::HashSet::new();
    for &word in roots {
        if word < HEADER_SIZE as u64 {
            continue;
        }
        let candidate_header = word - HEADER_SIZE as u64;
        if live_headers.contains(&candidate_header) {
            marked.insert(candidate_header);
        }
    }
    marked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_8_rounds_correctly() {
        assert_eq!(align_up_8(0), 0);
        assert_eq!(align_up_8(1), 8);
        assert_eq!(align_up_8(8), 8);
        assert_eq!(align_up_8(9), 16);
    }

    #[test]
    fn header_size_is_sixteen_bytes() {
        assert_eq!(HEADER_SIZE, 16);
        assert_eq!(std::mem::size_of::<GcHeader>(), 16);
    }

    #[test]
    fn reference_mark_matches_pointer_minus_header() {
        let headers = vec![0x1000, 0x2000];
        // a stack word pointing at user-data (header + 16) of object 0x1000
        let roots = vec![0x1000 + HEADER_SIZE as u64, 0xdead_beef];
        let marked = reference_mark(&roots, &headers);
        assert!(marked.contains(&0x1000));
        assert!(!marked.contains(&0x2000));
        assert_eq!(marked.len(), 1);
    }
}
