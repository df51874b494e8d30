//! Object layouts for emitted synchronization primitives (spec §3, §4.10.4
//! "Sync primitives", §4.10.10, §5).
//!
//! Every `make_mutex`/`make_rwlock`/`make_cond`/`make_semaphore` allocates a
//! GC object whose payload is this fixed-size struct; the Win32 handle or
//! inline structure lives at offset 0.

/// `{ handle, data_ptr, element_size }`, as specified in §4.10.4.
pub mod sync_object_layout {
    pub const OFFSET_HANDLE: i32 = 0;
    pub const OFFSET_DATA_PTR: i32 = 8;
    pub const OFFSET_ELEMENT_SIZE: i32 = 16;
    pub const SIZE: u32 = 24;
}

/// `SRWLOCK` and `CONDITION_VARIABLE` are single `PVOID`-sized opaque
/// structures the Win32 loader initializes in place; rwlocks and condition
/// variables therefore store the lock/cv word directly at `OFFSET_HANDLE`
/// rather than a `HANDLE` returned by a `Create*` call.
pub const SRWLOCK_SIZE: u32 = 8;
pub const CONDITION_VARIABLE_SIZE: u32 = 8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_object_is_three_qwords() {
        assert_eq!(sync_object_layout::SIZE, 24);
        assert_eq!(sync_object_layout::OFFSET_ELEMENT_SIZE, 16);
    }
}
