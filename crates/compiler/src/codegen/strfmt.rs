//! Runtime numeric-to-string conversion (spec §4.10.4 "I/O": `print`/
//! `println` accept any value, not only strings).
//!
//! Like [`super::gc`], these aren't a linked library: the routines are
//! emitted once, directly as x64 bytes, into the same buffer the rest of
//! codegen writes to, and called with `call_rel32` from wherever
//! [`super::FunctionCodegen::compile_print`] needs to turn a raw `rax`
//! value into printable bytes.

use super::assembler::{Assembler, Reg, Xmm};

pub const ITOA_LABEL: &str = "__fmt_itoa";
pub const FTOA_LABEL: &str = "__fmt_ftoa";
pub const STRLEN_LABEL: &str = "__fmt_strlen";

/// Scratch buffer sizes: enough for a sign plus every digit of an `i64`
/// (itoa), and `-` + up to 19 integer digits + `.` + 6 fraction digits
/// (ftoa).
const ITOA_BUF_LEN: i64 = 24;
const FTOA_INT_LEN: i64 = 20;
const FTOA_BUF_LEN: i64 = FTOA_INT_LEN + 1 + 6;

/// RVAs of the two `.data` scratch buffers and the `1000000.0` constant
/// ftoa scales the fractional part by.
pub struct FmtGlobals {
    pub itoa_buf_rva: u32,
    pub ftoa_buf_rva: u32,
    pub million_rva: u32,
}

/// Emits `__fmt_itoa`: `rcx` = signed value in, `rax` = pointer to the
/// first digit, `rdx` = length out. Builds digits from least to most
/// significant into the tail of a static buffer (same "write backward,
/// report where the cursor ended up" idiom `ftoa`'s integer part reuses),
/// so the loop runs exactly once per digit with no need to know the digit
/// count ahead of time.
pub fn emit_itoa(asm: &mut Assembler, globals: &FmtGlobals) {
    asm.label(ITOA_LABEL);
    asm.push_reg(Reg::Rbp);
    asm.mov_rbp_rsp();
    asm.push_reg(Reg::Rbx);
    asm.push_reg(Reg::R12);
    asm.push_reg(Reg::R13);

    emit_itoa_body(asm, globals.itoa_buf_rva, ITOA_BUF_LEN, Reg::Rcx);

    asm.pop_reg(Reg::R13);
    asm.pop_reg(Reg::R12);
    asm.pop_reg(Reg::Rbx);
    asm.pop_reg(Reg::Rbp);
    asm.ret();
}

/// Shared digit-writing core: formats the signed value in `input` into
/// `buf_rva` (a buffer of `buf_len` bytes), leaving `rax` = start pointer
/// and `rdx` = length. Clobbers `rax, rcx, rdx, r8, r9, r10, r11` and
/// `rbx, r12, r13` (caller saves/restores the callee-saved ones).
fn emit_itoa_body(asm: &mut Assembler, buf_rva: u32, buf_len: i64, input: Reg) {
    let pos_label = format!("{}_{}_pos", ITOA_LABEL, buf_rva);
    let loop_label = format!("{}_{}_loop", ITOA_LABEL, buf_rva);
    let done_label = format!("{}_{}_done", ITOA_LABEL, buf_rva);

    asm.lea_rax_rip_fixup(buf_rva);
    asm.mov_reg_reg(Reg::Rbx, Reg::Rax);
    asm.mov_reg_reg(Reg::R10, Reg::Rbx);
    asm.mov_reg_imm64(Reg::Rax, buf_len - 1);
    asm.add_reg_reg(Reg::R10, Reg::Rax); // r10 = cursor, last byte of the buffer
    asm.mov_reg_imm64(Reg::R11, 0); // digit count

    asm.mov_reg_imm64(Reg::R12, 0); // sign flag
    asm.mov_reg_reg(Reg::Rax, input);
    asm.xor_reg_reg(Reg::R13, Reg::R13);
    asm.cmp_reg_reg(Reg::Rax, Reg::R13);
    asm.jge_rel32(&pos_label);
    asm.mov_reg_imm64(Reg::R12, 1);
    asm.mov_reg_reg(Reg::Rcx, Reg::Rax);
    asm.xor_rax_rax();
    asm.sub_reg_reg(Reg::Rax, Reg::Rcx);
    asm.label(pos_label);

    asm.mov_reg_imm64(Reg::R9, 10);
    asm.mov_reg_imm64(Reg::R8, 0x30);

    asm.label(loop_label.clone());
    asm.cqo();
    asm.idiv_reg(Reg::R9);
    asm.add_reg_reg(Reg::Rdx, Reg::R8);
    asm.mov_mem_byte_from_reg(Reg::R10, 0, Reg::Rdx);
    asm.mov_reg_imm64(Reg::Rcx, 1);
    asm.sub_reg_reg(Reg::R10, Reg::Rcx);
    asm.add_reg_reg(Reg::R11, Reg::Rcx);
    asm.xor_reg_reg(Reg::R13, Reg::R13);
    asm.cmp_reg_reg(Reg::Rax, Reg::R13);
    asm.jnz_rel32(&loop_label);

    asm.cmp_reg_reg(Reg::R12, Reg::R13);
    asm.jz_rel32(&done_label);
    asm.mov_reg_imm64(Reg::Rdx, 0x2D); // '-'
    asm.mov_mem_byte_from_reg(Reg::R10, 0, Reg::Rdx);
    asm.mov_reg_imm64(Reg::Rcx, 1);
    asm.sub_reg_reg(Reg::R10, Reg::Rcx);
    asm.add_reg_reg(Reg::R11, Reg::Rcx);
    asm.label(done_label);

    asm.mov_reg_imm64(Reg::Rax, buf_len);
    asm.sub_reg_reg(Reg::Rax, Reg::R11);
    asm.add_reg_reg(Reg::Rax, Reg::Rbx); // rax = start pointer
    asm.mov_reg_reg(Reg::Rdx, Reg::R11); // rdx = length
}

/// Emits `__fmt_ftoa`: `rcx` = the IEEE-754 bit pattern of a `f64` in, a
/// fixed `%f`-style rendering (`-`? + integer digits + `.` + exactly six
/// fraction digits) out, same `rax`/`rdx` pointer/length convention as
/// `__fmt_itoa`. The sign is read off bit 63 of the raw pattern directly
/// rather than through an SSE compare (spec §4.7 lists no float-compare
/// form the assembler emits), which is exact since clearing that bit
/// always yields the bit pattern of the absolute value.
pub fn emit_ftoa(asm: &mut Assembler, globals: &FmtGlobals) {
    asm.label(FTOA_LABEL);
    asm.push_reg(Reg::Rbp);
    asm.mov_rbp_rsp();
    asm.push_reg(Reg::Rbx);
    asm.push_reg(Reg::R12);
    asm.push_reg(Reg::R13);
    asm.push_reg(Reg::R14);
    asm.push_reg(Reg::R15);

    // r12 = sign flag, r14 = |value|'s raw bits.
    asm.mov_reg_imm64(Reg::R12, 0);
    asm.mov_reg_reg(Reg::Rax, Reg::Rcx);
    asm.xor_reg_reg(Reg::R13, Reg::R13);
    asm.cmp_reg_reg(Reg::Rax, Reg::R13);
    let pos_label = format!("{FTOA_LABEL}_pos");
    asm.jge_rel32(&pos_label);
    asm.mov_reg_imm64(Reg::R12, 1);
    asm.label(pos_label);
    asm.mov_reg_imm64(Reg::Rax, i64::MAX); // 0x7FFF...FFFF clears the sign bit
    asm.and_reg_reg(Reg::Rcx, Reg::Rax);
    asm.mov_reg_reg(Reg::R14, Reg::Rcx);

    asm.movq_xmm_from_gpr(Xmm(0), Reg::R14);
    asm.cvttsd2si(Reg::R13, Xmm(0)); // r13 = truncated integer part

    // frac = |value| - int_part, scaled into 0..999999 and truncated.
    asm.cvtsi2sd(Xmm(1), Reg::R13);
    asm.movsd(Xmm(2), Xmm(0));
    asm.subsd(Xmm(2), Xmm(1));
    asm.lea_rax_rip_fixup(globals.million_rva);
    asm.mov_reg_from_mem(Reg::Rax, Reg::Rax, 0);
    asm.movq_xmm_from_gpr(Xmm(3), Reg::Rax);
    asm.mulsd(Xmm(2), Xmm(3));
    asm.cvttsd2si(Reg::R15, Xmm(2)); // r15 = 0..999999

    // Six fixed-width fraction digits, written backward so the cursor
    // lands exactly on the byte before them once all six are placed.
    asm.lea_rax_rip_fixup(globals.ftoa_buf_rva);
    asm.mov_reg_reg(Reg::Rbx, Reg::Rax);
    asm.mov_reg_reg(Reg::R10, Reg::Rbx);
    asm.mov_reg_imm64(Reg::Rax, FTOA_BUF_LEN - 1);
    asm.add_reg_reg(Reg::R10, Reg::Rax);
    asm.mov_reg_reg(Reg::Rax, Reg::R15);
    asm.mov_reg_imm64(Reg::R9, 10);
    asm.mov_reg_imm64(Reg::R8, 0x30);
    asm.mov_reg_imm64(Reg::R11, 6); // digits remaining
    let frac_loop = format!("{FTOA_LABEL}_frac_loop");
    asm.label(frac_loop.clone());
    asm.cqo();
    asm.idiv_reg(Reg::R9);
    asm.add_reg_reg(Reg::Rdx, Reg::R8);
    asm.mov_mem_byte_from_reg(Reg::R10, 0, Reg::Rdx);
    asm.mov_reg_imm64(Reg::Rdx, 1);
    asm.sub_reg_reg(Reg::R10, Reg::Rdx);
    asm.sub_reg_reg(Reg::R11, Reg::Rdx);
    asm.xor_reg_reg(Reg::R13, Reg::R13);
    asm.cmp_reg_reg(Reg::R11, Reg::R13);
    asm.jnz_rel32(&frac_loop);

    // r10 now points at the `.` slot.
    asm.mov_reg_imm64(Reg::Rdx, 0x2E);
    asm.mov_mem_byte_from_reg(Reg::R10, 0, Reg::Rdx);
    asm.mov_reg_imm64(Reg::Rdx, 1);
    asm.sub_reg_reg(Reg::R10, Reg::Rdx);

    // Integer part: same do-while digit loop `itoa` uses, continuing from
    // the cursor the fraction loop left just before the `.`.
    asm.mov_reg_reg(Reg::Rax, Reg::R13); // truncated int part from cvttsd2si above
    asm.mov_reg_imm64(Reg::R11, 0); // digit count
    asm.mov_reg_imm64(Reg::R9, 10);
    asm.mov_reg_imm64(Reg::R8, 0x30);
    let int_loop = format!("{FTOA_LABEL}_int_loop");
    asm.label(int_loop.clone());
    asm.cqo();
    asm.idiv_reg(Reg::R9);
    asm.add_reg_reg(Reg::Rdx, Reg::R8);
    asm.mov_mem_byte_from_reg(Reg::R10, 0, Reg::Rdx);
    asm.mov_reg_imm64(Reg::Rcx, 1);
    asm.sub_reg_reg(Reg::R10, Reg::Rcx);
    asm.add_reg_reg(Reg::R11, Reg::Rcx);
    asm.xor_reg_reg(Reg::R13, Reg::R13);
    asm.cmp_reg_reg(Reg::Rax, Reg::R13);
    asm.jnz_rel32(&int_loop);

    let done_label = format!("{FTOA_LABEL}_done");
    asm.cmp_reg_reg(Reg::R12, Reg::R13);
    asm.jz_rel32(&done_label);
    asm.mov_reg_imm64(Reg::Rdx, 0x2D);
    asm.mov_mem_byte_from_reg(Reg::R10, 0, Reg::Rdx);
    asm.mov_reg_imm64(Reg::Rcx, 1);
    asm.sub_reg_reg(Reg::R10, Reg::Rcx);
    asm.add_reg_reg(Reg::R11, Reg::Rcx);
    asm.label(done_label);

    // Length is the digit count plus the fixed `.` and six fraction
    // digits; start pointer is the buffer end minus that length.
    asm.mov_reg_imm64(Reg::Rax, 7); // '.' + 6 fraction digits
    asm.add_reg_reg(Reg::R11, Reg::Rax);
    asm.mov_reg_imm64(Reg::Rax, FTOA_BUF_LEN);
    asm.sub_reg_reg(Reg::Rax, Reg::R11);
    asm.add_reg_reg(Reg::Rax, Reg::Rbx);
    asm.mov_reg_reg(Reg::Rdx, Reg::R11);

    asm.pop_reg(Reg::R15);
    asm.pop_reg(Reg::R14);
    asm.pop_reg(Reg::R13);
    asm.pop_reg(Reg::R12);
    asm.pop_reg(Reg::Rbx);
    asm.pop_reg(Reg::Rbp);
    asm.ret();
}

/// Emits `__fmt_strlen`: `rcx` = pointer to a nul-terminated string in,
/// `rax` = the same pointer, `rdx` = byte count up to (not including) the
/// terminator out — strings built by [`super::PeWriter::add_string`] and
/// by runtime record/list allocation are always nul-terminated, so a
/// non-literal `Str`-typed `print` argument can be measured this way
/// without carrying a length alongside the pointer.
pub fn emit_strlen(asm: &mut Assembler) {
    asm.label(STRLEN_LABEL);
    asm.push_reg(Reg::Rbx);
    asm.mov_reg_reg(Reg::Rbx, Reg::Rcx); // rbx = cursor, starts at the string pointer
    asm.mov_reg_imm64(Reg::Rdx, 0); // length
    let loop_label = format!("{STRLEN_LABEL}_loop");
    let done_label = format!("{STRLEN_LABEL}_done");
    asm.label(loop_label.clone());
    asm.mov_reg_byte_zx_from_mem(Reg::Rax, Reg::Rbx, 0);
    asm.mov_reg_imm64(Reg::R9, 0);
    asm.cmp_reg_reg(Reg::Rax, Reg::R9);
    asm.jz_rel32(&done_label);
    asm.mov_reg_imm64(Reg::R9, 1);
    asm.add_reg_reg(Reg::Rdx, Reg::R9);
    asm.add_reg_reg(Reg::Rbx, Reg::R9);
    asm.jmp_rel32(&loop_label);
    asm.label(done_label);
    asm.mov_reg_reg(Reg::Rax, Reg::Rbx);
    asm.sub_reg_reg(Reg::Rax, Reg::Rdx); // rax = original start pointer
    asm.pop_reg(Reg::Rbx);
    asm.ret();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_globals() -> FmtGlobals {
        FmtGlobals { itoa_buf_rva: 0x2000, ftoa_buf_rva: 0x2020, million_rva: 0x2050 }
    }

    #[test]
    fn itoa_emits_a_callable_labeled_routine() {
        let mut asm = Assembler::new();
        emit_itoa(&mut asm, &dummy_globals());
        assert!(!asm.code.is_empty());
        assert!(asm.resolve(0x1000).is_ok());
    }

    #[test]
    fn ftoa_emits_a_callable_labeled_routine() {
        let mut asm = Assembler::new();
        emit_ftoa(&mut asm, &dummy_globals());
        assert!(asm.resolve(0x1000).is_ok());
    }

    #[test]
    fn strlen_emits_a_callable_labeled_routine() {
        let mut asm = Assembler::new();
        emit_strlen(&mut asm);
        asm.label("caller");
        asm.mov_reg_imm64(Reg::Rcx, 0x2000);
        asm.call_rel32(STRLEN_LABEL);
        asm.ret();
        assert!(asm.resolve(0x1000).is_ok());
    }

    #[test]
    fn itoa_is_callable_from_another_label() {
        let mut asm = Assembler::new();
        emit_itoa(&mut asm, &dummy_globals());
        asm.label("caller");
        asm.mov_reg_imm64(Reg::Rcx, -42);
        asm.call_rel32(ITOA_LABEL);
        asm.ret();
        assert!(asm.resolve(0x1000).is_ok());
    }
}
