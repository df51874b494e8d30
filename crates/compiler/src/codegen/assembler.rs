//! x64 byte-emitter (spec §4.7 "x64 Assembler").
//!
//! Not a parser of assembly text: a thin buffer with one helper method per
//! instruction form the native code generator needs. Each helper appends
//! raw bytes; `resolve` patches every recorded label reference once all
//! labels are known, and `apply_rip_fixups` patches RIP-relative data
//! references once the data section's final RVA is known (spec I6).
//!
//! Grounded in the general shape of the teacher's buffer-and-counter
//! `CodeGen` (`navicore-cem3/compiler/src/codegen.rs`), generalized from
//! text emission to raw byte emission per spec §4.7/§9 ("Raw-byte code
//! emission... the tricky part is getting the x64 ModR/M and REX prefix
//! encodings right").

use std::collections::HashMap;

/// A general-purpose register, numbered per the x64 encoding (`rax`=0 ...
/// `r15`=15). Only the callee-saved set (`rbx, r12-r15`) is used by the
/// register allocator (spec §4.10.6), but the assembler supports the full
/// set since the calling convention and prologue/epilogue touch others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Reg {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// True if encoding this register requires REX.B/R/X (register number
    /// >= 8).
    pub fn is_extended(self) -> bool {
        self.code() >= 8
    }
}

/// An `xmm0`..`xmm15` register, used for float operands (spec §4.10.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Xmm(pub u8);

const REX: u8 = 0x40;
const REX_W: u8 = 0x48; // 64-bit operand size
const REX_R: u8 = 0x04; // ModRM.reg extension
const REX_X: u8 = 0x02; // SIB.index extension
const REX_B: u8 = 0x01; // ModRM.rm / SIB.base / opcode.reg extension

fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    (mode << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
}

/// Win64 calling-convention integer argument registers, in order (spec
/// §4.10.1).
pub const ARG_REGS: [Reg; 4] = [Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9];
/// Callee-saved registers available to the priority register allocator
/// (spec §4.10.6); `rbp`/`rsp` are excluded (frame pointer and stack
/// pointer), `rbx`/`r12`-`r15` are the real callee-saved set.
pub const CALLEE_SAVED: [Reg; 5] = [Reg::Rbx, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FixupKind {
    /// A `rel32` branch/call displacement relative to the byte *after* the
    /// 4-byte field, resolved against another label in the same buffer.
    Rel32ToLabel,
}

#[derive(Debug, Clone)]
struct LabelFixup {
    /// Byte offset of the 4-byte displacement field within the code
    /// buffer.
    field_offset: usize,
    label: String,
    kind: FixupKind,
}

/// A RIP-relative reference to the data section, recorded because the
/// data section's final RVA isn't known until the PE writer lays out
/// sections (spec I6, §4.7 "References to the data section").
#[derive(Debug, Clone, Copy)]
pub struct RipFixup {
    /// Byte offset of the 4-byte displacement field within the code
    /// buffer.
    pub field_offset: usize,
    /// Target RVA within `.data` the `lea`/`call`/`mov` should end up
    /// addressing, relative to the final code-section base once resolved.
    pub target_rva: u32,
}

#[derive(Debug, Default)]
pub struct Assembler {
    pub code: Vec<u8>,
    labels: HashMap<String, usize>,
    fixups: Vec<LabelFixup>,
    pub rip_fixups: Vec<RipFixup>,
}

impl Assembler {
    pub fn new() -> Self {
        Assembler::default()
    }

    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn label(&mut self, name: impl Into<String>) {
        self.labels.insert(name.into(), self.code.len());
    }

    fn emit(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    fn emit_rex(&mut self, w: bool, r: bool, x: bool, b: bool) {
        let mut rex = 0u8;
        if w {
            rex |= REX_W;
        }
        if r {
            rex |= REX_R;
        }
        if x {
            rex |= REX_X;
        }
        if b {
            rex |= REX_B;
        }
        if rex != 0 || w {
            self.emit(&[rex | REX]);
        }
    }

    // ---- data movement -------------------------------------------------

    /// `mov reg, imm64` — `REX.W B8+r io`.
    pub fn mov_reg_imm64(&mut self, dst: Reg, imm: i64) {
        self.emit_rex(true, false, false, dst.is_extended());
        self.emit(&[0xB8 + (dst.code() & 0x7)]);
        self.emit(&(imm as u64).to_le_bytes());
    }

    /// `mov rax, imm64` (spec's named helper).
    pub fn mov_rax_imm64(&mut self, imm: i64) {
        self.mov_reg_imm64(Reg::Rax, imm);
    }

    /// `mov dst, src` — `REX.W 89 /r` (src is ModRM.reg, dst is ModRM.rm).
    pub fn mov_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.emit_rex(true, src.is_extended(), false, dst.is_extended());
        self.emit(&[0x89, modrm(0b11, src.code(), dst.code())]);
    }

    /// `mov dst, [rbp + disp32]` — local variable load (spec §4.7 "locals
    /// are `[rbp - offset]`").
    pub fn mov_reg_from_rbp(&mut self, dst: Reg, disp: i32) {
        self.emit_rex(true, dst.is_extended(), false, false);
        self.emit(&[0x8B, modrm(0b10, dst.code(), Reg::Rbp.code())]);
        self.emit(&disp.to_le_bytes());
    }

    /// `mov [rbp + disp32], src` — local variable store.
    pub fn mov_rbp_to_reg(&mut self, disp: i32, src: Reg) {
        self.emit_rex(true, src.is_extended(), false, false);
        self.emit(&[0x89, modrm(0b10, src.code(), Reg::Rbp.code())]);
        self.emit(&disp.to_le_bytes());
    }

    /// `mov dst, [base + disp32]` — general memory load, used for record
    /// field / GC header / capture slot access.
    pub fn mov_reg_from_mem(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.emit_rex(true, dst.is_extended(), false, base.is_extended());
        if disp == 0 && base != Reg::Rbp && base != Reg::R13 {
            self.emit(&[0x8B, modrm(0b00, dst.code(), base.code())]);
        } else {
            self.emit(&[0x8B, modrm(0b10, dst.code(), base.code())]);
            self.emit(&disp.to_le_bytes());
        }
    }

    pub fn mov_mem_from_reg(&mut self, base: Reg, disp: i32, src: Reg) {
        self.emit_rex(true, src.is_extended(), false, base.is_extended());
        if disp == 0 && base != Reg::Rbp && base != Reg::R13 {
            self.emit(&[0x89, modrm(0b00, src.code(), base.code())]);
        } else {
            self.emit(&[0x89, modrm(0b10, src.code(), base.code())]);
            self.emit(&disp.to_le_bytes());
        }
    }

    /// `mov byte [base + disp32], src` — single-byte store, used by the
    /// itoa/ftoa runtime routines to write individual ASCII digit bytes
    /// into a scratch buffer. Callers must pass `src` as `Rax`, `Rcx`,
    /// `Rdx`, `Rbx`, or an extended register (`R8`-`R15`): those encode as
    /// `al`/`cl`/`dl`/`bl`/`r8b`-`r15b` with or without a REX prefix,
    /// whereas `Rsp`/`Rbp`/`Rsi`/`Rdi` would silently address
    /// `ah`/`ch`/`dh`/`bh` without one.
    pub fn mov_mem_byte_from_reg(&mut self, base: Reg, disp: i32, src: Reg) {
        self.emit_rex(false, src.is_extended(), false, base.is_extended());
        if disp == 0 && base != Reg::Rbp && base != Reg::R13 {
            self.emit(&[0x88, modrm(0b00, src.code(), base.code())]);
        } else {
            self.emit(&[0x88, modrm(0b10, src.code(), base.code())]);
            self.emit(&disp.to_le_bytes());
        }
    }

    /// `movzx dst, byte [base + disp32]` — zero-extending single-byte
    /// load, the counterpart to [`Assembler::mov_mem_byte_from_reg`] used by
    /// the strlen runtime routine to scan a C-string for its terminator.
    pub fn mov_reg_byte_zx_from_mem(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.emit_rex(true, dst.is_extended(), false, base.is_extended());
        if disp == 0 && base != Reg::Rbp && base != Reg::R13 {
            self.emit(&[0x0F, 0xB6, modrm(0b00, dst.code(), base.code())]);
        } else {
            self.emit(&[0x0F, 0xB6, modrm(0b10, dst.code(), base.code())]);
            self.emit(&disp.to_le_bytes());
        }
    }

    pub fn mov_rbp_rsp(&mut self) {
        self.mov_reg_reg(Reg::Rbp, Reg::Rsp);
    }

    // ---- stack ----------------------------------------------------------

    pub fn push_reg(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.emit(&[REX | REX_B]);
        }
        self.emit(&[0x50 + (reg.code() & 0x7)]);
    }

    pub fn pop_reg(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.emit(&[REX | REX_B]);
        }
        self.emit(&[0x58 + (reg.code() & 0x7)]);
    }

    /// `sub rsp, imm32` — `REX.W 81 /5 id`.
    pub fn sub_rsp_imm32(&mut self, imm: i32) {
        self.emit_rex(true, false, false, false);
        self.emit(&[0x81, modrm(0b11, 5, Reg::Rsp.code())]);
        self.emit(&imm.to_le_bytes());
    }

    pub fn add_rsp_imm32(&mut self, imm: i32) {
        self.emit_rex(true, false, false, false);
        self.emit(&[0x81, modrm(0b11, 0, Reg::Rsp.code())]);
        self.emit(&imm.to_le_bytes());
    }

    // ---- arithmetic -------------------------------------------------

    fn alu_reg_reg(&mut self, opcode: u8, dst: Reg, src: Reg) {
        self.emit_rex(true, src.is_extended(), false, dst.is_extended());
        self.emit(&[opcode, modrm(0b11, src.code(), dst.code())]);
    }

    pub fn add_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.alu_reg_reg(0x01, dst, src);
    }

    pub fn add_rax_rcx(&mut self) {
        self.add_reg_reg(Reg::Rax, Reg::Rcx);
    }

    pub fn sub_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.alu_reg_reg(0x29, dst, src);
    }

    pub fn and_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.alu_reg_reg(0x21, dst, src);
    }

    pub fn or_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.alu_reg_reg(0x09, dst, src);
    }

    pub fn xor_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.alu_reg_reg(0x31, dst, src);
    }

    pub fn xor_rax_rax(&mut self) {
        self.xor_reg_reg(Reg::Rax, Reg::Rax);
    }

    pub fn cmp_reg_reg(&mut self, a: Reg, b: Reg) {
        self.alu_reg_reg(0x39, a, b);
    }

    /// `imul dst, src` — `REX.W 0F AF /r`.
    pub fn imul_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.emit_rex(true, dst.is_extended(), false, src.is_extended());
        self.emit(&[0x0F, 0xAF, modrm(0b11, dst.code(), src.code())]);
    }

    /// `cqo` — sign-extend `rax` into `rdx:rax`, ahead of `idiv` (spec
    /// §4.10.3 "idiv (sign-extending via cqo)").
    pub fn cqo(&mut self) {
        self.emit(&[REX | REX_W, 0x99]);
    }

    /// `idiv divisor` — `REX.W F7 /7`.
    pub fn idiv_reg(&mut self, divisor: Reg) {
        self.emit_rex(true, false, false, divisor.is_extended());
        self.emit(&[0xF7, modrm(0b11, 7, divisor.code())]);
    }

    /// `cmp reg, imm32` then `setCC al; movzx rax, al` is built by codegen
    /// out of `cmp_reg_reg`/`set_cc`/`movzx_rax_al` for boolean results
    /// (spec §4.10.3 "Comparisons").
    pub fn set_cc(&mut self, cc: CondCode) {
        // SETcc r/m8 — 0F 90+cc /0, targeting AL.
        self.emit(&[0x0F, 0x90 + cc as u8, modrm(0b11, 0, Reg::Rax.code())]);
    }

    pub fn movzx_rax_al(&mut self) {
        self.emit_rex(true, false, false, false);
        self.emit(&[0x0F, 0xB6, modrm(0b11, Reg::Rax.code(), Reg::Rax.code())]);
    }

    // ---- control flow -------------------------------------------------

    fn emit_rel32_fixup(&mut self, label: &str) {
        let field_offset = self.code.len();
        self.emit(&0i32.to_le_bytes());
        self.fixups.push(LabelFixup { field_offset, label: label.to_string(), kind: FixupKind::Rel32ToLabel });
    }

    pub fn call_rel32(&mut self, label: &str) {
        self.emit(&[0xE8]);
        self.emit_rel32_fixup(label);
    }

    pub fn jmp_rel32(&mut self, label: &str) {
        self.emit(&[0xE9]);
        self.emit_rel32_fixup(label);
    }

    pub fn jz_rel32(&mut self, label: &str) {
        self.emit(&[0x0F, 0x84]);
        self.emit_rel32_fixup(label);
    }

    pub fn jnz_rel32(&mut self, label: &str) {
        self.emit(&[0x0F, 0x85]);
        self.emit_rel32_fixup(label);
    }

    pub fn jl_rel32(&mut self, label: &str) {
        self.emit(&[0x0F, 0x8C]);
        self.emit_rel32_fixup(label);
    }

    pub fn jge_rel32(&mut self, label: &str) {
        self.emit(&[0x0F, 0x8D]);
        self.emit_rel32_fixup(label);
    }

    /// `call [rip + disp32]` — indirect call through an IAT slot (spec
    /// §4.8 "the code generator emits `call_mem_rip(import_rva)`").
    pub fn call_mem_rip(&mut self, import_rva: u32) {
        self.emit(&[0xFF, modrm(0b00, 2, 0b101)]);
        let field_offset = self.code.len();
        self.emit(&0i32.to_le_bytes());
        self.rip_fixups.push(RipFixup { field_offset, target_rva: import_rva });
    }

    /// `lea rax, [rip + disp32]` — address of a `.data` constant (spec
    /// §4.7 "References to the data section").
    pub fn lea_rax_rip_fixup(&mut self, target_rva: u32) {
        self.emit_rex(true, false, false, false);
        self.emit(&[0x8D, modrm(0b00, Reg::Rax.code(), 0b101)]);
        let field_offset = self.code.len();
        self.emit(&0i32.to_le_bytes());
        self.rip_fixups.push(RipFixup { field_offset, target_rva });
    }

    pub fn ret(&mut self) {
        self.emit(&[0xC3]);
    }

    // ---- SSE (float) --------------------------------------------------

    fn sse_rr(&mut self, prefix: u8, opcode: u8, dst: Xmm, src: Xmm) {
        self.emit(&[prefix]);
        if dst.0 >= 8 || src.0 >= 8 {
            self.emit_rex(false, dst.0 >= 8, false, src.0 >= 8);
        }
        self.emit(&[0x0F, opcode, modrm(0b11, dst.0 & 0x7, src.0 & 0x7)]);
    }

    pub fn movsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, 0x10, dst, src);
    }

    pub fn addsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, 0x58, dst, src);
    }

    pub fn subsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, 0x5C, dst, src);
    }

    pub fn mulsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, 0x59, dst, src);
    }

    pub fn divsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, 0x5E, dst, src);
    }

    /// `cvtsi2sd dst, src` — int-to-float (spec §4.10.3 "Arithmetic
    /// lowering").
    pub fn cvtsi2sd(&mut self, dst: Xmm, src: Reg) {
        self.emit(&[0xF2]);
        self.emit_rex(true, dst.0 >= 8, false, src.is_extended());
        self.emit(&[0x0F, 0x2A, modrm(0b11, dst.0 & 0x7, src.code())]);
    }

    /// `cvttsd2si dst, src` — truncating float-to-int.
    pub fn cvttsd2si(&mut self, dst: Reg, src: Xmm) {
        self.emit(&[0xF2]);
        self.emit_rex(true, dst.is_extended(), false, src.0 >= 8);
        self.emit(&[0x0F, 0x2C, modrm(0b11, dst.code(), src.0 & 0x7)]);
    }

    /// `movq dst, src` (xmm <- gpr) — `66 REX.W 0F 6E /r`.
    pub fn movq_xmm_from_gpr(&mut self, dst: Xmm, src: Reg) {
        self.emit(&[0x66]);
        self.emit_rex(true, dst.0 >= 8, false, src.is_extended());
        self.emit(&[0x0F, 0x6E, modrm(0b11, dst.0 & 0x7, src.code())]);
    }

    /// `movq dst, src` (gpr <- xmm) — `66 REX.W 0F 7E /r`.
    pub fn movq_gpr_from_xmm(&mut self, dst: Reg, src: Xmm) {
        self.emit(&[0x66]);
        self.emit_rex(true, src.0 >= 8, false, dst.is_extended());
        self.emit(&[0x0F, 0x7E, modrm(0b11, src.0 & 0x7, dst.code())]);
    }

    // ---- resolution -------------------------------------------------

    #[derive()]
    pub fn nop(&mut self) {
        self.emit(&[0x90]);
    }

    /// Patches every recorded label-relative fixup against the label
    /// positions recorded so far. `code_base_rva` is accepted for parity
    /// with spec wording ("resolve(code_base_rva)") but rel32 branches are
    /// self-relative and don't need it; it's threaded through for callers
    /// that want to assert the final RVA in tests/diagnostics.
    pub fn resolve(&mut self, _code_base_rva: u32) -> Result<(), AssembleError> {
        for fixup in &self.fixups {
            let target = *self
                .labels
                .get(&fixup.label)
                .ok_or_else(|| AssembleError::UnresolvedLabel(fixup.label.clone()))?;
            let next_instr = fixup.field_offset + 4;
            let rel = target as i64 - next_instr as i64;
            if rel < i32::MIN as i64 || rel > i32::MAX as i64 {
                return Err(AssembleError::DisplacementOutOfRange(fixup.label.clone()));
            }
            match fixup.kind {
                FixupKind::Rel32ToLabel => {
                    self.code[fixup.field_offset..fixup.field_offset + 4].copy_from_slice(&(rel as i32).to_le_bytes());
                }
            }
        }
        Ok(())
    }

    /// Patches RIP-relative `.data` references once the final code-section
    /// RVA and the target RVAs are known (spec §4.8 "applyFixups").
    pub fn apply_rip_fixups(&mut self, code_base_rva: u32) {
        for fixup in &self.rip_fixups {
            let next_instr_rva = code_base_rva + (fixup.field_offset + 4) as u32;
            let rel = fixup.target_rva as i64 - next_instr_rva as i64;
            self.code[fixup.field_offset..fixup.field_offset + 4]
                .copy_from_slice(&(rel as i32).to_le_bytes());
        }
    }

    /// Peephole pass (spec §4.7): collapses redundant forms after assembly.
    /// Operates on whole encoded instructions recognized by their exact
    /// byte patterns, since there's no separate instruction-list IR here.
    pub fn peephole(&mut self) {
        let mov_rax_rax = {
            let mut a = Assembler::new();
            a.mov_reg_reg(Reg::Rax, Reg::Rax);
            a.code
        };
        let add_rsp_zero = {
            let mut a = Assembler::new();
            a.add_rsp_imm32(0);
            a.code
        };
        remove_all_occurrences(&mut self.code, &mov_rax_rax);
        remove_all_occurrences(&mut self.code, &add_rsp_zero);
        collapse_push_pop_same_reg(&mut self.code);
        fuse_xor_rax_rax_then_mov_rax_imm(&mut self.code);
    }
}

/// Drops a redundant `xor rax, rax` immediately ahead of a `mov rax,
/// imm64` — the zeroing has no effect once the immediate load overwrites
/// the whole register (spec §4.7's fourth peephole form).
fn fuse_xor_rax_rax_then_mov_rax_imm(code: &mut Vec<u8>) {
    const XOR_RAX_RAX: [u8; 3] = [0x48, 0x31, 0xC0];
    const MOV_RAX_IMM_PREFIX: [u8; 2] = [0x48, 0xB8];
    let mut out = Vec::with_capacity(code.len());
    let mut i = 0;
    while i < code.len() {
        let fusable = code[i..].starts_with(&XOR_RAX_RAX)
            && code.get(i + XOR_RAX_RAX.len()..).is_some_and(|rest| rest.starts_with(&MOV_RAX_IMM_PREFIX));
        if fusable {
            i += XOR_RAX_RAX.len();
            continue;
        }
        out.push(code[i]);
        i += 1;
    }
    *code = out;
}

fn remove_all_occurrences(code: &mut Vec<u8>, pattern: &[u8]) {
    if pattern.is_empty() {
        return;
    }
    let mut out = Vec::with_capacity(code.len());
    let mut i = 0;
    while i < code.len() {
        if code[i..].starts_with(pattern) {
            i += pattern.len();
        } else {
            out.push(code[i]);
            i += 1;
        }
    }
    *code = out;
}

/// Merges an immediately adjacent `push r; pop r` pair (same register) into
/// nothing, per spec §4.7's peephole list.
fn collapse_push_pop_same_reg(code: &mut Vec<u8>) {
    let mut out: Vec<u8> = Vec::with_capacity(code.len());
    let mut i = 0;
    while i < code.len() {
        if i + 1 < code.len() && (0x50..=0x57).contains(&code[i]) && code[i + 1] == code[i] + 0x08 {
            i += 2;
            continue;
        }
        out.push(code[i]);
        i += 1;
    }
    *code = out;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CondCode {
    Overflow = 0x0,
    NotOverflow = 0x1,
    Below = 0x2,
    AboveOrEqual = 0x3,
    Equal = 0x4,
    NotEqual = 0x5,
    BelowOrEqual = 0x6,
    Above = 0x7,
    Sign = 0x8,
    NotSign = 0x9,
    Less = 0xC,
    GreaterOrEqual = 0xD,
    LessOrEqual = 0xE,
    Greater = 0xF,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssembleError {
    UnresolvedLabel(String),
    DisplacementOutOfRange(String),
}

impl std::fmt::Display for AssembleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssembleError::UnresolvedLabel(l) => write!(f, "unresolved label `{l}`"),
            AssembleError::DisplacementOutOfRange(l) => write!(f, "branch to `{l}` exceeds rel32 range"),
        }
    }
}

impl std::error::Error for AssembleError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mov_rax_imm64_emits_rex_w_b8_and_eight_bytes() {
        let mut asm = Assembler::new();
        asm.mov_rax_imm64(5);
        assert_eq!(asm.code, vec![0x48, 0xB8, 5, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn call_rel32_resolves_against_a_later_label() {
        let mut asm = Assembler::new();
        asm.call_rel32("target");
        let call_end = asm.offset();
        asm.nop();
        asm.label("target");
        asm.resolve(0x1000).unwrap();
        let rel = i32::from_le_bytes(asm.code[1..5].try_into().unwrap());
        assert_eq!(rel, (call_end + 1 - call_end) as i32);
    }

    #[test]
    fn unresolved_label_is_an_error() {
        let mut asm = Assembler::new();
        asm.jmp_rel32("nowhere");
        assert!(asm.resolve(0).is_err());
    }

    #[test]
    fn rip_fixup_patches_relative_to_code_base() {
        let mut asm = Assembler::new();
        asm.lea_rax_rip_fixup(0x3000);
        asm.apply_rip_fixups(0x1000);
        let field = asm.code.len() - 4;
        let rel = i32::from_le_bytes(asm.code[field..].try_into().unwrap());
        let next_instr_rva = 0x1000 + field as u32 + 4;
        assert_eq!(rel, 0x3000 - next_instr_rva as i32);
    }

    #[test]
    fn peephole_removes_redundant_mov_rax_rax() {
        let mut asm = Assembler::new();
        asm.mov_rax_imm64(1);
        asm.mov_reg_reg(Reg::Rax, Reg::Rax);
        asm.ret();
        asm.peephole();
        assert_eq!(asm.code, vec![0x48, 0xB8, 1, 0, 0, 0, 0, 0, 0, 0, 0xC3]);
    }

    #[test]
    fn peephole_collapses_push_pop_same_register() {
        let mut asm = Assembler::new();
        asm.push_reg(Reg::Rbx);
        asm.pop_reg(Reg::Rbx);
        asm.ret();
        asm.peephole();
        assert_eq!(asm.code, vec![0xC3]);
    }

    #[test]
    fn peephole_fuses_xor_rax_rax_then_mov_rax_imm() {
        let mut asm = Assembler::new();
        asm.xor_rax_rax();
        asm.mov_rax_imm64(42);
        asm.ret();
        asm.peephole();
        assert_eq!(asm.code, vec![0x48, 0xB8, 42, 0, 0, 0, 0, 0, 0, 0, 0xC3]);
    }

    #[test]
    fn peephole_leaves_unrelated_xor_rax_rax_alone() {
        let mut asm = Assembler::new();
        asm.xor_rax_rax();
        asm.ret();
        asm.peephole();
        assert_eq!(asm.code, vec![0x48, 0x31, 0xC0, 0xC3]);
    }

    #[test]
    fn mov_mem_byte_from_reg_emits_a_single_byte_store() {
        let mut asm = Assembler::new();
        asm.mov_mem_byte_from_reg(Reg::R10, -1, Reg::Rdx);
        assert!(!asm.code.is_empty());
    }

    #[test]
    fn mov_reg_byte_zx_from_mem_emits_a_single_byte_load() {
        let mut asm = Assembler::new();
        asm.mov_reg_byte_zx_from_mem(Reg::Rax, Reg::R10, 0);
        assert!(!asm.code.is_empty());
    }

    #[test]
    fn extended_register_sets_rex_b() {
        let mut asm = Assembler::new();
        asm.push_reg(Reg::R12);
        assert_eq!(asm.code, vec![0x41, 0x54]);
    }
}
