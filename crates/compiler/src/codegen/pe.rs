//! PE (Portable Executable) writer (spec §4.8 "PE Writer").
//!
//! Builds a minimal but valid Windows x64 executable out of a `.text`
//! section of machine code, a `.data` section of initialized globals, and
//! an `.idata` section synthesized from a requested import table. Grounded
//! in `original_source/src/backend/x64/pe_generator.h`'s `PEGenerator`:
//! the RVA layout is computed twice — placeholder RVAs during code
//! emission, then `calculate_actual_rvas`/`apply_fixups` once every
//! section's final size is known, exactly as the original's two-pass
//! `calculateActualRVAs`/`applyFixups` does it.

use std::collections::HashMap;

pub const IMAGE_BASE: u64 = 0x1_4000_0000;
pub const SECTION_ALIGN: u32 = 0x1000;
pub const FILE_ALIGN: u32 = 0x200;
pub const CODE_RVA: u32 = 0x1000;

/// Placeholder RVAs used while emitting code, before final section sizes
/// are known — `calculate_actual_rvas` rewrites every fixup that targeted
/// one of these once the real layout is fixed.
pub const DATA_RVA_PLACEHOLDER: u32 = 0x0010_0000;
pub const IDATA_RVA_PLACEHOLDER: u32 = 0x0020_0000;

fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) / align * align
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupKind {
    Data,
    Idata,
}

/// A 32-bit RIP-relative displacement in `.text` that needs rewriting once
/// the real RVA of its target is known (spec §4.7 "RIP-relative fixups").
#[derive(Debug, Clone, Copy)]
pub struct CodeFixup {
    pub offset: usize,
    pub target_placeholder_rva: u32,
    pub kind: FixupKind,
}

#[derive(Debug)]
pub enum PeError {
    DuplicateImport { dll: String, function: String },
    ImportsNotFinalized,
    UnknownImport(String),
    FixupOutOfRange { offset: usize },
    TooManyImports,
}

impl std::fmt::Display for PeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeError::DuplicateImport { dll, function } => {
                write!(f, "import `{function}` from `{dll}` requested more than once")
            }
            PeError::ImportsNotFinalized => write!(f, "imports must be finalized before RVAs are computed"),
            PeError::UnknownImport(name) => write!(f, "no import named `{name}` was registered"),
            PeError::FixupOutOfRange { offset } => write!(f, "fixup at code offset {offset} is out of range"),
            PeError::TooManyImports => write!(f, "more than 65535 imported functions"),
        }
    }
}

impl std::error::Error for PeError {}

/// Accumulates the three sections and the fixups against them, then emits
/// a finished Windows PE32+ console executable.
pub struct PeWriter {
    code: Vec<u8>,
    data: Vec<u8>,
    idata: Vec<u8>,
    code_fixups: Vec<CodeFixup>,
    /// DLL name -> ordered list of function names (order fixes IAT slot
    /// index, which `import_rva` depends on).
    imports: Vec<(String, Vec<String>)>,
    import_rvas: HashMap<String, u32>,
    imports_finalized: bool,
    entry_point_offset: u32,
}

impl Default for PeWriter {
    fn default() -> Self {
        PeWriter {
            code: Vec::new(),
            data: Vec::new(),
            idata: Vec::new(),
            code_fixups: Vec::new(),
            imports: Vec::new(),
            import_rvas: HashMap::new(),
            imports_finalized: false,
            entry_point_offset: 0,
        }
    }
}

impl PeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_entry_point(&mut self, code_offset: u32) {
        self.entry_point_offset = code_offset;
    }

    /// Appends raw machine code and returns the offset it was placed at,
    /// so the caller can record label addresses before fixups are known.
    pub fn add_code(&mut self, bytes: &[u8]) -> usize {
        let offset = self.code.len();
        self.code.extend_from_slice(bytes);
        offset
    }

    pub fn add_code_with_fixups(&mut self, bytes: &[u8], rip_fixups: &[(usize, u32, FixupKind)]) -> usize {
        let base = self.add_code(bytes);
        for &(local_offset, target_rva, kind) in rip_fixups {
            self.code_fixups.push(CodeFixup { offset: base + local_offset, target_placeholder_rva: target_rva, kind });
        }
        base
    }

    /// Appends bytes to `.data` and returns their *placeholder* RVA
    /// (`DATA_RVA_PLACEHOLDER`-relative) — resolved to a real RVA by
    /// `calculate_actual_rvas`.
    pub fn add_data(&mut self, bytes: &[u8]) -> u32 {
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(bytes);
        DATA_RVA_PLACEHOLDER + offset
    }

    pub fn add_string(&mut self, s: &str) -> u32 {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.add_data(&bytes)
    }

    pub fn add_qword(&mut self, value: u64) -> u32 {
        self.add_data(&value.to_le_bytes())
    }

    pub fn add_zeroed(&mut self, size: u32, align: u32) -> u32 {
        while self.data.len() as u32 % align.max(1) != 0 {
            self.data.push(0);
        }
        let offset = self.data.len() as u32;
        self.data.resize(self.data.len() + size as usize, 0);
        DATA_RVA_PLACEHOLDER + offset
    }

    pub fn add_import(&mut self, dll: &str, function: &str) -> Result<(), PeError> {
        if self.imports_finalized {
            return Err(PeError::ImportsNotFinalized);
        }
        if let Some((_, funcs)) = self.imports.iter().find(|(d, _)| d.eq_ignore_ascii_case(dll)) {
            if funcs.iter().any(|f| f == function) {
                return Err(PeError::DuplicateImport { dll: dll.to_string(), function: function.to_string() });
            }
        }
        match self.imports.iter_mut().find(|(d, _)| d.eq_ignore_ascii_case(dll)) {
            Some((_, funcs)) => funcs.push(function.to_string()),
            None => self.imports.push((dll.to_string(), vec![function.to_string()])),
        }
        Ok(())
    }

    /// Lays out the import directory table, import lookup tables, IAT, and
    /// hint/name strings into `.idata`, and records each imported
    /// function's placeholder RVA (the IAT slot a `call [rip+disp]`
    /// through that import resolves to).
    pub fn finalize_imports(&mut self) -> Result<(), PeError> {
        if self.imports.len() * self.imports.iter().map(|(_, f)| f.len()).sum::<usize>().max(1) > u16::MAX as usize {
            return Err(PeError::TooManyImports);
        }
        self.idata.clear();
        self.import_rvas.clear();

        const DIR_ENTRY_SIZE: u32 = 20;
        let num_dlls = self.imports.len() as u32;
        let dir_table_size = DIR_ENTRY_SIZE * (num_dlls + 1);

        let mut ilt_offsets = Vec::new();
        let mut iat_offsets = Vec::new();
        let mut cursor = dir_table_size;
        for (_, funcs) in &self.imports {
            ilt_offsets.push(cursor);
            cursor += 8 * (funcs.len() as u32 + 1);
        }
        for (_, funcs) in &self.imports {
            iat_offsets.push(cursor);
            cursor += 8 * (funcs.len() as u32 + 1);
        }

        let mut name_offsets: Vec<Vec<u32>> = Vec::new();
        let mut dll_name_offsets = Vec::new();
        for (dll, funcs) in &self.imports {
            let mut offsets = Vec::new();
            for func in funcs {
                let entry_off = cursor;
                self.idata_reserve_to(cursor);
                let hint_name_off = entry_off;
                cursor += 2;
                cursor += func.len() as u32 + 1;
                if cursor % 2 != 0 {
                    cursor += 1;
                }
                offsets.push(hint_name_off);
            }
            name_offsets.push(offsets);
            dll_name_offsets.push(cursor);
            cursor += dll.len() as u32 + 1;
        }

        self.idata.resize(cursor as usize, 0);

        for (i, (_dll, funcs)) in self.imports.iter().enumerate() {
            let dir_off = (DIR_ENTRY_SIZE * i as u32) as usize;
            self.write_u32_idata(dir_off, IDATA_RVA_PLACEHOLDER + ilt_offsets[i]);
            self.write_u32_idata(dir_off + 12, IDATA_RVA_PLACEHOLDER + dll_name_offsets[i]);
            self.write_u32_idata(dir_off + 16, IDATA_RVA_PLACEHOLDER + iat_offsets[i]);

            for (j, func) in funcs.iter().enumerate() {
                let name_rva = IDATA_RVA_PLACEHOLDER + name_offsets[i][j];
                self.write_u64_idata((ilt_offsets[i] + 8 * j as u32) as usize, name_rva as u64);
                self.write_u64_idata((iat_offsets[i] + 8 * j as u32) as usize, name_rva as u64);

                let hn_off = name_offsets[i][j] as usize;
                self.idata[hn_off..hn_off + 2].copy_from_slice(&0u16.to_le_bytes());
                let name_start = hn_off + 2;
                self.idata[name_start..name_start + func.len()].copy_from_slice(func.as_bytes());
                self.idata[name_start + func.len()] = 0;

                self.import_rvas.insert(func.clone(), IDATA_RVA_PLACEHOLDER + iat_offsets[i] + 8 * j as u32);
            }

            let dll_off = dll_name_offsets[i] as usize;
            let dll_bytes = self.imports[i].0.as_bytes();
            self.idata[dll_off..dll_off + dll_bytes.len()].copy_from_slice(dll_bytes);
            self.idata[dll_off + dll_bytes.len()] = 0;
        }

        self.imports_finalized = true;
        Ok(())
    }

    fn idata_reserve_to(&mut self, end: u32) {
        if self.idata.len() < end as usize {
            self.idata.resize(end as usize, 0);
        }
    }

    fn write_u32_idata(&mut self, offset: usize, value: u32) {
        self.idata_reserve_to((offset + 4) as u32);
        self.idata[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u64_idata(&mut self, offset: usize, value: u64) {
        self.idata_reserve_to((offset + 8) as u32);
        self.idata[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// The placeholder RVA of `function`'s IAT slot — what `lea`/`call
    /// [rip+disp]` fixups against an import should target before
    /// `calculate_actual_rvas` rewrites it to the real one.
    pub fn import_rva(&self, function: &str) -> Result<u32, PeError> {
        self.import_rvas.get(function).copied().ok_or_else(|| PeError::UnknownImport(function.to_string()))
    }

    /// Real RVAs for `.data` and `.idata`, once `.text`'s size is fixed
    /// (spec §4.8 "two-pass RVA resolution").
    fn calculate_actual_rvas(&self) -> (u32, u32) {
        let text_size = align_up(self.code.len() as u32, SECTION_ALIGN);
        let data_rva = CODE_RVA + text_size;
        let data_size = align_up(self.data.len() as u32, SECTION_ALIGN);
        let idata_rva = data_rva + data_size;
        (data_rva, idata_rva)
    }

    /// Rewrites every recorded `.text` fixup from its placeholder RVA to
    /// the real one, as a RIP-relative 32-bit displacement (value - (RVA
    /// of the byte after the displacement field)).
    fn apply_fixups(&mut self, data_rva: u32, idata_rva: u32) -> Result<(), PeError> {
        for fixup in &self.code_fixups {
            if fixup.offset + 4 > self.code.len() {
                return Err(PeError::FixupOutOfRange { offset: fixup.offset });
            }
            let (base, real_rva) = match fixup.kind {
                FixupKind::Data => (DATA_RVA_PLACEHOLDER, data_rva),
                FixupKind::Idata => (IDATA_RVA_PLACEHOLDER, idata_rva),
            };
            let target_rva = real_rva + (fixup.target_placeholder_rva - base);
            let next_instr_rva = CODE_RVA + fixup.offset as u32 + 4;
            let disp = target_rva as i64 - next_instr_rva as i64;
            self.code[fixup.offset..fixup.offset + 4].copy_from_slice(&(disp as i32).to_le_bytes());
        }
        Ok(())
    }

    /// Serializes the accumulated sections into a full PE32+ console
    /// executable image.
    pub fn write(mut self) -> Result<Vec<u8>, PeError> {
        if !self.imports_finalized {
            self.finalize_imports()?;
        }
        let (data_rva, idata_rva) = self.calculate_actual_rvas();
        self.apply_fixups(data_rva, idata_rva)?;

        let text_size_raw = align_up(self.code.len() as u32, FILE_ALIGN);
        let data_size_raw = align_up(self.data.len() as u32, FILE_ALIGN);
        let idata_size_raw = align_up(self.idata.len() as u32, FILE_ALIGN);

        let text_vsize = align_up(self.code.len() as u32, SECTION_ALIGN);
        let data_vsize = align_up(self.data.len() as u32, SECTION_ALIGN);
        let idata_vsize = align_up(self.idata.len() as u32, SECTION_ALIGN);

        const NUM_SECTIONS: u16 = 3;
        let dos_header_size = 0x40u32;
        let pe_headers_size = 4 + 20 + 240; // signature + file header + optional header (PE32+)
        let section_table_size = 40 * NUM_SECTIONS as u32;
        let headers_size = align_up(dos_header_size + pe_headers_size + section_table_size, FILE_ALIGN);

        let text_file_off = headers_size;
        let data_file_off = text_file_off + text_size_raw;
        let idata_file_off = data_file_off + data_size_raw;

        let mut out = Vec::new();

        // --- DOS header + stub ---
        out.extend_from_slice(b"MZ");
        out.resize(0x3c, 0);
        out.extend_from_slice(&(dos_header_size).to_le_bytes());
        out.resize(dos_header_size as usize, 0);

        // --- PE signature + COFF file header ---
        out.extend_from_slice(b"PE\0\0");
        out.extend_from_slice(&0x8664u16.to_le_bytes()); // IMAGE_FILE_MACHINE_AMD64
        out.extend_from_slice(&NUM_SECTIONS.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // timestamp
        out.extend_from_slice(&0u32.to_le_bytes()); // symbol table ptr
        out.extend_from_slice(&0u32.to_le_bytes()); // symbol count
        out.extend_from_slice(&240u16.to_le_bytes()); // optional header size
        const EXECUTABLE_IMAGE: u16 = 0x0002;
        const LARGE_ADDRESS_AWARE: u16 = 0x0020;
        out.extend_from_slice(&(EXECUTABLE_IMAGE | LARGE_ADDRESS_AWARE).to_le_bytes());

        // --- PE32+ optional header ---
        out.extend_from_slice(&0x20bu16.to_le_bytes()); // PE32+ magic
        out.push(14); // major linker ver
        out.push(0); // minor linker ver
        out.extend_from_slice(&text_size_raw.to_le_bytes());
        out.extend_from_slice(&(data_size_raw + idata_size_raw).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // size of bss
        out.extend_from_slice(&(CODE_RVA + self.entry_point_offset).to_le_bytes());
        out.extend_from_slice(&CODE_RVA.to_le_bytes()); // base of code
        out.extend_from_slice(&IMAGE_BASE.to_le_bytes());
        out.extend_from_slice(&SECTION_ALIGN.to_le_bytes());
        out.extend_from_slice(&FILE_ALIGN.to_le_bytes());
        out.extend_from_slice(&6u16.to_le_bytes()); // major OS ver
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // major image ver
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&6u16.to_le_bytes()); // major subsystem ver
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // win32 version value
        let image_size = align_up(idata_rva + idata_vsize, SECTION_ALIGN);
        out.extend_from_slice(&image_size.to_le_bytes());
        out.extend_from_slice(&headers_size.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // checksum
        const SUBSYSTEM_CONSOLE: u16 = 3;
        out.extend_from_slice(&SUBSYSTEM_CONSOLE.to_le_bytes());
        out.extend_from_slice(&0x8140u16.to_le_bytes()); // dll characteristics
        out.extend_from_slice(&0x100000u64.to_le_bytes()); // stack reserve
        out.extend_from_slice(&0x1000u64.to_le_bytes()); // stack commit
        out.extend_from_slice(&0x100000u64.to_le_bytes()); // heap reserve
        out.extend_from_slice(&0x1000u64.to_le_bytes()); // heap commit
        out.extend_from_slice(&0u32.to_le_bytes()); // loader flags
        const NUM_DATA_DIRS: u32 = 16;
        out.extend_from_slice(&NUM_DATA_DIRS.to_le_bytes());

        // data directories: 0 export, 1 import, ... 15 reserved
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&idata_rva.to_le_bytes());
        out.extend_from_slice(&(self.idata.len() as u32).to_le_bytes());
        for _ in 2..16 {
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
        }

        // --- section table ---
        write_section(&mut out, b".text", text_vsize, CODE_RVA, text_size_raw, text_file_off, 0x6000_0020);
        write_section(&mut out, b".data", data_vsize, data_rva, data_size_raw, data_file_off, 0xc000_0040);
        write_section(&mut out, b".idata", idata_vsize, idata_rva, idata_size_raw, idata_file_off, 0xc000_0040);

        out.resize(headers_size as usize, 0);

        out.resize(text_file_off as usize, 0);
        out.extend_from_slice(&self.code);
        out.resize((text_file_off + text_size_raw) as usize, 0);

        out.resize(data_file_off as usize, 0);
        out.extend_from_slice(&self.data);
        out.resize((data_file_off + data_size_raw) as usize, 0);

        out.resize(idata_file_off as usize, 0);
        out.extend_from_slice(&self.idata);
        out.resize((idata_file_off + idata_size_raw) as usize, 0);

        Ok(out)
    }
}

fn write_section(out: &mut Vec<u8>, name: &[u8], vsize: u32, rva: u32, raw_size: u32, raw_off: u32, characteristics: u32) {
    let mut name_field = [0u8; 8];
    name_field[..name.len()].copy_from_slice(name);
    out.extend_from_slice(&name_field);
    out.extend_from_slice(&vsize.to_le_bytes());
    out.extend_from_slice(&rva.to_le_bytes());
    out.extend_from_slice(&raw_size.to_le_bytes());
    out.extend_from_slice(&raw_off.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // reloc ptr
    out.extend_from_slice(&0u32.to_le_bytes()); // line num ptr
    out.extend_from_slice(&0u16.to_le_bytes()); // num relocs
    out.extend_from_slice(&0u16.to_le_bytes()); // num line nums
    out.extend_from_slice(&characteristics.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_image_has_mz_and_pe_signatures() {
        let writer = PeWriter::new();
        let image = writer.write().unwrap();
        assert_eq!(&image[0..2], b"MZ");
        let pe_off = u32::from_le_bytes(image[0x3c..0x40].try_into().unwrap()) as usize;
        assert_eq!(&image[pe_off..pe_off + 4], b"PE\0\0");
    }

    #[test]
    fn duplicate_import_is_rejected() {
        let mut writer = PeWriter::new();
        writer.add_import("kernel32.dll", "ExitProcess").unwrap();
        assert!(writer.add_import("kernel32.dll", "ExitProcess").is_err());
    }

    #[test]
    fn import_rva_is_available_after_finalize() {
        let mut writer = PeWriter::new();
        writer.add_import("kernel32.dll", "ExitProcess").unwrap();
        writer.finalize_imports().unwrap();
        assert!(writer.import_rva("ExitProcess").is_ok());
        assert!(writer.import_rva("NoSuchFunction").is_err());
    }

    #[test]
    fn data_fixup_resolves_to_real_section_rva() {
        let mut writer = PeWriter::new();
        let target = writer.add_qword(42);
        let code = vec![0x48, 0x8d, 0x05, 0x00, 0x00, 0x00, 0x00]; // lea rax, [rip+disp32]
        writer.add_code_with_fixups(&code, &[(3, target, FixupKind::Data)]);
        let image = writer.write().unwrap();
        assert!(image.len() > headers_len());
    }

    fn headers_len() -> usize {
        0x400
    }

    #[test]
    fn code_with_no_fixups_is_copied_verbatim_into_text_section() {
        let mut writer = PeWriter::new();
        writer.add_code(&[0x90, 0x90, 0xc3]);
        let image = writer.write().unwrap();
        assert!(image.len() >= 0x1000 * 2);
    }
}
