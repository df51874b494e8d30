//! Linker (spec §4.11): merges `.to` object files into a single PE image.
//!
//! Grounded in `original_source/src/backend/linker/linker.h`'s `Linker`:
//! the same four-phase pipeline (`collectSymbols` / `resolveSymbols` /
//! `layoutSections` / `applyRelocations`) generalized from the original's
//! hand-rolled RVA bookkeeping to operate over [`crate::objfile::ObjectFile`]
//! values and reuse [`crate::codegen::pe::PeWriter`] for the final image.
//!
//! An import symbol (spec: "marked as an import") is any undefined
//! [`ObjSymbol`] whose name contains a `!`, written `dll!function` — e.g.
//! `kernel32.dll!ExitProcess`. Anything else undefined is an unresolved
//! reference and a fatal link error.

use crate::codegen::pe::{FixupKind, PeError, PeWriter};
use crate::objfile::{ObjSymbol, ObjectFile, RelocKind, SectionKind};
use std::collections::HashMap;

#[derive(Debug)]
pub enum LinkError {
    NoObjects,
    DuplicateStrongSymbol { name: String, first: String, second: String },
    UndefinedSymbol { name: String, referenced_from: String },
    NoEntryPoint,
    Pe(PeError),
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::NoObjects => write!(f, "no object files given to link"),
            LinkError::DuplicateStrongSymbol { name, first, second } => {
                write!(f, "duplicate strong symbol `{name}` defined in both `{first}` and `{second}`")
            }
            LinkError::UndefinedSymbol { name, referenced_from } => {
                write!(f, "undefined symbol `{name}` referenced from `{referenced_from}`")
            }
            LinkError::NoEntryPoint => write!(f, "no object defines `main`"),
            LinkError::Pe(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for LinkError {}

impl From<PeError> for LinkError {
    fn from(e: PeError) -> Self {
        LinkError::Pe(e)
    }
}

/// One row of a `--map` file: a resolved symbol's final RVA and the
/// object that defined it (spec §4.11: "An optional `.map` file lists
/// every symbol, its final RVA, and its source object").
#[derive(Debug, Clone)]
pub struct LinkedSymbol {
    pub name: String,
    pub rva: u32,
    pub size: u32,
    pub source_module: String,
}

pub struct LinkResult {
    pub image: Vec<u8>,
    pub map: Vec<LinkedSymbol>,
}

struct Resolved<'a> {
    symbol: &'a ObjSymbol,
    module: &'a str,
    /// Offset of this object's matching section within the merged buffer.
    base_offset: u32,
}

/// Phase 1 (spec: "Collects every defined symbol into a global map;
/// duplicate strong definitions are errors; duplicates where one is weak
/// yield the strong one").
fn collect_symbols<'a>(objects: &'a [ObjectFile], layouts: &HashMap<&'a str, ObjectLayout>) -> Result<HashMap<&'a str, Resolved<'a>>, LinkError> {
    let mut globals: HashMap<&str, Resolved> = HashMap::new();
    for obj in objects {
        let layout = &layouts[obj.module_name.as_str()];
        for sym in &obj.symbols {
            if !sym.is_defined {
                continue;
            }
            let base_offset = match sym.section {
                Some(SectionKind::Text) => layout.text_offset,
                Some(SectionKind::Data) => layout.data_offset,
                Some(SectionKind::Rodata) => layout.rodata_offset,
                None => 0,
            };
            match globals.get(sym.name.as_str()) {
                None => {
                    globals.insert(&sym.name, Resolved { symbol: sym, module: &obj.module_name, base_offset });
                }
                Some(existing) => {
                    if existing.symbol.is_weak && !sym.is_weak {
                        globals.insert(&sym.name, Resolved { symbol: sym, module: &obj.module_name, base_offset });
                    } else if existing.symbol.is_weak && sym.is_weak {
                        // first weak definition wins; later weak duplicates are ignored
                    } else if !sym.is_weak {
                        return Err(LinkError::DuplicateStrongSymbol {
                            name: sym.name.clone(),
                            first: existing.module.to_string(),
                            second: obj.module_name.clone(),
                        });
                    }
                }
            }
        }
    }
    Ok(globals)
}

struct ObjectLayout {
    text_offset: u32,
    data_offset: u32,
    rodata_offset: u32,
}

/// Phase 3 (spec: "Lays out sections by object-order, assigns each object
/// an offset").
fn layout_objects(objects: &[ObjectFile]) -> (HashMap<&str, ObjectLayout>, Vec<u8>, Vec<u8>, Vec<u8>) {
    let mut layouts = HashMap::new();
    let mut text = Vec::new();
    let mut data = Vec::new();
    let mut rodata = Vec::new();
    for obj in objects {
        let layout = ObjectLayout { text_offset: text.len() as u32, data_offset: data.len() as u32, rodata_offset: rodata.len() as u32 };
        text.extend_from_slice(obj.section_bytes(SectionKind::Text));
        data.extend_from_slice(obj.section_bytes(SectionKind::Data));
        rodata.extend_from_slice(obj.section_bytes(SectionKind::Rodata));
        layouts.insert(obj.module_name.as_str(), layout);
    }
    (layouts, text, data, rodata)
}

/// Runs the full four-phase pipeline (spec §4.11) and emits one PE image.
pub fn link(objects: &[ObjectFile]) -> Result<LinkResult, LinkError> {
    if objects.is_empty() {
        return Err(LinkError::NoObjects);
    }

    let (layouts, mut text, data, rodata) = layout_objects(objects);
    // `.rodata` content is appended after `.data` in the merged buffer so
    // pointer-sized relocations against either resolve against one backing
    // section, matching how `codegen::pe::PeWriter` exposes a single
    // `.data` section.
    let mut merged_data = data;
    merged_data.extend_from_slice(&rodata);

    let globals = collect_symbols(objects, &layouts)?;

    // Phase 2: verify every relocation's symbol is either resolved locally
    // or names a Win32 import (`dll!function`).
    let mut imports: Vec<(String, String)> = Vec::new();
    for obj in objects {
        for reloc in &obj.relocations {
            if globals.contains_key(reloc.symbol.as_str()) {
                continue;
            }
            if let Some((dll, func)) = reloc.symbol.split_once('!') {
                if !imports.iter().any(|(d, f)| d == dll && f == func) {
                    imports.push((dll.to_string(), func.to_string()));
                }
                continue;
            }
            return Err(LinkError::UndefinedSymbol { name: reloc.symbol.clone(), referenced_from: obj.module_name.clone() });
        }
    }

    let mut writer = PeWriter::new();
    for (dll, func) in &imports {
        writer.add_import(dll, func)?;
    }
    writer.finalize_imports()?;

    // Phase 4: apply relocations directly against the merged `.text`
    // buffer before handing it to the PE writer, then record RIP fixups
    // for anything that targets `.data`/an import so `PeWriter::write`
    // can patch in real RVAs once section layout is final.
    let mut code_fixups = Vec::new();
    for obj in objects {
        let layout = &layouts[obj.module_name.as_str()];
        for reloc in &obj.relocations {
            if reloc.section != SectionKind::Text {
                continue; // only code-section relocations need patching here
            }
            let field_offset = (layout.text_offset + reloc.offset) as usize;
            if let Some(resolved) = globals.get(reloc.symbol.as_str()) {
                match reloc.kind {
                    RelocKind::Rel32 => {
                        let target = resolved.base_offset + resolved.symbol.offset;
                        let next_insn = field_offset as i64 + 4;
                        let disp = target as i64 + reloc.addend as i64 - next_insn;
                        text[field_offset..field_offset + 4].copy_from_slice(&(disp as i32).to_le_bytes());
                    }
                    RelocKind::RipRel32 => {
                        let target_rva = crate::codegen::pe::DATA_RVA_PLACEHOLDER + resolved.base_offset + resolved.symbol.offset;
                        code_fixups.push((field_offset, target_rva, FixupKind::Data));
                    }
                }
            } else if let Some((dll, func)) = reloc.symbol.split_once('!') {
                let rva = writer.import_rva(func).map_err(LinkError::Pe)?;
                let _ = dll;
                match reloc.kind {
                    RelocKind::Rel32 => {
                        let next_insn = field_offset as i64 + 4;
                        let disp = rva as i64 - next_insn;
                        text[field_offset..field_offset + 4].copy_from_slice(&(disp as i32).to_le_bytes());
                    }
                    RelocKind::RipRel32 => code_fixups.push((field_offset, rva, FixupKind::Idata)),
                }
            }
        }
    }

    writer.add_code_with_fixups(&text, &code_fixups);
    writer.add_data(&merged_data);

    let entry = globals.get("main").ok_or(LinkError::NoEntryPoint)?;
    writer.set_entry_point(entry.base_offset + entry.symbol.offset);

    let map: Vec<LinkedSymbol> = globals
        .values()
        .map(|r| LinkedSymbol {
            name: r.symbol.name.clone(),
            rva: crate::codegen::pe::CODE_RVA + r.base_offset + r.symbol.offset,
            size: r.symbol.size,
            source_module: r.module.to_string(),
        })
        .collect();

    let image = writer.write()?;
    Ok(LinkResult { image, map })
}

/// Renders a `--map` file: one line per symbol, sorted by RVA.
pub fn render_map(map: &[LinkedSymbol]) -> String {
    let mut rows = map.to_vec();
    rows.sort_by_key(|s| s.rva);
    let mut out = String::new();
    for row in rows {
        out.push_str(&format!("{:#010x} {:>8} {}  ({})\n", row.rva, row.size, row.name, row.source_module));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objfile::{ObjSymbol, Relocation};

    fn obj_with_main() -> ObjectFile {
        let mut obj = ObjectFile::new("a.to");
        // `xor eax, eax; ret`
        obj.set_section(SectionKind::Text, vec![0x31, 0xC0, 0xC3]);
        obj.symbols.push(ObjSymbol { name: "main".into(), section: Some(SectionKind::Text), offset: 0, size: 3, is_weak: false, is_defined: true });
        obj
    }

    #[test]
    fn links_a_single_object_with_an_entry_point() {
        let result = link(&[obj_with_main()]).unwrap();
        assert_eq!(&result.image[0..2], b"MZ");
        assert_eq!(result.map.len(), 1);
        assert_eq!(result.map[0].name, "main");
    }

    #[test]
    fn rejects_empty_input() {
        assert!(matches!(link(&[]), Err(LinkError::NoObjects)));
    }

    #[test]
    fn rejects_missing_entry_point() {
        let mut obj = ObjectFile::new("a.to");
        obj.set_section(SectionKind::Text, vec![0xC3]);
        obj.symbols.push(ObjSymbol { name: "helper".into(), section: Some(SectionKind::Text), offset: 0, size: 1, is_weak: false, is_defined: true });
        assert!(matches!(link(&[obj]), Err(LinkError::NoEntryPoint)));
    }

    #[test]
    fn rejects_duplicate_strong_symbols_across_objects() {
        let a = obj_with_main();
        let mut b = ObjectFile::new("b.to");
        b.set_section(SectionKind::Text, vec![0xC3]);
        b.symbols.push(ObjSymbol { name: "main".into(), section: Some(SectionKind::Text), offset: 0, size: 1, is_weak: false, is_defined: true });
        let err = link(&[a, b]).unwrap_err();
        assert!(matches!(err, LinkError::DuplicateStrongSymbol { .. }));
    }

    #[test]
    fn rejects_unresolved_reference() {
        let mut obj = obj_with_main();
        obj.relocations.push(Relocation { section: SectionKind::Text, offset: 0, symbol: "nowhere".into(), addend: 0, kind: RelocKind::Rel32 });
        let err = link(&[obj]).unwrap_err();
        assert!(matches!(err, LinkError::UndefinedSymbol { .. }));
    }

    #[test]
    fn allows_a_weak_definition_to_be_overridden_by_a_strong_one() {
        let mut a = ObjectFile::new("a.to");
        a.set_section(SectionKind::Text, vec![0xC3, 0xC3, 0xC3]);
        a.symbols.push(ObjSymbol { name: "helper".into(), section: Some(SectionKind::Text), offset: 0, size: 1, is_weak: true, is_defined: true });
        a.symbols.push(ObjSymbol { name: "main".into(), section: Some(SectionKind::Text), offset: 1, size: 1, is_weak: false, is_defined: true });
        let mut b = ObjectFile::new("b.to");
        b.set_section(SectionKind::Text, vec![0xC3]);
        b.symbols.push(ObjSymbol { name: "helper".into(), section: Some(SectionKind::Text), offset: 0, size: 1, is_weak: false, is_defined: true });
        let result = link(&[a, b]).unwrap();
        let helper = result.map.iter().find(|s| s.name == "helper").unwrap();
        assert_eq!(helper.source_module, "b.to");
    }
}
