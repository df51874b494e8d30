//! Object file format (spec §6 "Object file format", §4.11 "Linker").
//!
//! A custom format: a magic-prefixed container holding section bytes, a
//! flat symbol table, and a relocation list. Grounded in
//! `original_source/src/backend/linker/linker.h`'s `ObjectFile`/
//! `LinkedSymbol` shapes, generalized from the original's hand-rolled
//! byte layout to a `serde`-derived struct so the same type backs both the
//! binary `.to` encoding (`bincode`, used by `-S/--obj` and `--link`) and
//! the human-readable `--map` output (`serde_json`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// First four bytes of every `.to` file. Lets `--link` fail fast on a
/// file that isn't one of ours instead of misinterpreting garbage bytes.
pub const OBJ_MAGIC: [u8; 4] = *b"TLOB";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SectionKind {
    Text,
    Data,
    Rodata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub kind: SectionKind,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelocKind {
    /// A 32-bit PC-relative displacement, as used by `call`/`jmp rel32`.
    Rel32,
    /// A 32-bit RIP-relative displacement, as used by `lea`/`mov` against
    /// the data section.
    RipRel32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relocation {
    pub section: SectionKind,
    /// Byte offset within `section` of the 4-byte field to patch.
    pub offset: u32,
    pub symbol: String,
    pub addend: i32,
    pub kind: RelocKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjSymbol {
    pub name: String,
    /// `None` for an import/extern reference with no local definition.
    pub section: Option<SectionKind>,
    pub offset: u32,
    pub size: u32,
    pub is_weak: bool,
    pub is_defined: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectFile {
    pub module_name: String,
    pub sections: Vec<Section>,
    pub symbols: Vec<ObjSymbol>,
    pub relocations: Vec<Relocation>,
}

#[derive(Debug)]
pub enum ObjError {
    BadMagic,
    Encode(bincode::Error),
    Decode(bincode::Error),
    Io(std::io::Error),
}

impl std::fmt::Display for ObjError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjError::BadMagic => write!(f, "not a Talon object file (bad magic)"),
            ObjError::Encode(e) => write!(f, "failed to encode object file: {e}"),
            ObjError::Decode(e) => write!(f, "failed to decode object file: {e}"),
            ObjError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ObjError {}

impl From<std::io::Error> for ObjError {
    fn from(e: std::io::Error) -> Self {
        ObjError::Io(e)
    }
}

impl ObjectFile {
    pub fn new(module_name: impl Into<String>) -> Self {
        ObjectFile { module_name: module_name.into(), sections: Vec::new(), symbols: Vec::new(), relocations: Vec::new() }
    }

    pub fn section(&self, kind: SectionKind) -> Option<&Section> {
        self.sections.iter().find(|s| s.kind == kind)
    }

    pub fn section_bytes(&self, kind: SectionKind) -> &[u8] {
        self.section(kind).map(|s| s.bytes.as_slice()).unwrap_or(&[])
    }

    pub fn set_section(&mut self, kind: SectionKind, bytes: Vec<u8>) {
        if let Some(existing) = self.sections.iter_mut().find(|s| s.kind == kind) {
            existing.bytes = bytes;
        } else {
            self.sections.push(Section { kind, bytes });
        }
    }

    /// Encodes `self` as a `.to` object file: magic bytes followed by a
    /// `bincode` payload.
    pub fn encode(&self) -> Result<Vec<u8>, ObjError> {
        let mut out = OBJ_MAGIC.to_vec();
        let payload = bincode::serialize(self).map_err(ObjError::Encode)?;
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ObjError> {
        if bytes.len() < 4 || bytes[0..4] != OBJ_MAGIC {
            return Err(ObjError::BadMagic);
        }
        bincode::deserialize(&bytes[4..]).map_err(ObjError::Decode)
    }

    pub fn write_to(&self, path: &std::path::Path) -> Result<(), ObjError> {
        std::fs::write(path, self.encode()?)?;
        Ok(())
    }

    pub fn read_from(path: &std::path::Path) -> Result<Self, ObjError> {
        let bytes = std::fs::read(path)?;
        Self::decode(&bytes)
    }

    /// Symbol name -> (index into `symbols`), for a single object file.
    pub fn symbol_index(&self) -> HashMap<&str, usize> {
        self.symbols.iter().enumerate().map(|(i, s)| (s.name.as_str(), i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ObjectFile {
        let mut obj = ObjectFile::new("a.tln");
        obj.set_section(SectionKind::Text, vec![0x90, 0xC3]);
        obj.symbols.push(ObjSymbol {
            name: "main".into(),
            section: Some(SectionKind::Text),
            offset: 0,
            size: 2,
            is_weak: false,
            is_defined: true,
        });
        obj
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let obj = sample();
        let bytes = obj.encode().unwrap();
        assert_eq!(&bytes[0..4], &OBJ_MAGIC);
        let back = ObjectFile::decode(&bytes).unwrap();
        assert_eq!(back.module_name, "a.tln");
        assert_eq!(back.section_bytes(SectionKind::Text), &[0x90, 0xC3]);
        assert_eq!(back.symbols.len(), 1);
    }

    #[test]
    fn rejects_bad_magic() {
        let err = ObjectFile::decode(&[0, 0, 0, 0]);
        assert!(matches!(err, Err(ObjError::BadMagic)));
    }

    #[test]
    fn symbol_index_maps_names_to_positions() {
        let obj = sample();
        let idx = obj.symbol_index();
        assert_eq!(idx.get("main"), Some(&0));
    }
}
