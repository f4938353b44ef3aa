//! Passive data segment: interned string constants and per-class
//! shape tables.
//!
//! The whole module carries exactly one passive segment; string
//! literals become `array.new_data` pulls at their interned offset,
//! and each class's shape table (method name to index records) is
//! appended once and cached by class id.

use std::collections::HashMap;

use wasm_encoder::{DataCountSection, DataSection};

use crate::ids::ClassId;
use crate::types::{ClassRegistry, MethodKind};

/// Bytes reserved at the front of the segment so offset zero never
/// aliases a real constant.
const HEADER_SIZE: u32 = 16;

#[derive(Debug, Default)]
pub struct DataSegment {
    bytes: Vec<u8>,
    strings: HashMap<String, (u32, u32)>,
    shapes: HashMap<ClassId, u32>,
}

impl DataSegment {
    pub fn new() -> Self {
        Self {
            bytes: vec![0; HEADER_SIZE as usize],
            strings: HashMap::new(),
            shapes: HashMap::new(),
        }
    }

    /// Intern a string literal, returning (offset, len). Identical
    /// literals share one copy.
    pub fn intern(&mut self, s: &str) -> (u32, u32) {
        if let Some(&loc) = self.strings.get(s) {
            return loc;
        }
        let offset = self.bytes.len() as u32;
        let len = s.len() as u32;
        self.bytes.extend_from_slice(s.as_bytes());
        self.strings.insert(s.to_string(), (offset, len));
        (offset, len)
    }

    /// Offset of the shape table for a class, appending it on first
    /// request. Layout: u32 class id, u32 entry count, then per
    /// method: u32 name offset, u32 name len, u32 kind flag, u32
    /// method index. All little-endian.
    pub fn shape_table(&mut self, classes: &ClassRegistry, id: ClassId) -> u32 {
        if let Some(&off) = self.shapes.get(&id) {
            return off;
        }
        // Method names must be interned first so the table itself is
        // contiguous.
        let methods: Vec<(String, MethodKind)> = classes
            .chain(id)
            .iter()
            .flat_map(|&c| classes.get(c).methods.iter())
            .map(|m| (m.name.clone(), m.kind))
            .collect();
        let names: Vec<(u32, u32)> = methods.iter().map(|(n, _)| self.intern(n)).collect();

        let offset = self.bytes.len() as u32;
        self.push_u32(id.index() as u32);
        self.push_u32(methods.len() as u32);
        for (i, ((_, kind), (name_off, name_len))) in
            methods.iter().zip(names.iter()).enumerate()
        {
            self.push_u32(*name_off);
            self.push_u32(*name_len);
            self.push_u32(method_flag(*kind));
            self.push_u32(i as u32);
        }
        self.shapes.insert(id, offset);
        offset
    }

    fn push_u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn size(&self) -> u32 {
        self.bytes.len() as u32
    }

    /// Emit the passive segment plus its count section.
    pub fn emit(&self, data: &mut DataSection, count: &mut DataCountSection) {
        data.passive(self.bytes.iter().copied());
        count.count = 1;
    }
}

fn method_flag(kind: MethodKind) -> u32 {
    match kind {
        MethodKind::Constructor => 0,
        MethodKind::Method => 1,
        MethodKind::Getter => 2,
        MethodKind::Setter => 3,
        MethodKind::Static => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClassDef, MethodDef};
    use crate::types::Ty;

    #[test]
    fn test_interning_shares_identical_literals() {
        let mut d = DataSegment::new();
        let a = d.intern("hello");
        let b = d.intern("hello");
        let c = d.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.0, HEADER_SIZE);
        assert_eq!(a.1, 5);
    }

    #[test]
    fn test_shape_table_cached_by_class() {
        let mut reg = ClassRegistry::new();
        let id = reg.register(ClassDef {
            name: "Point".to_string(),
            super_id: None,
            is_interface: false,
            fields: Vec::new(),
            methods: vec![MethodDef {
                name: "getX".to_string(),
                kind: MethodKind::Method,
                params: Vec::new(),
                ret: Ty::Number,
                scope: None,
            }],
        });
        let mut d = DataSegment::new();
        let off = d.shape_table(&reg, id);
        let size_after = d.size();
        assert_eq!(d.shape_table(&reg, id), off);
        assert_eq!(d.size(), size_after);
        // id + count + one 4-word record.
        let table = &[
            (id.index() as u32).to_le_bytes(),
            1u32.to_le_bytes(),
        ];
        let start = off as usize;
        assert_eq!(
            &d.bytes[start..start + 8],
            &table.concat()[..]
        );
    }
}
