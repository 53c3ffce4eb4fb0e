//! The output module: merged sections, the symbol pool, realized
//! relocation lists, and the needed-library list.
//!
//! Input sections are merged by appending their bytes as fragments of the
//! owning output section; the per-input `section_map` remembers where each
//! input section landed so symbols and relocations can be pinned with
//! [`FragmentRef`]s that stay valid through layout.

use std::collections::HashMap;

use log::debug;

use crate::diag::Result;
use crate::elf::{self, DataEncoding};
use crate::emulation::SectionNameMap;
use crate::input::{Attribute, Input};
use crate::reloc::Relocation;
use crate::sections::{FragmentKind, FragmentRef, LDSection, SectionData, SectionKind};
use crate::symbols::NamePool;

/// A shared library the output will depend on.
#[derive(Debug, Clone)]
pub struct NeededLib {
    pub name: String,
    pub attr: Attribute,
    /// Whether the library satisfied at least one reference.
    pub needed: bool,
}

pub struct OutputSection {
    pub sect: LDSection,
    pub data: SectionData,
}

#[derive(Default)]
pub struct Module {
    /// Output name; the SONAME for a DynObj.
    pub name: String,
    pub sections: Vec<OutputSection>,
    by_name: HashMap<String, usize>,
    pub pool: NamePool,
    /// One realized list per input relocation section, in input order.
    pub reloc_lists: Vec<Vec<Relocation>>,
    pub libs: Vec<NeededLib>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Module {
        Module { name: name.into(), ..Module::default() }
    }

    pub fn find_section(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn section(&self, idx: usize) -> &OutputSection {
        &self.sections[idx]
    }

    pub fn section_mut(&mut self, idx: usize) -> &mut OutputSection {
        &mut self.sections[idx]
    }

    pub fn get_or_create_section(
        &mut self,
        name: &str,
        kind: SectionKind,
        sh_type: u32,
        sh_flags: u32,
    ) -> usize {
        if let Some(&idx) = self.by_name.get(name) {
            return idx;
        }
        let idx = self.sections.len();
        self.by_name.insert(name.to_string(), idx);
        self.sections.push(OutputSection {
            sect: LDSection::new(name, kind, sh_type, sh_flags),
            data: SectionData::new(),
        });
        idx
    }

    /// Merge all content sections of one input. `map` is the emulation
    /// table; `None` when producing a relocatable object, in which case
    /// input sections keep their own names.
    pub fn merge_input_sections(
        &mut self,
        input: &mut Input,
        map: Option<&SectionNameMap>,
    ) -> Result<()> {
        let count = input.context.sections.len();
        input.context.section_map = vec![None; count];

        for idx in 0..count {
            if input.context.skipped[idx] {
                continue;
            }
            let (kind, sh_type, sh_flags, size, offset, align, name) = {
                let s = &input.context.sections[idx];
                (s.kind, s.sh_type, s.sh_flags, s.size, s.offset, s.align, s.name.clone())
            };

            match kind {
                // Header-level and meta sections never carry merged bytes.
                SectionKind::Null
                | SectionKind::NamePool
                | SectionKind::Relocation
                | SectionKind::Group => continue,
                // Kept in the output as a marker, but contributes no bytes.
                SectionKind::StackNote => {
                    self.get_or_create_section(&name, kind, sh_type, sh_flags);
                    continue;
                }
                _ => {}
            }

            let out_name = match map {
                Some(map) => map.lookup(&name).unwrap_or(&name).to_string(),
                None => name.clone(),
            };

            let out_idx = self.get_or_create_section(&out_name, kind, sh_type, sh_flags);
            let frag_kind = if sh_type == elf::SHT_NOBITS {
                FragmentKind::Fill { pattern: 0, size: 1, count: size }
            } else {
                FragmentKind::Region(input.area.request(offset as usize, size as usize)?.to_vec())
            };

            let out = &mut self.sections[out_idx];
            out.sect.sh_flags |= sh_flags & (elf::SHF_WRITE | elf::SHF_EXECINSTR | elf::SHF_TLS);
            out.sect.align = out.sect.align.max(align);
            out.data.append(frag_kind, align);
            let frag_idx = out.data.frags.len() - 1;
            out.sect.size = out.data.size();

            input.context.section_map[idx] = Some((out_idx, frag_idx));
        }

        debug!("{}: merged into {} output sections", input.path, self.sections.len());
        Ok(())
    }

    /// Section-relative byte offset of a fragment position. Valid only for
    /// sections whose content lives in fragments (not backend-owned ones).
    pub fn frag_offset(&self, fref: FragmentRef) -> u32 {
        self.sections[fref.sect].data.frag_offset(fref.frag, fref.offset)
    }

    /// The runtime address of a fragment position (P of a relocation).
    pub fn place(&self, fref: FragmentRef) -> u32 {
        self.sections[fref.sect].sect.addr + self.frag_offset(fref)
    }

    pub fn read_target_word(&self, fref: FragmentRef, enc: DataEncoding) -> u32 {
        let off = self.frag_offset(fref);
        self.sections[fref.sect].data.read_word(off, enc)
    }

    pub fn write_target_word(&mut self, fref: FragmentRef, value: u32, enc: DataEncoding) -> bool {
        let off = self.frag_offset(fref);
        self.sections[fref.sect].data.write_word(off, value, enc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemoryArea;

    fn input_with_section(name: &str, bytes: &[u8], sh_type: u32, sh_flags: u32) -> Input {
        let mut input = Input::new("a.o", MemoryArea::new("a.o", bytes.to_vec()));
        let mut sect = LDSection::new(
            name,
            SectionKind::classify(sh_type, sh_flags, name),
            sh_type,
            sh_flags,
        );
        sect.size = bytes.len() as u32;
        sect.offset = 0;
        sect.align = 4;
        input.context.sections.push(sect);
        input.context.skipped.push(false);
        input
    }

    #[test]
    fn test_merge_appends_fragments() {
        let mut module = Module::new("a.out");
        let map = SectionNameMap::standard().unwrap();

        let mut a = input_with_section(".text.main", &[1, 2, 3, 4], elf::SHT_PROGBITS,
            elf::SHF_ALLOC | elf::SHF_EXECINSTR);
        module.merge_input_sections(&mut a, Some(&map)).unwrap();
        let mut b = input_with_section(".text", &[5, 6], elf::SHT_PROGBITS,
            elf::SHF_ALLOC | elf::SHF_EXECINSTR);
        module.merge_input_sections(&mut b, Some(&map)).unwrap();

        let text = module.find_section(".text").unwrap();
        assert_eq!(module.section(text).sect.size, 6);
        assert_eq!(a.context.merged(0), Some((text, 0)));
        let (sect, frag) = b.context.merged(0).unwrap();
        assert_eq!(sect, text);
        assert_eq!(module.section(text).data.frag_offset(frag, 0), 4);
    }

    #[test]
    fn test_merge_bss_as_fill() {
        let mut module = Module::new("a.out");
        let map = SectionNameMap::standard().unwrap();
        let mut input = input_with_section(".bss", &[], elf::SHT_NOBITS,
            elf::SHF_ALLOC | elf::SHF_WRITE);
        input.context.sections[0].size = 32; // NOBITS: size without bytes
        module.merge_input_sections(&mut input, Some(&map)).unwrap();
        let bss = module.find_section(".bss").unwrap();
        assert_eq!(module.section(bss).sect.size, 32);
    }

    #[test]
    fn test_object_output_keeps_names() {
        let mut module = Module::new("r.o");
        let mut input = input_with_section(".text.hot", &[1, 2], elf::SHT_PROGBITS,
            elf::SHF_ALLOC | elf::SHF_EXECINSTR);
        module.merge_input_sections(&mut input, None).unwrap();
        assert!(module.find_section(".text.hot").is_some());
        assert!(module.find_section(".text").is_none());
    }

    #[test]
    fn test_skipped_sections_not_merged() {
        let mut module = Module::new("a.out");
        let map = SectionNameMap::standard().unwrap();
        let mut input = input_with_section(".text", &[1, 2], elf::SHT_PROGBITS,
            elf::SHF_ALLOC | elf::SHF_EXECINSTR);
        input.context.skipped[0] = true;
        module.merge_input_sections(&mut input, Some(&map)).unwrap();
        assert!(module.find_section(".text").is_none());
        assert_eq!(input.context.merged(0), None);
    }
}
