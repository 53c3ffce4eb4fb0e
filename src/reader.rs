//! The ELF reader: decodes headers, section tables, symbol tables,
//! relocation sections, and `.dynamic` of one input file.
//!
//! Decoding is endian-aware throughout: the file's `ei_data` selects the
//! byte order for every multi-byte field, so results do not depend on the
//! host. Verification is separate from decoding: a file whose machine or
//! byte order does not match the configured target is rejected up front.

use log::debug;

use crate::diag::{LinkError, Result};
use crate::elf::{self, DataEncoding, Elf32Dyn, Elf32Ehdr, Elf32Rel, Elf32Shdr, Elf32Sym};
use crate::input::{basename, Input, InputType, RawSymbol};
use crate::reloc::Relocation;
use crate::sections::{FragmentRef, LDSection, SectionKind};
use crate::symbols::{Binding, ResolveInfo, SymDesc, SymType, Visibility};

pub struct Reader {
    machine: u16,
    enc: DataEncoding,
}

impl Reader {
    /// A reader for the given target machine. Both supported targets are
    /// little-endian.
    pub fn new(machine: u16) -> Reader {
        Reader { machine, enc: DataEncoding::Little }
    }

    pub fn is_elf(data: &[u8]) -> bool {
        data.len() >= 4 && data[..4] == elf::ELF_MAGIC
    }

    pub fn is_my_endian(&self, hdr: &Elf32Ehdr) -> bool {
        DataEncoding::from_ei_data(hdr.ident[elf::EI_DATA]) == Some(self.enc)
    }

    pub fn is_my_machine(&self, hdr: &Elf32Ehdr) -> bool {
        hdr.e_machine == self.machine
    }

    pub fn file_type(hdr: &Elf32Ehdr) -> InputType {
        match hdr.e_type {
            elf::ET_REL => InputType::Object,
            elf::ET_DYN => InputType::DynObj,
            elf::ET_EXEC => InputType::Exec,
            elf::ET_CORE => InputType::CoreFile,
            _ => InputType::Unknown,
        }
    }

    /// Decode and verify the ELF header, recording the header, encoding,
    /// and file type on the input.
    pub fn read_header(&self, input: &mut Input) -> Result<()> {
        let data = input.area.request(0, elf::EHDR_SIZE).map_err(|_| LinkError::NotElf {
            path: input.path.clone(),
        })?;
        if !Reader::is_elf(data) {
            return Err(LinkError::NotElf { path: input.path.clone() });
        }
        if data[elf::EI_CLASS] != elf::ELFCLASS32 {
            return Err(LinkError::WrongClass { path: input.path.clone() });
        }
        let ei_data = data[elf::EI_DATA];
        let enc = DataEncoding::from_ei_data(ei_data).ok_or(LinkError::WrongEndian {
            path: input.path.clone(),
            ei_data,
        })?;
        let hdr = Elf32Ehdr::decode(data, enc);
        if !self.is_my_endian(&hdr) {
            return Err(LinkError::WrongEndian { path: input.path.clone(), ei_data });
        }
        if !self.is_my_machine(&hdr) {
            return Err(LinkError::WrongMachine {
                path: input.path.clone(),
                expected: self.machine,
                found: hdr.e_machine,
            });
        }
        input.kind = Reader::file_type(&hdr);
        if !matches!(input.kind, InputType::Object | InputType::DynObj) {
            return Err(LinkError::WrongFileType { path: input.path.clone(), e_type: hdr.e_type });
        }
        input.enc = enc;
        input.ehdr = Some(hdr);
        Ok(())
    }

    /// Build the input's section catalogue from the section-header table.
    /// `e_shoff == 0` is a valid empty case.
    pub fn read_section_headers(&self, input: &mut Input) -> Result<()> {
        let hdr = input.ehdr.clone().ok_or_else(|| crate::diag::internal("header not read"))?;
        if hdr.e_shoff == 0 {
            return Ok(());
        }
        let enc = input.enc;
        let shentsize = hdr.e_shentsize as usize;
        let shnum = hdr.e_shnum as usize;
        if shentsize < elf::SHDR_SIZE {
            return Err(LinkError::TruncatedInput {
                path: input.path.clone(),
                what: "section header table",
                offset: hdr.e_shoff as usize,
            });
        }

        let table = input.area.request(hdr.e_shoff as usize, shnum * shentsize)?;
        let mut shdrs = Vec::with_capacity(shnum);
        for i in 0..shnum {
            shdrs.push(Elf32Shdr::decode(table, i * shentsize, enc));
        }

        let shstrndx = hdr.e_shstrndx as usize;
        let shstrtab = if shstrndx < shdrs.len() {
            input
                .area
                .request(shdrs[shstrndx].sh_offset as usize, shdrs[shstrndx].sh_size as usize)?
        } else {
            &[]
        };

        let mut sections = Vec::with_capacity(shnum);
        for sh in &shdrs {
            let name = elf::read_cstr(shstrtab, sh.sh_name as usize).to_string();
            let kind = SectionKind::classify(sh.sh_type, sh.sh_flags, &name);
            let mut sect = LDSection::new(name, kind, sh.sh_type, sh.sh_flags);
            sect.size = sh.sh_size;
            sect.offset = sh.sh_offset;
            sect.align = sh.sh_addralign.max(1);
            sect.info = sh.sh_info;
            sections.push(sect);
        }

        // Deferred pass: resolve inter-section references. Relocation
        // sections point at the section they patch (sh_info); name pools,
        // groups, notes and `.dynamic` follow sh_link.
        for (i, sh) in shdrs.iter().enumerate() {
            let link = match sections[i].kind {
                SectionKind::Relocation => sh.sh_info as usize,
                SectionKind::NamePool | SectionKind::Group | SectionKind::Note => {
                    sh.sh_link as usize
                }
                _ if sh.sh_type == elf::SHT_DYNAMIC => sh.sh_link as usize,
                _ => continue,
            };
            if link < sections.len() {
                sections[i].link = Some(link);
            }
        }

        debug!("{}: {} sections", input.path, sections.len());
        input.context.skipped = vec![false; sections.len()];
        input.context.sections = sections;
        Ok(())
    }

    /// Decode the input's symbol table (`.symtab`, or `.dynsym` for a
    /// DynObj) into the raw per-input symbol list.
    pub fn read_symbols(&self, input: &mut Input) -> Result<()> {
        let wanted = if input.kind == InputType::DynObj { elf::SHT_DYNSYM } else { elf::SHT_SYMTAB };
        let symtab_idx = match input.context.sections.iter().position(|s| s.sh_type == wanted) {
            Some(i) => i,
            None => return Ok(()),
        };
        let raw = self.decode_symtab(input, symtab_idx)?;
        debug!("{}: {} symbols", input.path, raw.len());
        input.context.raw_syms = raw;
        Ok(())
    }

    fn decode_symtab(&self, input: &Input, symtab_idx: usize) -> Result<Vec<RawSymbol>> {
        let enc = input.enc;
        let symtab = &input.context.sections[symtab_idx];
        let strtab_idx = symtab.link.ok_or(LinkError::MissingSection {
            path: input.path.clone(),
            section: ".strtab",
        })?;
        let strtab_sect = &input.context.sections[strtab_idx];

        let sym_data = input.area.request(symtab.offset as usize, symtab.size as usize)?;
        let str_data = input.area.request(strtab_sect.offset as usize, strtab_sect.size as usize)?;

        let count = sym_data.len() / elf::SYM_SIZE;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let sym = Elf32Sym::decode(sym_data, i * elf::SYM_SIZE, enc);
            out.push(RawSymbol {
                name: elf::read_cstr(str_data, sym.st_name as usize).to_string(),
                value: sym.st_value,
                size: sym.st_size,
                binding: sym.binding(),
                ty: sym.sym_type(),
                vis: sym.visibility(),
                shndx: sym.st_shndx,
            });
        }
        Ok(out)
    }

    /// Construct the `ResolveInfo` of a group section's signature symbol
    /// (symbol `sym_idx` of the group's linked symbol table).
    pub fn read_signature(
        &self,
        input: &Input,
        group_sect: usize,
        sym_idx: usize,
    ) -> Result<ResolveInfo> {
        let group = &input.context.sections[group_sect];
        let symtab_idx = group.link.ok_or(LinkError::MissingSection {
            path: input.path.clone(),
            section: ".symtab",
        })?;
        let symtab = &input.context.sections[symtab_idx];
        let strtab_idx = symtab.link.ok_or(LinkError::MissingSection {
            path: input.path.clone(),
            section: ".strtab",
        })?;
        let strtab_sect = &input.context.sections[strtab_idx];

        let sym_data = input.area.request(
            symtab.offset as usize + sym_idx * elf::SYM_SIZE,
            elf::SYM_SIZE,
        )?;
        let str_data = input.area.request(strtab_sect.offset as usize, strtab_sect.size as usize)?;
        let sym = Elf32Sym::decode(sym_data, 0, input.enc);

        let mut info = ResolveInfo::new(elf::read_cstr(str_data, sym.st_name as usize));
        info.ty = SymType::from_elf(sym.sym_type());
        info.desc = SymDesc::from_shndx(sym.st_shndx);
        info.binding = Binding::from_elf(sym.binding(), sym.st_shndx);
        info.vis = Visibility::from_elf(sym.st_other);
        info.size = sym.st_size;
        info.value = sym.st_value;
        info.from_dyn = input.kind == InputType::DynObj;
        Ok(info)
    }

    /// Interpret a DynObj's `.dynamic`: `DT_SONAME` renames the input to
    /// the SONAME's basename, and every `DT_NEEDED` string is returned.
    pub fn read_dynamic(&self, input: &mut Input) -> Result<Vec<String>> {
        debug_assert_eq!(input.kind, InputType::DynObj);
        let enc = input.enc;
        let dyn_idx = input
            .context
            .sections
            .iter()
            .position(|s| s.sh_type == elf::SHT_DYNAMIC)
            .ok_or(LinkError::MissingSection { path: input.path.clone(), section: ".dynamic" })?;
        let dyn_sect = &input.context.sections[dyn_idx];
        let strtab_idx = dyn_sect.link.ok_or(LinkError::MissingSection {
            path: input.path.clone(),
            section: ".dynstr",
        })?;
        let strtab_sect = &input.context.sections[strtab_idx];
        if strtab_sect.sh_type != elf::SHT_STRTAB {
            return Err(LinkError::MissingSection { path: input.path.clone(), section: ".dynstr" });
        }

        let dyn_data = input.area.request(dyn_sect.offset as usize, dyn_sect.size as usize)?;
        let str_data = input.area.request(strtab_sect.offset as usize, strtab_sect.size as usize)?;

        let mut needed = Vec::new();
        let mut soname = None;
        for off in (0..dyn_data.len().saturating_sub(elf::DYN_SIZE - 1)).step_by(elf::DYN_SIZE) {
            let entry = Elf32Dyn::decode(dyn_data, off, enc);
            match entry.d_tag {
                elf::DT_NULL => break,
                elf::DT_SONAME => {
                    soname = Some(elf::read_cstr(str_data, entry.d_val as usize).to_string());
                }
                elf::DT_NEEDED => {
                    needed.push(elf::read_cstr(str_data, entry.d_val as usize).to_string());
                }
                _ => {}
            }
        }

        if let Some(soname) = soname {
            input.name = basename(&soname).to_string();
        }
        Ok(needed)
    }

    /// Realize one relocation section (already merged inputs only): every
    /// entry becomes a [`Relocation`] whose target points into the merged
    /// output section the patched input section landed in.
    pub fn read_relocations(&self, input: &Input, reloc_sect: usize) -> Result<Vec<Relocation>> {
        let enc = input.enc;
        let sect = &input.context.sections[reloc_sect];
        debug_assert_eq!(sect.kind, SectionKind::Relocation);

        let target_idx = match sect.link {
            Some(i) => i,
            None => return Ok(Vec::new()),
        };
        let (out_sect, frag) = match input.context.merged(target_idx) {
            Some(m) => m,
            None => return Ok(Vec::new()), // patched section was dropped
        };

        let is_rela = sect.sh_type == elf::SHT_RELA;
        let entsize = if is_rela { 12 } else { elf::REL_SIZE };
        let data = input.area.request(sect.offset as usize, sect.size as usize)?;
        let count = data.len() / entsize;

        let mut relocs = Vec::with_capacity(count);
        for i in 0..count {
            let off = i * entsize;
            let rel = Elf32Rel::decode(data, off, enc);
            let addend = if is_rela { elf::read_i32(data, off + 8, enc) } else { 0 };
            let sym = input.context.symbol(rel.sym_index() as usize);
            relocs.push(Relocation::new(
                rel.rel_type(),
                sym,
                FragmentRef::new(out_sect, frag, rel.r_offset),
                addend,
            ));
        }
        Ok(relocs)
    }
}
