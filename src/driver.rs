//! The link driver: owns the inputs, the output module, and the backend,
//! and runs the pipeline phases in their fixed order.
//!
//! Phases must be invoked in sequence; each observes the complete output
//! of its predecessor. [`Driver::link`] runs them all:
//! `linkable` → `read_sections` → `read_symbol_tables` → `merge_sections`
//! → `merge_symbol_tables` → `add_standard_symbols` → `add_target_symbols`
//! → `read_relocations` (which also runs the backend's relocation scan)
//! → `layout` → `relocate` → `emit_output`.

use std::collections::{HashMap, HashSet};

use log::{debug, error};

use crate::diag::{LinkError, Result};
use crate::elf;
use crate::emit::{self, EmitPlan};
use crate::emulation::SectionNameMap;
use crate::input::{archive_members, is_archive, Attribute, Input, InputType};
use crate::layout::{self, LayoutInfo};
use crate::mem::MemoryArea;
use crate::module::{Module, NeededLib};
use crate::reader::Reader;
use crate::resolver::{self, ResolveAction};
use crate::sections::{FragmentRef, SectionKind};
use crate::symbols::{Binding, ResolveInfo, SymDesc, SymType, Visibility};
use crate::target::{arm::ArmBackend, mips::MipsBackend, Backend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Arm,
    Mipsel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Object,
    Exec,
    DynObj,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub target: Target,
    pub output: OutputKind,
    /// Output file name; doubles as the SONAME of a DynObj unless
    /// `soname` overrides it.
    pub output_name: String,
    pub soname: Option<String>,
    pub entry: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            target: Target::Arm,
            output: OutputKind::Exec,
            output_name: "a.out".into(),
            soname: None,
            entry: "_start".into(),
        }
    }
}

/// Symbols the driver itself defines when something references them.
const STANDARD_SYMBOLS: &[&str] = &["__bss_start", "_edata", "_end", "__end"];

pub struct Driver {
    pub config: Config,
    pub module: Module,
    inputs: Vec<Input>,
    backend: Box<dyn Backend>,
    reader: Reader,
    map: Option<SectionNameMap>,
    plan: Option<EmitPlan>,
    layout: Option<LayoutInfo>,
    /// COMDAT group signatures already kept.
    signatures: HashSet<String>,
    /// Input index -> `module.libs` index, for `--as-needed` accounting.
    lib_of_input: HashMap<usize, usize>,
}

impl Driver {
    pub fn new(config: Config) -> Result<Driver> {
        let backend: Box<dyn Backend> = match config.target {
            Target::Arm => Box::new(ArmBackend::new()),
            Target::Mipsel => Box::new(MipsBackend::new()),
        };
        let reader = Reader::new(backend.machine());
        let map = if config.output != OutputKind::Object {
            Some(SectionNameMap::standard()?)
        } else {
            None
        };
        let name = config.soname.clone().unwrap_or_else(|| config.output_name.clone());
        Ok(Driver {
            module: Module::new(name),
            inputs: Vec::new(),
            backend,
            reader,
            map,
            plan: None,
            layout: None,
            signatures: HashSet::new(),
            lib_of_input: HashMap::new(),
            config,
        })
    }

    /// Add one input from raw bytes. Archives expand into one input per
    /// member sharing the archive bytes with a member-base offset.
    pub fn add_input_bytes(
        &mut self,
        path: &str,
        bytes: Vec<u8>,
        attr: Attribute,
    ) -> Result<()> {
        if is_archive(&bytes) {
            for member in archive_members(path, &bytes)? {
                let name = format!("{}({})", path, member.name);
                let area = MemoryArea::with_base(name.clone(), bytes.clone(), member.offset);
                let mut input = Input::new(name, area);
                input.attr = attr;
                self.inputs.push(input);
            }
            return Ok(());
        }
        let mut input = Input::new(path, MemoryArea::new(path, bytes));
        input.attr = attr;
        self.inputs.push(input);
        Ok(())
    }

    pub fn add_input_file(&mut self, path: &str) -> Result<()> {
        let bytes = std::fs::read(path).map_err(|source| LinkError::Io {
            path: path.to_string(),
            source,
        })?;
        self.add_input_bytes(path, bytes, Attribute::default())
    }

    /// Verify the input-attribute constraints before anything is read.
    pub fn linkable(&self) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(LinkError::InputConstraint { reason: "no input files".into() });
        }
        for input in &self.inputs {
            if input.attr.as_needed && !input.attr.add_needed {
                return Err(LinkError::InputConstraint {
                    reason: format!("{}: --as-needed conflicts with --no-add-needed", input.path),
                });
            }
        }
        Ok(())
    }

    /// Read headers and section tables of every input; DynObj inputs also
    /// get their `.dynamic` interpreted and enter the needed-library list.
    pub fn read_sections(&mut self) -> Result<()> {
        if self.config.output != OutputKind::Object {
            self.backend.init_target_sections(&mut self.module, &self.config);
        }
        for i in 0..self.inputs.len() {
            let input = &mut self.inputs[i];
            self.reader.read_header(input)?;
            self.reader.read_section_headers(input)?;
            if input.kind == InputType::DynObj {
                let needed = self.reader.read_dynamic(input)?;
                debug!("{}: NEEDED {:?}", input.path, needed);
                let lib_idx = self.module.libs.len();
                self.module.libs.push(NeededLib {
                    name: input.name.clone(),
                    attr: input.attr,
                    needed: false,
                });
                self.lib_of_input.insert(i, lib_idx);
            }
            self.dedupe_groups(i)?;
        }
        Ok(())
    }

    /// Suppress the members of COMDAT groups whose signature was already
    /// kept from an earlier input.
    fn dedupe_groups(&mut self, input_idx: usize) -> Result<()> {
        let input = &self.inputs[input_idx];
        let mut drops: Vec<usize> = Vec::new();
        for (sidx, sect) in input.context.sections.iter().enumerate() {
            if sect.kind != SectionKind::Group || sect.size < 4 {
                continue;
            }
            let data = input.area.request(sect.offset as usize, sect.size as usize)?;
            if elf::read_u32(data, 0, input.enc) & elf::GRP_COMDAT == 0 {
                continue;
            }
            let signature = self.reader.read_signature(input, sidx, sect.info as usize)?;
            if self.signatures.contains(&signature.name) {
                for off in (4..data.len().saturating_sub(3)).step_by(4) {
                    drops.push(elf::read_u32(data, off, input.enc) as usize);
                }
            } else {
                self.signatures.insert(signature.name);
            }
        }
        let input = &mut self.inputs[input_idx];
        for member in drops {
            if member < input.context.skipped.len() {
                input.context.skipped[member] = true;
            }
        }
        Ok(())
    }

    pub fn read_symbol_tables(&mut self) -> Result<()> {
        for input in &mut self.inputs {
            self.reader.read_symbols(input)?;
        }
        Ok(())
    }

    pub fn merge_sections(&mut self) -> Result<()> {
        for input in &mut self.inputs {
            if input.kind == InputType::Object {
                self.module.merge_input_sections(input, self.map.as_ref())?;
            }
        }
        Ok(())
    }

    pub fn merge_symbol_tables(&mut self) -> Result<()> {
        for i in 0..self.inputs.len() {
            match self.inputs[i].kind {
                InputType::Object => self.merge_object_symbols(i)?,
                InputType::DynObj => self.merge_dynobj_symbols(i)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn merge_object_symbols(&mut self, input_idx: usize) -> Result<()> {
        let count = self.inputs[input_idx].context.raw_syms.len();
        let mut ids = vec![None; count];

        for i in 1..count {
            let raw = self.inputs[input_idx].context.raw_syms[i].clone();
            let input = &self.inputs[input_idx];
            let shndx = raw.shndx as usize;
            let merged = if raw.shndx < elf::SHN_LORESERVE {
                input.context.merged(shndx)
            } else {
                None
            };
            // Definitions inside sections dropped by COMDAT deduplication
            // contribute nothing; the kept group's copy resolves the name.
            if raw.shndx != elf::SHN_UNDEF
                && raw.shndx < elf::SHN_LORESERVE
                && merged.is_none()
            {
                continue;
            }

            let frag = merged.map(|(sect, frag)| FragmentRef::new(sect, frag, raw.value));
            let mut info = ResolveInfo::new(raw.name.clone());
            info.ty = SymType::from_elf(raw.ty);
            info.desc = SymDesc::from_shndx(raw.shndx);
            if info.ty == SymType::IndirectFunc && raw.shndx != elf::SHN_UNDEF {
                info.desc = SymDesc::IndirectFunc;
            }
            info.binding = Binding::from_elf(raw.binding, raw.shndx);
            info.vis = Visibility::from_elf(raw.vis);
            info.size = raw.size;
            info.value = raw.value;

            let id = if info.is_local() {
                let id = self.module.pool.push_local(info);
                self.module.pool.out_symbol_mut(id).frag = frag;
                id
            } else {
                let defines = !matches!(info.desc, SymDesc::Undefined);
                let (id, action) = resolver::resolve(&mut self.module.pool, info)?;
                if defines && action == ResolveAction::Override {
                    self.module.pool.out_symbol_mut(id).frag = frag;
                }
                id
            };
            ids[i] = Some(id);
        }

        self.inputs[input_idx].context.symbols = ids;
        Ok(())
    }

    fn merge_dynobj_symbols(&mut self, input_idx: usize) -> Result<()> {
        let count = self.inputs[input_idx].context.raw_syms.len();
        let mut ids = vec![None; count];
        let mut satisfied = false;

        for i in 1..count {
            let raw = self.inputs[input_idx].context.raw_syms[i].clone();
            // Only the export surface of a shared object participates.
            if raw.binding == elf::STB_LOCAL
                || raw.shndx == elf::SHN_UNDEF
                || matches!(SymType::from_elf(raw.ty), SymType::Section | SymType::File)
            {
                continue;
            }
            let mut info = ResolveInfo::new(raw.name.clone());
            info.ty = SymType::from_elf(raw.ty);
            info.desc = SymDesc::Define;
            info.binding = Binding::from_elf(raw.binding, raw.shndx);
            info.vis = Visibility::from_elf(raw.vis);
            info.size = raw.size;
            info.value = raw.value;
            info.from_dyn = true;

            let (id, action) = resolver::resolve(&mut self.module.pool, info)?;
            if action == ResolveAction::Override {
                satisfied = true;
            }
            ids[i] = Some(id);
        }

        self.inputs[input_idx].context.symbols = ids;
        if satisfied {
            if let Some(&lib) = self.lib_of_input.get(&input_idx) {
                self.module.libs[lib].needed = true;
            }
        }
        Ok(())
    }

    /// Define `__bss_start`/`_edata`/`_end`/`__end` for inputs that
    /// reference them; their values land after layout.
    pub fn add_standard_symbols(&mut self) -> Result<()> {
        for name in STANDARD_SYMBOLS {
            let Some(id) = self.module.pool.lookup(name) else { continue };
            let info = self.module.pool.get_mut(id);
            if info.is_undef() {
                info.desc = SymDesc::Define;
                info.binding = Binding::Absolute;
                info.ty = SymType::Object;
            }
        }
        Ok(())
    }

    pub fn add_target_symbols(&mut self) -> Result<()> {
        if self.config.output == OutputKind::Object {
            return Ok(());
        }
        self.backend.init_target_symbols(&mut self.module, &self.config)
    }

    /// Realize every input relocation section into an in-memory list and
    /// run the backend's reservation scan over each site.
    pub fn read_relocations(&mut self) -> Result<()> {
        for input_idx in 0..self.inputs.len() {
            if self.inputs[input_idx].kind != InputType::Object {
                continue;
            }
            let sect_count = self.inputs[input_idx].context.sections.len();
            for sidx in 0..sect_count {
                if self.inputs[input_idx].context.sections[sidx].kind != SectionKind::Relocation {
                    continue;
                }
                let relocs = self.reader.read_relocations(&self.inputs[input_idx], sidx)?;
                if relocs.is_empty() {
                    continue;
                }
                if self.config.output != OutputKind::Object {
                    for reloc in &relocs {
                        self.backend.scan_relocation(reloc, &mut self.module, &self.config)?;
                    }
                }
                self.module.reloc_lists.push(relocs);
            }
        }
        Ok(())
    }

    /// Assign output addresses and file offsets. No instruction relaxation.
    pub fn layout(&mut self) -> Result<()> {
        layout::allocate_common_symbols(&mut self.module)?;
        self.backend.pre_layout(&mut self.module, &self.config)?;
        let plan = EmitPlan::build(&mut self.module, &self.config, self.backend.as_ref())?;
        let info = layout::assign(&mut self.module, &self.config, self.backend.as_ref())?;
        layout::finalize_symbol_values(&mut self.module, &self.config);
        self.finalize_standard_symbols();
        self.backend.finalize_target_symbols(&mut self.module, &self.config);
        self.plan = Some(plan);
        self.layout = Some(info);
        Ok(())
    }

    fn finalize_standard_symbols(&mut self) {
        let (bss_addr, bss_end) = match self.module.find_section(".bss") {
            Some(idx) => {
                let s = &self.module.section(idx).sect;
                (s.addr, s.addr + s.size)
            }
            None => {
                // Without a .bss the markers collapse to the image end.
                let end = self
                    .module
                    .sections
                    .iter()
                    .filter(|s| s.sect.is_alloc())
                    .map(|s| s.sect.addr + s.sect.size)
                    .max()
                    .unwrap_or(0);
                (end, end)
            }
        };
        for (name, value) in [
            ("__bss_start", bss_addr),
            ("_edata", bss_addr),
            ("_end", bss_end),
            ("__end", bss_end),
        ] {
            if let Some(id) = self.module.pool.lookup(name) {
                if self.module.pool.get(id).is_define()
                    && self.module.pool.out_symbol(id).frag.is_none()
                {
                    self.module.pool.get_mut(id).value = value;
                    self.module.pool.out_symbol_mut(id).value = value;
                }
            }
        }
    }

    /// Apply every relocation. On ARM any failure terminates; on MIPS
    /// overflow and bad-opcode results are reported and counted, and the
    /// link fails at the end of the phase.
    pub fn relocate(&mut self) -> Result<()> {
        if self.config.output == OutputKind::Object {
            return Ok(());
        }
        let lists = std::mem::take(&mut self.module.reloc_lists);
        let mut errors = 0usize;
        for list in &lists {
            for (i, reloc) in list.iter().enumerate() {
                match self.backend.apply_relocation(reloc, list, i, &mut self.module, &self.config)
                {
                    Ok(()) => {}
                    Err(
                        e @ (LinkError::RelocOverflow { .. } | LinkError::RelocBadOpcode { .. }),
                    ) if !self.backend.fatal_reloc_errors() => {
                        error!("{}", e);
                        errors += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        self.module.reloc_lists = lists;
        if errors > 0 {
            return Err(LinkError::RelocationsFailed { count: errors });
        }
        Ok(())
    }

    /// Produce the final ELF image bytes.
    pub fn emit_to_bytes(&mut self) -> Result<Vec<u8>> {
        let plan = self.plan.as_ref().ok_or_else(|| crate::diag::internal("layout not run"))?;
        let info = self.layout.as_ref().ok_or_else(|| crate::diag::internal("layout not run"))?;
        emit::write_image(&self.module, &self.config, self.backend.as_ref(), plan, info)
    }

    pub fn emit_output(&mut self) -> Result<()> {
        let image = self.emit_to_bytes()?;
        let path = self.config.output_name.clone();
        std::fs::write(&path, image).map_err(|source| LinkError::Io { path, source })?;
        Ok(())
    }

    /// Run the whole pipeline and write the output file.
    pub fn link(&mut self) -> Result<()> {
        self.linkable()?;
        self.read_sections()?;
        self.read_symbol_tables()?;
        self.merge_sections()?;
        self.merge_symbol_tables()?;
        self.add_standard_symbols()?;
        self.add_target_symbols()?;
        self.read_relocations()?;
        self.layout()?;
        self.relocate()?;
        self.emit_output()
    }

    /// Run every phase but write nothing; returns the image bytes.
    pub fn link_to_bytes(&mut self) -> Result<Vec<u8>> {
        self.linkable()?;
        self.read_sections()?;
        self.read_symbol_tables()?;
        self.merge_sections()?;
        self.merge_symbol_tables()?;
        self.add_standard_symbols()?;
        self.add_target_symbols()?;
        self.read_relocations()?;
        self.layout()?;
        self.relocate()?;
        self.emit_to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::Binding;

    /// Builds a minimal ELF32 relocatable object in memory: a .text
    /// section, an optional .data section, relocations against .text, and
    /// the three name-pool sections.
    struct TestObject {
        machine: u16,
        text: Vec<u8>,
        data: Vec<u8>,
        /// (name, value, size, st_info, shndx)
        symbols: Vec<(&'static str, u32, u32, u8, u16)>,
        /// (offset in .text, type, 1-based symbol index)
        relocs: Vec<(u32, u32, u32)>,
    }

    const TEXT_SHNDX: u16 = 1;
    const DATA_SHNDX: u16 = 2;

    impl TestObject {
        fn new(machine: u16) -> TestObject {
            TestObject {
                machine,
                text: Vec::new(),
                data: Vec::new(),
                symbols: Vec::new(),
                relocs: Vec::new(),
            }
        }

        fn text_words(mut self, words: &[u32]) -> TestObject {
            for w in words {
                self.text.extend_from_slice(&w.to_le_bytes());
            }
            self
        }

        fn data_words(mut self, words: &[u32]) -> TestObject {
            for w in words {
                self.data.extend_from_slice(&w.to_le_bytes());
            }
            self
        }

        fn global_func(mut self, name: &'static str, value: u32) -> TestObject {
            self.symbols.push((name, value, 0, (elf::STB_GLOBAL << 4) | elf::STT_FUNC, TEXT_SHNDX));
            self
        }

        fn weak_func(mut self, name: &'static str, value: u32) -> TestObject {
            self.symbols.push((name, value, 0, (elf::STB_WEAK << 4) | elf::STT_FUNC, TEXT_SHNDX));
            self
        }

        fn data_object(mut self, name: &'static str, value: u32, size: u32) -> TestObject {
            self.symbols.push((name, value, size, (elf::STB_GLOBAL << 4) | elf::STT_OBJECT, DATA_SHNDX));
            self
        }

        fn undef(mut self, name: &'static str) -> TestObject {
            self.symbols.push((name, 0, 0, (elf::STB_GLOBAL << 4) | elf::STT_NOTYPE, elf::SHN_UNDEF));
            self
        }

        fn weak_undef(mut self, name: &'static str) -> TestObject {
            self.symbols.push((name, 0, 0, (elf::STB_WEAK << 4) | elf::STT_FUNC, elf::SHN_UNDEF));
            self
        }

        fn reloc(mut self, offset: u32, rtype: u32, sym: u32) -> TestObject {
            self.relocs.push((offset, rtype, sym));
            self
        }

        fn build(&self) -> Vec<u8> {
            let mut strtab = vec![0u8];
            let mut name_offs = Vec::new();
            for (name, ..) in &self.symbols {
                name_offs.push(strtab.len() as u32);
                strtab.extend_from_slice(name.as_bytes());
                strtab.push(0);
            }

            let mut symtab = vec![0u8; elf::SYM_SIZE]; // STN_UNDEF
            for (i, &(_, value, size, st_info, shndx)) in self.symbols.iter().enumerate() {
                symtab.extend_from_slice(&name_offs[i].to_le_bytes());
                symtab.extend_from_slice(&value.to_le_bytes());
                symtab.extend_from_slice(&size.to_le_bytes());
                symtab.push(st_info);
                symtab.push(0);
                symtab.extend_from_slice(&shndx.to_le_bytes());
            }

            let mut rel = Vec::new();
            for &(offset, rtype, sym) in &self.relocs {
                rel.extend_from_slice(&offset.to_le_bytes());
                rel.extend_from_slice(&((sym << 8) | rtype).to_le_bytes());
            }

            let shstrtab = b"\0.text\0.data\0.rel.text\0.symtab\0.strtab\0.shstrtab\0".to_vec();
            let names = [1u32, 7, 13, 23, 31, 39]; // offsets into shstrtab

            // section bodies follow the headers
            let shnum = 7u16;
            let shoff = elf::EHDR_SIZE;
            let mut body_off = shoff + shnum as usize * elf::SHDR_SIZE;
            let mut place = |len: usize| {
                let at = body_off;
                body_off += len;
                at
            };
            let text_off = place(self.text.len());
            let data_off = place(self.data.len());
            let rel_off = place(rel.len());
            let symtab_off = place(symtab.len());
            let strtab_off = place(strtab.len());
            let shstrtab_off = place(shstrtab.len());

            let mut out = vec![0u8; body_off];
            out[..4].copy_from_slice(&elf::ELF_MAGIC);
            out[elf::EI_CLASS] = elf::ELFCLASS32;
            out[elf::EI_DATA] = elf::ELFDATA2LSB;
            out[elf::EI_VERSION] = elf::EV_CURRENT;
            out[16..18].copy_from_slice(&elf::ET_REL.to_le_bytes());
            out[18..20].copy_from_slice(&self.machine.to_le_bytes());
            out[32..36].copy_from_slice(&(shoff as u32).to_le_bytes());
            out[46..48].copy_from_slice(&(elf::SHDR_SIZE as u16).to_le_bytes());
            out[48..50].copy_from_slice(&shnum.to_le_bytes());
            out[50..52].copy_from_slice(&6u16.to_le_bytes());

            let mut shdr = |idx: usize,
                            name: u32,
                            sh_type: u32,
                            flags: u32,
                            offset: usize,
                            size: usize,
                            link: u32,
                            info: u32,
                            out: &mut [u8]| {
                let at = shoff + idx * elf::SHDR_SIZE;
                out[at..at + 4].copy_from_slice(&name.to_le_bytes());
                out[at + 4..at + 8].copy_from_slice(&sh_type.to_le_bytes());
                out[at + 8..at + 12].copy_from_slice(&flags.to_le_bytes());
                out[at + 16..at + 20].copy_from_slice(&(offset as u32).to_le_bytes());
                out[at + 20..at + 24].copy_from_slice(&(size as u32).to_le_bytes());
                out[at + 24..at + 28].copy_from_slice(&link.to_le_bytes());
                out[at + 28..at + 32].copy_from_slice(&info.to_le_bytes());
                out[at + 32..at + 36].copy_from_slice(&4u32.to_le_bytes());
            };

            shdr(1, names[0], elf::SHT_PROGBITS, elf::SHF_ALLOC | elf::SHF_EXECINSTR,
                text_off, self.text.len(), 0, 0, &mut out);
            shdr(2, names[1], elf::SHT_PROGBITS, elf::SHF_ALLOC | elf::SHF_WRITE,
                data_off, self.data.len(), 0, 0, &mut out);
            shdr(3, names[2], elf::SHT_REL, 0, rel_off, rel.len(), 4, 1, &mut out);
            shdr(4, names[3], elf::SHT_SYMTAB, 0, symtab_off, symtab.len(), 5, 1, &mut out);
            shdr(5, names[4], elf::SHT_STRTAB, 0, strtab_off, strtab.len(), 0, 0, &mut out);
            shdr(6, names[5], elf::SHT_STRTAB, 0, shstrtab_off, shstrtab.len(), 0, 0, &mut out);

            out[text_off..text_off + self.text.len()].copy_from_slice(&self.text);
            out[data_off..data_off + self.data.len()].copy_from_slice(&self.data);
            out[rel_off..rel_off + rel.len()].copy_from_slice(&rel);
            out[symtab_off..symtab_off + symtab.len()].copy_from_slice(&symtab);
            out[strtab_off..strtab_off + strtab.len()].copy_from_slice(&strtab);
            out[shstrtab_off..shstrtab_off + shstrtab.len()].copy_from_slice(&shstrtab);
            out
        }
    }

    fn arm_config() -> Config {
        Config { target: Target::Arm, output: OutputKind::Exec, ..Config::default() }
    }

    fn read_u32_at(image: &[u8], off: usize) -> u32 {
        elf::read_u32(image, off, crate::elf::DataEncoding::Little)
    }

    /// Find an output section's (offset, addr, size) by walking the
    /// emitted section-header table.
    fn find_shdr(image: &[u8], name: &str) -> Option<(u32, u32, u32)> {
        let shoff = read_u32_at(image, 32) as usize;
        let shnum = elf::read_u16(image, 48, crate::elf::DataEncoding::Little) as usize;
        let shstrndx = elf::read_u16(image, 50, crate::elf::DataEncoding::Little) as usize;
        let str_off = read_u32_at(image, shoff + shstrndx * elf::SHDR_SIZE + 16) as usize;
        for i in 0..shnum {
            let at = shoff + i * elf::SHDR_SIZE;
            let name_off = read_u32_at(image, at) as usize;
            if elf::read_cstr(&image[str_off..], name_off) == name {
                return Some((
                    read_u32_at(image, at + 16),
                    read_u32_at(image, at + 12),
                    read_u32_at(image, at + 20),
                ));
            }
        }
        None
    }

    #[test]
    fn test_link_arm_exec_with_call() {
        // _start at 0 does `bl callee`; callee sits at offset 8.
        let obj = TestObject::new(elf::EM_ARM)
            .text_words(&[0xEB00_0000, 0xE1A0_F00E, 0xE1A0_0000])
            .global_func("_start", 0)
            .global_func("callee", 8)
            .reloc(0, crate::target::arm::R_ARM_CALL, 2);

        let mut driver = Driver::new(arm_config()).unwrap();
        driver.add_input_bytes("a.o", obj.build(), Attribute::default()).unwrap();
        let image = driver.link_to_bytes().unwrap();

        // header basics
        assert_eq!(&image[..4], &elf::ELF_MAGIC);
        assert_eq!(elf::read_u16(&image, 16, crate::elf::DataEncoding::Little), elf::ET_EXEC);
        assert_eq!(elf::read_u16(&image, 18, crate::elf::DataEncoding::Little), elf::EM_ARM);

        // the entry point is _start's address
        let start = driver.module.pool.lookup("_start").unwrap();
        let start_addr = driver.module.pool.out_symbol(start).value;
        assert_eq!(read_u32_at(&image, 24), start_addr);

        // BL imm24 encodes (callee - P - A) >> 2 = (8 - 0) >> 2 = 2
        let (text_off, text_addr, _) = find_shdr(&image, ".text").unwrap();
        assert_eq!(text_addr, start_addr);
        assert_eq!(read_u32_at(&image, text_off as usize), 0xEB00_0002);
    }

    #[test]
    fn test_strong_beats_weak_across_objects() {
        // Object A defines strong foo; object B declares it weak. The
        // pool keeps A's definition and B contributes no output symbol.
        let a = TestObject::new(elf::EM_ARM)
            .text_words(&[0xE1A0_0000])
            .global_func("_start", 0)
            .global_func("foo", 0);
        let b = TestObject::new(elf::EM_ARM)
            .text_words(&[0xE1A0_F00E])
            .weak_func("foo", 0);

        let mut driver = Driver::new(arm_config()).unwrap();
        driver.add_input_bytes("a.o", a.build(), Attribute::default()).unwrap();
        driver.add_input_bytes("b.o", b.build(), Attribute::default()).unwrap();
        driver.link_to_bytes().unwrap();

        let foo = driver.module.pool.lookup("foo").unwrap();
        let info = driver.module.pool.get(foo);
        assert_eq!(info.binding, Binding::Global);
        assert!(info.is_define());
        // bound into a.o's .text fragment, which starts the section
        let frag = driver.module.pool.out_symbol(foo).frag.unwrap();
        assert_eq!(driver.module.frag_offset(frag), 0);
    }

    #[test]
    fn test_undefined_reference_is_fatal() {
        let obj = TestObject::new(elf::EM_ARM)
            .text_words(&[0xEB00_0000])
            .global_func("_start", 0)
            .undef("missing")
            .reloc(0, crate::target::arm::R_ARM_CALL, 2);

        let mut driver = Driver::new(arm_config()).unwrap();
        driver.add_input_bytes("a.o", obj.build(), Attribute::default()).unwrap();
        match driver.link_to_bytes() {
            Err(LinkError::UndefinedReference { symbol }) => assert_eq!(symbol, "missing"),
            other => panic!("expected undefined reference, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_undefined_weak_links_to_nop() {
        let obj = TestObject::new(elf::EM_ARM)
            .text_words(&[0xEB00_0000])
            .global_func("_start", 0)
            .weak_undef("maybe")
            .reloc(0, crate::target::arm::R_ARM_CALL, 2);

        let mut driver = Driver::new(arm_config()).unwrap();
        driver.add_input_bytes("a.o", obj.build(), Attribute::default()).unwrap();
        let image = driver.link_to_bytes().unwrap();
        let (text_off, _, _) = find_shdr(&image, ".text").unwrap();
        assert_eq!(read_u32_at(&image, text_off as usize), 0xE1A0_0000);
    }

    #[test]
    fn test_link_mips_hi_lo_pair() {
        // lui/addiu materializing the address of `datum` in .data.
        let obj = TestObject::new(elf::EM_MIPS)
            .text_words(&[0x3C08_0000, 0x2508_0000, 0x03E0_0008])
            .data_words(&[0x1234_5678])
            .global_func("__start", 0)
            .data_object("datum", 0, 4)
            .reloc(0, crate::target::mips::R_MIPS_HI16, 2)
            .reloc(4, crate::target::mips::R_MIPS_LO16, 2);

        let config = Config {
            target: Target::Mipsel,
            output: OutputKind::Exec,
            entry: "__start".into(),
            ..Config::default()
        };
        let mut driver = Driver::new(config).unwrap();
        driver.add_input_bytes("m.o", obj.build(), Attribute::default()).unwrap();
        let image = driver.link_to_bytes().unwrap();

        assert_eq!(elf::read_u16(&image, 18, crate::elf::DataEncoding::Little), elf::EM_MIPS);

        let datum = driver.module.pool.lookup("datum").unwrap();
        let s = driver.module.pool.out_symbol(datum).value;
        let (text_off, _, _) = find_shdr(&image, ".text").unwrap();
        let hi = read_u32_at(&image, text_off as usize);
        let lo = read_u32_at(&image, text_off as usize + 4);
        let expect_hi = ((s as i32 - (s as i16 as i32)) >> 16) as u32 & 0xffff;
        assert_eq!(hi, 0x3C08_0000 | expect_hi);
        assert_eq!(lo, 0x2508_0000 | (s & 0xffff));
    }

    #[test]
    fn test_relocatable_output_keeps_relocations() {
        let obj = TestObject::new(elf::EM_ARM)
            .text_words(&[0xEB00_0000])
            .global_func("_start", 0)
            .undef("external")
            .reloc(0, crate::target::arm::R_ARM_CALL, 2);

        let config = Config {
            target: Target::Arm,
            output: OutputKind::Object,
            output_name: "r.o".into(),
            ..Config::default()
        };
        let mut driver = Driver::new(config).unwrap();
        driver.add_input_bytes("a.o", obj.build(), Attribute::default()).unwrap();
        let image = driver.link_to_bytes().unwrap();

        assert_eq!(elf::read_u16(&image, 16, crate::elf::DataEncoding::Little), elf::ET_REL);
        let (rel_off, _, rel_size) = find_shdr(&image, ".rel.text").unwrap();
        assert_eq!(rel_size, elf::REL_SIZE as u32);
        let r_info = read_u32_at(&image, rel_off as usize + 4);
        assert_eq!(r_info & 0xff, crate::target::arm::R_ARM_CALL);
        assert_ne!(r_info >> 8, 0); // references a real symtab entry
    }

    #[test]
    fn test_linkable_rejects_empty_link() {
        let driver = Driver::new(arm_config()).unwrap();
        assert!(matches!(driver.linkable(), Err(LinkError::InputConstraint { .. })));
    }
}
