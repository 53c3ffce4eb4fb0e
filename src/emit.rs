//! ELF32 image emission.
//!
//! Emission happens in two steps. [`EmitPlan::build`] runs before layout:
//! it fixes the contents of every name pool (symbol-table orders, string
//! tables, the needed-library list) and sizes the sections that hold them,
//! so layout can assign final offsets. [`write_image`] runs after
//! relocation and serializes everything: ELF header, program headers,
//! section contents (fragments, backend-owned tables, name pools, the
//! hash table and `.dynamic`), and the section-header table.

use std::collections::HashMap;

use log::debug;

use crate::diag::{internal, Result};
use crate::driver::{Config, OutputKind};
use crate::elf;
use crate::layout::LayoutInfo;
use crate::module::Module;
use crate::sections::SectionKind;
use crate::symbols::{SymType, SymbolId};
use crate::target::{hash_bucket_count, Backend};

/// A string table under construction; offsets are stable once added.
#[derive(Debug, Default)]
pub struct StrTab {
    data: Vec<u8>,
    offsets: HashMap<String, u32>,
}

impl StrTab {
    pub fn new() -> StrTab {
        StrTab { data: vec![0], offsets: HashMap::new() }
    }

    pub fn add(&mut self, s: &str) -> u32 {
        if s.is_empty() {
            return 0;
        }
        if let Some(&off) = self.offsets.get(s) {
            return off;
        }
        let off = self.data.len() as u32;
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        self.offsets.insert(s.to_string(), off);
        off
    }

    pub fn offset(&self, s: &str) -> u32 {
        if s.is_empty() { 0 } else { self.offsets.get(s).copied().unwrap_or(0) }
    }

    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.data.len() <= 1
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// A relocation section of a relocatable output, regenerated against the
/// merged symbol table.
#[derive(Debug)]
struct RelOutput {
    sect: usize,
    target: usize,
    lists: Vec<usize>,
}

pub struct EmitPlan {
    pub is_dynamic: bool,
    symtab_ids: Vec<SymbolId>,
    /// Emitted symbols with STB_LOCAL binding; they lead the table.
    symtab_locals: usize,
    symtab_index: HashMap<SymbolId, u32>,
    dynsym_ids: Vec<SymbolId>,
    dynsym_index: HashMap<SymbolId, u32>,
    strtab: StrTab,
    dynstr: StrTab,
    shstrtab: StrTab,
    /// dynstr offsets for the DT_NEEDED entries, in library order.
    needed: Vec<u32>,
    soname: Option<u32>,
    rel_outputs: Vec<RelOutput>,
}

impl EmitPlan {
    /// 1-based index of a symbol in `.dynsym` (0 = STN_UNDEF).
    pub fn dynsym_index(&self, sym: SymbolId) -> u32 {
        self.dynsym_index.get(&sym).copied().unwrap_or(0)
    }

    /// 1-based index of a symbol in `.symtab` (0 = STN_UNDEF).
    pub fn symtab_index(&self, sym: SymbolId) -> u32 {
        self.symtab_index.get(&sym).copied().unwrap_or(0)
    }

    /// Fix name-pool contents and size their sections.
    pub fn build(module: &mut Module, config: &Config, backend: &dyn Backend) -> Result<EmitPlan> {
        let is_dynamic =
            config.output == OutputKind::DynObj || !module.libs.is_empty();

        // ── .symtab / .strtab ────────────────────────────────────────────
        let mut symtab_ids = Vec::new();
        let mut strtab = StrTab::new();
        for id in module.pool.emission_order() {
            let info = module.pool.get(id);
            // Section symbols of sections that never merged carry nothing.
            if info.ty == SymType::Section && module.pool.out_symbol(id).frag.is_none() {
                continue;
            }
            if info.ty != SymType::Section {
                strtab.add(&info.name);
            }
            symtab_ids.push(id);
        }
        let symtab_index: HashMap<SymbolId, u32> =
            symtab_ids.iter().enumerate().map(|(i, &id)| (id, i as u32 + 1)).collect();
        let symtab_locals = symtab_ids
            .iter()
            .filter(|&&id| {
                use crate::symbols::SymCategory;
                matches!(
                    module.pool.get(id).category(),
                    SymCategory::File | SymCategory::Local
                )
            })
            .count();

        // ── .dynsym / .dynstr ────────────────────────────────────────────
        let mut dynsym_ids = Vec::new();
        let mut dynstr = StrTab::new();
        let mut needed = Vec::new();
        let mut soname = None;
        if is_dynamic {
            let tail = backend.tail_dynsym_symbols();
            for id in module.pool.emission_order() {
                if tail.contains(&id) {
                    continue;
                }
                if backend.is_dynamic_symbol(module.pool.get(id), config) {
                    dynsym_ids.push(id);
                }
            }
            // Global GOT symbols close the table, in reservation order.
            for id in tail {
                if backend.is_dynamic_symbol(module.pool.get(id), config) {
                    dynsym_ids.push(id);
                }
            }
            for &id in &dynsym_ids {
                dynstr.add(&module.pool.get(id).name);
            }
            for lib in &module.libs {
                // --add-needed gates recording at all; --as-needed demands
                // the library actually satisfied something.
                if lib.attr.add_needed && (!lib.attr.as_needed || lib.needed) {
                    needed.push(dynstr.add(&lib.name));
                }
            }
            if config.output == OutputKind::DynObj {
                soname = Some(dynstr.add(&module.name));
            }
        }
        let dynsym_index: HashMap<SymbolId, u32> =
            dynsym_ids.iter().enumerate().map(|(i, &id)| (id, i as u32 + 1)).collect();

        // ── Relocation sections of a relocatable output ──────────────────
        let mut rel_outputs: Vec<RelOutput> = Vec::new();
        if config.output == OutputKind::Object {
            for (list_idx, list) in module.reloc_lists.iter().enumerate() {
                let Some(first) = list.first() else { continue };
                let target = first.target.sect;
                if let Some(out) = rel_outputs.iter_mut().find(|r| r.target == target) {
                    out.lists.push(list_idx);
                } else {
                    rel_outputs.push(RelOutput { sect: 0, target, lists: vec![list_idx] });
                }
            }
            for rel in &mut rel_outputs {
                let name = format!(".rel{}", module.section(rel.target).sect.name);
                let sect = module.get_or_create_section(
                    &name,
                    SectionKind::Relocation,
                    elf::SHT_REL,
                    0,
                );
                let count: usize =
                    rel.lists.iter().map(|&l| module.reloc_lists[l].len()).sum();
                let out = module.section_mut(sect);
                out.sect.align = 4;
                out.sect.size = (count * elf::REL_SIZE) as u32;
                rel.sect = sect;
            }
        }

        // ── Size the name-pool sections ──────────────────────────────────
        if is_dynamic {
            let dynsym = module.get_or_create_section(
                ".dynsym",
                SectionKind::NamePool,
                elf::SHT_DYNSYM,
                elf::SHF_ALLOC,
            );
            set_size(module, dynsym, ((dynsym_ids.len() + 1) * elf::SYM_SIZE) as u32, 4);

            let dynstr_sect = module.get_or_create_section(
                ".dynstr",
                SectionKind::NamePool,
                elf::SHT_STRTAB,
                elf::SHF_ALLOC,
            );
            set_size(module, dynstr_sect, dynstr.len(), 1);

            let nchain = dynsym_ids.len() as u32 + 1;
            let nbucket = hash_bucket_count(nchain as usize);
            let hash = module.get_or_create_section(
                ".hash",
                SectionKind::Target,
                elf::SHT_HASH,
                elf::SHF_ALLOC,
            );
            set_size(module, hash, (2 + nbucket + nchain) * 4, 4);
        }

        let symtab = module.get_or_create_section(
            ".symtab",
            SectionKind::NamePool,
            elf::SHT_SYMTAB,
            0,
        );
        set_size(module, symtab, ((symtab_ids.len() + 1) * elf::SYM_SIZE) as u32, 4);
        let strtab_sect =
            module.get_or_create_section(".strtab", SectionKind::NamePool, elf::SHT_STRTAB, 0);
        set_size(module, strtab_sect, strtab.len(), 1);

        let mut plan = EmitPlan {
            is_dynamic,
            symtab_ids,
            symtab_locals,
            symtab_index,
            dynsym_ids,
            dynsym_index,
            strtab,
            dynstr,
            shstrtab: StrTab::new(),
            needed,
            soname,
            rel_outputs,
        };

        // .dynamic needs the full entry count, which depends only on
        // section presence and sizes frozen above.
        if is_dynamic {
            let count = dynamic_entries(module, config, &plan).len() as u32;
            let dynamic = module.get_or_create_section(
                ".dynamic",
                SectionKind::Target,
                elf::SHT_DYNAMIC,
                elf::SHF_ALLOC | elf::SHF_WRITE,
            );
            set_size(module, dynamic, count * elf::DYN_SIZE as u32, 4);
        }

        // ── .shstrtab, named last so it can name itself ──────────────────
        let shstrtab_sect = module.get_or_create_section(
            ".shstrtab",
            SectionKind::NamePool,
            elf::SHT_STRTAB,
            0,
        );
        plan.shstrtab.add(".shstrtab");
        for i in 0..module.sections.len() {
            let sect = &module.section(i).sect;
            if sect.size > 0 || sect.kind == SectionKind::StackNote {
                let name = sect.name.clone();
                plan.shstrtab.add(&name);
            }
        }
        set_size(module, shstrtab_sect, plan.shstrtab.len(), 1);

        debug!(
            "emit plan: {} symtab, {} dynsym, {} needed libs",
            plan.symtab_ids.len(),
            plan.dynsym_ids.len(),
            plan.needed.len()
        );
        Ok(plan)
    }
}

fn set_size(module: &mut Module, sect: usize, size: u32, align: u32) {
    let s = &mut module.section_mut(sect).sect;
    s.size = size;
    s.align = s.align.max(align);
}

/// The `.dynamic` entry list. Called once at plan time for its length and
/// once at write time for its values; both depend only on state frozen
/// before layout (plus addresses, which only the second call reads).
fn dynamic_entries(module: &Module, config: &Config, plan: &EmitPlan) -> Vec<(u32, u32)> {
    let addr = |name: &str| {
        module.find_section(name).map(|i| module.section(i).sect.addr).unwrap_or(0)
    };
    let size = |name: &str| {
        module.find_section(name).map(|i| module.section(i).sect.size).unwrap_or(0)
    };

    let mut out = Vec::new();
    for &off in &plan.needed {
        out.push((elf::DT_NEEDED, off));
    }
    if let Some(off) = plan.soname {
        out.push((elf::DT_SONAME, off));
    }
    out.push((elf::DT_HASH, addr(".hash")));
    out.push((elf::DT_STRTAB, addr(".dynstr")));
    out.push((elf::DT_SYMTAB, addr(".dynsym")));
    out.push((elf::DT_STRSZ, plan.dynstr.len()));
    out.push((elf::DT_SYMENT, elf::SYM_SIZE as u32));
    if size(".init") > 0 {
        out.push((elf::DT_INIT, addr(".init")));
    }
    if size(".fini") > 0 {
        out.push((elf::DT_FINI, addr(".fini")));
    }
    if size(".rel.dyn") > 0 {
        out.push((elf::DT_REL, addr(".rel.dyn")));
        out.push((elf::DT_RELSZ, size(".rel.dyn")));
        out.push((elf::DT_RELENT, elf::REL_SIZE as u32));
    }
    if size(".rel.plt") > 0 {
        out.push((elf::DT_PLTGOT, addr(".got.plt")));
        out.push((elf::DT_PLTRELSZ, size(".rel.plt")));
        out.push((elf::DT_PLTREL, elf::DT_REL));
        out.push((elf::DT_JMPREL, addr(".rel.plt")));
    } else if size(".got") > 0 {
        // Without a PLT the dynamic linker still wants the GOT origin.
        out.push((elf::DT_PLTGOT, addr(".got")));
    }
    out.push((elf::DT_FLAGS, 0));
    out.push((elf::DT_NULL, 0));
    out
}

/// Serialize the final image.
pub fn write_image(
    module: &Module,
    config: &Config,
    backend: &dyn Backend,
    plan: &EmitPlan,
    info: &LayoutInfo,
) -> Result<Vec<u8>> {
    let mut out = vec![0u8; info.file_size as usize];

    // Section index in the header table: null entry first.
    let shndx: HashMap<usize, u32> = info
        .order
        .iter()
        .enumerate()
        .map(|(i, &sect)| (sect, i as u32 + 1))
        .collect();

    write_ehdr(&mut out, module, config, backend, info, &shndx);

    let mut phoff = elf::EHDR_SIZE;
    for seg in &info.segments {
        write_phdr(&mut out, &mut phoff, seg);
    }

    for &idx in &info.order {
        let sect = &module.section(idx).sect;
        if sect.sh_type == elf::SHT_NOBITS || sect.size == 0 {
            continue;
        }
        let at = sect.offset as usize;
        let len = sect.size as usize;
        if at + len > out.len() {
            return Err(internal(format!("section {} overruns the image", sect.name)));
        }

        if let Some(bytes) = backend.emit_section_data(module, idx, plan)? {
            let n = bytes.len().min(len);
            out[at..at + n].copy_from_slice(&bytes[..n]);
            continue;
        }

        match sect.name.as_str() {
            ".symtab" => {
                write_symtab(&mut out[at..at + len], module, &plan.symtab_ids, &plan.strtab, &shndx)
            }
            ".dynsym" => {
                write_symtab(&mut out[at..at + len], module, &plan.dynsym_ids, &plan.dynstr, &shndx)
            }
            ".strtab" => out[at..at + len].copy_from_slice(plan.strtab.as_bytes()),
            ".dynstr" => out[at..at + len].copy_from_slice(plan.dynstr.as_bytes()),
            ".shstrtab" => out[at..at + len].copy_from_slice(plan.shstrtab.as_bytes()),
            ".hash" => write_hash(&mut out[at..at + len], module, &plan.dynsym_ids),
            ".dynamic" => {
                let mut off = at;
                for (tag, val) in dynamic_entries(module, config, plan) {
                    out[off..off + 4].copy_from_slice(&tag.to_le_bytes());
                    out[off + 4..off + 8].copy_from_slice(&val.to_le_bytes());
                    off += elf::DYN_SIZE;
                }
            }
            _ => {
                if let Some(rel) = plan.rel_outputs.iter().find(|r| r.sect == idx) {
                    write_object_relocs(&mut out[at..at + len], module, plan, rel);
                } else {
                    module.section(idx).data.assemble(&mut out[at..at + len]);
                }
            }
        }
    }

    write_shdrs(&mut out, module, plan, info, &shndx);
    Ok(out)
}

fn write_ehdr(
    out: &mut [u8],
    module: &Module,
    config: &Config,
    backend: &dyn Backend,
    info: &LayoutInfo,
    shndx: &HashMap<usize, u32>,
) {
    out[..4].copy_from_slice(&elf::ELF_MAGIC);
    out[elf::EI_CLASS] = elf::ELFCLASS32;
    out[elf::EI_DATA] = elf::ELFDATA2LSB;
    out[elf::EI_VERSION] = elf::EV_CURRENT;

    let e_type = match config.output {
        OutputKind::Object => elf::ET_REL,
        OutputKind::Exec => elf::ET_EXEC,
        OutputKind::DynObj => elf::ET_DYN,
    };
    let entry = if config.output == OutputKind::Exec {
        module
            .pool
            .lookup(&config.entry)
            .map(|id| module.pool.out_symbol(id).value)
            .unwrap_or(0)
    } else {
        0
    };
    let shstrndx = module
        .find_section(".shstrtab")
        .and_then(|i| shndx.get(&i).copied())
        .unwrap_or(0) as u16;

    put16(out, 16, e_type);
    put16(out, 18, backend.machine());
    put32(out, 20, 1);
    put32(out, 24, entry);
    put32(out, 28, if info.segments.is_empty() { 0 } else { elf::EHDR_SIZE as u32 });
    put32(out, 32, info.shoff);
    put32(out, 36, backend.elf_flags());
    put16(out, 40, elf::EHDR_SIZE as u16);
    put16(out, 42, elf::PHDR_SIZE as u16);
    put16(out, 44, info.segments.len() as u16);
    put16(out, 46, elf::SHDR_SIZE as u16);
    put16(out, 48, info.order.len() as u16 + 1);
    put16(out, 50, shstrndx);
}

fn write_phdr(out: &mut [u8], off: &mut usize, seg: &crate::layout::Segment) {
    let at = *off;
    put32(out, at, seg.p_type);
    put32(out, at + 4, seg.offset);
    put32(out, at + 8, seg.vaddr);
    put32(out, at + 12, seg.vaddr);
    put32(out, at + 16, seg.filesz);
    put32(out, at + 20, seg.memsz);
    put32(out, at + 24, seg.flags);
    put32(out, at + 28, seg.align);
    *off += elf::PHDR_SIZE;
}

fn symbol_shndx(module: &Module, id: SymbolId, shndx: &HashMap<usize, u32>) -> u16 {
    let info = module.pool.get(id);
    if let Some(frag) = module.pool.out_symbol(id).frag {
        return shndx.get(&frag.sect).map(|&i| i as u16).unwrap_or(elf::SHN_ABS);
    }
    if info.is_absolute() || info.ty == SymType::File {
        return elf::SHN_ABS;
    }
    elf::SHN_UNDEF
}

fn write_symtab(
    out: &mut [u8],
    module: &Module,
    ids: &[SymbolId],
    strtab: &StrTab,
    shndx: &HashMap<usize, u32>,
) {
    // Entry 0 is the STN_UNDEF null symbol; the buffer starts zeroed.
    for (i, &id) in ids.iter().enumerate() {
        let info = module.pool.get(id);
        let sym = module.pool.out_symbol(id);
        let at = (i + 1) * elf::SYM_SIZE;
        let name = if info.ty == SymType::Section { 0 } else { strtab.offset(&info.name) };
        put32(out, at, name);
        put32(out, at + 4, sym.value);
        put32(out, at + 8, sym.size);
        out[at + 12] = (info.binding.to_elf() << 4) | info.ty.to_elf();
        out[at + 13] = info.vis.to_elf();
        put16(out, at + 14, symbol_shndx(module, id, shndx));
    }
}

/// SysV hash table: `[nbucket, nchain, bucket[nbucket], chain[nchain]]`.
fn write_hash(out: &mut [u8], module: &Module, dynsym_ids: &[SymbolId]) {
    let nchain = dynsym_ids.len() as u32 + 1;
    let nbucket = hash_bucket_count(nchain as usize);
    put32(out, 0, nbucket);
    put32(out, 4, nchain);
    let bucket_base = 8;
    let chain_base = bucket_base + nbucket as usize * 4;

    for (i, &id) in dynsym_ids.iter().enumerate() {
        let sym_idx = i as u32 + 1;
        let name = &module.pool.get(id).name;
        let pos = (elf::elf_hash(name) % nbucket) as usize;
        let prev = elf::read_u32(out, bucket_base + pos * 4, elf::DataEncoding::Little);
        put32(out, chain_base + sym_idx as usize * 4, prev);
        put32(out, bucket_base + pos * 4, sym_idx);
    }
}

fn write_object_relocs(out: &mut [u8], module: &Module, plan: &EmitPlan, rel: &RelOutput) {
    let mut at = 0;
    for &list in &rel.lists {
        for reloc in &module.reloc_lists[list] {
            let r_offset = module.frag_offset(reloc.target);
            let sym_idx = reloc.sym.map(|s| plan.symtab_index(s)).unwrap_or(0);
            put32(out, at, r_offset);
            put32(out, at + 4, (sym_idx << 8) | (reloc.rtype & 0xff));
            at += elf::REL_SIZE;
        }
    }
}

fn write_shdrs(
    out: &mut [u8],
    module: &Module,
    plan: &EmitPlan,
    info: &LayoutInfo,
    shndx: &HashMap<usize, u32>,
) {
    let shdr_of = |name: &str| {
        module.find_section(name).and_then(|i| shndx.get(&i).copied()).unwrap_or(0)
    };

    for (i, &idx) in info.order.iter().enumerate() {
        let sect = &module.section(idx).sect;
        let at = info.shoff as usize + (i + 1) * elf::SHDR_SIZE;

        let (link, entsize, sh_info) = match sect.sh_type {
            elf::SHT_SYMTAB => (
                shdr_of(".strtab"),
                elf::SYM_SIZE as u32,
                plan.symtab_locals as u32 + 1,
            ),
            elf::SHT_DYNSYM => (shdr_of(".dynstr"), elf::SYM_SIZE as u32, 1),
            elf::SHT_HASH => (shdr_of(".dynsym"), 4, 0),
            elf::SHT_DYNAMIC => (shdr_of(".dynstr"), elf::DYN_SIZE as u32, 0),
            elf::SHT_REL => {
                if let Some(rel) = plan.rel_outputs.iter().find(|r| r.sect == idx) {
                    // relocatable output: link the symtab, point at the
                    // patched section
                    (shdr_of(".symtab"), elf::REL_SIZE as u32, shndx[&rel.target])
                } else {
                    (shdr_of(".dynsym"), elf::REL_SIZE as u32, 0)
                }
            }
            _ => (0, 0, 0),
        };

        put32(out, at, plan.shstrtab.offset(&sect.name));
        put32(out, at + 4, sect.sh_type);
        put32(out, at + 8, sect.sh_flags);
        put32(out, at + 12, sect.addr);
        put32(out, at + 16, sect.offset);
        put32(out, at + 20, sect.size);
        put32(out, at + 24, link);
        put32(out, at + 28, sh_info);
        put32(out, at + 32, sect.align);
        put32(out, at + 36, entsize);
    }
}

fn put16(out: &mut [u8], off: usize, v: u16) {
    out[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put32(out: &mut [u8], off: usize, v: u32) {
    out[off..off + 4].copy_from_slice(&v.to_le_bytes());
}
