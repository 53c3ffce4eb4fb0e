//! Output layout: section ordering, address and file-offset assignment,
//! and segment planning.
//!
//! Layout never reorders the module's section vector (fragment references
//! index into it); it computes an ordered view, walks it assigning file
//! offsets and, for executable outputs, virtual addresses, and plans the
//! program headers. Every read-only allocated section precedes the first
//! writable one, so the image maps as one R+X segment followed by one R+W
//! segment; NOBITS sections close the writable segment.

use log::debug;

use crate::diag::Result;
use crate::driver::{Config, OutputKind};
use crate::elf;
use crate::module::Module;
use crate::sections::{FragmentKind, FragmentRef, SectionKind};
use crate::symbols::SymDesc;
use crate::target::Backend;

#[derive(Debug, Clone)]
pub struct Segment {
    pub p_type: u32,
    pub offset: u32,
    pub vaddr: u32,
    pub filesz: u32,
    pub memsz: u32,
    pub flags: u32,
    pub align: u32,
}

#[derive(Debug, Default)]
pub struct LayoutInfo {
    /// Output sections in emission order (section-header order minus the
    /// leading null entry).
    pub order: Vec<usize>,
    pub segments: Vec<Segment>,
    pub shoff: u32,
    pub file_size: u32,
}

/// Give every common symbol a zero-filled fragment in `.bss` (or `.tbss`
/// for thread-locals) and turn it into a definition.
pub fn allocate_common_symbols(module: &mut Module) -> Result<()> {
    let commons: Vec<_> = module
        .pool
        .ids()
        .filter(|&id| module.pool.get(id).desc == SymDesc::Common)
        .collect();
    if commons.is_empty() {
        return Ok(());
    }

    for id in commons {
        let (size, align, is_tls) = {
            let info = module.pool.get(id);
            // A common's value is its required alignment.
            (info.size, info.value.max(1), info.ty == crate::symbols::SymType::ThreadLocal)
        };
        let name = if is_tls { ".tbss" } else { ".bss" };
        let sect = module.get_or_create_section(
            name,
            SectionKind::Bss,
            elf::SHT_NOBITS,
            elf::SHF_ALLOC | elf::SHF_WRITE | if is_tls { elf::SHF_TLS } else { 0 },
        );
        let out = module.section_mut(sect);
        out.data.append(FragmentKind::Fill { pattern: 0, size: 1, count: size.max(1) }, align);
        let frag = out.data.frags.len() - 1;
        out.sect.align = out.sect.align.max(align);
        out.sect.size = out.data.size();

        let info = module.pool.get_mut(id);
        info.desc = SymDesc::Define;
        info.value = 0;
        let sym = module.pool.out_symbol_mut(id);
        sym.frag = Some(FragmentRef::new(sect, frag, 0));
    }
    Ok(())
}

/// Layout-order key; lower keys come first. Read-only allocated sections
/// sort below everything writable, NOBITS last among the writable.
fn order_key(module: &Module, idx: usize, backend: &dyn Backend) -> u32 {
    let sect = &module.section(idx).sect;
    let name = sect.name.as_str();

    if let Some(key) = backend.target_section_order(name) {
        return key;
    }

    if !sect.is_alloc() {
        return match name {
            ".symtab" => 900,
            ".strtab" => 910,
            ".shstrtab" => 920,
            _ => 800,
        };
    }

    match name {
        n if n.starts_with(".note") => 10,
        ".hash" => 20,
        ".dynsym" => 30,
        ".dynstr" => 40,
        ".rel.dyn" => 50,
        ".rel.plt" => 60,
        ".init" => 100,
        ".plt" => 110,
        ".text" => 120,
        ".fini" => 130,
        ".rodata" => 200,
        ".gcc_except_table" => 210,
        ".lrodata" => 220,
        ".data.rel.ro.local" => 300,
        ".data.rel.ro" => 310,
        ".tdata" => 320,
        ".data" => 330,
        ".ldata" => 340,
        ".sdata" => 350,
        ".ctors" => 360,
        ".dtors" => 370,
        ".init_array" => 380,
        ".fini_array" => 390,
        ".got" => 400,
        ".got.plt" => 410,
        ".dynamic" => 420,
        ".tbss" => 500,
        ".sbss" => 510,
        ".bss" => 520,
        _ => {
            if sect.sh_type == elf::SHT_NOBITS {
                530
            } else if sect.is_writable() {
                345
            } else if sect.sh_flags & elf::SHF_EXECINSTR != 0 {
                125
            } else {
                205
            }
        }
    }
}

/// Assign file offsets, addresses, and segments.
pub fn assign(module: &mut Module, config: &Config, backend: &dyn Backend) -> Result<LayoutInfo> {
    let mut info = LayoutInfo::default();

    // Emission order over sections that materialize. Zero-size sections
    // are dropped, except the stack-note marker.
    let mut order: Vec<usize> = (0..module.sections.len())
        .filter(|&i| {
            let s = &module.section(i).sect;
            s.kind != SectionKind::Null
                && (s.size > 0 || s.kind == SectionKind::StackNote)
        })
        .collect();
    order.sort_by_key(|&i| (order_key(module, i, backend), i));

    let is_exec_image = config.output != OutputKind::Object;
    let page = backend.page_size();
    let base = match config.output {
        OutputKind::Exec => backend.text_base(),
        _ => 0,
    };

    let phnum = if is_exec_image {
        let has_rw = order.iter().any(|&i| {
            let s = &module.section(i).sect;
            s.is_alloc() && s.is_writable()
        });
        let has_dynamic = module.find_section(".dynamic").is_some();
        1 + 1 + has_rw as u32 + has_dynamic as u32 // PHDR + RX + RW? + DYNAMIC?
    } else {
        0
    };

    let headers = (elf::EHDR_SIZE + phnum as usize * elf::PHDR_SIZE) as u32;
    let mut file_off = headers;
    let mut vaddr = base + headers;

    let mut ro_end_file = headers;
    let mut rw_start = None;
    let mut rw_end_file = file_off;
    let mut rw_end_vaddr = vaddr;

    for &idx in &order {
        let (is_alloc, is_write, is_nobits, align, size) = {
            let s = &module.section(idx).sect;
            (
                s.is_alloc(),
                s.is_writable(),
                s.sh_type == elf::SHT_NOBITS,
                s.align.max(1),
                s.size,
            )
        };
        if !is_alloc || !is_exec_image {
            continue;
        }

        if is_write && rw_start.is_none() {
            ro_end_file = file_off;
            file_off = (file_off + page - 1) & !(page - 1);
            vaddr = base + file_off;
            rw_start = Some((file_off, vaddr));
        }

        file_off = (file_off + align - 1) & !(align - 1);
        vaddr = (vaddr + align - 1) & !(align - 1);

        let s = &mut module.section_mut(idx).sect;
        s.offset = file_off;
        s.addr = vaddr;
        if is_nobits {
            vaddr += size;
        } else {
            file_off += size;
            vaddr += size;
        }
        if is_write {
            rw_end_file = file_off;
            rw_end_vaddr = vaddr;
        } else {
            ro_end_file = file_off;
        }
    }

    // Non-allocated sections (and everything, for relocatable output)
    // take file offsets only.
    for &idx in &order {
        let s = &module.section(idx).sect;
        if is_exec_image && s.is_alloc() {
            continue;
        }
        let align = s.align.max(1);
        let size = s.size;
        let is_nobits = s.sh_type == elf::SHT_NOBITS;
        file_off = (file_off + align - 1) & !(align - 1);
        let s = &mut module.section_mut(idx).sect;
        s.offset = file_off;
        s.addr = 0;
        if !is_nobits {
            file_off += size;
        }
    }

    info.shoff = (file_off + 3) & !3;
    info.file_size = info.shoff + ((order.len() as u32) + 1) * elf::SHDR_SIZE as u32;

    if is_exec_image {
        info.segments.push(Segment {
            p_type: elf::PT_PHDR,
            offset: elf::EHDR_SIZE as u32,
            vaddr: base + elf::EHDR_SIZE as u32,
            filesz: phnum * elf::PHDR_SIZE as u32,
            memsz: phnum * elf::PHDR_SIZE as u32,
            flags: elf::PF_R,
            align: 4,
        });
        info.segments.push(Segment {
            p_type: elf::PT_LOAD,
            offset: 0,
            vaddr: base,
            filesz: ro_end_file,
            memsz: ro_end_file,
            flags: elf::PF_R | elf::PF_X,
            align: page,
        });
        if let Some((off, addr)) = rw_start {
            info.segments.push(Segment {
                p_type: elf::PT_LOAD,
                offset: off,
                vaddr: addr,
                filesz: rw_end_file.saturating_sub(off),
                memsz: rw_end_vaddr.saturating_sub(addr),
                flags: elf::PF_R | elf::PF_W,
                align: page,
            });
        }
        if let Some(dyn_idx) = module.find_section(".dynamic") {
            let s = &module.section(dyn_idx).sect;
            info.segments.push(Segment {
                p_type: elf::PT_DYNAMIC,
                offset: s.offset,
                vaddr: s.addr,
                filesz: s.size,
                memsz: s.size,
                flags: elf::PF_R | elf::PF_W,
                align: 4,
            });
        }
    }

    info.order = order;
    debug!(
        "layout: {} sections, {} segments, image {:#x} bytes",
        info.order.len(),
        info.segments.len(),
        info.file_size
    );
    Ok(info)
}

/// Resolve every symbol's final value from its fragment reference. For
/// executable images this is the runtime address; for relocatable output
/// it stays section-relative.
pub fn finalize_symbol_values(module: &mut Module, config: &Config) {
    let relative = config.output == OutputKind::Object;
    for id in module.pool.ids() {
        let frag = module.pool.out_symbol(id).frag;
        if let Some(fref) = frag {
            let off = module.frag_offset(fref);
            let base = if relative { 0 } else { module.section(fref.sect).sect.addr };
            let value = base + off;
            module.pool.out_symbol_mut(id).value = value;
            module.pool.get_mut(id).value = value;
        }
    }
}
