//! The ARM backend: reservation policy, GOT/PLT shapes, and emission of
//! the backend-owned sections.

pub mod reloc;

use log::debug;

use crate::diag::{internal, LinkError, Result};
use crate::driver::{Config, OutputKind};
use crate::elf;
use crate::emit::EmitPlan;
use crate::module::Module;
use crate::plt_got::{Got, OutputRelocSection, Plt};
use crate::reloc::Relocation;
use crate::sections::{FragmentKind, FragmentRef, SectionKind};
use crate::symbols::{Binding, ResolveInfo, SymDesc, SymType, SymbolId, Visibility};
use crate::target::{is_symbol_preemptible, symbol_needs_dyn_rel, Backend};

// ── ARM relocation types ─────────────────────────────────────────────────

pub const R_ARM_NONE: u32 = 0;
pub const R_ARM_PC24: u32 = 1;
pub const R_ARM_ABS32: u32 = 2;
pub const R_ARM_REL32: u32 = 3;
pub const R_ARM_THM_CALL: u32 = 10;
pub const R_ARM_TLS_DTPMOD32: u32 = 17;
pub const R_ARM_TLS_DTPOFF32: u32 = 18;
pub const R_ARM_TLS_TPOFF32: u32 = 19;
pub const R_ARM_COPY: u32 = 20;
pub const R_ARM_GLOB_DAT: u32 = 21;
pub const R_ARM_JUMP_SLOT: u32 = 22;
pub const R_ARM_RELATIVE: u32 = 23;
pub const R_ARM_GOTOFF32: u32 = 24;
pub const R_ARM_GOT_BREL: u32 = 26;
pub const R_ARM_PLT32: u32 = 27;
pub const R_ARM_CALL: u32 = 28;
pub const R_ARM_JUMP24: u32 = 29;
pub const R_ARM_THM_JUMP24: u32 = 30;
pub const R_ARM_TARGET1: u32 = 38;
pub const R_ARM_V4BX: u32 = 40;
pub const R_ARM_PREL31: u32 = 42;
pub const R_ARM_MOVW_ABS_NC: u32 = 43;
pub const R_ARM_MOVT_ABS: u32 = 44;
pub const R_ARM_MOVW_PREL_NC: u32 = 45;
pub const R_ARM_MOVT_PREL: u32 = 46;
pub const R_ARM_THM_MOVW_ABS_NC: u32 = 47;
pub const R_ARM_THM_MOVT_ABS: u32 = 48;
pub const R_ARM_THM_MOVW_PREL_NC: u32 = 49;
pub const R_ARM_THM_MOVT_PREL: u32 = 50;
pub const R_ARM_TLS_GD32: u32 = 104;
pub const R_ARM_TLS_LDM32: u32 = 105;
pub const R_ARM_TLS_LDO32: u32 = 106;
pub const R_ARM_TLS_IE32: u32 = 107;
pub const R_ARM_TLS_LE32: u32 = 108;

/// 131..=255 is outside the ARM-documented range.
pub const R_ARM_MAX_DOCUMENTED: u32 = 130;

// ── Reserved-flags bits on ResolveInfo ───────────────────────────────────

pub const RESERVE_REL: u32 = 0x1;
pub const RESERVE_GOT: u32 = 0x2;
pub const GOT_REL: u32 = 0x4;
pub const RESERVE_PLT: u32 = 0x8;
pub const RESERVE_COPY: u32 = 0x10;

const BASE_ADDR: u32 = 0x10000;
const PAGE_SIZE: u32 = 0x10000;
const PLT0_SIZE: u32 = 20;
const PLT_ENTRY_SIZE: u32 = 16;
const GOT_HEADER: u32 = 1; // GOT[0] = _DYNAMIC
const GOTPLT_HEADER: u32 = 3;

pub struct ArmBackend {
    pub got: Got,
    pub plt: Plt,
    pub rel_dyn: OutputRelocSection,
    pub rel_plt: OutputRelocSection,
    got_symbol: Option<SymbolId>,
}

impl ArmBackend {
    pub fn new() -> ArmBackend {
        ArmBackend {
            got: Got::new(GOT_HEADER),
            plt: Plt::new(PLT0_SIZE, PLT_ENTRY_SIZE, GOTPLT_HEADER),
            rel_dyn: OutputRelocSection::new(),
            rel_plt: OutputRelocSection::new(),
            got_symbol: None,
        }
    }

    fn scan_local(&mut self, rtype: u32, sym: SymbolId, module: &mut Module, config: &Config) {
        match rtype {
            R_ARM_ABS32 | R_ARM_TARGET1 => {
                // An absolute word in a shared object needs a load-time
                // R_ARM_RELATIVE fixup.
                if config.output == OutputKind::DynObj {
                    self.rel_dyn.reserve_entry();
                    let info = module.pool.get_mut(sym);
                    info.reserved |= RESERVE_REL;
                }
            }
            R_ARM_GOT_BREL => {
                let reserved = module.pool.get(sym).reserved;
                if reserved & (RESERVE_GOT | GOT_REL) == 0 {
                    self.got.reserve_entry();
                    let bit = if config.output == OutputKind::DynObj {
                        self.rel_dyn.reserve_entry();
                        GOT_REL
                    } else {
                        RESERVE_GOT
                    };
                    module.pool.get_mut(sym).reserved |= bit;
                }
            }
            _ => {}
        }
    }

    fn scan_global(
        &mut self,
        rtype: u32,
        sym: SymbolId,
        module: &mut Module,
        config: &Config,
    ) -> Result<()> {
        match rtype {
            R_ARM_ABS32 | R_ARM_TARGET1 => {
                if self.symbol_needs_plt(sym, module, config) {
                    self.reserve_plt(sym, module);
                }
                if self.symbol_needs_copy(sym, module, config) {
                    self.reserve_copy(sym, module)?;
                } else {
                    let info = module.pool.get(sym);
                    let has_plt = info.reserved & RESERVE_PLT != 0;
                    if symbol_needs_dyn_rel(info, config, true, has_plt) {
                        self.rel_dyn.reserve_entry();
                        module.pool.get_mut(sym).reserved |= RESERVE_REL;
                    }
                }
            }
            // A split MOVW/MOVT immediate cannot carry a dynamic fixup;
            // only the PLT redirection applies.
            R_ARM_MOVW_ABS_NC | R_ARM_MOVT_ABS | R_ARM_THM_MOVW_ABS_NC
            | R_ARM_THM_MOVT_ABS => {
                if self.symbol_needs_plt(sym, module, config) {
                    self.reserve_plt(sym, module);
                }
            }
            R_ARM_PC24 | R_ARM_CALL | R_ARM_JUMP24 | R_ARM_PLT32 | R_ARM_THM_CALL
            | R_ARM_THM_JUMP24 => {
                if self.symbol_needs_plt(sym, module, config) {
                    self.reserve_plt(sym, module);
                }
            }
            R_ARM_GOT_BREL => {
                let info = module.pool.get(sym);
                if info.reserved & (RESERVE_GOT | GOT_REL) == 0 {
                    self.got.reserve_entry();
                    let preemptible = is_symbol_preemptible(info, config);
                    let bit = if config.output == OutputKind::DynObj
                        || info.from_dyn
                        || preemptible
                    {
                        self.rel_dyn.reserve_entry();
                        GOT_REL
                    } else {
                        RESERVE_GOT
                    };
                    module.pool.get_mut(sym).reserved |= bit;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// A call-class or address-class reference goes through the PLT when
    /// the target is a function the static link cannot pin down.
    fn symbol_needs_plt(&self, sym: SymbolId, module: &Module, config: &Config) -> bool {
        let info = module.pool.get(sym);
        if info.ty != SymType::Func || info.is_local() {
            return false;
        }
        // An undefined symbol no shared object provides gets no stub in an
        // executable; weak ones rewrite to no-ops at apply time.
        if info.is_undef() && !info.from_dyn && config.output != OutputKind::DynObj {
            return false;
        }
        info.from_dyn || info.is_undef() || is_symbol_preemptible(info, config)
    }

    fn reserve_plt(&mut self, sym: SymbolId, module: &mut Module) {
        let info = module.pool.get(sym);
        if info.reserved & RESERVE_PLT != 0 {
            return;
        }
        self.plt.reserve_entry();
        self.rel_plt.reserve_entry();
        module.pool.get_mut(sym).reserved |= RESERVE_PLT;
    }

    /// Address references from an executable to data defined in a shared
    /// object get a copy of the datum in `.bss` plus an `R_ARM_COPY`.
    fn symbol_needs_copy(&self, sym: SymbolId, module: &Module, config: &Config) -> bool {
        let info = module.pool.get(sym);
        config.output == OutputKind::Exec
            && info.from_dyn
            && info.ty == SymType::Object
            && info.size > 0
    }

    fn reserve_copy(&mut self, sym: SymbolId, module: &mut Module) -> Result<()> {
        if module.pool.get(sym).reserved & RESERVE_COPY != 0 {
            return Ok(());
        }
        let size = module.pool.get(sym).size;
        let bss = module.get_or_create_section(
            ".bss",
            SectionKind::Bss,
            elf::SHT_NOBITS,
            elf::SHF_ALLOC | elf::SHF_WRITE,
        );
        let align = if size >= 8 { 8 } else { 4 };
        let out = module.section_mut(bss);
        out.data.append(FragmentKind::Fill { pattern: 0, size: 1, count: size }, align);
        let frag = out.data.frags.len() - 1;
        out.sect.align = out.sect.align.max(align);
        out.sect.size = out.data.size();

        module.pool.out_symbol_mut(sym).frag = Some(FragmentRef::new(bss, frag, 0));
        module.pool.get_mut(sym).reserved |= RESERVE_COPY;
        self.rel_dyn.reserve_entry();
        Ok(())
    }
}

impl Default for ArmBackend {
    fn default() -> ArmBackend {
        ArmBackend::new()
    }
}

impl Backend for ArmBackend {
    fn machine(&self) -> u16 {
        elf::EM_ARM
    }

    fn elf_flags(&self) -> u32 {
        elf::EF_ARM_ABI_VER5
    }

    fn text_base(&self) -> u32 {
        BASE_ADDR
    }

    fn page_size(&self) -> u32 {
        PAGE_SIZE
    }

    fn init_target_sections(&mut self, module: &mut Module, _config: &Config) {
        let got = module.get_or_create_section(
            ".got",
            SectionKind::Target,
            elf::SHT_PROGBITS,
            elf::SHF_ALLOC | elf::SHF_WRITE,
        );
        let gotplt = module.get_or_create_section(
            ".got.plt",
            SectionKind::Target,
            elf::SHT_PROGBITS,
            elf::SHF_ALLOC | elf::SHF_WRITE,
        );
        let plt = module.get_or_create_section(
            ".plt",
            SectionKind::Target,
            elf::SHT_PROGBITS,
            elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        );
        let rel_dyn = module.get_or_create_section(
            ".rel.dyn",
            SectionKind::Target,
            elf::SHT_REL,
            elf::SHF_ALLOC,
        );
        let rel_plt = module.get_or_create_section(
            ".rel.plt",
            SectionKind::Target,
            elf::SHT_REL,
            elf::SHF_ALLOC,
        );
        for idx in [got, gotplt, plt, rel_dyn, rel_plt] {
            let out = module.section_mut(idx);
            out.sect.align = 4;
            // One placeholder fragment so FragmentRefs into backend-owned
            // sections resolve as (section, 0, byte-offset).
            out.data.append(FragmentKind::Target, 1);
        }
        self.got.sect = Some(got);
        self.plt.sect = Some(plt);
        self.plt.gotplt_sect = Some(gotplt);
        self.rel_dyn.sect = Some(rel_dyn);
        self.rel_plt.sect = Some(rel_plt);
    }

    /// `_GLOBAL_OFFSET_TABLE_` is defined only when some input refers to
    /// it; a user definition of the name is a collision.
    fn init_target_symbols(&mut self, module: &mut Module, _config: &Config) -> Result<()> {
        let Some(id) = module.pool.lookup("_GLOBAL_OFFSET_TABLE_") else {
            return Ok(());
        };
        if module.pool.get(id).is_define() {
            return Err(LinkError::ReservedSymbolCollision {
                symbol: "_GLOBAL_OFFSET_TABLE_".into(),
            });
        }
        let info = module.pool.get_mut(id);
        info.ty = SymType::Object;
        info.desc = SymDesc::Define;
        info.binding = Binding::Local;
        info.vis = Visibility::Hidden;
        self.got_symbol = Some(id);
        Ok(())
    }

    fn scan_relocation(
        &mut self,
        reloc: &Relocation,
        module: &mut Module,
        config: &Config,
    ) -> Result<()> {
        let Some(sym) = reloc.sym else { return Ok(()) };
        if !module.section(reloc.target.sect).sect.is_alloc() {
            return Ok(());
        }

        {
            let info = module.pool.get(sym);
            if info.is_undef() && !info.from_dyn && !info.is_weak() {
                return Err(LinkError::UndefinedReference { symbol: info.name.clone() });
            }
        }

        if module.pool.get(sym).is_local() {
            self.scan_local(reloc.rtype, sym, module, config);
            Ok(())
        } else {
            self.scan_global(reloc.rtype, sym, module, config)
        }
    }

    fn pre_layout(&mut self, module: &mut Module, config: &Config) -> Result<()> {
        // Copy-relocated symbols pair with exactly one R_ARM_COPY entry
        // aimed at their .bss shadow.
        let copies: Vec<SymbolId> = module
            .pool
            .ids()
            .filter(|&id| module.pool.get(id).reserved & RESERVE_COPY != 0)
            .collect();
        for sym in copies {
            let target = module
                .pool
                .out_symbol(sym)
                .frag
                .ok_or_else(|| internal("copy-relocated symbol without a .bss shadow"))?;
            let (entry, exist) = self.rel_dyn.entry(sym, true)?;
            if exist {
                return Err(internal("copy relocation claimed twice"));
            }
            entry.rtype = R_ARM_COPY;
            entry.sym = Some(sym);
            entry.target = target;
        }

        let keep_got = self.got.has_entries()
            || config.output == OutputKind::DynObj
            || self.got_symbol.is_some();
        if let Some(got) = self.got.sect {
            module.section_mut(got).sect.size = if keep_got { self.got.size() } else { 0 };
        }
        if let Some(gotplt) = self.plt.gotplt_sect {
            module.section_mut(gotplt).sect.size = self.plt.gotplt_size();
        }
        if let Some(plt) = self.plt.sect {
            module.section_mut(plt).sect.size = self.plt.size();
        }
        if let Some(idx) = self.rel_dyn.sect {
            module.section_mut(idx).sect.size = self.rel_dyn.size();
        }
        if let Some(idx) = self.rel_plt.sect {
            module.section_mut(idx).sect.size = self.rel_plt.size();
        }

        // Pin _GLOBAL_OFFSET_TABLE_ to the table's first byte.
        if let (Some(id), Some(got), true) = (self.got_symbol, self.got.sect, keep_got) {
            module.pool.out_symbol_mut(id).frag = Some(FragmentRef::new(got, 0, 0));
        }

        debug!(
            "arm: got {} plt {} rel.dyn {} rel.plt {}",
            self.got.reserved(),
            self.plt.reserved(),
            self.rel_dyn.reserved(),
            self.rel_plt.reserved()
        );
        Ok(())
    }

    fn finalize_target_symbols(&mut self, module: &mut Module, _config: &Config) {
        if let (Some(id), Some(got)) = (self.got_symbol, self.got.sect) {
            let addr = module.section(got).sect.addr;
            module.pool.out_symbol_mut(id).value = addr;
            module.pool.get_mut(id).value = addr;
        }
    }

    fn apply_relocation(
        &mut self,
        reloc: &Relocation,
        _list: &[Relocation],
        _index: usize,
        module: &mut Module,
        config: &Config,
    ) -> Result<()> {
        reloc::apply(self, reloc, module, config)
    }

    fn is_dynamic_symbol(&self, info: &ResolveInfo, config: &Config) -> bool {
        if info.reserved & (RESERVE_PLT | RESERVE_COPY) != 0 {
            return true;
        }
        if info.reserved & GOT_REL != 0 && !info.is_local() {
            return true;
        }
        crate::target::shared_is_dynamic_symbol(info, config)
    }

    fn emit_section_data(
        &self,
        module: &Module,
        sect: usize,
        plan: &EmitPlan,
    ) -> Result<Option<Vec<u8>>> {
        if Some(sect) == self.got.sect {
            let dynamic = module
                .find_section(".dynamic")
                .map(|i| module.section(i).sect.addr)
                .unwrap_or(0);
            return Ok(Some(self.got.emit(&[dynamic])));
        }
        if Some(sect) == self.plt.gotplt_sect {
            return Ok(Some(self.emit_gotplt(module)));
        }
        if Some(sect) == self.plt.sect {
            return Ok(Some(self.emit_plt(module)));
        }
        if Some(sect) == self.rel_dyn.sect {
            return Ok(Some(crate::target::emit_rel_entries(self.rel_dyn.entries(), module, plan)));
        }
        if Some(sect) == self.rel_plt.sect {
            return Ok(Some(crate::target::emit_rel_entries(self.rel_plt.entries(), module, plan)));
        }
        Ok(None)
    }
}

impl ArmBackend {
    /// GOTPLT slot 0 holds `_DYNAMIC`; slots 1-2 are for the dynamic
    /// linker; lazy slots start out pointing at PLT0.
    fn emit_gotplt(&self, module: &Module) -> Vec<u8> {
        let dynamic = module
            .find_section(".dynamic")
            .map(|i| module.section(i).sect.addr)
            .unwrap_or(0);
        let plt0 = self
            .plt
            .sect
            .map(|i| module.section(i).sect.addr)
            .unwrap_or(0);
        let mut out = Vec::with_capacity(self.plt.gotplt_size() as usize);
        out.extend_from_slice(&dynamic.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        for _ in self.plt.entries() {
            out.extend_from_slice(&plt0.to_le_bytes());
        }
        out.resize(self.plt.gotplt_size() as usize, 0);
        out
    }

    fn emit_plt(&self, module: &Module) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.plt.size() as usize);
        if self.plt.reserved() == 0 {
            return out;
        }
        let plt_addr = self.plt.sect.map(|i| module.section(i).sect.addr).unwrap_or(0);
        let gotplt_addr = self
            .plt
            .gotplt_sect
            .map(|i| module.section(i).sect.addr)
            .unwrap_or(0);

        // PLT0: push lr, load the GOTPLT displacement, jump through slot 2.
        let got_disp = gotplt_addr.wrapping_sub(plt_addr).wrapping_sub(16);
        out.extend_from_slice(&0xe52d_e004u32.to_le_bytes()); // str lr, [sp, #-4]!
        out.extend_from_slice(&0xe59f_e004u32.to_le_bytes()); // ldr lr, [pc, #4]
        out.extend_from_slice(&0xe08f_e00eu32.to_le_bytes()); // add lr, pc, lr
        out.extend_from_slice(&0xe5be_f008u32.to_le_bytes()); // ldr pc, [lr, #8]!
        out.extend_from_slice(&got_disp.to_le_bytes());

        for idx in 0..self.plt.reserved() {
            let entry_addr = plt_addr + self.plt.entry_offset(idx);
            let slot_addr = gotplt_addr + self.plt.gotplt_offset(idx);
            let disp = slot_addr.wrapping_sub(entry_addr).wrapping_sub(12);
            out.extend_from_slice(&0xe59f_c004u32.to_le_bytes()); // ldr ip, [pc, #4]
            out.extend_from_slice(&0xe08f_c00cu32.to_le_bytes()); // add ip, pc, ip
            out.extend_from_slice(&0xe59c_f000u32.to_le_bytes()); // ldr pc, [ip]
            out.extend_from_slice(&disp.to_le_bytes());
        }
        out
    }
}

