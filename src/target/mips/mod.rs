//! The MIPS (o32, little-endian) backend.
//!
//! MIPS links through the GOT rather than a PLT: call- and data-class
//! GOT relocations reserve global GOT entries, section-relative GOT16
//! sites reserve local entries, and `_gp_disp` anchors the `$gp`-relative
//! addressing convention at GOT + 0x7FF0.

pub mod reloc;

use std::collections::HashSet;

use log::debug;

use crate::diag::{LinkError, Result};
use crate::driver::{Config, OutputKind};
use crate::elf;
use crate::emit::EmitPlan;
use crate::module::Module;
use crate::plt_got::{Got, OutputRelocSection};
use crate::reloc::Relocation;
use crate::sections::{FragmentKind, FragmentRef, SectionKind};
use crate::symbols::{Binding, ResolveInfo, SymDesc, SymType, SymbolId, Visibility};
use crate::target::{symbol_needs_dyn_rel, Backend};

// ── MIPS relocation types ────────────────────────────────────────────────

pub const R_MIPS_NONE: u32 = 0;
pub const R_MIPS_16: u32 = 1;
pub const R_MIPS_32: u32 = 2;
pub const R_MIPS_REL32: u32 = 3;
pub const R_MIPS_26: u32 = 4;
pub const R_MIPS_HI16: u32 = 5;
pub const R_MIPS_LO16: u32 = 6;
pub const R_MIPS_GPREL16: u32 = 7;
pub const R_MIPS_LITERAL: u32 = 8;
pub const R_MIPS_GOT16: u32 = 9;
pub const R_MIPS_PC16: u32 = 10;
pub const R_MIPS_CALL16: u32 = 11;
pub const R_MIPS_GPREL32: u32 = 12;
pub const R_MIPS_SHIFT5: u32 = 16;
pub const R_MIPS_SHIFT6: u32 = 17;
pub const R_MIPS_64: u32 = 18;
pub const R_MIPS_GOT_DISP: u32 = 19;
pub const R_MIPS_GOT_PAGE: u32 = 20;
pub const R_MIPS_GOT_OFST: u32 = 21;
pub const R_MIPS_GOT_HI16: u32 = 22;
pub const R_MIPS_GOT_LO16: u32 = 23;
pub const R_MIPS_SUB: u32 = 24;
pub const R_MIPS_INSERT_A: u32 = 25;
pub const R_MIPS_INSERT_B: u32 = 26;
pub const R_MIPS_DELETE: u32 = 27;
pub const R_MIPS_HIGHER: u32 = 28;
pub const R_MIPS_HIGHEST: u32 = 29;
pub const R_MIPS_CALL_HI16: u32 = 30;
pub const R_MIPS_CALL_LO16: u32 = 31;
pub const R_MIPS_SCN_DISP: u32 = 32;
pub const R_MIPS_REL16: u32 = 33;
pub const R_MIPS_ADD_IMMEDIATE: u32 = 34;
pub const R_MIPS_PJUMP: u32 = 35;
pub const R_MIPS_RELGOT: u32 = 36;
pub const R_MIPS_JALR: u32 = 37;
pub const R_MIPS_TLS_DTPMOD32: u32 = 38;
pub const R_MIPS_TLS_DTPREL32: u32 = 39;
pub const R_MIPS_TLS_DTPMOD64: u32 = 40;
pub const R_MIPS_TLS_DTPREL64: u32 = 41;
pub const R_MIPS_TLS_GD: u32 = 42;
pub const R_MIPS_TLS_LDM: u32 = 43;
pub const R_MIPS_TLS_DTPREL_HI16: u32 = 44;
pub const R_MIPS_TLS_DTPREL_LO16: u32 = 45;
pub const R_MIPS_TLS_GOTTPREL: u32 = 46;
pub const R_MIPS_TLS_TPREL32: u32 = 47;
pub const R_MIPS_TLS_TPREL64: u32 = 48;
pub const R_MIPS_TLS_TPREL_HI16: u32 = 49;
pub const R_MIPS_TLS_TPREL_LO16: u32 = 50;
pub const R_MIPS_GLOB_DAT: u32 = 51;
pub const R_MIPS_COPY: u32 = 126;
pub const R_MIPS_JUMP_SLOT: u32 = 127;

/// The dispatch table covers 0..=51; everything above is unknown.
pub const R_MIPS_TABLE_MAX: u32 = 51;

// ── Reserved-flags bits on ResolveInfo ───────────────────────────────────

pub const RESERVE_REL: u32 = 0x1;
pub const RESERVE_GOT: u32 = 0x2;
pub const RESERVE_GP_DISP: u32 = 0x4;

pub const GP_DISP_NAME: &str = "_gp_disp";
/// `$gp` sits 0x7FF0 past the GOT origin so 16-bit signed displacements
/// span the whole first 64K of the table.
pub const GP_OFFSET: u32 = 0x7FF0;

const BASE_ADDR: u32 = 0x80000;
const PAGE_SIZE: u32 = 0x10000;
/// got[0] is the lazy-resolver slot, got[1] the module pointer marker.
const GOT_HEADER: u32 = 2;

pub struct MipsBackend {
    pub got: Got,
    pub rel_dyn: OutputRelocSection,
    /// Symbols recorded as "local" on the GOT. Membership is bookkeeping:
    /// a local R_MIPS_32 records the symbol here without a slot.
    got_local: HashSet<SymbolId>,
    got_global: HashSet<SymbolId>,
    /// Global GOT symbols in reservation order; they close `.dynsym`.
    global_got_syms: Vec<SymbolId>,
    got_symbol: Option<SymbolId>,
    gp_disp: Option<SymbolId>,
    /// AHL carried from a HI16 to its paired LO16.
    pub(crate) ahl: i32,
}

impl MipsBackend {
    pub fn new() -> MipsBackend {
        MipsBackend {
            got: Got::new(GOT_HEADER),
            rel_dyn: OutputRelocSection::new(),
            got_local: HashSet::new(),
            got_global: HashSet::new(),
            global_got_syms: Vec::new(),
            got_symbol: None,
            gp_disp: None,
            ahl: 0,
        }
    }

    pub fn is_got_local(&self, sym: SymbolId) -> bool {
        self.got_local.contains(&sym)
    }

    pub(crate) fn is_gp_disp(&self, sym: SymbolId) -> bool {
        self.gp_disp == Some(sym)
    }

    /// `$gp` for the output image.
    pub(crate) fn gp(&self, module: &Module) -> u32 {
        let addr = self.got.sect.map(|i| module.section(i).sect.addr).unwrap_or(0);
        addr + GP_OFFSET
    }

    fn scan_local(&mut self, rtype: u32, sym: SymbolId, module: &mut Module, config: &Config) -> Result<()> {
        match rtype {
            R_MIPS_NONE | R_MIPS_16 => {}
            R_MIPS_32 => {
                if config.output == OutputKind::DynObj {
                    self.rel_dyn.reserve_entry();
                    module.pool.get_mut(sym).reserved |= RESERVE_REL;
                    // Recorded as a local GOT symbol without an actual
                    // slot; the apply-time REL32 needs the distinction.
                    self.got_local.insert(sym);
                }
            }
            R_MIPS_GOT16 | R_MIPS_CALL16 => {
                if module.pool.get(sym).ty == SymType::Section {
                    self.got.reserve_entry();
                    self.got_local.insert(sym);
                    return Ok(());
                }
                if module.pool.get(sym).reserved & RESERVE_GOT == 0 {
                    self.got.reserve_entry();
                    module.pool.get_mut(sym).reserved |= RESERVE_GOT;
                    self.got_local.insert(sym);
                }
            }
            R_MIPS_REL32 | R_MIPS_26 | R_MIPS_HI16 | R_MIPS_LO16 | R_MIPS_PC16
            | R_MIPS_SHIFT5 | R_MIPS_SHIFT6 | R_MIPS_64 | R_MIPS_GOT_PAGE | R_MIPS_GOT_OFST
            | R_MIPS_SUB | R_MIPS_INSERT_A | R_MIPS_INSERT_B | R_MIPS_DELETE
            | R_MIPS_HIGHER | R_MIPS_HIGHEST | R_MIPS_SCN_DISP | R_MIPS_REL16
            | R_MIPS_ADD_IMMEDIATE | R_MIPS_PJUMP | R_MIPS_RELGOT | R_MIPS_JALR
            | R_MIPS_GLOB_DAT | R_MIPS_COPY | R_MIPS_JUMP_SLOT => {}
            R_MIPS_GPREL32 | R_MIPS_GPREL16 | R_MIPS_LITERAL => {}
            R_MIPS_GOT_DISP | R_MIPS_GOT_HI16 | R_MIPS_CALL_HI16 | R_MIPS_GOT_LO16
            | R_MIPS_CALL_LO16 => {}
            t if (R_MIPS_TLS_DTPMOD32..=R_MIPS_TLS_TPREL_LO16).contains(&t) => {}
            _ => {
                return Err(LinkError::UnknownRelocation {
                    rtype,
                    symbol: module.pool.get(sym).name.clone(),
                });
            }
        }
        Ok(())
    }

    fn scan_global(
        &mut self,
        rtype: u32,
        sym: SymbolId,
        module: &mut Module,
        config: &Config,
    ) -> Result<()> {
        match rtype {
            R_MIPS_NONE | R_MIPS_INSERT_A | R_MIPS_INSERT_B | R_MIPS_DELETE
            | R_MIPS_TLS_DTPMOD64 | R_MIPS_TLS_DTPREL64 | R_MIPS_REL16
            | R_MIPS_ADD_IMMEDIATE | R_MIPS_PJUMP | R_MIPS_RELGOT
            | R_MIPS_TLS_TPREL64 => {}
            R_MIPS_32 | R_MIPS_64 | R_MIPS_HI16 | R_MIPS_LO16 => {
                let info = module.pool.get(sym);
                if symbol_needs_dyn_rel(info, config, true, false) {
                    self.rel_dyn.reserve_entry();
                    module.pool.get_mut(sym).reserved |= RESERVE_REL;
                    // A global with a REL32 fixup counts as a global GOT
                    // symbol without an actual slot.
                    self.got_global.insert(sym);
                }
            }
            R_MIPS_GOT16 | R_MIPS_CALL16 | R_MIPS_GOT_DISP | R_MIPS_GOT_HI16
            | R_MIPS_CALL_HI16 | R_MIPS_GOT_LO16 | R_MIPS_CALL_LO16 | R_MIPS_GOT_PAGE
            | R_MIPS_GOT_OFST => {
                if module.pool.get(sym).reserved & RESERVE_GOT == 0 {
                    self.got.reserve_entry();
                    module.pool.get_mut(sym).reserved |= RESERVE_GOT;
                    self.global_got_syms.push(sym);
                    self.got_global.insert(sym);
                }
            }
            R_MIPS_LITERAL | R_MIPS_GPREL32 => {
                return Err(LinkError::RelocBadOpcode {
                    name: if rtype == R_MIPS_LITERAL { "R_MIPS_LITERAL" } else { "R_MIPS_GPREL32" },
                    symbol: module.pool.get(sym).name.clone(),
                });
            }
            R_MIPS_GPREL16 | R_MIPS_26 | R_MIPS_PC16 | R_MIPS_16 | R_MIPS_SHIFT5
            | R_MIPS_SHIFT6 | R_MIPS_SUB | R_MIPS_HIGHER | R_MIPS_HIGHEST
            | R_MIPS_SCN_DISP | R_MIPS_REL32 | R_MIPS_JALR => {}
            t if (R_MIPS_TLS_DTPMOD32..=R_MIPS_TLS_TPREL_LO16).contains(&t) => {}
            R_MIPS_COPY | R_MIPS_GLOB_DAT | R_MIPS_JUMP_SLOT => {
                // These belong only in the dynamic output.
                return Err(LinkError::UnsupportedRelocation {
                    name: "dynamic-section relocation in input",
                    symbol: module.pool.get(sym).name.clone(),
                });
            }
            _ => {
                return Err(LinkError::UnknownRelocation {
                    rtype,
                    symbol: module.pool.get(sym).name.clone(),
                });
            }
        }
        Ok(())
    }
}

impl Default for MipsBackend {
    fn default() -> MipsBackend {
        MipsBackend::new()
    }
}

impl Backend for MipsBackend {
    fn machine(&self) -> u16 {
        elf::EM_MIPS
    }

    fn elf_flags(&self) -> u32 {
        elf::EF_MIPS_ARCH_32R2
            | elf::EF_MIPS_NOREORDER
            | elf::EF_MIPS_PIC
            | elf::EF_MIPS_CPIC
            | elf::EF_MIPS_ABI_O32
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
        let rel_dyn = module.get_or_create_section(
            ".rel.dyn",
            SectionKind::Target,
            elf::SHT_REL,
            elf::SHF_ALLOC,
        );
        for idx in [got, rel_dyn] {
            let out = module.section_mut(idx);
            out.sect.align = 4;
            out.data.append(FragmentKind::Target, 1);
        }
        self.got.sect = Some(got);
        self.rel_dyn.sect = Some(rel_dyn);
    }

    /// Both fixed symbols are defined only when some input refers to
    /// them; a user definition of either name is a collision.
    fn init_target_symbols(&mut self, module: &mut Module, _config: &Config) -> Result<()> {
        for name in ["_GLOBAL_OFFSET_TABLE_", GP_DISP_NAME] {
            if let Some(id) = module.pool.lookup(name) {
                if module.pool.get(id).is_define() {
                    return Err(LinkError::ReservedSymbolCollision { symbol: name.into() });
                }
            }
        }

        if let Some(id) = module.pool.lookup("_GLOBAL_OFFSET_TABLE_") {
            let info = module.pool.get_mut(id);
            info.ty = SymType::Object;
            info.desc = SymDesc::Define;
            info.binding = Binding::Local;
            info.vis = Visibility::Hidden;
            self.got_symbol = Some(id);
        }

        if let Some(id) = module.pool.lookup(GP_DISP_NAME) {
            let info = module.pool.get_mut(id);
            info.ty = SymType::Section;
            info.desc = SymDesc::Define;
            info.binding = Binding::Absolute;
            info.vis = Visibility::Default;
            info.reserved |= RESERVE_GP_DISP;
            self.gp_disp = Some(id);
        }
        Ok(())
    }

    fn scan_relocation(
        &mut self,
        reloc: &Relocation,
        module: &mut Module,
        config: &Config,
    ) -> Result<()> {
        let Some(sym) = reloc.sym else { return Ok(()) };
        // References to _gp_disp are a fixed addressing idiom, never a
        // reservation.
        if self.is_gp_disp(sym) {
            return Ok(());
        }
        if !module.section(reloc.target.sect).sect.is_alloc() {
            return Ok(());
        }

        let is_local_path = {
            let info = module.pool.get(sym);
            if info.is_undef() && !info.from_dyn && !info.is_weak() {
                return Err(LinkError::UndefinedReference { symbol: info.name.clone() });
            }
            !info.is_undef() && (info.is_local() || !info.from_dyn)
        };

        if is_local_path {
            self.scan_local(reloc.rtype, sym, module, config)
        } else {
            self.scan_global(reloc.rtype, sym, module, config)
        }
    }

    fn pre_layout(&mut self, module: &mut Module, config: &Config) -> Result<()> {
        let keep_got = self.got.has_entries()
            || config.output == OutputKind::DynObj
            || self.got_symbol.is_some();
        if let Some(got) = self.got.sect {
            module.section_mut(got).sect.size = if keep_got { self.got.size() } else { 0 };
        }
        if let Some(idx) = self.rel_dyn.sect {
            module.section_mut(idx).sect.size = self.rel_dyn.size();
        }
        if let (Some(id), Some(got), true) = (self.got_symbol, self.got.sect, keep_got) {
            module.pool.out_symbol_mut(id).frag = Some(FragmentRef::new(got, 0, 0));
        }
        debug!(
            "mips: got {} (local {}, global {}), rel.dyn {}",
            self.got.reserved(),
            self.got_local.len(),
            self.got_global.len(),
            self.rel_dyn.reserved()
        );
        Ok(())
    }

    fn finalize_target_symbols(&mut self, module: &mut Module, _config: &Config) {
        if let (Some(id), Some(got)) = (self.got_symbol, self.got.sect) {
            let addr = module.section(got).sect.addr;
            module.pool.out_symbol_mut(id).value = addr;
            module.pool.get_mut(id).value = addr;
        }
        if let Some(id) = self.gp_disp {
            let gp = self.gp(module);
            module.pool.out_symbol_mut(id).value = gp;
            module.pool.get_mut(id).value = gp;
        }
    }

    fn apply_relocation(
        &mut self,
        reloc: &Relocation,
        list: &[Relocation],
        index: usize,
        module: &mut Module,
        config: &Config,
    ) -> Result<()> {
        reloc::apply(self, reloc, list, index, module, config)
    }

    /// MIPS relocation failures are reported, counted, and the link
    /// carries on to surface every bad site.
    fn fatal_reloc_errors(&self) -> bool {
        false
    }

    fn target_section_order(&self, name: &str) -> Option<u32> {
        // .got carries $gp-addressed data; keep it with the data sections.
        if name == ".got" {
            Some(400)
        } else {
            None
        }
    }

    fn is_dynamic_symbol(&self, info: &ResolveInfo, config: &Config) -> bool {
        if info.reserved & RESERVE_GOT != 0 && !info.is_local() {
            return true;
        }
        crate::target::shared_is_dynamic_symbol(info, config)
    }

    fn tail_dynsym_symbols(&self) -> Vec<SymbolId> {
        self.global_got_syms.clone()
    }

    fn emit_section_data(
        &self,
        module: &Module,
        sect: usize,
        plan: &EmitPlan,
    ) -> Result<Option<Vec<u8>>> {
        if Some(sect) == self.got.sect {
            // got[0] is the lazy-resolution slot; got[1]'s top bit marks a
            // modern module pointer convention.
            return Ok(Some(self.got.emit(&[0, 0x8000_0000])));
        }
        if Some(sect) == self.rel_dyn.sect {
            return Ok(Some(crate::target::emit_rel_entries(
                self.rel_dyn.entries(),
                module,
                plan,
            )));
        }
        Ok(None)
    }
}
