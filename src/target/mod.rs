//! Target backends.
//!
//! A [`Backend`] owns the architecture-specific shape of the output: the
//! GOT and PLT, the dynamic relocation sections, the relocation scanning
//! policy, and the relocation applicators. Everything the two supported
//! architectures agree on (preemption, which symbols need dynamic
//! relocations, which land in `.dynsym`, the SysV hash geometry) lives
//! here as shared policy.

pub mod arm;
pub mod mips;

use crate::diag::Result;
use crate::driver::{Config, OutputKind};
use crate::emit::EmitPlan;
use crate::module::Module;
use crate::reloc::Relocation;
use crate::symbols::{ResolveInfo, SymType};

pub trait Backend {
    fn machine(&self) -> u16;
    fn elf_flags(&self) -> u32;
    /// Base virtual address of an executable's image.
    fn text_base(&self) -> u32;
    fn page_size(&self) -> u32;

    /// Create the backend-owned output sections (`.got`, `.rel.dyn`, and
    /// on ARM `.plt`/`.got.plt`/`.rel.plt`). Not called for relocatable
    /// output.
    fn init_target_sections(&mut self, module: &mut Module, config: &Config);

    /// Define the architecture-fixed symbols. Fails if a user symbol
    /// already defined one of the reserved names.
    fn init_target_symbols(&mut self, module: &mut Module, config: &Config) -> Result<()>;

    /// Decide what output reservations one input relocation site induces.
    /// Called once per relocation, before layout.
    fn scan_relocation(
        &mut self,
        reloc: &Relocation,
        module: &mut Module,
        config: &Config,
    ) -> Result<()>;

    /// Freeze the sizes of the backend-owned sections before layout.
    fn pre_layout(&mut self, module: &mut Module, config: &Config) -> Result<()>;

    /// Set symbol values that depend on post-layout addresses.
    fn finalize_target_symbols(&mut self, module: &mut Module, config: &Config);

    /// Apply one relocation. `list` is the realized relocation list the
    /// site belongs to and `index` its position in it (MIPS scans forward
    /// for the paired LO16).
    fn apply_relocation(
        &mut self,
        reloc: &Relocation,
        list: &[Relocation],
        index: usize,
        module: &mut Module,
        config: &Config,
    ) -> Result<()>;

    /// Whether Overflow/BadReloc results terminate immediately (ARM) or
    /// are reported and counted (MIPS).
    fn fatal_reloc_errors(&self) -> bool {
        true
    }

    /// Layout-order override for backend-owned sections.
    fn target_section_order(&self, _name: &str) -> Option<u32> {
        None
    }

    /// A symbol enters `.dynsym` if it came from or is visible to the
    /// dynamic linker. Backends extend this for PLT/GOT-driven cases.
    fn is_dynamic_symbol(&self, info: &ResolveInfo, config: &Config) -> bool {
        shared_is_dynamic_symbol(info, config)
    }

    /// Symbols the MIPS backend requires at the tail of `.dynsym` (global
    /// GOT entries); empty elsewhere.
    fn tail_dynsym_symbols(&self) -> Vec<crate::symbols::SymbolId> {
        Vec::new()
    }

    /// Produce the bytes of a backend-owned section, or `None` if `sect`
    /// is not backend-owned.
    fn emit_section_data(
        &self,
        module: &Module,
        sect: usize,
        plan: &EmitPlan,
    ) -> Result<Option<Vec<u8>>>;
}

pub fn shared_is_dynamic_symbol(info: &ResolveInfo, config: &Config) -> bool {
    if info.is_local() || matches!(info.ty, SymType::Section | SymType::File) {
        return false;
    }
    if info.from_dyn {
        return true;
    }
    config.output == OutputKind::DynObj
        && matches!(info.vis, crate::symbols::Visibility::Default | crate::symbols::Visibility::Protected)
}

/// A symbol is preemptible iff the output is a DynObj and its visibility
/// allows preemption on a non-local binding.
pub fn is_symbol_preemptible(info: &ResolveInfo, config: &Config) -> bool {
    config.output == OutputKind::DynObj
        && !info.is_local()
        && matches!(info.vis, crate::symbols::Visibility::Default | crate::symbols::Visibility::Protected)
}

/// Whether a reference to `info` must be fixed up by the dynamic linker.
/// `is_abs_reloc` marks absolute (address-materializing) relocation types;
/// `has_plt` tells whether the symbol already reserved a PLT entry.
pub fn symbol_needs_dyn_rel(
    info: &ResolveInfo,
    config: &Config,
    is_abs_reloc: bool,
    has_plt: bool,
) -> bool {
    if info.is_absolute() {
        return false;
    }
    if info.is_undef() && config.output == OutputKind::Exec {
        return false;
    }
    if config.output == OutputKind::DynObj && is_abs_reloc {
        return true;
    }
    if has_plt && info.ty == SymType::Func {
        return false;
    }
    is_symbol_preemptible(info, config)
}

/// Serialize dynamic relocation entries as `Elf32_Rel`.
pub(crate) fn emit_rel_entries(
    entries: &[Relocation],
    module: &Module,
    plan: &EmitPlan,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * crate::elf::REL_SIZE);
    for rel in entries {
        let r_offset = module.place(rel.target);
        let sym_idx = rel.sym.map(|s| plan.dynsym_index(s)).unwrap_or(0);
        let r_info = (sym_idx << 8) | (rel.rtype & 0xff);
        out.extend_from_slice(&r_offset.to_le_bytes());
        out.extend_from_slice(&r_info.to_le_bytes());
    }
    out
}

/// Bucket count of the SysV hash table for `symbols` dynamic symbols:
/// the largest entry of the standard ladder not exceeding the count.
pub fn hash_bucket_count(symbols: usize) -> u32 {
    static BUCKETS: &[u32] = &[
        1, 3, 17, 37, 67, 97, 131, 197, 263, 521, 1031, 2053, 4099, 8209, 16411, 32771,
    ];
    let mut result = 1;
    for &b in BUCKETS {
        if (symbols as u32) < b {
            break;
        }
        result = b;
    }
    result
}
