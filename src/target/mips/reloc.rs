//! MIPS relocation application.
//!
//! The engine carries one register's worth of state: the AHL combined
//! addend, set by every HI16 (and local GOT16) and consumed by the
//! `_gp_disp` LO16 that follows. For ordinary LO16 sites the low half is
//! re-derived from the site's own bytes, so an intervening relocation on
//! another symbol cannot clobber the pairing.

use super::*;
use crate::diag::internal;
use crate::reloc::{signed_overflow, RelocResult};

type Applier =
    fn(&mut MipsBackend, &Relocation, &[Relocation], usize, &mut Module, &Config) -> Result<RelocResult>;

fn lookup(rtype: u32) -> Option<(&'static str, Applier)> {
    if rtype > R_MIPS_TABLE_MAX {
        return None;
    }
    Some(match rtype {
        R_MIPS_NONE => ("R_MIPS_NONE", none),
        R_MIPS_32 => ("R_MIPS_32", abs32),
        R_MIPS_26 => ("R_MIPS_26", rel26),
        R_MIPS_HI16 => ("R_MIPS_HI16", hi16),
        R_MIPS_LO16 => ("R_MIPS_LO16", lo16),
        R_MIPS_GPREL16 => ("R_MIPS_GPREL16", gprel16),
        R_MIPS_GOT16 => ("R_MIPS_GOT16", got16),
        R_MIPS_CALL16 => ("R_MIPS_CALL16", call16),
        R_MIPS_GPREL32 => ("R_MIPS_GPREL32", gprel32),
        R_MIPS_GOT_DISP => ("R_MIPS_GOT_DISP", gotoff),
        R_MIPS_GOT_PAGE => ("R_MIPS_GOT_PAGE", gotoff),
        R_MIPS_GOT_OFST => ("R_MIPS_GOT_OFST", gotoff),
        R_MIPS_GOT_HI16 => ("R_MIPS_GOT_HI16", gotoff),
        R_MIPS_GOT_LO16 => ("R_MIPS_GOT_LO16", gotoff),
        R_MIPS_CALL_HI16 => ("R_MIPS_CALL_HI16", gotoff),
        R_MIPS_CALL_LO16 => ("R_MIPS_CALL_LO16", gotoff),
        // Hint for the assembler's jalr-to-bal optimization; safe to skip.
        R_MIPS_JALR => ("R_MIPS_JALR", none),
        R_MIPS_TLS_DTPMOD32 => ("R_MIPS_TLS_DTPMOD32", unsupport),
        R_MIPS_TLS_DTPREL32 => ("R_MIPS_TLS_DTPREL32", unsupport),
        R_MIPS_TLS_GD => ("R_MIPS_TLS_GD", unsupport),
        R_MIPS_TLS_LDM => ("R_MIPS_TLS_LDM", unsupport),
        R_MIPS_TLS_DTPREL_HI16 => ("R_MIPS_TLS_DTPREL_HI16", unsupport),
        R_MIPS_TLS_DTPREL_LO16 => ("R_MIPS_TLS_DTPREL_LO16", unsupport),
        R_MIPS_TLS_GOTTPREL => ("R_MIPS_TLS_GOTTPREL", unsupport),
        R_MIPS_TLS_TPREL32 => ("R_MIPS_TLS_TPREL32", unsupport),
        R_MIPS_TLS_TPREL_HI16 => ("R_MIPS_TLS_TPREL_HI16", unsupport),
        R_MIPS_TLS_TPREL_LO16 => ("R_MIPS_TLS_TPREL_LO16", unsupport),
        R_MIPS_GLOB_DAT => ("R_MIPS_GLOB_DAT", unsupport),
        _ => ("R_MIPS_UNSUPPORTED", unsupport),
    })
}

pub(super) fn apply(
    backend: &mut MipsBackend,
    reloc: &Relocation,
    list: &[Relocation],
    index: usize,
    module: &mut Module,
    config: &Config,
) -> Result<()> {
    let symbol_name = |module: &Module| {
        reloc
            .sym
            .map(|id| module.pool.get(id).name.clone())
            .unwrap_or_default()
    };
    let (name, func) = lookup(reloc.rtype).ok_or_else(|| LinkError::UnknownRelocation {
        rtype: reloc.rtype,
        symbol: symbol_name(module),
    })?;

    match func(backend, reloc, list, index, module, config)? {
        RelocResult::Ok => Ok(()),
        RelocResult::Overflow => {
            Err(LinkError::RelocOverflow { name, symbol: symbol_name(module) })
        }
        RelocResult::BadReloc => {
            Err(LinkError::RelocBadOpcode { name, symbol: symbol_name(module) })
        }
        RelocResult::Unsupport => {
            Err(LinkError::UnsupportedRelocation { name, symbol: symbol_name(module) })
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

const ENC: crate::elf::DataEncoding = crate::elf::DataEncoding::Little;

fn sym_value(reloc: &Relocation, module: &Module) -> u32 {
    reloc.sym.map(|id| module.pool.out_symbol(id).value).unwrap_or(0)
}

fn read_target(reloc: &Relocation, module: &Module) -> u32 {
    module.read_target_word(reloc.target, ENC)
}

fn write_target(reloc: &Relocation, module: &mut Module, value: u32) -> Result<RelocResult> {
    if module.write_target_word(reloc.target, value, ENC) {
        Ok(RelocResult::Ok)
    } else {
        Err(internal("relocation target outside any region fragment"))
    }
}

/// Patch only the instruction's low half, preserving the opcode word.
fn write_low16(reloc: &Relocation, module: &mut Module, value: i32) -> Result<RelocResult> {
    let word = read_target(reloc, module);
    write_target(reloc, module, (word & 0xffff_0000) | (value as u32 & 0xffff))
}

/// The next R_MIPS_LO16 against the same symbol, in forward order.
fn find_lo16<'a>(
    list: &'a [Relocation],
    index: usize,
    reloc: &Relocation,
) -> Option<&'a Relocation> {
    list[index + 1..]
        .iter()
        .find(|r| r.rtype == R_MIPS_LO16 && r.sym == reloc.sym)
}

/// AHL of a HI16/LO16 pair: the combined 32-bit addend, rebuilt from the
/// two halves plus the LO16's explicit addend.
fn calc_ahl(hi_word: u32, lo_word: u32, lo_addend: i32) -> i32 {
    let ahi = hi_word as i32;
    let alo = lo_word as i32;
    ((ahi & 0xffff) << 16) + (alo & 0xffff) as u16 as i16 as i32 + lo_addend
}

/// Claim (and on first use initialize) a GOT entry for the symbol.
fn helper_got_entry(
    backend: &mut MipsBackend,
    reloc: &Relocation,
    module: &Module,
) -> Result<usize> {
    let sym = reloc.sym.ok_or_else(|| internal("GOT relocation without a symbol"))?;
    let (idx, exist) = backend.got.entry(sym)?;
    if !exist {
        let info = module.pool.get(sym);
        if !(backend.is_got_local(sym) && info.ty == SymType::Section) {
            if info.reserved & RESERVE_GOT != 0 {
                backend.got.set_content(idx, sym_value(reloc, module));
            } else {
                return Err(internal("reserved entry number mismatch in GOT"));
            }
        }
    }
    Ok(idx)
}

/// `G`: the GOT offset of the symbol's entry relative to `$gp`.
fn helper_got_offset(
    backend: &mut MipsBackend,
    reloc: &Relocation,
    module: &Module,
) -> Result<i32> {
    let idx = helper_got_entry(backend, reloc, module)?;
    Ok(backend.got.entry_offset(idx) as i32 - GP_OFFSET as i32)
}

/// Claim a `.rel.dyn` slot of type R_MIPS_REL32 for this place and patch
/// the stored word: a local target keeps `A + S` for the R_MIPS_REL32
/// base adjustment, a global target keeps only `A` for the dynamic
/// linker to resolve.
fn helper_dyn_rel(
    backend: &mut MipsBackend,
    reloc: &Relocation,
    module: &mut Module,
) -> Result<RelocResult> {
    let sym = reloc.sym.ok_or_else(|| internal("dynamic relocation without a symbol"))?;
    let a = read_target(reloc, module).wrapping_add(reloc.addend as u32);
    let s = sym_value(reloc, module);

    let local = backend.is_got_local(sym);
    let (entry, _) = backend.rel_dyn.entry(sym, false)?;
    entry.rtype = R_MIPS_REL32;
    entry.target = reloc.target;
    if local {
        entry.sym = None;
        write_target(reloc, module, a.wrapping_add(s))
    } else {
        entry.sym = Some(sym);
        write_target(reloc, module, a)
    }
}

// ── Applicators ──────────────────────────────────────────────────────────

fn none(
    _backend: &mut MipsBackend,
    _reloc: &Relocation,
    _list: &[Relocation],
    _index: usize,
    _module: &mut Module,
    _config: &Config,
) -> Result<RelocResult> {
    Ok(RelocResult::Ok)
}

fn unsupport(
    _backend: &mut MipsBackend,
    _reloc: &Relocation,
    _list: &[Relocation],
    _index: usize,
    _module: &mut Module,
    _config: &Config,
) -> Result<RelocResult> {
    Ok(RelocResult::Unsupport)
}

// R_MIPS_32: S + A, or an R_MIPS_REL32 handed to the dynamic linker.
fn abs32(
    backend: &mut MipsBackend,
    reloc: &Relocation,
    _list: &[Relocation],
    _index: usize,
    module: &mut Module,
    _config: &Config,
) -> Result<RelocResult> {
    // Only scanned (allocated) sections carry reservations; a word in a
    // debug section takes the link-time value.
    let in_alloc = module.section(reloc.target.sect).sect.is_alloc();
    if let Some(sym) = reloc.sym {
        if in_alloc && module.pool.get(sym).reserved & RESERVE_REL != 0 {
            return helper_dyn_rel(backend, reloc, module);
        }
    }
    let a = read_target(reloc, module).wrapping_add(reloc.addend as u32);
    let s = sym_value(reloc, module);
    write_target(reloc, module, s.wrapping_add(a))
}

// R_MIPS_26: jump target within the current 256MB window.
fn rel26(
    _backend: &mut MipsBackend,
    reloc: &Relocation,
    _list: &[Relocation],
    _index: usize,
    module: &mut Module,
    _config: &Config,
) -> Result<RelocResult> {
    let word = read_target(reloc, module);
    let p = module.place(reloc.target);
    let s = sym_value(reloc, module);
    let local = reloc
        .sym
        .map(|id| module.pool.get(id).is_local())
        .unwrap_or(true);

    let a26 = (word & 0x03ff_ffff).wrapping_add(reloc.addend as u32);
    let x = if local {
        ((a26 << 2) | (p & 0xf000_0000)).wrapping_add(s) >> 2
    } else {
        (crate::reloc::sign_extend(a26 << 2, 28).wrapping_add(s)) >> 2
    };
    write_target(reloc, module, (word & 0xfc00_0000) | (x & 0x03ff_ffff))
}

// R_MIPS_HI16:
//   local/external: ((AHL + S) - (short)(AHL + S)) >> 16
//   _gp_disp      : ((AHL + GP - P) - (short)(AHL + GP - P)) >> 16
fn hi16(
    backend: &mut MipsBackend,
    reloc: &Relocation,
    list: &[Relocation],
    index: usize,
    module: &mut Module,
    _config: &Config,
) -> Result<RelocResult> {
    let lo = find_lo16(list, index, reloc).ok_or_else(|| LinkError::MissingPairedLo16 {
        symbol: reloc
            .sym
            .map(|id| module.pool.get(id).name.clone())
            .unwrap_or_default(),
    })?;
    let hi_word = read_target(reloc, module);
    let lo_word = read_target(lo, module);
    let ahl = calc_ahl(hi_word, lo_word, lo.addend);
    backend.ahl = ahl;

    let res = if reloc.sym.map(|s| backend.is_gp_disp(s)).unwrap_or(false) {
        let p = module.place(reloc.target) as i32;
        let gp = backend.gp(module) as i32;
        let v = ahl.wrapping_add(gp).wrapping_sub(p);
        (v.wrapping_sub(v as i16 as i32)) >> 16
    } else {
        let s = sym_value(reloc, module) as i32;
        let v = ahl.wrapping_add(s);
        (v.wrapping_sub(v as i16 as i32)) >> 16
    };
    write_low16(reloc, module, res)
}

// R_MIPS_LO16:
//   local/external: AHL + S  (the low half re-derived on site)
//   _gp_disp      : AHL + GP - P + 4
fn lo16(
    backend: &mut MipsBackend,
    reloc: &Relocation,
    _list: &[Relocation],
    _index: usize,
    module: &mut Module,
    _config: &Config,
) -> Result<RelocResult> {
    let res = if reloc.sym.map(|s| backend.is_gp_disp(s)).unwrap_or(false) {
        let p = module.place(reloc.target) as i32;
        let gp = backend.gp(module) as i32;
        backend.ahl.wrapping_add(gp).wrapping_sub(p).wrapping_add(4)
    } else {
        // The engine's AHL may belong to another pair by now; the low
        // part only needs this site's own bytes.
        let word = read_target(reloc, module);
        let alo = (word & 0xffff) as u16 as i16 as i32 + reloc.addend;
        let s = sym_value(reloc, module) as i32;
        alo.wrapping_add(s)
    };
    write_low16(reloc, module, res)
}

// R_MIPS_GOT16: G, with the high page value parked in the GOT for local
// (section) symbols.
fn got16(
    backend: &mut MipsBackend,
    reloc: &Relocation,
    list: &[Relocation],
    index: usize,
    module: &mut Module,
    _config: &Config,
) -> Result<RelocResult> {
    let sym = reloc.sym.ok_or_else(|| internal("R_MIPS_GOT16 without a symbol"))?;
    let g = if module.pool.get(sym).is_local() {
        let lo = find_lo16(list, index, reloc).ok_or_else(|| LinkError::MissingPairedLo16 {
            symbol: module.pool.get(sym).name.clone(),
        })?;
        let hi_word = read_target(reloc, module);
        let lo_word = read_target(lo, module);
        let ahl = calc_ahl(hi_word, lo_word, lo.addend);
        backend.ahl = ahl;

        let s = sym_value(reloc, module) as i32;
        let page = (ahl.wrapping_add(s).wrapping_add(0x8000) as u32) & 0xffff_0000;
        let idx = helper_got_entry(backend, reloc, module)?;
        backend.got.set_content(idx, page);
        backend.got.entry_offset(idx) as i32 - GP_OFFSET as i32
    } else {
        helper_got_offset(backend, reloc, module)?
    };
    write_low16(reloc, module, g)
}

// R_MIPS_CALL16 and the GOT_*/CALL_* family: G
fn call16(
    backend: &mut MipsBackend,
    reloc: &Relocation,
    _list: &[Relocation],
    _index: usize,
    module: &mut Module,
    _config: &Config,
) -> Result<RelocResult> {
    let g = helper_got_offset(backend, reloc, module)?;
    write_low16(reloc, module, g)
}

fn gotoff(
    backend: &mut MipsBackend,
    reloc: &Relocation,
    list: &[Relocation],
    index: usize,
    module: &mut Module,
    config: &Config,
) -> Result<RelocResult> {
    call16(backend, reloc, list, index, module, config)
}

// R_MIPS_GPREL16: A + S + GP0 - GP (GP0 assumed zero)
fn gprel16(
    backend: &mut MipsBackend,
    reloc: &Relocation,
    _list: &[Relocation],
    _index: usize,
    module: &mut Module,
    _config: &Config,
) -> Result<RelocResult> {
    let word = read_target(reloc, module);
    let a = (word & 0xffff) as u16 as i16 as i32 + reloc.addend;
    let s = sym_value(reloc, module) as i32;
    let gp = backend.gp(module) as i32;
    let res = a.wrapping_add(s).wrapping_sub(gp);
    if signed_overflow(res as u32, 16) {
        return Ok(RelocResult::Overflow);
    }
    write_low16(reloc, module, res)
}

// R_MIPS_GPREL32: A + S + GP0 - GP (GP0 assumed zero; llvm emits no
// SHT_MIPS_REGINFO to say otherwise)
fn gprel32(
    backend: &mut MipsBackend,
    reloc: &Relocation,
    _list: &[Relocation],
    _index: usize,
    module: &mut Module,
    _config: &Config,
) -> Result<RelocResult> {
    let a = read_target(reloc, module).wrapping_add(reloc.addend as u32) as i32;
    let s = sym_value(reloc, module) as i32;
    let gp = backend.gp(module) as i32;
    write_target(reloc, module, a.wrapping_add(s).wrapping_sub(gp) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Target;
    use crate::resolver;
    use crate::sections::FragmentKind;

    fn config() -> Config {
        Config { target: Target::Mipsel, output: OutputKind::Exec, ..Config::default() }
    }

    fn module_with_text(words: &[u32], addr: u32) -> (Module, usize) {
        let mut module = Module::new("out");
        let text = module.get_or_create_section(
            ".text",
            SectionKind::Regular,
            elf::SHT_PROGBITS,
            elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        );
        let mut bytes = Vec::new();
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        let out = module.section_mut(text);
        out.data.append(FragmentKind::Region(bytes), 4);
        out.sect.size = out.data.size();
        out.sect.addr = addr;
        (module, text)
    }

    fn define_global(module: &mut Module, name: &str, value: u32) -> SymbolId {
        let mut info = ResolveInfo::new(name);
        info.binding = Binding::Global;
        info.desc = SymDesc::Define;
        info.value = value;
        let (id, _) = resolver::resolve(&mut module.pool, info).unwrap();
        module.pool.out_symbol_mut(id).value = value;
        id
    }

    fn read(module: &Module, sect: usize, off: u32) -> u32 {
        module.section(sect).data.read_word(off, ENC)
    }

    #[test]
    fn test_hi16_lo16_pair() {
        // S3: S = 0x00400800, HI = lui (0x3C080000), LO = addiu
        // (0x25080000). HI gets 0x0040, LO gets 0x0800.
        let (mut module, text) = module_with_text(&[0x3C08_0000, 0x2508_0000], 0);
        let sym = define_global(&mut module, "data", 0x0040_0800);
        let mut backend = MipsBackend::new();

        let list = vec![
            Relocation::new(R_MIPS_HI16, Some(sym), FragmentRef::new(text, 0, 0), 0),
            Relocation::new(R_MIPS_LO16, Some(sym), FragmentRef::new(text, 0, 4), 0),
        ];
        for (i, reloc) in list.iter().enumerate() {
            apply(&mut backend, reloc, &list, i, &mut module, &config()).unwrap();
        }
        assert_eq!(read(&module, text, 0), 0x3C08_0040);
        assert_eq!(read(&module, text, 4), 0x2508_0800);
    }

    #[test]
    fn test_hi16_carry_propagates() {
        // S = 0x0040_8800: low half 0x8800 is negative as i16, so the
        // high half must carry: HI16 = 0x0041.
        let (mut module, text) = module_with_text(&[0x3C08_0000, 0x2508_0000], 0);
        let sym = define_global(&mut module, "data", 0x0040_8800);
        let mut backend = MipsBackend::new();
        let list = vec![
            Relocation::new(R_MIPS_HI16, Some(sym), FragmentRef::new(text, 0, 0), 0),
            Relocation::new(R_MIPS_LO16, Some(sym), FragmentRef::new(text, 0, 4), 0),
        ];
        for (i, reloc) in list.iter().enumerate() {
            apply(&mut backend, reloc, &list, i, &mut module, &config()).unwrap();
        }
        assert_eq!(read(&module, text, 0), 0x3C08_0041);
        assert_eq!(read(&module, text, 4), 0x2508_8800);
    }

    #[test]
    fn test_hi16_without_lo16_fails() {
        let (mut module, text) = module_with_text(&[0x3C08_0000], 0);
        let sym = define_global(&mut module, "data", 0x1000);
        let mut backend = MipsBackend::new();
        let list =
            vec![Relocation::new(R_MIPS_HI16, Some(sym), FragmentRef::new(text, 0, 0), 0)];
        assert!(matches!(
            apply(&mut backend, &list[0], &list, 0, &mut module, &config()),
            Err(LinkError::MissingPairedLo16 { .. })
        ));
    }

    #[test]
    fn test_got16_external() {
        // S4: a global with a reserved GOT slot landing at offset 16 from
        // the GOT base: G = 16 - 0x7FF0, low half 0x8010.
        let (mut module, text) = module_with_text(&[0x8F99_0000], 0);
        let mut backend = MipsBackend::new();
        let cfg = Config { target: Target::Mipsel, output: OutputKind::DynObj, ..Config::default() };
        backend.init_target_sections(&mut module, &cfg);

        // Two earlier symbols occupy slots 2 and 3 (after the two header
        // slots); the third claim sits at byte offset 16.
        for name in ["a", "b"] {
            let id = define_global(&mut module, name, 0);
            module.pool.get_mut(id).reserved |= RESERVE_GOT;
            backend.got.reserve_entry();
            backend.got.entry(id).unwrap();
        }
        let sym = define_global(&mut module, "callee", 0x1234);
        module.pool.get_mut(sym).reserved |= RESERVE_GOT;
        backend.got.reserve_entry();

        let list = vec![Relocation::new(R_MIPS_GOT16, Some(sym), FragmentRef::new(text, 0, 0), 0)];
        apply(&mut backend, &list[0], &list, 0, &mut module, &config()).unwrap();

        assert_eq!(backend.got.entry_offset(2), 16);
        assert_eq!(read(&module, text, 0) & 0xffff, 0x8010);
        assert_eq!(read(&module, text, 0) & 0xffff_0000, 0x8F99_0000);
    }

    #[test]
    fn test_got16_claims_slot_once() {
        let (mut module, text) = module_with_text(&[0x8F99_0000, 0x8F99_0000], 0);
        let mut backend = MipsBackend::new();
        let cfg = config();
        backend.init_target_sections(&mut module, &cfg);
        let sym = define_global(&mut module, "callee", 0);
        module.pool.get_mut(sym).reserved |= RESERVE_GOT;
        backend.got.reserve_entry();

        let list = vec![
            Relocation::new(R_MIPS_CALL16, Some(sym), FragmentRef::new(text, 0, 0), 0),
            Relocation::new(R_MIPS_CALL16, Some(sym), FragmentRef::new(text, 0, 4), 0),
        ];
        for (i, reloc) in list.iter().enumerate() {
            apply(&mut backend, reloc, &list, i, &mut module, &cfg).unwrap();
        }
        // both sites see the same slot, and only one was claimed
        assert_eq!(read(&module, text, 0), read(&module, text, 4));
    }

    #[test]
    fn test_abs32_with_dyn_rel_global() {
        let (mut module, text) = module_with_text(&[0x0000_0010], 0x100);
        let mut backend = MipsBackend::new();
        let cfg = Config { target: Target::Mipsel, output: OutputKind::DynObj, ..Config::default() };
        backend.init_target_sections(&mut module, &cfg);
        let sym = define_global(&mut module, "g", 0x2000);
        module.pool.get_mut(sym).reserved |= RESERVE_REL;
        backend.rel_dyn.reserve_entry();

        let list = vec![Relocation::new(R_MIPS_32, Some(sym), FragmentRef::new(text, 0, 0), 0)];
        apply(&mut backend, &list[0], &list, 0, &mut module, &cfg).unwrap();

        // Global: the place keeps only the addend; the runtime adds S.
        assert_eq!(read(&module, text, 0), 0x10);
        let entries = backend.rel_dyn.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].rtype, R_MIPS_REL32);
        assert_eq!(entries[0].sym, Some(sym));
    }

    #[test]
    fn test_abs32_with_dyn_rel_local() {
        let (mut module, text) = module_with_text(&[0x0000_0010], 0x100);
        let mut backend = MipsBackend::new();
        let cfg = Config { target: Target::Mipsel, output: OutputKind::DynObj, ..Config::default() };
        backend.init_target_sections(&mut module, &cfg);

        let mut info = ResolveInfo::new("");
        info.binding = Binding::Local;
        info.desc = SymDesc::Define;
        info.ty = SymType::Section;
        let sym = module.pool.push_local(info);
        module.pool.out_symbol_mut(sym).value = 0x2000;
        module.pool.get_mut(sym).reserved |= RESERVE_REL;
        backend.got_local.insert(sym);
        backend.rel_dyn.reserve_entry();

        let list = vec![Relocation::new(R_MIPS_32, Some(sym), FragmentRef::new(text, 0, 0), 0)];
        apply(&mut backend, &list[0], &list, 0, &mut module, &cfg).unwrap();

        // Local: the place keeps A + S; the runtime only rebases.
        assert_eq!(read(&module, text, 0), 0x2010);
        assert_eq!(backend.rel_dyn.entries()[0].sym, None);
    }

    #[test]
    fn test_gp_disp_pair() {
        // lui/addiu against _gp_disp at P = 0x400000, GOT at 0x410000:
        // the pair must materialize GP - P (plus the +4 LO bias).
        let (mut module, text) = module_with_text(&[0x3C1C_0000, 0x279C_0000], 0x40_0000);
        let mut backend = MipsBackend::new();
        let cfg = Config { target: Target::Mipsel, output: OutputKind::Exec, ..Config::default() };
        backend.init_target_sections(&mut module, &cfg);
        module.pool.intern(GP_DISP_NAME); // an input referenced it
        backend.init_target_symbols(&mut module, &cfg).unwrap();
        let got_sect = backend.got.sect.unwrap();
        module.section_mut(got_sect).sect.addr = 0x41_0000;
        let gp_disp = module.pool.lookup(GP_DISP_NAME).unwrap();

        let list = vec![
            Relocation::new(R_MIPS_HI16, Some(gp_disp), FragmentRef::new(text, 0, 0), 0),
            Relocation::new(R_MIPS_LO16, Some(gp_disp), FragmentRef::new(text, 0, 4), 0),
        ];
        for (i, reloc) in list.iter().enumerate() {
            apply(&mut backend, reloc, &list, i, &mut module, &cfg).unwrap();
        }

        let gp = 0x41_0000 + GP_OFFSET;
        let hi = read(&module, text, 0) & 0xffff;
        let lo = read(&module, text, 4) & 0xffff;
        let rebuilt = (hi << 16).wrapping_add(lo as u16 as i16 as i32 as u32);
        // HI pairs against P of the lui, LO against P of the addiu (+4).
        assert_eq!(rebuilt, gp - 0x40_0000);
    }

    #[test]
    fn test_gprel32() {
        let (mut module, text) = module_with_text(&[0x0000_0100], 0);
        let mut backend = MipsBackend::new();
        let cfg = config();
        backend.init_target_sections(&mut module, &cfg);
        let got_sect = backend.got.sect.unwrap();
        module.section_mut(got_sect).sect.addr = 0x1_0000;
        let sym = define_global(&mut module, "sdata_sym", 0x2_0000);

        let list = vec![Relocation::new(R_MIPS_GPREL32, Some(sym), FragmentRef::new(text, 0, 0), 0)];
        apply(&mut backend, &list[0], &list, 0, &mut module, &cfg).unwrap();
        let gp = 0x1_0000 + GP_OFFSET;
        assert_eq!(read(&module, text, 0), (0x100 + 0x2_0000 - gp as i32) as u32);
    }

    #[test]
    fn test_tls_unsupported() {
        let (mut module, text) = module_with_text(&[0], 0);
        let sym = define_global(&mut module, "tls_var", 0);
        let mut backend = MipsBackend::new();
        let list = vec![Relocation::new(R_MIPS_TLS_GD, Some(sym), FragmentRef::new(text, 0, 0), 0)];
        assert!(matches!(
            apply(&mut backend, &list[0], &list, 0, &mut module, &config()),
            Err(LinkError::UnsupportedRelocation { .. })
        ));
    }
}
