//! ARM relocation application.
//!
//! One applicator per relocation type, dispatched over the documented id
//! range 0..=130; ids in the reserved gaps map to the explicit
//! `unsupport` cell and anything above the range is a fatal unknown
//! relocation. All failures are fatal on ARM.

use super::*;
use crate::reloc::{bit_select, sign_extend, signed_overflow, RelocResult};

type Applier = fn(&mut ArmBackend, &Relocation, &mut Module, &Config) -> Result<RelocResult>;

/// Dispatch cell for one relocation type.
fn lookup(rtype: u32) -> Option<(&'static str, Applier)> {
    if rtype > R_ARM_MAX_DOCUMENTED {
        return None;
    }
    Some(match rtype {
        R_ARM_NONE => ("R_ARM_NONE", none),
        R_ARM_PC24 => ("R_ARM_PC24", call),
        R_ARM_ABS32 => ("R_ARM_ABS32", abs32),
        R_ARM_REL32 => ("R_ARM_REL32", rel32),
        R_ARM_THM_CALL => ("R_ARM_THM_CALL", thm_call),
        R_ARM_TLS_DTPMOD32 => ("R_ARM_TLS_DTPMOD32", tls),
        R_ARM_TLS_DTPOFF32 => ("R_ARM_TLS_DTPOFF32", tls),
        R_ARM_TLS_TPOFF32 => ("R_ARM_TLS_TPOFF32", tls),
        R_ARM_GOTOFF32 => ("R_ARM_GOTOFF32", gotoff32),
        R_ARM_GOT_BREL => ("R_ARM_GOT_BREL", got_brel),
        R_ARM_PLT32 => ("R_ARM_PLT32", call),
        R_ARM_CALL => ("R_ARM_CALL", call),
        R_ARM_JUMP24 => ("R_ARM_JUMP24", call),
        R_ARM_THM_JUMP24 => ("R_ARM_THM_JUMP24", thm_call),
        R_ARM_TARGET1 => ("R_ARM_TARGET1", abs32),
        R_ARM_V4BX => ("R_ARM_V4BX", none),
        R_ARM_PREL31 => ("R_ARM_PREL31", prel31),
        R_ARM_MOVW_ABS_NC => ("R_ARM_MOVW_ABS_NC", movw_abs_nc),
        R_ARM_MOVT_ABS => ("R_ARM_MOVT_ABS", movt_abs),
        R_ARM_MOVW_PREL_NC => ("R_ARM_MOVW_PREL_NC", movw_prel_nc),
        R_ARM_MOVT_PREL => ("R_ARM_MOVT_PREL", movt_prel),
        R_ARM_THM_MOVW_ABS_NC => ("R_ARM_THM_MOVW_ABS_NC", thm_movw_abs_nc),
        R_ARM_THM_MOVT_ABS => ("R_ARM_THM_MOVT_ABS", thm_movt_abs),
        R_ARM_THM_MOVW_PREL_NC => ("R_ARM_THM_MOVW_PREL_NC", thm_movw_prel_nc),
        R_ARM_THM_MOVT_PREL => ("R_ARM_THM_MOVT_PREL", thm_movt_prel),
        R_ARM_TLS_GD32 => ("R_ARM_TLS_GD32", tls),
        R_ARM_TLS_LDM32 => ("R_ARM_TLS_LDM32", tls),
        R_ARM_TLS_LDO32 => ("R_ARM_TLS_LDO32", tls),
        R_ARM_TLS_IE32 => ("R_ARM_TLS_IE32", tls),
        R_ARM_TLS_LE32 => ("R_ARM_TLS_LE32", tls),
        // Everything else inside the documented range is an explicit
        // unsupported cell.
        _ => ("R_ARM_UNSUPPORTED", unsupport),
    })
}

pub(super) fn apply(
    backend: &mut ArmBackend,
    reloc: &Relocation,
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

    match func(backend, reloc, module, config)? {
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

/// The Thumb bit: set iff the symbol is defined, a function, and its
/// value has bit 0 set.
fn thumb_bit(reloc: &Relocation, module: &Module) -> u32 {
    let Some(sym) = reloc.sym else { return 0 };
    let info = module.pool.get(sym);
    let set = info.desc != SymDesc::Undefined
        && info.ty == SymType::Func
        && module.pool.out_symbol(sym).value & 0x1 != 0;
    set as u32
}

fn sym_value(reloc: &Relocation, module: &Module) -> u32 {
    reloc.sym.map(|id| module.pool.out_symbol(id).value).unwrap_or(0)
}

fn reserved(reloc: &Relocation, module: &Module) -> u32 {
    reloc.sym.map(|id| module.pool.get(id).reserved).unwrap_or(0)
}

fn read_target(reloc: &Relocation, module: &Module) -> u32 {
    module.read_target_word(reloc.target, crate::elf::DataEncoding::Little)
}

fn write_target(reloc: &Relocation, module: &mut Module, value: u32) -> Result<RelocResult> {
    if module.write_target_word(reloc.target, value, crate::elf::DataEncoding::Little) {
        Ok(RelocResult::Ok)
    } else {
        Err(internal("relocation target outside any region fragment"))
    }
}

fn got_origin(backend: &ArmBackend, module: &Module) -> u32 {
    backend.got.sect.map(|i| module.section(i).sect.addr).unwrap_or(0)
}

fn plt_symbol(reloc: &Relocation) -> Result<SymbolId> {
    reloc.sym.ok_or_else(|| internal("PLT relocation without a symbol"))
}

/// Whether the dynamic fixup for this symbol may be the symbol-less
/// `R_ARM_RELATIVE` form.
fn use_relative_reloc(sym: SymbolId, module: &Module, config: &Config) -> bool {
    let info = module.pool.get(sym);
    !(info.from_dyn || info.is_undef() || is_symbol_preemptible(info, config))
}

/// Claim (and on first use initialize) the symbol's PLT entry; returns
/// the entry's runtime address.
fn helper_plt(backend: &mut ArmBackend, sym: SymbolId, module: &mut Module) -> Result<u32> {
    let (idx, exist) = backend.plt.entry(sym)?;
    if !exist {
        if module.pool.get(sym).reserved & RESERVE_PLT == 0 {
            return Err(internal("no PLT entry reserved for PLT type relocation"));
        }
        let (gotplt_idx, _) = backend.plt.gotplt_entry(sym)?;
        let gotplt_sect = backend
            .plt
            .gotplt_sect
            .ok_or_else(|| internal("PLT without a .got.plt section"))?;
        let (entry, exist) = backend.rel_plt.entry(sym, true)?;
        if exist {
            return Err(internal("PLT entry not exist, but DynRel entry exist"));
        }
        entry.rtype = R_ARM_JUMP_SLOT;
        entry.sym = Some(sym);
        entry.target =
            FragmentRef::new(gotplt_sect, 0, backend.plt.gotplt_offset(gotplt_idx));
    }
    let plt_addr = backend
        .plt
        .sect
        .map(|i| module.section(i).sect.addr)
        .unwrap_or(0);
    Ok(plt_addr + backend.plt.entry_offset(idx))
}

/// Claim (and on first use initialize) the symbol's GOT entry; returns
/// the entry's runtime address.
fn helper_got(
    backend: &mut ArmBackend,
    reloc: &Relocation,
    module: &mut Module,
    config: &Config,
) -> Result<u32> {
    let sym = reloc.sym.ok_or_else(|| internal("GOT relocation without a symbol"))?;
    let got_sect = backend.got.sect.ok_or_else(|| internal("GOT not initialized"))?;
    let (idx, exist) = backend.got.entry(sym)?;
    if !exist {
        let flags = module.pool.get(sym).reserved;
        if flags & RESERVE_GOT != 0 {
            // No dynamic fixup: the entry holds the link-time value.
            backend.got.set_content(idx, sym_value(reloc, module));
        } else if flags & GOT_REL != 0 {
            let target = FragmentRef::new(got_sect, 0, backend.got.entry_offset(idx));
            let relative = module.pool.get(sym).is_local()
                || use_relative_reloc(sym, module, config);
            let content = if relative { sym_value(reloc, module) } else { 0 };
            backend.got.set_content(idx, content);
            let (entry, exist) = backend.rel_dyn.entry(sym, true)?;
            if exist {
                return Err(internal("GOT entry not exist, but DynRel entry exist"));
            }
            if relative {
                entry.rtype = R_ARM_RELATIVE;
                entry.sym = None;
            } else {
                entry.rtype = R_ARM_GLOB_DAT;
                entry.sym = Some(sym);
            }
            entry.target = target;
        } else {
            return Err(internal("no GOT entry reserved for GOT type relocation"));
        }
    }
    Ok(got_origin(backend, module) + backend.got.entry_offset(idx))
}

/// Claim a fresh `.rel.dyn` slot aimed at the relocation's own place.
fn helper_dyn_rel(
    backend: &mut ArmBackend,
    reloc: &Relocation,
    rtype: u32,
) -> Result<()> {
    let sym = if rtype == R_ARM_RELATIVE { None } else { reloc.sym };
    let (entry, _) = backend.rel_dyn.entry(reloc.sym.unwrap_or(0), false)?;
    entry.rtype = rtype;
    entry.sym = sym;
    entry.target = reloc.target;
    Ok(())
}

fn is_weak_undef_without_plt(reloc: &Relocation, module: &Module) -> bool {
    let Some(sym) = reloc.sym else { return false };
    let info = module.pool.get(sym);
    info.is_weak() && info.is_undef() && info.reserved & RESERVE_PLT == 0
}

// MOVW/MOVT immediates sit in a split field: imm16 = [19:16][11:0].
fn movw_movt_addend(target: u32) -> u32 {
    sign_extend(((target >> 4) & 0xf000) | (target & 0xfff), 16)
}

fn insert_movw_movt(target: u32, imm: u32) -> u32 {
    (target & 0xfff0_f000) | (imm & 0x0fff) | ((imm & 0xf000) << 4)
}

// Thumb2 MOVW/MOVT, stored as two LE halfwords (upper in the low bits of
// the read word, like the BL pair):
//   upper: 11110 i 10.x.. imm4    lower: 0 imm3 Rd imm8
// imm16 = imm4:i:imm3:imm8.
fn thumb_movw_movt_addend(target: u32) -> u32 {
    let upper = target & 0xffff;
    let lower = target >> 16;
    sign_extend(
        ((upper & 0xf) << 12) | (((upper >> 10) & 1) << 11) | (((lower >> 12) & 0x7) << 8)
            | (lower & 0xff),
        16,
    )
}

fn insert_thumb_movw_movt(target: u32, imm: u32) -> u32 {
    let upper = target & 0xffff;
    let lower = target >> 16;
    let new_upper = (upper & 0xfbf0) | (((imm >> 11) & 1) << 10) | ((imm >> 12) & 0xf);
    let new_lower = (lower & 0x8f00) | (((imm >> 8) & 0x7) << 12) | (imm & 0xff);
    (new_lower << 16) | new_upper
}

/// Decode the 25-bit branch offset of a Thumb2 BL/BLX pair
/// (`S:I1:I2:imm10:imm11:0`, I1 = !(J1^S), I2 = !(J2^S)).
fn thumb32_branch_offset(upper16: u32, lower16: u32) -> u32 {
    let s = (upper16 >> 10) & 1;
    let u = upper16 & 0x3ff;
    let l = lower16 & 0x7ff;
    let j1 = (lower16 >> 13) & 1;
    let j2 = (lower16 >> 11) & 1;
    let i1 = if j1 ^ s != 0 { 0 } else { 1 };
    let i2 = if j2 ^ s != 0 { 0 } else { 1 };
    sign_extend((s << 24) | (i1 << 23) | (i2 << 22) | (u << 12) | (l << 1), 25)
}

fn thumb32_branch_upper(upper16: u32, offset: u32) -> u32 {
    let sign = (offset >> 31) & 1;
    (upper16 & !0x7ff) | ((offset >> 12) & 0x3ff) | (sign << 10)
}

fn thumb32_branch_lower(lower16: u32, offset: u32) -> u32 {
    let sign = (offset >> 31) & 1;
    let i1 = (offset >> 23) & 1;
    let i2 = (offset >> 22) & 1;
    let j1 = (i1 ^ sign) ^ 1;
    let j2 = (i2 ^ sign) ^ 1;
    (lower16 & 0xd000) | (j1 << 13) | (j2 << 11) | ((offset >> 1) & 0x7ff)
}

// ── Applicators ──────────────────────────────────────────────────────────

fn none(
    _backend: &mut ArmBackend,
    _reloc: &Relocation,
    _module: &mut Module,
    _config: &Config,
) -> Result<RelocResult> {
    Ok(RelocResult::Ok)
}

fn unsupport(
    _backend: &mut ArmBackend,
    _reloc: &Relocation,
    _module: &mut Module,
    _config: &Config,
) -> Result<RelocResult> {
    Ok(RelocResult::Unsupport)
}

fn tls(
    _backend: &mut ArmBackend,
    _reloc: &Relocation,
    _module: &mut Module,
    _config: &Config,
) -> Result<RelocResult> {
    Ok(RelocResult::Unsupport)
}

// R_ARM_ABS32: (S + A) | T
fn abs32(
    backend: &mut ArmBackend,
    reloc: &Relocation,
    module: &mut Module,
    config: &Config,
) -> Result<RelocResult> {
    let sym = reloc.sym;
    let mut t = thumb_bit(reloc, module);
    let a = read_target(reloc, module).wrapping_add(reloc.addend as u32);
    let mut s = sym_value(reloc, module);

    // Only scanned (allocated) sections carry reservations; a word in a
    // debug section takes the link-time value.
    let in_alloc = module.section(reloc.target.sect).sect.is_alloc();

    if let (Some(sym), true) = (sym, in_alloc) {
        let info_local = module.pool.get(sym).is_local();
        let flags = reserved(reloc, module);
        if info_local && flags & RESERVE_REL != 0 {
            helper_dyn_rel(backend, reloc, R_ARM_RELATIVE)?;
            return write_target(reloc, module, s.wrapping_add(a) | t);
        }
        if !info_local {
            if flags & RESERVE_PLT != 0 {
                s = helper_plt(backend, sym, module)?;
                t = 0; // PLT stubs are ARM code
            }
            if flags & RESERVE_REL != 0 {
                if use_relative_reloc(sym, module, config) {
                    helper_dyn_rel(backend, reloc, R_ARM_RELATIVE)?;
                } else {
                    // The dynamic linker resolves this place; keep the
                    // addend stored there untouched.
                    helper_dyn_rel(backend, reloc, reloc.rtype)?;
                    return Ok(RelocResult::Ok);
                }
            }
        }
    }

    write_target(reloc, module, s.wrapping_add(a) | t)
}

// R_ARM_REL32: ((S + A) | T) - P
fn rel32(
    _backend: &mut ArmBackend,
    reloc: &Relocation,
    module: &mut Module,
    _config: &Config,
) -> Result<RelocResult> {
    let t = thumb_bit(reloc, module);
    let a = read_target(reloc, module).wrapping_add(reloc.addend as u32);
    let s = sym_value(reloc, module);
    let p = module.place(reloc.target);
    write_target(reloc, module, (s.wrapping_add(a) | t).wrapping_sub(p))
}

// R_ARM_GOTOFF32: ((S + A) | T) - GOT_ORG
fn gotoff32(
    backend: &mut ArmBackend,
    reloc: &Relocation,
    module: &mut Module,
    _config: &Config,
) -> Result<RelocResult> {
    let t = thumb_bit(reloc, module);
    let a = read_target(reloc, module).wrapping_add(reloc.addend as u32);
    let s = sym_value(reloc, module);
    let got_org = got_origin(backend, module);
    write_target(reloc, module, (s.wrapping_add(a) | t).wrapping_sub(got_org))
}

// R_ARM_GOT_BREL: GOT(S) + A - GOT_ORG
fn got_brel(
    backend: &mut ArmBackend,
    reloc: &Relocation,
    module: &mut Module,
    config: &Config,
) -> Result<RelocResult> {
    if reserved(reloc, module) & (RESERVE_GOT | GOT_REL) == 0 {
        return Ok(RelocResult::BadReloc);
    }
    let got_s = helper_got(backend, reloc, module, config)?;
    let a = read_target(reloc, module).wrapping_add(reloc.addend as u32);
    let got_org = got_origin(backend, module);
    write_target(reloc, module, got_s.wrapping_add(a).wrapping_sub(got_org))
}

// R_ARM_CALL / R_ARM_JUMP24 / R_ARM_PLT32 / R_ARM_PC24: ((S + A) | T) - P
fn call(
    backend: &mut ArmBackend,
    reloc: &Relocation,
    module: &mut Module,
    _config: &Config,
) -> Result<RelocResult> {
    // An undefined weak target without a PLT entry resolves to the next
    // instruction: rewrite to `mov r0, r0`, keeping the condition field.
    if is_weak_undef_without_plt(reloc, module) {
        let target = read_target(reloc, module);
        return write_target(reloc, module, (target & 0xf000_0000) | 0x01a0_0000);
    }

    let target = read_target(reloc, module);
    let mut t = thumb_bit(reloc, module);
    let a = sign_extend((target & 0x00ff_ffff) << 2, 26).wrapping_add(reloc.addend as u32);
    let p = module.place(reloc.target);
    let mut s = sym_value(reloc, module);

    if reserved(reloc, module) & RESERVE_PLT != 0 {
        s = helper_plt(backend, plt_symbol(reloc)?, module)?;
        t = 0;
    }

    let x = (s.wrapping_add(a) | t).wrapping_sub(p);
    if x & 0x3 != 0 {
        // Interworking to a Thumb target needs a stub we do not build.
        return Ok(RelocResult::BadReloc);
    }
    if signed_overflow(x, 26) {
        return Ok(RelocResult::Overflow);
    }
    write_target(reloc, module, (target & 0xff00_0000) | ((x & 0x03ff_fffe) >> 2))
}

// R_ARM_THM_CALL / R_ARM_THM_JUMP24: ((S + A) | T) - P on a Thumb2
// BL/BLX halfword pair.
fn thm_call(
    backend: &mut ArmBackend,
    reloc: &Relocation,
    module: &mut Module,
    _config: &Config,
) -> Result<RelocResult> {
    if is_weak_undef_without_plt(reloc, module) {
        // nop.w
        return write_target(reloc, module, (0xbf00 << 16) | 0xe000);
    }

    let word = read_target(reloc, module);
    let upper16 = word & 0xffff;
    let lower16 = word >> 16;

    let mut t = thumb_bit(reloc, module);
    let a = thumb32_branch_offset(upper16, lower16).wrapping_add(reloc.addend as u32);
    let p = module.place(reloc.target);
    let mut s = sym_value(reloc, module);

    if reserved(reloc, module) & RESERVE_PLT != 0 {
        s = helper_plt(backend, plt_symbol(reloc)?, module)?;
        t = 0;
    }

    let mut x = (s.wrapping_add(a) | t).wrapping_sub(p);

    // An ARM-state target turns BL into BLX: bit 1 of the destination
    // comes from the base address, so round to a word boundary. B.W has
    // no BLX form; interworking there would need a stub.
    let mut lower_out = lower16;
    if t == 0 && reloc.rtype == R_ARM_THM_CALL {
        x = x.wrapping_add(2) & !0x3;
        lower_out &= !(1 << 12);
    }

    if signed_overflow(x >> 1, 24) {
        return Ok(RelocResult::Overflow);
    }

    let new_upper = thumb32_branch_upper(upper16, x);
    let new_lower = thumb32_branch_lower(lower_out, x);
    write_target(reloc, module, (new_lower << 16) | new_upper)
}

// R_ARM_MOVW_ABS_NC: (S + A) | T
fn movw_abs_nc(
    backend: &mut ArmBackend,
    reloc: &Relocation,
    module: &mut Module,
    _config: &Config,
) -> Result<RelocResult> {
    let target = read_target(reloc, module);
    let mut t = thumb_bit(reloc, module);
    let a = movw_movt_addend(target).wrapping_add(reloc.addend as u32);
    let mut s = sym_value(reloc, module);
    if reserved(reloc, module) & RESERVE_PLT != 0 {
        s = helper_plt(backend, plt_symbol(reloc)?, module)?;
        t = 0;
    }
    let x = s.wrapping_add(a) | t;
    if signed_overflow(x, 16) {
        return Ok(RelocResult::Overflow);
    }
    write_target(reloc, module, insert_movw_movt(target, x))
}

// R_ARM_MOVT_ABS: (S + A) >> 16
fn movt_abs(
    backend: &mut ArmBackend,
    reloc: &Relocation,
    module: &mut Module,
    _config: &Config,
) -> Result<RelocResult> {
    let target = read_target(reloc, module);
    let a = movw_movt_addend(target).wrapping_add(reloc.addend as u32);
    let mut s = sym_value(reloc, module);
    if reserved(reloc, module) & RESERVE_PLT != 0 {
        s = helper_plt(backend, plt_symbol(reloc)?, module)?;
    }
    let x = s.wrapping_add(a) >> 16;
    write_target(reloc, module, insert_movw_movt(target, x))
}

// R_ARM_MOVW_PREL_NC: ((S + A) | T) - P
fn movw_prel_nc(
    _backend: &mut ArmBackend,
    reloc: &Relocation,
    module: &mut Module,
    _config: &Config,
) -> Result<RelocResult> {
    let target = read_target(reloc, module);
    let t = thumb_bit(reloc, module);
    let a = movw_movt_addend(target).wrapping_add(reloc.addend as u32);
    let s = sym_value(reloc, module);
    let p = module.place(reloc.target);
    let x = (s.wrapping_add(a) | t).wrapping_sub(p);
    if signed_overflow(x, 16) {
        return Ok(RelocResult::Overflow);
    }
    write_target(reloc, module, insert_movw_movt(target, x))
}

// R_ARM_MOVT_PREL: (S + A - P) >> 16
fn movt_prel(
    _backend: &mut ArmBackend,
    reloc: &Relocation,
    module: &mut Module,
    _config: &Config,
) -> Result<RelocResult> {
    let target = read_target(reloc, module);
    let a = movw_movt_addend(target).wrapping_add(reloc.addend as u32);
    let s = sym_value(reloc, module);
    let p = module.place(reloc.target);
    let x = s.wrapping_add(a).wrapping_sub(p) >> 16;
    write_target(reloc, module, insert_movw_movt(target, x))
}

// R_ARM_THM_MOVW_ABS_NC: (S + A) | T
fn thm_movw_abs_nc(
    backend: &mut ArmBackend,
    reloc: &Relocation,
    module: &mut Module,
    _config: &Config,
) -> Result<RelocResult> {
    let target = read_target(reloc, module);
    let mut t = thumb_bit(reloc, module);
    let a = thumb_movw_movt_addend(target).wrapping_add(reloc.addend as u32);
    let mut s = sym_value(reloc, module);
    if reserved(reloc, module) & RESERVE_PLT != 0 {
        s = helper_plt(backend, plt_symbol(reloc)?, module)?;
        t = 0;
    }
    let x = s.wrapping_add(a) | t;
    if signed_overflow(x, 16) {
        return Ok(RelocResult::Overflow);
    }
    write_target(reloc, module, insert_thumb_movw_movt(target, x))
}

// R_ARM_THM_MOVT_ABS: (S + A) >> 16
fn thm_movt_abs(
    backend: &mut ArmBackend,
    reloc: &Relocation,
    module: &mut Module,
    _config: &Config,
) -> Result<RelocResult> {
    let target = read_target(reloc, module);
    let a = thumb_movw_movt_addend(target).wrapping_add(reloc.addend as u32);
    let mut s = sym_value(reloc, module);
    if reserved(reloc, module) & RESERVE_PLT != 0 {
        s = helper_plt(backend, plt_symbol(reloc)?, module)?;
    }
    // MOVT takes the high half verbatim; only the NC variants range-check.
    let x = s.wrapping_add(a) >> 16;
    write_target(reloc, module, insert_thumb_movw_movt(target, x))
}

// R_ARM_THM_MOVW_PREL_NC: ((S + A) | T) - P
fn thm_movw_prel_nc(
    _backend: &mut ArmBackend,
    reloc: &Relocation,
    module: &mut Module,
    _config: &Config,
) -> Result<RelocResult> {
    let target = read_target(reloc, module);
    let t = thumb_bit(reloc, module);
    let a = thumb_movw_movt_addend(target).wrapping_add(reloc.addend as u32);
    let s = sym_value(reloc, module);
    let p = module.place(reloc.target);
    let x = (s.wrapping_add(a) | t).wrapping_sub(p);
    if signed_overflow(x, 16) {
        return Ok(RelocResult::Overflow);
    }
    write_target(reloc, module, insert_thumb_movw_movt(target, x))
}

// R_ARM_THM_MOVT_PREL: (S + A - P) >> 16
fn thm_movt_prel(
    _backend: &mut ArmBackend,
    reloc: &Relocation,
    module: &mut Module,
    _config: &Config,
) -> Result<RelocResult> {
    let target = read_target(reloc, module);
    let a = thumb_movw_movt_addend(target).wrapping_add(reloc.addend as u32);
    let s = sym_value(reloc, module);
    let p = module.place(reloc.target);
    let x = s.wrapping_add(a).wrapping_sub(p) >> 16;
    write_target(reloc, module, insert_thumb_movw_movt(target, x))
}

// R_ARM_PREL31: (S + A) | T, low 31 bits, bit 31 preserved
fn prel31(
    backend: &mut ArmBackend,
    reloc: &Relocation,
    module: &mut Module,
    _config: &Config,
) -> Result<RelocResult> {
    let target = read_target(reloc, module);
    let mut t = thumb_bit(reloc, module);
    let a = sign_extend(target, 31).wrapping_add(reloc.addend as u32);
    let mut s = sym_value(reloc, module);
    if reserved(reloc, module) & RESERVE_PLT != 0 {
        s = helper_plt(backend, plt_symbol(reloc)?, module)?;
        t = 0;
    }
    let x = s.wrapping_add(a) | t;
    let result = bit_select(target, x, 0x7fff_ffff);
    if signed_overflow(x, 31) {
        return Ok(RelocResult::Overflow);
    }
    write_target(reloc, module, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Config, OutputKind, Target};
    use crate::sections::FragmentKind;
    use crate::symbols::ResolveInfo;

    fn config() -> Config {
        Config { target: Target::Arm, output: OutputKind::Exec, ..Config::default() }
    }

    /// A module with one .text section holding `words`, at address `addr`.
    fn module_with_text(words: &[u32], addr: u32) -> (Module, usize) {
        let mut module = Module::new("a.out");
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

    fn define_func(module: &mut Module, name: &str, value: u32) -> SymbolId {
        let mut info = ResolveInfo::new(name);
        info.binding = Binding::Global;
        info.desc = SymDesc::Define;
        info.ty = SymType::Func;
        info.value = value;
        let (id, _) = crate::resolver::resolve(&mut module.pool, info).unwrap();
        module.pool.out_symbol_mut(id).value = value;
        id
    }

    #[test]
    fn test_abs32_sets_thumb_bit() {
        // S1: Function symbol at 0x8001 (Thumb), addend 0, word 0.
        let (mut module, text) = module_with_text(&[0], 0);
        let sym = define_func(&mut module, "f", 0x8001);
        let mut backend = ArmBackend::new();
        let reloc = Relocation::new(R_ARM_ABS32, Some(sym), FragmentRef::new(text, 0, 0), 0);
        apply(&mut backend, &reloc, &mut module, &config()).unwrap();
        assert_eq!(module.read_target_word(reloc.target, crate::elf::DataEncoding::Little), 0x8001);
    }

    #[test]
    fn test_abs32_object_symbol_keeps_lsb_meaning() {
        // Against an Object symbol the low bit is whatever S+A produces.
        let (mut module, text) = module_with_text(&[0], 0);
        let mut info = ResolveInfo::new("obj");
        info.binding = Binding::Global;
        info.desc = SymDesc::Define;
        info.ty = SymType::Object;
        info.value = 0x8001;
        let (sym, _) = crate::resolver::resolve(&mut module.pool, info).unwrap();
        module.pool.out_symbol_mut(sym).value = 0x8001;
        let mut backend = ArmBackend::new();
        let reloc = Relocation::new(R_ARM_ABS32, Some(sym), FragmentRef::new(text, 0, 0), 0);
        apply(&mut backend, &reloc, &mut module, &config()).unwrap();
        assert_eq!(module.read_target_word(reloc.target, crate::elf::DataEncoding::Little), 0x8001);
    }

    #[test]
    fn test_call_encodes_branch() {
        // S2: BL at P=4 to S=0x10000: X = 0xFFFC, imm24 = 0x3FFF.
        let (mut module, text) = module_with_text(&[0, 0xEB00_0000], 0);
        let sym = define_func(&mut module, "f", 0x0001_0000);
        let mut backend = ArmBackend::new();
        let reloc = Relocation::new(R_ARM_CALL, Some(sym), FragmentRef::new(text, 0, 4), 0);
        apply(&mut backend, &reloc, &mut module, &config()).unwrap();
        assert_eq!(
            module.read_target_word(reloc.target, crate::elf::DataEncoding::Little),
            0xEB00_3FFF
        );
    }

    #[test]
    fn test_call_overflow_leaves_bytes_untouched() {
        let (mut module, text) = module_with_text(&[0xEB00_0000], 0);
        let sym = define_func(&mut module, "far", 0x0400_0000); // > ±32MB
        let mut backend = ArmBackend::new();
        let reloc = Relocation::new(R_ARM_CALL, Some(sym), FragmentRef::new(text, 0, 0), 0);
        let err = apply(&mut backend, &reloc, &mut module, &config());
        assert!(matches!(err, Err(LinkError::RelocOverflow { .. })));
        assert_eq!(
            module.read_target_word(reloc.target, crate::elf::DataEncoding::Little),
            0xEB00_0000
        );
    }

    #[test]
    fn test_call_undefined_weak_becomes_nop() {
        let (mut module, text) = module_with_text(&[0xEB00_0000], 0);
        let mut info = ResolveInfo::new("maybe");
        info.binding = Binding::Weak;
        let (sym, _) = crate::resolver::resolve(&mut module.pool, info).unwrap();
        let mut backend = ArmBackend::new();
        let reloc = Relocation::new(R_ARM_CALL, Some(sym), FragmentRef::new(text, 0, 0), 0);
        apply(&mut backend, &reloc, &mut module, &config()).unwrap();
        assert_eq!(
            module.read_target_word(reloc.target, crate::elf::DataEncoding::Little),
            0xE1A0_0000 // mov r0, r0 under the original condition bits
        );
    }

    #[test]
    fn test_thm_call_undefined_weak_becomes_nop_w() {
        // S5: (upper16, lower16) = (0xF000, 0xF800) -> (0xE000, 0xBF00).
        let (mut module, text) = module_with_text(&[(0xF800 << 16) | 0xF000], 0);
        let mut info = ResolveInfo::new("maybe");
        info.binding = Binding::Weak;
        let (sym, _) = crate::resolver::resolve(&mut module.pool, info).unwrap();
        let mut backend = ArmBackend::new();
        let reloc = Relocation::new(R_ARM_THM_CALL, Some(sym), FragmentRef::new(text, 0, 0), 0);
        apply(&mut backend, &reloc, &mut module, &config()).unwrap();
        let word = module.read_target_word(reloc.target, crate::elf::DataEncoding::Little);
        assert_eq!(word & 0xffff, 0xE000);
        assert_eq!(word >> 16, 0xBF00);
    }

    #[test]
    fn test_thm_call_round_trips_offset() {
        // BL forward by a small even offset to a Thumb target.
        let (mut module, text) = module_with_text(&[(0xF800 << 16) | 0xF000], 0x1000);
        let sym = define_func(&mut module, "t", 0x1101); // Thumb: bit 0 set
        let mut backend = ArmBackend::new();
        let reloc = Relocation::new(R_ARM_THM_CALL, Some(sym), FragmentRef::new(text, 0, 0), 0);
        apply(&mut backend, &reloc, &mut module, &config()).unwrap();
        let word = module.read_target_word(reloc.target, crate::elf::DataEncoding::Little);
        let upper = word & 0xffff;
        let lower = word >> 16;
        // X = ((S | T) - P) = (0x1101 | 1) - 0x1000 = 0x101; the encoding
        // keeps halfword granularity, so bit 0 drops.
        assert_eq!(thumb32_branch_offset(upper, lower), 0x100);
        // BL to a Thumb target keeps bit 12 set.
        assert_eq!(lower & (1 << 12), 1 << 12);
    }

    #[test]
    fn test_movw_movt_pair() {
        let (mut module, text) = module_with_text(&[0xE300_0000, 0xE340_0000], 0);
        let mut info = ResolveInfo::new("data");
        info.binding = Binding::Global;
        info.desc = SymDesc::Define;
        info.ty = SymType::Object;
        let (sym, _) = crate::resolver::resolve(&mut module.pool, info).unwrap();
        module.pool.out_symbol_mut(sym).value = 0x0001_2345;

        let mut backend = ArmBackend::new();
        let movw = Relocation::new(R_ARM_MOVW_ABS_NC, Some(sym), FragmentRef::new(text, 0, 0), 0);
        apply(&mut backend, &movw, &mut module, &config()).unwrap();
        let movt = Relocation::new(R_ARM_MOVT_ABS, Some(sym), FragmentRef::new(text, 0, 4), 0);
        apply(&mut backend, &movt, &mut module, &config()).unwrap();

        // movw r0, #0x2345 -> imm split [19:16]=2, [11:0]=0x345
        assert_eq!(
            module.read_target_word(movw.target, crate::elf::DataEncoding::Little),
            0xE302_0345
        );
        // movt r0, #1
        assert_eq!(
            module.read_target_word(movt.target, crate::elf::DataEncoding::Little),
            0xE340_0001
        );
    }

    #[test]
    fn test_thm_movw_movt_pair() {
        // movw r0 (F240 0000) then movt r0 (F2C0 0000). The movw site
        // references a small value (its NC check sees the full S+A); the
        // movt site takes the high half of an above-2GiB address
        // verbatim, with no range check.
        let (mut module, text) = module_with_text(&[(0x0000 << 16) | 0xF240, (0x0000 << 16) | 0xF2C0], 0);
        let mut lo = ResolveInfo::new("near");
        lo.binding = Binding::Global;
        lo.desc = SymDesc::Define;
        lo.ty = SymType::Object;
        let (sym_lo, _) = crate::resolver::resolve(&mut module.pool, lo).unwrap();
        module.pool.out_symbol_mut(sym_lo).value = 0x2345;
        let mut hi = ResolveInfo::new("high");
        hi.binding = Binding::Global;
        hi.desc = SymDesc::Define;
        hi.ty = SymType::Object;
        let (sym_hi, _) = crate::resolver::resolve(&mut module.pool, hi).unwrap();
        module.pool.out_symbol_mut(sym_hi).value = 0x8001_2345;

        let mut backend = ArmBackend::new();
        let movw = Relocation::new(
            R_ARM_THM_MOVW_ABS_NC,
            Some(sym_lo),
            FragmentRef::new(text, 0, 0),
            0,
        );
        apply(&mut backend, &movw, &mut module, &config()).unwrap();
        let movt = Relocation::new(
            R_ARM_THM_MOVT_ABS,
            Some(sym_hi),
            FragmentRef::new(text, 0, 4),
            0,
        );
        apply(&mut backend, &movt, &mut module, &config()).unwrap();

        // imm16 0x2345: imm4=2, i=0, imm3=3, imm8=0x45
        assert_eq!(
            module.read_target_word(movw.target, crate::elf::DataEncoding::Little),
            (0x3045 << 16) | 0xF242
        );
        // imm16 0x8001: imm4=8, i=0, imm3=0, imm8=0x01
        assert_eq!(
            module.read_target_word(movt.target, crate::elf::DataEncoding::Little),
            (0x0001 << 16) | 0xF2C8
        );
    }

    #[test]
    fn test_thm_movw_movt_field_round_trip() {
        let word = insert_thumb_movw_movt((0x0000 << 16) | 0xF240, 0x7A5C);
        assert_eq!(thumb_movw_movt_addend(word) & 0xffff, 0x7A5C);
    }

    #[test]
    fn test_unknown_type_is_fatal() {
        let (mut module, text) = module_with_text(&[0], 0);
        let sym = define_func(&mut module, "f", 0);
        let mut backend = ArmBackend::new();
        let reloc = Relocation::new(200, Some(sym), FragmentRef::new(text, 0, 0), 0);
        assert!(matches!(
            apply(&mut backend, &reloc, &mut module, &config()),
            Err(LinkError::UnknownRelocation { rtype: 200, .. })
        ));
    }

    #[test]
    fn test_tls_is_unsupported() {
        let (mut module, text) = module_with_text(&[0], 0);
        let sym = define_func(&mut module, "f", 0);
        let mut backend = ArmBackend::new();
        let reloc = Relocation::new(R_ARM_TLS_LE32, Some(sym), FragmentRef::new(text, 0, 0), 0);
        assert!(matches!(
            apply(&mut backend, &reloc, &mut module, &config()),
            Err(LinkError::UnsupportedRelocation { .. })
        ));
    }

    #[test]
    fn test_prel31_preserves_top_bit() {
        let (mut module, text) = module_with_text(&[0x8000_0000], 0);
        let sym = define_func(&mut module, "f", 0x100);
        // keep the function out of Thumb mode
        module.pool.out_symbol_mut(sym).value = 0x100;
        let mut backend = ArmBackend::new();
        let reloc = Relocation::new(R_ARM_PREL31, Some(sym), FragmentRef::new(text, 0, 0), 0);
        apply(&mut backend, &reloc, &mut module, &config()).unwrap();
        let word = module.read_target_word(reloc.target, crate::elf::DataEncoding::Little);
        assert_eq!(word, 0x8000_0100);
    }
}
