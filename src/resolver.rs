//! Symbol resolution under ELF rules.
//!
//! [`resolve`] absorbs one new global-symbol occurrence into the name pool
//! and reports the outcome: the existing record stays (`Success`), the new
//! occurrence replaces it (`Override`), or the link aborts on a
//! multiply-defined strong symbol. Local symbols never come through here;
//! the reader appends them directly.
//!
//! Rules:
//! - undefined vs. anything defined: the definition wins;
//! - strong define vs. strong define: abort;
//! - weak define vs. strong define: strong wins, first weak wins over
//!   later weaks;
//! - common vs. common: the larger size wins and the stricter alignment
//!   is kept (a common's `value` holds its alignment);
//! - common vs. define: the definition wins and the common size is
//!   discarded; a common in a regular object beats a DynObj definition;
//! - a DynObj definition never overrides a regular definition but does
//!   satisfy an undefined reference;
//! - visibility always merges to the stricter of the two.

use crate::diag::{LinkError, Result};
use crate::symbols::{NamePool, ResolveInfo, SymbolId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveAction {
    /// The existing record stays.
    Success,
    /// The new occurrence replaced the existing record.
    Override,
}

/// Absorb `new` into the pool. `new.binding` must not be `Local`.
pub fn resolve(pool: &mut NamePool, new: ResolveInfo) -> Result<(SymbolId, ResolveAction)> {
    debug_assert!(!new.is_local());

    let id = match pool.lookup(&new.name) {
        Some(id) => id,
        None => {
            let name = new.name.clone();
            let id = pool.push_local(new);
            // push_local skips the map; enter the name by hand.
            pool.intern_existing(&name, id);
            return Ok((id, ResolveAction::Override));
        }
    };

    let old = pool.get(id);
    let action = decide(old, &new)?;
    let merged_vis = if new.vis.rank() > old.vis.rank() { new.vis } else { old.vis };
    let old_reserved = old.reserved;
    let common_align = if old.is_common() && new.is_common() {
        Some(old.value.max(new.value))
    } else {
        None
    };

    match action {
        ResolveAction::Override => {
            let record = pool.get_mut(id);
            *record = new;
            record.reserved = old_reserved;
            record.vis = merged_vis;
            if let Some(align) = common_align {
                record.value = align;
            }
        }
        ResolveAction::Success => {
            let record = pool.get_mut(id);
            record.vis = merged_vis;
            // An undefined weak reference joined by a strong reference
            // must be reported as strong if it stays unresolved.
            if record.is_undef() && record.is_weak() && new.is_undef() && !new.is_weak() {
                record.binding = new.binding;
            }
            // Common vs. common: keep the larger size, the stricter
            // alignment (held in `value`).
            if record.is_common() && new.is_common() {
                record.size = record.size.max(new.size);
                record.value = record.value.max(new.value);
            }
        }
    }

    let (value, size) = {
        let record = pool.get(id);
        (record.value, record.size)
    };
    let sym = pool.out_symbol_mut(id);
    sym.value = value;
    sym.size = size;

    Ok((id, action))
}

fn decide(old: &ResolveInfo, new: &ResolveInfo) -> Result<ResolveAction> {
    // The new occurrence is only a reference.
    if new.is_undef() {
        return Ok(ResolveAction::Success);
    }

    // The new occurrence is a definition from a DynObj: it satisfies an
    // undefined reference but never displaces anything defined by a
    // regular input.
    if new.from_dyn {
        return if old.is_undef() && !old.from_dyn {
            Ok(ResolveAction::Override)
        } else {
            Ok(ResolveAction::Success)
        };
    }

    // The new occurrence is a common (tentative) definition.
    if new.is_common() {
        return if old.is_undef() || old.from_dyn {
            Ok(ResolveAction::Override)
        } else if old.is_common() {
            // Larger size wins; equal or smaller merges in place.
            if new.size > old.size {
                Ok(ResolveAction::Override)
            } else {
                Ok(ResolveAction::Success)
            }
        } else {
            Ok(ResolveAction::Success)
        };
    }

    // The new occurrence is a real definition from a regular input.
    if old.is_undef() || old.from_dyn || old.is_common() {
        return Ok(ResolveAction::Override);
    }

    // Defined against defined.
    match (old.is_weak(), new.is_weak()) {
        (true, false) => Ok(ResolveAction::Override),
        (false, true) | (true, true) => Ok(ResolveAction::Success),
        (false, false) => Err(LinkError::MultipleDefinition { symbol: new.name.clone() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::{Binding, SymDesc, SymType, Visibility};

    fn occurrence(name: &str, desc: SymDesc, binding: Binding) -> ResolveInfo {
        let mut info = ResolveInfo::new(name);
        info.desc = desc;
        info.binding = binding;
        info
    }

    #[test]
    fn test_strong_beats_weak() {
        // Object A defines strong `foo`; object B declares weak `foo`.
        let mut pool = NamePool::new();
        let mut strong = occurrence("foo", SymDesc::Define, Binding::Global);
        strong.value = 0x1000;
        let (id, action) = resolve(&mut pool, strong).unwrap();
        assert_eq!(action, ResolveAction::Override);

        let weak = occurrence("foo", SymDesc::Define, Binding::Weak);
        let (id2, action) = resolve(&mut pool, weak).unwrap();
        assert_eq!(id, id2);
        assert_eq!(action, ResolveAction::Success);

        let info = pool.get(id);
        assert_eq!(info.binding, Binding::Global);
        assert_eq!(info.desc, SymDesc::Define);
        assert_eq!(info.value, 0x1000);
    }

    #[test]
    fn test_weak_then_strong_overrides() {
        let mut pool = NamePool::new();
        resolve(&mut pool, occurrence("foo", SymDesc::Define, Binding::Weak)).unwrap();
        let mut strong = occurrence("foo", SymDesc::Define, Binding::Global);
        strong.value = 0x2000;
        let (id, action) = resolve(&mut pool, strong).unwrap();
        assert_eq!(action, ResolveAction::Override);
        assert_eq!(pool.get(id).value, 0x2000);
    }

    #[test]
    fn test_strong_collision_aborts() {
        let mut pool = NamePool::new();
        resolve(&mut pool, occurrence("foo", SymDesc::Define, Binding::Global)).unwrap();
        let err = resolve(&mut pool, occurrence("foo", SymDesc::Define, Binding::Global));
        assert!(matches!(err, Err(LinkError::MultipleDefinition { .. })));
    }

    #[test]
    fn test_undef_then_define() {
        let mut pool = NamePool::new();
        let (id, _) = resolve(&mut pool, occurrence("foo", SymDesc::Undefined, Binding::Global)).unwrap();
        let (id2, action) = resolve(&mut pool, occurrence("foo", SymDesc::Define, Binding::Global)).unwrap();
        assert_eq!(id, id2);
        assert_eq!(action, ResolveAction::Override);
        assert!(pool.get(id).is_define());
    }

    #[test]
    fn test_common_merging() {
        let mut pool = NamePool::new();
        let mut small = occurrence("buf", SymDesc::Common, Binding::Global);
        small.size = 16;
        small.value = 4; // alignment
        let (id, _) = resolve(&mut pool, small).unwrap();

        let mut large = occurrence("buf", SymDesc::Common, Binding::Global);
        large.size = 64;
        large.value = 8;
        let (_, action) = resolve(&mut pool, large).unwrap();
        assert_eq!(action, ResolveAction::Override);
        assert_eq!(pool.get(id).size, 64);

        let mut smaller = occurrence("buf", SymDesc::Common, Binding::Global);
        smaller.size = 8;
        smaller.value = 16;
        let (_, action) = resolve(&mut pool, smaller).unwrap();
        assert_eq!(action, ResolveAction::Success);
        let info = pool.get(id);
        assert_eq!(info.size, 64);
        assert_eq!(info.value, 16); // stricter alignment kept
    }

    #[test]
    fn test_define_beats_common() {
        let mut pool = NamePool::new();
        let mut common = occurrence("buf", SymDesc::Common, Binding::Global);
        common.size = 64;
        let (id, _) = resolve(&mut pool, common).unwrap();
        let mut def = occurrence("buf", SymDesc::Define, Binding::Global);
        def.size = 4;
        let (_, action) = resolve(&mut pool, def).unwrap();
        assert_eq!(action, ResolveAction::Override);
        assert_eq!(pool.get(id).size, 4); // common size discarded
    }

    #[test]
    fn test_dynobj_never_overrides_regular() {
        let mut pool = NamePool::new();
        let mut def = occurrence("f", SymDesc::Define, Binding::Global);
        def.value = 0x100;
        let (id, _) = resolve(&mut pool, def).unwrap();

        let mut dyn_def = occurrence("f", SymDesc::Define, Binding::Global);
        dyn_def.from_dyn = true;
        dyn_def.value = 0x999;
        let (_, action) = resolve(&mut pool, dyn_def).unwrap();
        assert_eq!(action, ResolveAction::Success);
        assert_eq!(pool.get(id).value, 0x100);
        assert!(!pool.get(id).from_dyn);
    }

    #[test]
    fn test_dynobj_satisfies_reference() {
        let mut pool = NamePool::new();
        resolve(&mut pool, occurrence("puts", SymDesc::Undefined, Binding::Global)).unwrap();
        let mut dyn_def = occurrence("puts", SymDesc::Define, Binding::Global);
        dyn_def.from_dyn = true;
        dyn_def.ty = SymType::Func;
        let (id, action) = resolve(&mut pool, dyn_def).unwrap();
        assert_eq!(action, ResolveAction::Override);
        assert!(pool.get(id).from_dyn);
    }

    #[test]
    fn test_visibility_merges_to_stricter() {
        let mut pool = NamePool::new();
        let mut first = occurrence("v", SymDesc::Undefined, Binding::Global);
        first.vis = Visibility::Protected;
        let (id, _) = resolve(&mut pool, first).unwrap();
        let mut second = occurrence("v", SymDesc::Define, Binding::Global);
        second.vis = Visibility::Hidden;
        resolve(&mut pool, second).unwrap();
        assert_eq!(pool.get(id).vis, Visibility::Hidden);
    }
}
