//! Input-section to output-section name mapping.
//!
//! A fixed, ordered table of name-prefix rules decides which output
//! section an input section lands in when the output is not a relocatable
//! object. Order matters: more specific prefixes come first
//! (`.data.rel.ro.local` before `.data.rel.ro` before `.data`).

use crate::diag::{LinkError, Result};

/// `(input-name prefix, output-section name)`.
static NAME_MAP: &[(&str, &str)] = &[
    (".text", ".text"),
    (".rodata", ".rodata"),
    (".data.rel.ro.local", ".data.rel.ro.local"),
    (".data.rel.ro", ".data.rel.ro"),
    (".data", ".data"),
    (".bss", ".bss"),
    (".tdata", ".tdata"),
    (".tbss", ".tbss"),
    (".init_array", ".init_array"),
    (".fini_array", ".fini_array"),
    (".ctors", ".ctors"),
    (".dtors", ".dtors"),
    (".sdata2", ".sdata"),
    (".sbss2", ".sbss"),
    (".sdata", ".sdata"),
    (".sbss", ".sbss"),
    (".lrodata", ".lrodata"),
    (".ldata", ".ldata"),
    (".lbss", ".lbss"),
    (".gcc_except_table", ".gcc_except_table"),
    (".gnu.linkonce.d.rel.ro.local", ".data.rel.ro.local"),
    (".gnu.linkonce.d.rel.ro", ".data.rel.ro"),
    (".gnu.linkonce.r", ".rodata"),
    (".gnu.linkonce.d", ".data"),
    (".gnu.linkonce.b", ".bss"),
    (".gnu.linkonce.sb2", ".sbss"),
    (".gnu.linkonce.sb", ".sbss"),
    (".gnu.linkonce.s2", ".sdata"),
    (".gnu.linkonce.s", ".sdata"),
    (".gnu.linkonce.wi", ".debug_info"),
    (".gnu.linkonce.td", ".tdata"),
    (".gnu.linkonce.tb", ".tbss"),
    (".gnu.linkonce.t", ".text"),
    (".gnu.linkonce.lr", ".lrodata"),
    (".gnu.linkonce.lb", ".lbss"),
    (".gnu.linkonce.l", ".ldata"),
];

/// Ordered prefix map from input-section names to output-section names.
#[derive(Debug, Default)]
pub struct SectionNameMap {
    pairs: Vec<(String, String)>,
}

impl SectionNameMap {
    pub fn new() -> SectionNameMap {
        SectionNameMap::default()
    }

    /// The standard ELF emulation table. Fails if the static table ever
    /// carries a duplicate prefix.
    pub fn standard() -> Result<SectionNameMap> {
        let mut map = SectionNameMap::new();
        for (from, to) in NAME_MAP {
            if map.append(from, to) {
                return Err(LinkError::DuplicateSectionMapping { from: (*from).into() });
            }
        }
        Ok(map)
    }

    /// Append a pair; returns true if the prefix was already present.
    pub fn append(&mut self, from: &str, to: &str) -> bool {
        if self.pairs.iter().any(|(f, _)| f == from) {
            return true;
        }
        self.pairs.push((from.to_string(), to.to_string()));
        false
    }

    /// First pair whose prefix matches `name`, in insertion order.
    pub fn lookup(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(from, _)| name.starts_with(from.as_str()))
            .map(|(_, to)| to.as_str())
    }
}
