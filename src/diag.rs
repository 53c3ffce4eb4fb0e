//! Link-time diagnostics.
//!
//! Every failure the linker can surface is a variant of [`LinkError`], each
//! carrying enough context to print a useful message and a stable numeric
//! diagnostic id. Ids are grouped by kind: 1xx input/common, 2xx symbol
//! resolution, 3xx relocation, 4xx output, 5xx internal invariants.

use snafu::Snafu;

pub type Result<T, E = LinkError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LinkError {
    #[snafu(display("{path}: not an ELF file"))]
    NotElf { path: String },

    #[snafu(display("{path}: not an ELF32 file"))]
    WrongClass { path: String },

    #[snafu(display("{path}: unexpected byte order (ei_data = {ei_data})"))]
    WrongEndian { path: String, ei_data: u8 },

    #[snafu(display("{path}: wrong machine (e_machine = {found}, expected {expected})"))]
    WrongMachine { path: String, expected: u16, found: u16 },

    #[snafu(display("{path}: unexpected ELF file type (e_type = {e_type})"))]
    WrongFileType { path: String, e_type: u16 },

    #[snafu(display("{path}: truncated input reading {what} at offset {offset:#x}"))]
    TruncatedInput { path: String, what: &'static str, offset: usize },

    #[snafu(display("{path}: missing {section} section"))]
    MissingSection { path: String, section: &'static str },

    #[snafu(display("{path}: malformed archive: {reason}"))]
    BadArchive { path: String, reason: String },

    #[snafu(display("input attribute constraint violated: {reason}"))]
    InputConstraint { reason: String },

    #[snafu(display("undefined reference to `{symbol}'"))]
    UndefinedReference { symbol: String },

    #[snafu(display("multiple definition of `{symbol}'"))]
    MultipleDefinition { symbol: String },

    #[snafu(display("user symbol `{symbol}' collides with a reserved linker symbol"))]
    ReservedSymbolCollision { symbol: String },

    #[snafu(display("unknown relocation type {rtype} against symbol `{symbol}'"))]
    UnknownRelocation { rtype: u32, symbol: String },

    #[snafu(display("applying relocation `{name}' causes overflow on symbol `{symbol}'"))]
    RelocOverflow { name: &'static str, symbol: String },

    #[snafu(display("relocation `{name}' encountered unexpected opcode on symbol `{symbol}'"))]
    RelocBadOpcode { name: &'static str, symbol: String },

    #[snafu(display("unsupported relocation `{name}' on symbol `{symbol}'"))]
    UnsupportedRelocation { name: &'static str, symbol: String },

    #[snafu(display("no paired R_MIPS_LO16 follows R_MIPS_HI16 against `{symbol}'"))]
    MissingPairedLo16 { symbol: String },

    #[snafu(display("{count} relocation error(s) reported"))]
    RelocationsFailed { count: usize },

    #[snafu(display("unrecognized output section `{section}'"))]
    UnrecognizedOutputSection { section: String },

    #[snafu(display("duplicate section mapping for input pattern `{from}'"))]
    DuplicateSectionMapping { from: String },

    #[snafu(display("failed to write `{path}': {source}"))]
    Io { path: String, source: std::io::Error },

    #[snafu(display("internal error: {message}"))]
    Internal { message: String },
}

impl LinkError {
    /// Stable numeric diagnostic id.
    pub fn id(&self) -> u32 {
        use LinkError::*;
        match self {
            NotElf { .. } => 101,
            WrongClass { .. } => 102,
            WrongEndian { .. } => 103,
            WrongMachine { .. } => 104,
            WrongFileType { .. } => 105,
            TruncatedInput { .. } => 106,
            MissingSection { .. } => 107,
            BadArchive { .. } => 108,
            InputConstraint { .. } => 109,
            UndefinedReference { .. } => 201,
            MultipleDefinition { .. } => 202,
            ReservedSymbolCollision { .. } => 203,
            UnknownRelocation { .. } => 301,
            RelocOverflow { .. } => 302,
            RelocBadOpcode { .. } => 303,
            UnsupportedRelocation { .. } => 304,
            MissingPairedLo16 { .. } => 305,
            RelocationsFailed { .. } => 306,
            UnrecognizedOutputSection { .. } => 401,
            DuplicateSectionMapping { .. } => 402,
            Io { .. } => 403,
            Internal { .. } => 501,
        }
    }
}

/// Shorthand for internal-invariant violations.
pub fn internal(message: impl Into<String>) -> LinkError {
    LinkError::Internal { message: message.into() }
}
