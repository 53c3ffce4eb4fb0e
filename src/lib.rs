//! `eld`: an ELF32 static linker core for ARM and MIPS.
//!
//! Links ELF32 relocatable object files (and resolves against ELF32 shared
//! objects) into relocatable objects, shared objects (`ET_DYN`), or
//! executables for ARM (`EM_ARM`) and little-endian MIPS (`EM_MIPS`).
//!
//! The pipeline is a fixed sequence of phases driven by [`driver::Driver`]:
//! read section headers and symbol tables, merge them under ELF resolution
//! rules, scan relocations to reserve GOT/PLT/dynamic-relocation entries,
//! lay out output sections, apply relocations, and write the image.
//!
//! Architecture-specific behavior (relocation scanning policy, GOT/PLT
//! shapes, relocation application) lives in `target::arm` and
//! `target::mips`; everything else is shared.

pub mod diag;
pub mod mem;
pub mod elf;
pub mod input;
pub mod reader;
pub mod sections;
pub mod symbols;
pub mod resolver;
pub mod emulation;
pub mod module;
pub mod layout;
pub mod reloc;
pub mod plt_got;
pub mod target;
pub mod driver;
pub mod emit;

pub use diag::{LinkError, Result};
pub use driver::{Config, Driver, OutputKind, Target};
