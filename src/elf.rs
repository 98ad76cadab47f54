//! Minimal ELF header reading: just enough to recover the entry point
//! the Patcher's startup breakpoint needs (spec.md §4.6 "Startup injects
//! a single breakpoint at the ELF entry point"). Grounded on
//! original_source's `src/dbi/patch.cc` (`start()`), which reads the raw
//! `Elf64_Ehdr` itself; here `goblin`, already in the teacher's
//! dependency table, replaces the hand-rolled header struct.

use std::fs;

use crate::error::{Error, Result};

/// `e_entry` from the target binary's ELF header. Static (non-PIE)
/// binaries only: PIE/ASLR entry-point translation is explicitly out of
/// scope (see DESIGN.md).
pub fn read_entry_point(path: &str) -> Result<u64> {
    let bytes = fs::read(path).map_err(|e| Error::Fatal(format!("read {}: {}", path, e)))?;
    let elf = goblin::elf::Elf::parse(&bytes)
        .map_err(|e| Error::Fatal(format!("parse ELF header of {}: {}", path, e)))?;
    Ok(elf.entry)
}
