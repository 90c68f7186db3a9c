//! Binary Loader Module
//!
//! Parses PE/ELF executables using goblin and extracts what scratch
//! placement needs:
//! - Entry point
//! - Bitness
//! - Machine

use anyhow::{anyhow, Result};
use std::fs;
use std::path::Path;

/// Parsed binary information
#[derive(Debug, Clone)]
pub struct LoadedBinary {
    /// Original file path
    pub path: String,
    /// Entry point address
    pub entry_point: u64,
    /// Image base address
    pub image_base: u64,
    /// Is this a 64-bit binary?
    pub is_64bit: bool,
    /// Binary format (PE, ELF)
    pub format: String,
    /// Machine name (e.g., "x86-64")
    pub machine: String,
}

impl LoadedBinary {
    /// Load and parse a binary file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let data = fs::read(&path)?;
        Self::from_bytes(&data, path_str)
    }

    /// Parse binary from bytes
    pub fn from_bytes(data: &[u8], path: String) -> Result<Self> {
        if data.len() < 4 {
            return Err(anyhow!("File too small"));
        }

        // Check for PE (MZ header)
        if data[0] == 0x4D && data[1] == 0x5A {
            return Self::parse_pe(data, path);
        }

        // Check for ELF
        if data[0..4] == [0x7F, b'E', b'L', b'F'] {
            return Self::parse_elf(data, path);
        }

        Err(anyhow!("Unknown binary format"))
    }

    /// Whether the machine is one the x86-64 displaced stepper handles.
    pub fn is_x86_64(&self) -> bool {
        self.is_64bit && self.machine == "x86-64"
    }

    /// Parse PE (Windows executable)
    fn parse_pe(data: &[u8], path: String) -> Result<Self> {
        let pe = goblin::pe::PE::parse(data).map_err(|e| anyhow!("Failed to parse PE: {}", e))?;

        let image_base = pe.image_base as u64;
        let machine = match pe.header.coff_header.machine {
            goblin::pe::header::COFF_MACHINE_X86_64 => "x86-64",
            goblin::pe::header::COFF_MACHINE_X86 => "x86",
            goblin::pe::header::COFF_MACHINE_ARM64 => "aarch64",
            _ => "unknown",
        };

        Ok(Self {
            path,
            entry_point: image_base + pe.entry as u64,
            image_base,
            is_64bit: pe.is_64,
            format: "PE".to_string(),
            machine: machine.to_string(),
        })
    }

    /// Parse ELF (Linux executable)
    fn parse_elf(data: &[u8], path: String) -> Result<Self> {
        let elf = goblin::elf::Elf::parse(data)?;

        let machine = match elf.header.e_machine {
            goblin::elf::header::EM_X86_64 => "x86-64",
            goblin::elf::header::EM_386 => "x86",
            goblin::elf::header::EM_ARM => "arm",
            goblin::elf::header::EM_AARCH64 => "aarch64",
            goblin::elf::header::EM_RISCV => "riscv",
            _ => "unknown",
        };

        // Get image base
        let image_base = elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == goblin::elf::program_header::PT_LOAD)
            .map(|ph| ph.p_vaddr)
            .min()
            .unwrap_or(0);

        Ok(Self {
            path,
            entry_point: elf.entry,
            image_base,
            is_64bit: elf.is_64,
            format: "ELF".to_string(),
            machine: machine.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bare ELF64 header: x86-64 executable, no program or section headers.
    fn elf64_header(machine: u16, entry: u64) -> Vec<u8> {
        let mut data = vec![0x7f, b'E', b'L', b'F', 2, 1, 1, 0];
        data.resize(16, 0);
        data.extend_from_slice(&2u16.to_le_bytes()); // e_type: EXEC
        data.extend_from_slice(&machine.to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes()); // e_version
        data.extend_from_slice(&entry.to_le_bytes());
        data.extend_from_slice(&0u64.to_le_bytes()); // e_phoff
        data.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        data.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        data.extend_from_slice(&64u16.to_le_bytes()); // e_ehsize
        data.extend_from_slice(&56u16.to_le_bytes()); // e_phentsize
        data.extend_from_slice(&0u16.to_le_bytes()); // e_phnum
        data.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
        data.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        data.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
        data
    }

    #[test]
    fn test_elf_entry_point() {
        let data = elf64_header(goblin::elf::header::EM_X86_64, 0x401000);
        let binary = LoadedBinary::from_bytes(&data, "a.out".into()).unwrap();

        assert_eq!(binary.format, "ELF");
        assert_eq!(binary.entry_point, 0x401000);
        assert_eq!(binary.image_base, 0);
        assert!(binary.is_x86_64());
    }

    #[test]
    fn test_foreign_machine() {
        let data = elf64_header(goblin::elf::header::EM_AARCH64, 0x400000);
        let binary = LoadedBinary::from_bytes(&data, "a.out".into()).unwrap();
        assert_eq!(binary.machine, "aarch64");
        assert!(!binary.is_x86_64());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(LoadedBinary::from_bytes(&[0x7f], "x".into()).is_err());
        assert!(LoadedBinary::from_bytes(b"#!/bin/sh\n", "x".into()).is_err());
    }
}
