//! Memory - Debuggee memory operations
//!
//! Raw read/write primitives addressed to a specific process/thread, plus the
//! in-memory region type used by simulated inferiors.

use thiserror::Error;

use super::types::Ptid;

/// Memory operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Failed to read memory at {address:#x}: {reason}")]
    ReadFailed { address: u64, reason: String },

    #[error("Failed to write memory at {address:#x}: {reason}")]
    WriteFailed { address: u64, reason: String },

    #[error("Cannot access memory at address {address:#x}")]
    Unmapped { address: u64 },

    #[error("Access denied at {address:#x}")]
    AccessDenied { address: u64 },

    #[error("No process {pid}")]
    NoProcess { pid: u32 },
}

impl MemoryError {
    /// Address the failed request targeted, if any.
    pub fn address(&self) -> Option<u64> {
        match self {
            MemoryError::ReadFailed { address, .. }
            | MemoryError::WriteFailed { address, .. }
            | MemoryError::Unmapped { address }
            | MemoryError::AccessDenied { address } => Some(*address),
            MemoryError::NoProcess { .. } => None,
        }
    }
}

/// Raw memory access on the debuggee.
///
/// Every request names the process/thread it is meant for; implementors must
/// not substitute some other "current" thread.
pub trait TargetMemory {
    /// Fill `buf` with the bytes at `address`. Short reads are errors.
    fn read_memory(&mut self, ptid: Ptid, address: u64, buf: &mut [u8]) -> Result<(), MemoryError>;

    /// Write all of `data` at `address`.
    fn write_memory(&mut self, ptid: Ptid, address: u64, data: &[u8]) -> Result<(), MemoryError>;

    /// Read `len` bytes into a fresh vector.
    fn read_vec(&mut self, ptid: Ptid, address: u64, len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut buffer = vec![0u8; len];
        self.read_memory(ptid, address, &mut buffer)?;
        Ok(buffer)
    }

    /// Read a little-endian u64.
    fn read_u64(&mut self, ptid: Ptid, address: u64) -> Result<u64, MemoryError> {
        let mut data = [0u8; 8];
        self.read_memory(ptid, address, &mut data)?;
        Ok(u64::from_le_bytes(data))
    }

    /// Write a little-endian u64.
    fn write_u64(&mut self, ptid: Ptid, address: u64, value: u64) -> Result<(), MemoryError> {
        self.write_memory(ptid, address, &value.to_le_bytes())
    }
}

/// Memory protection flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryProtection {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl MemoryProtection {
    pub const RX: Self = Self {
        read: true,
        write: false,
        execute: true,
    };
    pub const RW: Self = Self {
        read: true,
        write: true,
        execute: false,
    };
    pub const RWX: Self = Self {
        read: true,
        write: true,
        execute: true,
    };
    pub const NONE: Self = Self {
        read: false,
        write: false,
        execute: false,
    };
}

/// A mapped region of a simulated address space, with its contents.
///
/// Protection describes the debuggee's view; debugger writes (breakpoints,
/// relocated instructions) go through as long as the region is accessible
/// at all, the same way ptrace pokes ignore page write protection.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    /// Start address of the region
    pub base_address: u64,

    /// Memory protection flags
    pub protection: MemoryProtection,

    /// Optional name (e.g., "[text]", "[stack]")
    pub name: Option<String>,

    data: Vec<u8>,
}

impl MemoryRegion {
    pub fn new(base_address: u64, size: usize, protection: MemoryProtection) -> Self {
        Self {
            base_address,
            protection,
            name: None,
            data: vec![0u8; size],
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Size of the region in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// One past the last byte, clamped at the top of the address space.
    pub fn end_address(&self) -> u64 {
        self.base_address.saturating_add(self.data.len() as u64)
    }

    /// Whether `[address, address + len)` lies entirely inside this region.
    pub fn contains(&self, address: u64, len: usize) -> bool {
        address >= self.base_address
            && address
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.end_address())
    }

    fn offset(&self, address: u64) -> usize {
        (address - self.base_address) as usize
    }

    pub fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        if !self.contains(address, buf.len()) {
            return Err(MemoryError::Unmapped { address });
        }
        if self.protection == MemoryProtection::NONE {
            return Err(MemoryError::AccessDenied { address });
        }
        let start = self.offset(address);
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    pub fn write(&mut self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        if !self.contains(address, data.len()) {
            return Err(MemoryError::Unmapped { address });
        }
        if self.protection == MemoryProtection::NONE {
            return Err(MemoryError::AccessDenied { address });
        }
        let start = self.offset(address);
        self.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Memory manager reading/writing a live process through `/proc/<pid>/mem`.
///
/// Requests are routed by the `pid` of the ptid they carry, so one manager
/// serves every process the debugger is attached to.
#[derive(Debug, Default)]
pub struct MemoryManager;

#[cfg(target_os = "linux")]
impl TargetMemory for MemoryManager {
    fn read_memory(&mut self, ptid: Ptid, address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        use std::fs::File;
        use std::os::unix::fs::FileExt;

        let mem_path = format!("/proc/{}/mem", ptid.pid);
        let file = File::open(&mem_path).map_err(|e| MemoryError::ReadFailed {
            address,
            reason: e.to_string(),
        })?;

        file.read_exact_at(buf, address)
            .map_err(|e| MemoryError::ReadFailed {
                address,
                reason: e.to_string(),
            })
    }

    fn write_memory(&mut self, ptid: Ptid, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        use std::fs::OpenOptions;
        use std::os::unix::fs::FileExt;

        let mem_path = format!("/proc/{}/mem", ptid.pid);
        let file = OpenOptions::new()
            .write(true)
            .open(&mem_path)
            .map_err(|e| MemoryError::WriteFailed {
                address,
                reason: e.to_string(),
            })?;

        file.write_all_at(data, address)
            .map_err(|e| MemoryError::WriteFailed {
                address,
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_read_write() {
        let mut region = MemoryRegion::new(0x1000, 0x10, MemoryProtection::RX);
        region.write(0x1004, &[1, 2, 3]).unwrap();

        let mut buf = [0u8; 4];
        region.read(0x1003, &mut buf).unwrap();
        assert_eq!(buf, [0, 1, 2, 3]);
    }

    #[test]
    fn test_region_bounds() {
        let region = MemoryRegion::new(0x1000, 0x10, MemoryProtection::RW);
        assert!(region.contains(0x1000, 0x10));
        assert!(!region.contains(0x100c, 5));
        assert!(!region.contains(0xfff, 1));

        let mut buf = [0u8; 8];
        assert_eq!(
            region.read(0x100c, &mut buf),
            Err(MemoryError::Unmapped { address: 0x100c })
        );
    }

    #[test]
    fn test_region_at_top_of_address_space() {
        let region = MemoryRegion::new(0xffff_ffff_ffff_f000, 0x2000, MemoryProtection::RW);
        assert_eq!(region.end_address(), u64::MAX);
        assert!(region.contains(0xffff_ffff_ffff_fff0, 8));
        assert!(!region.contains(0xffff_ffff_ffff_fff8, 16));
    }

    #[test]
    fn test_region_no_access() {
        let mut region = MemoryRegion::new(0x2000, 8, MemoryProtection::NONE);
        assert_eq!(
            region.write(0x2000, &[0xcc]),
            Err(MemoryError::AccessDenied { address: 0x2000 })
        );
    }

    #[test]
    fn test_error_address() {
        let err = MemoryError::ReadFailed {
            address: 0x1000,
            reason: "Input/output error".into(),
        };
        assert_eq!(err.address(), Some(0x1000));
        assert_eq!(
            err.to_string(),
            "Failed to read memory at 0x1000: Input/output error"
        );
        assert_eq!(MemoryError::NoProcess { pid: 3 }.address(), None);
    }
}
