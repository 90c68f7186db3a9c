//! Software breakpoint bookkeeping.
//!
//! Tracks inserted breakpoints together with the bytes they replaced, and
//! answers the range query displaced stepping uses to vet scratch buffers.

use std::collections::BTreeMap;

use super::memory::{MemoryError, TargetMemory};
use super::types::Ptid;

/// Software breakpoint info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    /// Breakpoint address
    pub address: u64,
    /// Original bytes at this address
    pub shadow: Vec<u8>,
    /// Breakpoint instruction written over them
    pub insn: Vec<u8>,
}

impl Breakpoint {
    pub fn len(&self) -> usize {
        self.shadow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shadow.is_empty()
    }

    /// Whether this breakpoint's bytes overlap `[address, address + len)`.
    pub fn overlaps(&self, address: u64, len: usize) -> bool {
        let end = address.saturating_add(len as u64);
        let bp_end = self.address.saturating_add(self.len() as u64);
        self.address < end && address < bp_end
    }
}

/// Inserted breakpoints of every process, keyed by (pid, address).
#[derive(Debug, Default)]
pub struct BreakpointTable {
    inserted: BTreeMap<(u32, u64), Breakpoint>,
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a breakpoint by writing `insn` over the code at `address`.
    ///
    /// Inserting at an address that already holds one is a no-op.
    pub fn insert(
        &mut self,
        memory: &mut dyn TargetMemory,
        ptid: Ptid,
        address: u64,
        insn: &[u8],
    ) -> Result<(), MemoryError> {
        if self.inserted.contains_key(&(ptid.pid, address)) {
            return Ok(());
        }

        let shadow = memory.read_vec(ptid, address, insn.len())?;
        memory.write_memory(ptid, address, insn)?;

        log::debug!("Inserted breakpoint at {:#x} in {}", address, ptid);
        self.inserted.insert(
            (ptid.pid, address),
            Breakpoint {
                address,
                shadow,
                insn: insn.to_vec(),
            },
        );
        Ok(())
    }

    /// Remove the breakpoint at `address`, restoring its shadow bytes.
    ///
    /// Returns false if there was none.
    pub fn remove(
        &mut self,
        memory: &mut dyn TargetMemory,
        ptid: Ptid,
        address: u64,
    ) -> Result<bool, MemoryError> {
        let Some(bp) = self.inserted.get(&(ptid.pid, address)) else {
            return Ok(false);
        };

        memory.write_memory(ptid, address, &bp.shadow)?;
        self.inserted.remove(&(ptid.pid, address));

        log::debug!("Removed breakpoint at {:#x} in {}", address, ptid);
        Ok(true)
    }

    /// Whether any breakpoint of process `pid` overlaps `[address, address + len)`.
    pub fn inserted_in_range(&self, pid: u32, address: u64, len: usize) -> bool {
        self.for_process(pid).any(|bp| bp.overlaps(address, len))
    }

    /// Replace breakpoint instructions in `buf`, read from `address`, with
    /// the program bytes they cover.
    pub fn shadow_contents(&self, pid: u32, address: u64, buf: &mut [u8]) {
        for bp in self.for_process(pid) {
            for (i, byte) in bp.shadow.iter().enumerate() {
                let at = bp.address + i as u64;
                if at >= address && at - address < buf.len() as u64 {
                    buf[(at - address) as usize] = *byte;
                }
            }
        }
    }

    /// Write program bytes at `address` around inserted breakpoints.
    ///
    /// Bytes landing under a breakpoint go to its shadow and the breakpoint
    /// instruction stays in memory. Shadows change only once the write went
    /// through.
    pub fn shadow_write(
        &mut self,
        memory: &mut dyn TargetMemory,
        ptid: Ptid,
        address: u64,
        data: &[u8],
    ) -> Result<(), MemoryError> {
        let mut out = data.to_vec();
        let mut covered = Vec::new();
        let end = address.saturating_add(data.len() as u64);
        for bp in self.for_process(ptid.pid) {
            for (i, insn_byte) in bp.insn.iter().enumerate() {
                let at = bp.address + i as u64;
                if at >= address && at < end {
                    let offset = (at - address) as usize;
                    out[offset] = *insn_byte;
                    covered.push((bp.address, i, data[offset]));
                }
            }
        }

        memory.write_memory(ptid, address, &out)?;

        for (bp_address, i, byte) in covered {
            if let Some(bp) = self.inserted.get_mut(&(ptid.pid, bp_address)) {
                bp.shadow[i] = byte;
            }
        }
        Ok(())
    }

    pub fn for_process(&self, pid: u32) -> impl Iterator<Item = &Breakpoint> {
        self.inserted
            .range((pid, 0)..=(pid, u64::MAX))
            .map(|(_, bp)| bp)
    }

    /// Drop every breakpoint of a process that went away, without touching
    /// memory.
    pub fn forget_process(&mut self, pid: u32) {
        self.inserted.retain(|(bp_pid, _), _| *bp_pid != pid);
    }

    /// Copy the breakpoints of `parent` to `child` after a fork; the child's
    /// memory already holds the breakpoint instructions.
    pub fn clone_process(&mut self, parent: u32, child: u32) {
        let copies: Vec<Breakpoint> = self.for_process(parent).cloned().collect();
        for bp in copies {
            self.inserted.insert((child, bp.address), bp);
        }
    }
}
