//! Simulated inferior - in-memory processes for driving displaced stepping
//! without a live debuggee.
//!
//! Used by the maintenance REPL and by the test suite.

use std::collections::{BTreeMap, HashSet};

use super::breakpoints::BreakpointTable;
use super::debugger::{DebugError, ProcessControl};
use super::memory::{MemoryError, MemoryRegion, TargetMemory};
use super::registers::{amd64, RegisterError, RegisterState};
use super::target::Target;
use super::types::Ptid;

#[derive(Debug, Clone, Default)]
struct SimProcess {
    regions: Vec<MemoryRegion>,
    threads: BTreeMap<u32, RegisterState>,
}

impl SimProcess {
    fn region(&self, address: u64, len: usize) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.contains(address, len))
    }

    fn region_mut(&mut self, address: u64, len: usize) -> Option<&mut MemoryRegion> {
        self.regions.iter_mut().find(|r| r.contains(address, len))
    }
}

/// A set of stopped, simulated processes with AMD64 register files.
#[derive(Debug, Default)]
pub struct SimulatedTarget {
    processes: BTreeMap<u32, SimProcess>,
    breakpoints: BreakpointTable,
    watchpoint_stops: HashSet<Ptid>,
    steppable_watchpoints: bool,
}

impl SimulatedTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_process(&mut self, pid: u32) {
        self.processes.entry(pid).or_default();
    }

    pub fn has_process(&self, pid: u32) -> bool {
        self.processes.contains_key(&pid)
    }

    /// Forget a process entirely (it exited or was detached).
    pub fn remove_process(&mut self, pid: u32) {
        self.processes.remove(&pid);
        self.breakpoints.forget_process(pid);
        self.watchpoint_stops.retain(|ptid| ptid.pid != pid);
    }

    /// Duplicate `parent` as a new process `child` with a single thread that
    /// has the registers of `parent_thread`.
    ///
    /// Memory is copied as is, inserted breakpoint instructions included;
    /// the breakpoint records follow through [`ProcessControl::clone_process`].
    pub fn fork(&mut self, parent_thread: Ptid, child: u32) -> Result<(), RegisterError> {
        let parent = self
            .processes
            .get(&parent_thread.pid)
            .ok_or(RegisterError::UnknownThread(parent_thread))?;
        let regs = parent
            .threads
            .get(&parent_thread.tid)
            .cloned()
            .ok_or(RegisterError::UnknownThread(parent_thread))?;

        let mut process = SimProcess {
            regions: parent.regions.clone(),
            threads: BTreeMap::new(),
        };
        process.threads.insert(child, regs);
        self.processes.insert(child, process);
        Ok(())
    }

    /// Map a region into a process, creating the process if needed.
    pub fn map(&mut self, pid: u32, region: MemoryRegion) {
        self.processes.entry(pid).or_default().regions.push(region);
    }

    /// Unmap the region starting at `base_address`. Returns false if absent.
    pub fn unmap(&mut self, pid: u32, base_address: u64) -> bool {
        let Some(process) = self.processes.get_mut(&pid) else {
            return false;
        };
        let before = process.regions.len();
        process.regions.retain(|r| r.base_address != base_address);
        process.regions.len() != before
    }

    pub fn regions(&self, pid: u32) -> impl Iterator<Item = &MemoryRegion> {
        self.processes
            .get(&pid)
            .into_iter()
            .flat_map(|p| p.regions.iter())
    }

    /// Add a stopped thread, creating its process if needed.
    pub fn add_thread(&mut self, ptid: Ptid, regs: RegisterState) {
        self.processes
            .entry(ptid.pid)
            .or_default()
            .threads
            .insert(ptid.tid, regs);
    }

    pub fn threads(&self, pid: u32) -> impl Iterator<Item = Ptid> + '_ {
        self.processes
            .get(&pid)
            .into_iter()
            .flat_map(move |p| p.threads.keys().map(move |tid| Ptid::new(pid, *tid)))
    }

    pub fn registers(&self, ptid: Ptid) -> Option<&RegisterState> {
        self.processes.get(&ptid.pid)?.threads.get(&ptid.tid)
    }

    pub fn registers_mut(&mut self, ptid: Ptid) -> Result<&mut RegisterState, RegisterError> {
        self.processes
            .get_mut(&ptid.pid)
            .and_then(|p| p.threads.get_mut(&ptid.tid))
            .ok_or(RegisterError::UnknownThread(ptid))
    }

    pub fn insert_breakpoint(&mut self, ptid: Ptid, address: u64, insn: &[u8]) -> Result<(), MemoryError> {
        let mut memory = SimMemory(&mut self.processes);
        self.breakpoints.insert(&mut memory, ptid, address, insn)
    }

    pub fn remove_breakpoint(&mut self, ptid: Ptid, address: u64) -> Result<bool, MemoryError> {
        let mut memory = SimMemory(&mut self.processes);
        self.breakpoints.remove(&mut memory, ptid, address)
    }

    pub fn breakpoints(&self) -> &BreakpointTable {
        &self.breakpoints
    }

    /// Mark the last stop of `ptid` as caused (or not) by a watchpoint.
    pub fn set_stopped_by_watchpoint(&mut self, ptid: Ptid, stopped: bool) {
        if stopped {
            self.watchpoint_stops.insert(ptid);
        } else {
            self.watchpoint_stops.remove(&ptid);
        }
    }

    pub fn set_steppable_watchpoints(&mut self, steppable: bool) {
        self.steppable_watchpoints = steppable;
    }
}

/// Memory view over the process map, split off so breakpoint bookkeeping
/// can borrow it alongside the breakpoint table.
struct SimMemory<'a>(&'a mut BTreeMap<u32, SimProcess>);

impl TargetMemory for SimMemory<'_> {
    fn read_memory(&mut self, ptid: Ptid, address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let process = self
            .0
            .get(&ptid.pid)
            .ok_or(MemoryError::NoProcess { pid: ptid.pid })?;
        process
            .region(address, buf.len())
            .ok_or(MemoryError::Unmapped { address })?
            .read(address, buf)
    }

    fn write_memory(&mut self, ptid: Ptid, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        let process = self
            .0
            .get_mut(&ptid.pid)
            .ok_or(MemoryError::NoProcess { pid: ptid.pid })?;
        process
            .region_mut(address, data.len())
            .ok_or(MemoryError::Unmapped { address })?
            .write(address, data)
    }
}

/// Reads and writes see program contents: inserted breakpoints are
/// shadowed the same way a real debugger hides them.
impl TargetMemory for SimulatedTarget {
    fn read_memory(&mut self, ptid: Ptid, address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        SimMemory(&mut self.processes).read_memory(ptid, address, buf)?;
        self.breakpoints.shadow_contents(ptid.pid, address, buf);
        Ok(())
    }

    fn write_memory(&mut self, ptid: Ptid, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.breakpoints
            .shadow_write(&mut SimMemory(&mut self.processes), ptid, address, data)
    }
}

impl SimulatedTarget {
    /// Read memory as it is, breakpoint instructions included.
    pub fn read_raw(&mut self, ptid: Ptid, address: u64, len: usize) -> Result<Vec<u8>, MemoryError> {
        SimMemory(&mut self.processes).read_vec(ptid, address, len)
    }
}

impl Target for SimulatedTarget {
    fn read_pc(&mut self, ptid: Ptid) -> Result<u64, RegisterError> {
        self.read_register(ptid, amd64::RIP)
    }

    fn write_pc(&mut self, ptid: Ptid, pc: u64) -> Result<(), RegisterError> {
        self.write_register(ptid, amd64::RIP, pc)
    }

    fn read_register(&mut self, ptid: Ptid, regnum: usize) -> Result<u64, RegisterError> {
        self.registers(ptid)
            .ok_or(RegisterError::UnknownThread(ptid))?
            .get(regnum)
    }

    fn write_register(&mut self, ptid: Ptid, regnum: usize, value: u64) -> Result<(), RegisterError> {
        self.registers_mut(ptid)?.set(regnum, value)
    }

    fn breakpoint_inserted_in_range(&self, ptid: Ptid, address: u64, len: usize) -> bool {
        self.breakpoints.inserted_in_range(ptid.pid, address, len)
    }

    fn stopped_by_watchpoint(&self, ptid: Ptid) -> bool {
        self.watchpoint_stops.contains(&ptid)
    }

    fn have_steppable_watchpoint(&self) -> bool {
        self.steppable_watchpoints
    }
}

/// Simulated processes keep running after a detach, minus breakpoints.
impl ProcessControl for SimulatedTarget {
    fn attach(&mut self, pid: u32) -> Result<(), DebugError> {
        if self.has_process(pid) {
            Ok(())
        } else {
            Err(DebugError::AttachFailed {
                pid,
                reason: "no such process".into(),
            })
        }
    }

    fn detach(&mut self, pid: u32) -> Result<(), DebugError> {
        if !self.has_process(pid) {
            return Err(DebugError::ProcessNotFound { pid });
        }

        let ptid = Ptid::process(pid);
        let addresses: Vec<u64> = self.breakpoints.for_process(pid).map(|bp| bp.address).collect();
        for address in addresses {
            self.remove_breakpoint(ptid, address)
                .map_err(|e| DebugError::DetachFailed {
                    pid,
                    reason: e.to_string(),
                })?;
        }
        self.watchpoint_stops.retain(|ptid| ptid.pid != pid);
        Ok(())
    }

    fn forget_process(&mut self, pid: u32) {
        self.remove_process(pid);
    }

    fn clone_process(&mut self, parent: u32, child: u32) {
        self.breakpoints.clone_process(parent, child);
    }
}
