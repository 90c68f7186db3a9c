//! Target abstraction for the stopped debuggee.
//!
//! The [`Target`] trait gathers the process-side capabilities displaced
//! stepping consumes: memory, registers, breakpoint presence and watchpoint
//! stop status. Every request names the thread it is for.

use super::memory::TargetMemory;
use super::registers::RegisterError;
use super::types::Ptid;

/// Process-side collaborator of the displaced-step machinery.
pub trait Target: TargetMemory {
    /// Read the program counter of `ptid`.
    fn read_pc(&mut self, ptid: Ptid) -> Result<u64, RegisterError>;

    /// Set the program counter of `ptid`.
    fn write_pc(&mut self, ptid: Ptid, pc: u64) -> Result<(), RegisterError>;

    /// Read a register by architecture register number.
    fn read_register(&mut self, ptid: Ptid, regnum: usize) -> Result<u64, RegisterError>;

    /// Write a register by architecture register number.
    fn write_register(&mut self, ptid: Ptid, regnum: usize, value: u64) -> Result<(), RegisterError>;

    /// Whether a breakpoint is inserted anywhere in `[address, address + len)`
    /// of the address space `ptid` belongs to.
    fn breakpoint_inserted_in_range(&self, ptid: Ptid, address: u64, len: usize) -> bool;

    /// Whether the last stop of `ptid` was caused by a watchpoint.
    fn stopped_by_watchpoint(&self, _ptid: Ptid) -> bool {
        false
    }

    /// Whether the target's watchpoints trigger before the access and need
    /// the instruction stepped afterwards.
    fn have_steppable_watchpoint(&self) -> bool {
        false
    }
}
