//! Shared application state
//!
//! A debugging session over a simulated x86-64 inferior, laid out from the
//! entry point of the loaded binary (or a default one).

use std::rc::Rc;

use anyhow::{anyhow, bail, Result};

use crate::arch::{displaced_step_buffer_addresses, Amd64, Gdbarch};
use crate::core::memory::{MemoryProtection, MemoryRegion, TargetMemory};
use crate::core::registers::RegisterState;
use crate::core::sim::SimulatedTarget;
use crate::core::{Debugger, Ptid, StopSignal, Target};
use crate::displaced::{FinishStatus, PrepareStatus};
use crate::loader::LoadedBinary;

use super::commands::ThreadRef;

/// PID of the simulated inferior
pub const DEFAULT_PID: u32 = 1000;

/// Entry point used when no binary is given
pub const DEFAULT_ENTRY_POINT: u64 = 0x401000;

const IMAGE_SIZE: u64 = 0x10000;
const STACK_TOP: u64 = 0x7ffff000;
const STACK_SIZE: u64 = 0x10000;

/// Session settings, filled from the command line
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Binary whose entry point anchors the scratch area
    pub target: Option<String>,
    /// Number of displaced-step buffers
    pub buffer_count: usize,
    /// Start with displaced-stepping debug output on
    pub debug_displaced: bool,
    pub pid: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target: None,
            buffer_count: 1,
            debug_displaced: false,
            pid: DEFAULT_PID,
        }
    }
}

/// A scratch buffer as shown to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferView {
    pub address: u64,
    pub owner: Option<Ptid>,
    pub has_closure: bool,
}

/// Shared application state
pub struct AppState {
    pub config: SessionConfig,
    /// Currently loaded binary
    pub binary: Option<LoadedBinary>,
    pub debugger: Debugger<SimulatedTarget>,
    /// Process that memory commands act on
    current_pid: u32,
}

impl AppState {
    pub fn new(config: SessionConfig) -> Result<Self> {
        let binary = config
            .target
            .as_deref()
            .map(LoadedBinary::from_file)
            .transpose()?;

        let entry_point = match &binary {
            Some(binary) if !binary.is_x86_64() => {
                bail!(
                    "{}: {} {} binaries are not supported, only x86-64",
                    binary.path,
                    binary.machine,
                    binary.format
                );
            }
            Some(binary) => binary.entry_point,
            None => DEFAULT_ENTRY_POINT,
        };

        Self::with_entry_point(config, binary, entry_point)
    }

    fn with_entry_point(config: SessionConfig, binary: Option<LoadedBinary>, entry_point: u64) -> Result<Self> {
        if config.buffer_count == 0 {
            bail!("at least one displaced-step buffer is needed");
        }

        let arch: Rc<dyn Gdbarch> = Rc::new(Amd64);
        let scratch = displaced_step_buffer_addresses(arch.as_ref(), entry_point, config.buffer_count);
        let scratch_end = scratch
            .last()
            .map(|addr| addr + arch.max_insn_length() as u64)
            .unwrap_or(entry_point);

        let image_base = entry_point & !0xfff;
        let image_size = IMAGE_SIZE.max((scratch_end - image_base + 0xfff) & !0xfff);

        let pid = config.pid;
        let mut target = SimulatedTarget::new();
        target.map(
            pid,
            MemoryRegion::new(image_base, image_size as usize, MemoryProtection::RWX).with_name("[text]"),
        );
        target.map(
            pid,
            MemoryRegion::new(STACK_TOP - STACK_SIZE, STACK_SIZE as usize, MemoryProtection::RW)
                .with_name("[stack]"),
        );
        target.add_thread(Ptid::process(pid), Self::initial_registers(entry_point));

        let mut debugger = Debugger::new(target, arch, scratch);
        debugger.attach(pid)?;

        Ok(Self {
            config,
            binary,
            debugger,
            current_pid: pid,
        })
    }

    fn initial_registers(pc: u64) -> RegisterState {
        RegisterState {
            rsp: STACK_TOP - 0x100,
            ..RegisterState::at_pc(pc)
        }
    }

    pub fn current_pid(&self) -> u32 {
        self.current_pid
    }

    /// Make `pid` the process memory commands act on.
    pub fn select_process(&mut self, pid: u32) -> Result<()> {
        if self.debugger.inferior(pid).is_none() {
            bail!("process {} is not being debugged", pid);
        }
        self.current_pid = pid;
        Ok(())
    }

    /// Resolve a thread reference against the current process.
    pub fn resolve(&self, thread: ThreadRef) -> Ptid {
        Ptid::new(thread.pid.unwrap_or(self.current_pid), thread.tid)
    }

    fn current(&self) -> Ptid {
        Ptid::process(self.current_pid)
    }

    pub fn map(&mut self, address: u64, size: usize) -> Result<()> {
        if size == 0 || address.checked_add(size as u64).is_none() {
            bail!("invalid region {:#x} (+{:#x})", address, size);
        }
        self.debugger
            .target_mut()
            .map(self.current_pid, MemoryRegion::new(address, size, MemoryProtection::RWX));
        Ok(())
    }

    /// Drop the region of the current process starting at `address`.
    pub fn unmap(&mut self, address: u64) -> Result<()> {
        if !self.debugger.target_mut().unmap(self.current_pid, address) {
            bail!("no region starts at {:#x}", address);
        }
        Ok(())
    }

    pub fn regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.debugger.target().regions(self.current_pid)
    }

    pub fn poke(&mut self, address: u64, bytes: &[u8]) -> Result<()> {
        let ptid = self.current();
        self.debugger.target_mut().write_memory(ptid, address, bytes)?;
        Ok(())
    }

    /// Read memory with breakpoints hidden, as the program sees it.
    pub fn examine(&mut self, address: u64, len: usize) -> Result<Vec<u8>> {
        let ptid = self.current();
        Ok(self.debugger.target_mut().read_vec(ptid, address, len)?)
    }

    /// Add a stopped thread at `pc` to the current process.
    pub fn spawn_thread(&mut self, tid: u32, pc: u64) -> Result<Ptid> {
        let ptid = Ptid::new(self.current_pid, tid);
        if self.debugger.thread(ptid).is_some() {
            bail!("{} already exists", ptid);
        }
        self.debugger.add_thread(ptid)?;
        self.debugger
            .target_mut()
            .add_thread(ptid, Self::initial_registers(pc));
        Ok(ptid)
    }

    pub fn pc(&mut self, thread: ThreadRef) -> Result<u64> {
        let ptid = self.resolve(thread);
        Ok(self.debugger.target_mut().read_pc(ptid)?)
    }

    pub fn set_pc(&mut self, thread: ThreadRef, pc: u64) -> Result<()> {
        let ptid = self.resolve(thread);
        self.debugger.target_mut().write_pc(ptid, pc)?;
        Ok(())
    }

    pub fn insert_breakpoint(&mut self, address: u64) -> Result<()> {
        let ptid = self.current();
        let arch = Rc::clone(self.debugger.arch());
        let insn = arch.breakpoint_from_pc(address);
        self.debugger
            .target_mut()
            .insert_breakpoint(ptid, address, insn)?;
        Ok(())
    }

    pub fn remove_breakpoint(&mut self, address: u64) -> Result<bool> {
        let ptid = self.current();
        Ok(self.debugger.target_mut().remove_breakpoint(ptid, address)?)
    }

    pub fn prepare(&mut self, thread: ThreadRef) -> Result<PrepareStatus> {
        let ptid = self.resolve(thread);
        Ok(self.debugger.displaced_step_prepare(ptid)?)
    }

    pub fn finish(&mut self, thread: ThreadRef, signal: StopSignal) -> Result<FinishStatus> {
        let ptid = self.resolve(thread);
        Ok(self.debugger.displaced_step_finish(ptid, signal)?)
    }

    /// Mark the last stop of a thread as caused (or not) by a watchpoint.
    pub fn set_watchpoint_stop(&mut self, thread: ThreadRef, stopped: bool) {
        let ptid = self.resolve(thread);
        self.debugger
            .target_mut()
            .set_stopped_by_watchpoint(ptid, stopped);
    }

    /// Buffers of the current process in pool order.
    pub fn buffers(&self) -> Result<Vec<BufferView>> {
        let inferior = self
            .debugger
            .inferior(self.current_pid)
            .ok_or_else(|| anyhow!("process {} is not being debugged", self.current_pid))?;
        let pool = &inferior.displaced_buffers;

        Ok(pool
            .addresses()
            .map(|address| BufferView {
                address,
                owner: pool.owner(address),
                has_closure: pool.copy_insn_closure_by_addr(address).is_some(),
            })
            .collect())
    }

    /// Put the scratch contents of the current process back into `into`.
    pub fn restore(&mut self, into: u32) -> Result<()> {
        self.debugger
            .restore_scratch(self.current_pid, Ptid::process(into))?;
        Ok(())
    }

    /// Fork `parent` into a new process `child`.
    pub fn fork(&mut self, parent: ThreadRef, child: u32) -> Result<()> {
        let parent = self.resolve(parent);
        if self.debugger.target().has_process(child) {
            bail!("process {} already exists", child);
        }
        self.debugger.target_mut().fork(parent, child)?;
        self.debugger.handle_fork(parent, child)?;
        Ok(())
    }

    pub fn detach(&mut self) -> Result<()> {
        self.debugger.detach(self.current_pid)?;
        self.select_remaining();
        Ok(())
    }

    /// The current process exits.
    pub fn exit(&mut self) {
        self.debugger.handle_exit(self.current_pid);
        self.select_remaining();
    }

    fn select_remaining(&mut self) {
        if let Some(next) = self.debugger.inferiors().next() {
            self.current_pid = next.pid;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AppState {
        AppState::new(SessionConfig::default()).unwrap()
    }

    fn main_thread() -> ThreadRef {
        ThreadRef { pid: None, tid: DEFAULT_PID }
    }

    #[test]
    fn test_default_session_layout() {
        let state = state();
        let buffers = state.buffers().unwrap();
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[0].address, DEFAULT_ENTRY_POINT + 2);
        assert_eq!(buffers[0].owner, None);
        assert_eq!(state.regions().count(), 2);
    }

    #[test]
    fn test_zero_buffers_rejected() {
        let config = SessionConfig {
            buffer_count: 0,
            ..SessionConfig::default()
        };
        assert!(AppState::new(config).is_err());
    }

    #[test]
    fn test_step_over_breakpoint() {
        let mut state = state();
        let code = DEFAULT_ENTRY_POINT + 0x100;
        // jmp +0x10
        state.poke(code, &[0xeb, 0x10]).unwrap();
        state.insert_breakpoint(code).unwrap();
        state.set_pc(main_thread(), code).unwrap();

        let scratch = DEFAULT_ENTRY_POINT + 2;
        assert_eq!(
            state.prepare(main_thread()).unwrap(),
            PrepareStatus::Ok { displaced_pc: scratch }
        );
        assert_eq!(state.examine(scratch, 2).unwrap(), vec![0xeb, 0x10]);
        assert_eq!(state.buffers().unwrap()[0].owner, Some(Ptid::process(DEFAULT_PID)));

        // The thread executes the jump inside the scratch pad.
        state.set_pc(main_thread(), scratch + 2 + 0x10).unwrap();
        assert_eq!(
            state.finish(main_thread(), StopSignal::Trap).unwrap(),
            FinishStatus::Ok
        );
        assert_eq!(state.pc(main_thread()).unwrap(), code + 2 + 0x10);
        assert_eq!(state.examine(scratch, 2).unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_second_thread_waits_for_buffer() {
        let mut state = state();
        let other = state.spawn_thread(7, DEFAULT_ENTRY_POINT + 0x200).unwrap();
        let other = ThreadRef {
            pid: Some(other.pid),
            tid: other.tid,
        };

        assert!(matches!(
            state.prepare(main_thread()).unwrap(),
            PrepareStatus::Ok { .. }
        ));
        assert_eq!(state.prepare(other).unwrap(), PrepareStatus::Unavailable);
        assert!(state.spawn_thread(7, 0).is_err());
    }

    #[test]
    fn test_fork_and_select() {
        let mut state = state();
        let code = DEFAULT_ENTRY_POINT + 0x100;
        let scratch = DEFAULT_ENTRY_POINT + 2;
        state.poke(code, &[0x90]).unwrap();
        state.set_pc(main_thread(), code).unwrap();
        assert!(matches!(
            state.prepare(main_thread()).unwrap(),
            PrepareStatus::Ok { .. }
        ));

        state.fork(main_thread(), 2000).unwrap();
        assert_eq!(state.examine(scratch, 2).unwrap(), vec![0x90, 0]);
        state.select_process(2000).unwrap();
        // The child got the original scratch bytes back.
        assert_eq!(state.examine(scratch, 2).unwrap(), vec![0, 0]);
        assert!(state.buffers().unwrap()[0].owner.is_none());

        state.exit();
        assert_eq!(state.current_pid(), DEFAULT_PID);
        assert!(state.select_process(2000).is_err());
    }

    #[test]
    fn test_repeated_prepare_and_stray_finish_are_errors() {
        let mut state = state();
        state.poke(DEFAULT_ENTRY_POINT + 0x100, &[0x90]).unwrap();
        state.set_pc(main_thread(), DEFAULT_ENTRY_POINT + 0x100).unwrap();
        assert!(matches!(
            state.prepare(main_thread()).unwrap(),
            PrepareStatus::Ok { .. }
        ));

        let err = state.prepare(main_thread()).unwrap_err();
        assert!(err.to_string().contains("already in the middle of a displaced step"));

        let idle = state.spawn_thread(4242, DEFAULT_ENTRY_POINT).unwrap();
        let idle = ThreadRef {
            pid: Some(idle.pid),
            tid: idle.tid,
        };
        let err = state.finish(idle, StopSignal::Trap).unwrap_err();
        assert!(err.to_string().contains("has no displaced step in progress"));

        // The session is still usable afterwards.
        assert_eq!(
            state.finish(main_thread(), StopSignal::Trap).unwrap(),
            FinishStatus::Ok
        );
    }

    #[test]
    fn test_map_and_unmap() {
        let mut state = state();
        assert!(state.map(0xffff_ffff_ffff_f000, 0x2000).is_err());
        assert!(state.map(0x1000_0000, 0).is_err());

        state.map(0x1000_0000, 0x1000).unwrap();
        state.poke(0x1000_0010, &[1, 2]).unwrap();
        assert_eq!(state.examine(0x1000_0010, 2).unwrap(), vec![1, 2]);

        state.unmap(0x1000_0000).unwrap();
        assert!(state.examine(0x1000_0010, 2).is_err());
        assert!(state.unmap(0x1000_0000).is_err());
    }
}
