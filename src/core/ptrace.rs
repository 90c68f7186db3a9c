//! Live Linux x86-64 target driven through ptrace.
//!
//! Memory goes through `/proc/<pid>/mem`, registers through
//! `PTRACE_GETREGS`/`PTRACE_SETREGS`, and watchpoint stops are recognised from
//! the `si_code` of the pending SIGTRAP.

use nix::libc::user_regs_struct;
use nix::sys::ptrace;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use super::breakpoints::BreakpointTable;
use super::debugger::{DebugError, ProcessControl};
use super::memory::{MemoryError, MemoryManager, TargetMemory};
use super::registers::{amd64, RegisterError, RegisterState};
use super::target::Target;
use super::types::Ptid;

/// `si_code` of a SIGTRAP raised by a hardware breakpoint/watchpoint.
const TRAP_HWBKPT: i32 = 4;

/// x86-64 `int3`
const BREAKPOINT_INSN: [u8; 1] = [0xcc];

impl From<&user_regs_struct> for RegisterState {
    fn from(regs: &user_regs_struct) -> Self {
        Self {
            rax: regs.rax,
            rbx: regs.rbx,
            rcx: regs.rcx,
            rdx: regs.rdx,
            rsi: regs.rsi,
            rdi: regs.rdi,
            rbp: regs.rbp,
            rsp: regs.rsp,
            r8: regs.r8,
            r9: regs.r9,
            r10: regs.r10,
            r11: regs.r11,
            r12: regs.r12,
            r13: regs.r13,
            r14: regs.r14,
            r15: regs.r15,
            rip: regs.rip,
            rflags: regs.eflags,
        }
    }
}

impl RegisterState {
    fn apply_to(&self, regs: &mut user_regs_struct) {
        regs.rax = self.rax;
        regs.rbx = self.rbx;
        regs.rcx = self.rcx;
        regs.rdx = self.rdx;
        regs.rsi = self.rsi;
        regs.rdi = self.rdi;
        regs.rbp = self.rbp;
        regs.rsp = self.rsp;
        regs.r8 = self.r8;
        regs.r9 = self.r9;
        regs.r10 = self.r10;
        regs.r11 = self.r11;
        regs.r12 = self.r12;
        regs.r13 = self.r13;
        regs.r14 = self.r14;
        regs.r15 = self.r15;
        regs.rip = self.rip;
        regs.eflags = self.rflags;
    }
}

/// Target for ptrace-stopped threads of one or more Linux processes.
#[derive(Debug, Default)]
pub struct PtraceTarget {
    memory: MemoryManager,
    breakpoints: BreakpointTable,
}

impl PtraceTarget {
    pub fn new() -> Self {
        Self::default()
    }

    fn getregs(ptid: Ptid) -> Result<user_regs_struct, RegisterError> {
        ptrace::getregs(Pid::from_raw(ptid.tid as i32)).map_err(|e| RegisterError::AccessFailed {
            ptid,
            reason: e.to_string(),
        })
    }

    fn setregs(ptid: Ptid, regs: user_regs_struct) -> Result<(), RegisterError> {
        ptrace::setregs(Pid::from_raw(ptid.tid as i32), regs).map_err(|e| {
            RegisterError::AccessFailed {
                ptid,
                reason: e.to_string(),
            }
        })
    }

    pub fn insert_breakpoint(&mut self, ptid: Ptid, address: u64) -> Result<(), MemoryError> {
        self.breakpoints
            .insert(&mut self.memory, ptid, address, &BREAKPOINT_INSN)
    }

    pub fn remove_breakpoint(&mut self, ptid: Ptid, address: u64) -> Result<bool, MemoryError> {
        self.breakpoints.remove(&mut self.memory, ptid, address)
    }
}

impl TargetMemory for PtraceTarget {
    fn read_memory(&mut self, ptid: Ptid, address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.memory.read_memory(ptid, address, buf)?;
        self.breakpoints.shadow_contents(ptid.pid, address, buf);
        Ok(())
    }

    fn write_memory(&mut self, ptid: Ptid, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.breakpoints
            .shadow_write(&mut self.memory, ptid, address, data)
    }
}

impl Target for PtraceTarget {
    fn read_pc(&mut self, ptid: Ptid) -> Result<u64, RegisterError> {
        Ok(Self::getregs(ptid)?.rip)
    }

    fn write_pc(&mut self, ptid: Ptid, pc: u64) -> Result<(), RegisterError> {
        let mut regs = Self::getregs(ptid)?;
        regs.rip = pc;
        // Stopped inside an interrupted syscall, the kernel would rewind the
        // new PC to restart it on resume.
        regs.orig_rax = u64::MAX;
        Self::setregs(ptid, regs)
    }

    fn read_register(&mut self, ptid: Ptid, regnum: usize) -> Result<u64, RegisterError> {
        RegisterState::from(&Self::getregs(ptid)?).get(regnum)
    }

    fn write_register(&mut self, ptid: Ptid, regnum: usize, value: u64) -> Result<(), RegisterError> {
        if regnum >= amd64::NUM_REGS {
            return Err(RegisterError::InvalidRegister(regnum));
        }
        let mut raw = Self::getregs(ptid)?;
        let mut state = RegisterState::from(&raw);
        state.set(regnum, value)?;
        state.apply_to(&mut raw);
        Self::setregs(ptid, raw)
    }

    fn breakpoint_inserted_in_range(&self, ptid: Ptid, address: u64, len: usize) -> bool {
        self.breakpoints.inserted_in_range(ptid.pid, address, len)
    }

    fn stopped_by_watchpoint(&self, ptid: Ptid) -> bool {
        ptrace::getsiginfo(Pid::from_raw(ptid.tid as i32))
            .map(|info| info.si_signo == nix::libc::SIGTRAP && info.si_code == TRAP_HWBKPT)
            .unwrap_or(false)
    }
}

impl ProcessControl for PtraceTarget {
    fn attach(&mut self, pid: u32) -> Result<(), DebugError> {
        let raw = Pid::from_raw(pid as i32);
        ptrace::attach(raw).map_err(|e| DebugError::AttachFailed {
            pid,
            reason: e.to_string(),
        })?;

        // Wait for the SIGSTOP the attach queued.
        match waitpid(raw, None) {
            Ok(WaitStatus::Stopped(_, _)) => Ok(()),
            Ok(status) => Err(DebugError::AttachFailed {
                pid,
                reason: format!("unexpected wait status {:?}", status),
            }),
            Err(e) => Err(DebugError::AttachFailed {
                pid,
                reason: e.to_string(),
            }),
        }
    }

    fn detach(&mut self, pid: u32) -> Result<(), DebugError> {
        let ptid = Ptid::process(pid);
        let addresses: Vec<u64> = self.breakpoints.for_process(pid).map(|bp| bp.address).collect();
        for address in addresses {
            if let Err(e) = self.breakpoints.remove(&mut self.memory, ptid, address) {
                log::warn!("Could not remove breakpoint at {:#x} before detach: {}", address, e);
            }
        }

        ptrace::detach(Pid::from_raw(pid as i32), None).map_err(|e| DebugError::DetachFailed {
            pid,
            reason: e.to_string(),
        })?;
        self.breakpoints.forget_process(pid);
        Ok(())
    }

    fn forget_process(&mut self, pid: u32) {
        self.breakpoints.forget_process(pid);
    }

    fn clone_process(&mut self, parent: u32, child: u32) {
        self.breakpoints.clone_process(parent, child);
    }
}
