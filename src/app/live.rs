//! Live session against a running Linux process
//!
//! Attaches with ptrace, places the scratch buffers next to the program's
//! run-time entry point and steps the main thread through them.

use std::rc::Rc;

use anyhow::{anyhow, bail, Context, Result};
use nix::sys::ptrace;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::arch::{displaced_step_buffer_addresses, Amd64, Gdbarch};
use crate::core::ptrace::PtraceTarget;
use crate::core::{Debugger, Ptid, StopSignal, Target};
use crate::displaced::{FinishStatus, PrepareStatus};

/// `AT_ENTRY` auxiliary vector tag
const AT_ENTRY: u64 = 9;

/// Program entry point from the raw contents of `/proc/<pid>/auxv`.
pub fn entry_point_from_auxv(auxv: &[u8]) -> Option<u64> {
    auxv.chunks_exact(16)
        .map(|pair| {
            let (key, value) = pair.split_at(8);
            (
                u64::from_le_bytes(key.try_into().unwrap_or_default()),
                u64::from_le_bytes(value.try_into().unwrap_or_default()),
            )
        })
        .take_while(|&(key, _)| key != 0)
        .find(|&(key, _)| key == AT_ENTRY)
        .map(|(_, value)| value)
}

/// How one step of the main thread went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Stepped from a scratch buffer.
    Displaced { from: u64, to: u64, status: FinishStatus },
    /// Stepped in place.
    InLine { from: u64, to: u64 },
}

/// A ptrace-attached process
pub struct LiveSession {
    pid: u32,
    debugger: Debugger<PtraceTarget>,
}

impl LiveSession {
    pub fn attach(pid: u32, buffer_count: usize) -> Result<Self> {
        if buffer_count == 0 {
            bail!("at least one displaced-step buffer is needed");
        }
        let auxv_path = format!("/proc/{}/auxv", pid);
        let auxv = std::fs::read(&auxv_path).with_context(|| format!("reading {}", auxv_path))?;
        let entry_point =
            entry_point_from_auxv(&auxv).ok_or_else(|| anyhow!("no AT_ENTRY in {}", auxv_path))?;

        let arch: Rc<dyn Gdbarch> = Rc::new(Amd64);
        let scratch = displaced_step_buffer_addresses(arch.as_ref(), entry_point, buffer_count);
        log::info!(
            "Process {} entry point {:#x}, scratch buffers at {:x?}",
            pid,
            entry_point,
            scratch
        );

        let mut debugger = Debugger::new(PtraceTarget::new(), arch, scratch);
        debugger.attach(pid)?;
        Ok(Self { pid, debugger })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Step the main thread over a breakpoint planted under its PC, through a
    /// scratch buffer when the architecture can relocate the instruction.
    pub fn step(&mut self) -> Result<StepOutcome> {
        let ptid = Ptid::process(self.pid);
        let from = self.debugger.target_mut().read_pc(ptid)?;

        self.debugger.target_mut().insert_breakpoint(ptid, from)?;
        let outcome = self.step_over_breakpoint(ptid, from);
        let removed = self.debugger.target_mut().remove_breakpoint(ptid, from);
        let outcome = outcome?;
        removed?;
        Ok(outcome)
    }

    fn step_over_breakpoint(&mut self, ptid: Ptid, from: u64) -> Result<StepOutcome> {
        match self.debugger.displaced_step_prepare(ptid)? {
            PrepareStatus::Ok { .. } => {
                let signal = self.single_step()?;
                let status = self.debugger.displaced_step_finish(ptid, signal)?;
                let to = self.debugger.target_mut().read_pc(ptid)?;
                Ok(StepOutcome::Displaced { from, to, status })
            }
            PrepareStatus::Cannot | PrepareStatus::Unavailable => {
                // In-line: lift the breakpoint for the step.
                self.debugger.target_mut().remove_breakpoint(ptid, from)?;
                self.single_step()?;
                let to = self.debugger.target_mut().read_pc(ptid)?;
                Ok(StepOutcome::InLine { from, to })
            }
        }
    }

    fn single_step(&mut self) -> Result<StopSignal> {
        let pid = Pid::from_raw(self.pid as i32);
        ptrace::step(pid, None)?;
        match waitpid(pid, None)? {
            WaitStatus::Stopped(_, signal) => Ok(StopSignal::from_raw(signal as i32)),
            other => {
                self.debugger.handle_exit(self.pid);
                bail!("process {} did not stop after a single-step: {:?}", self.pid, other)
            }
        }
    }

    pub fn detach(mut self) -> Result<()> {
        self.debugger.detach(self.pid)?;
        Ok(())
    }
}

/// Attach to `pid`, take `steps` steps and let it go again.
pub fn run_live(pid: u32, buffer_count: usize, steps: usize) -> Result<()> {
    let mut session = LiveSession::attach(pid, buffer_count)?;
    println!("[*] Attached to process {}", session.pid());

    for _ in 0..steps {
        match session.step()? {
            StepOutcome::Displaced { from, to, status } => {
                println!("    {:#x} -> {:#x} (displaced, {:?})", from, to, status);
            }
            StepOutcome::InLine { from, to } => {
                println!("    {:#x} -> {:#x} (in-line)", from, to);
            }
        }
    }

    session.detach()?;
    println!("[*] Detached from process {}", pid);
    Ok(())
}
