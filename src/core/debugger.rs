//! Debugger - session bookkeeping around displaced stepping
//!
//! Owns the known inferiors and threads, gives every inferior its own pool
//! of scratch buffers, and makes sure scratch contents are put back whenever
//! a process is detached, exits or forks.

use std::collections::BTreeMap;
use std::rc::Rc;

use thiserror::Error;

use super::target::Target;
use super::types::{InferiorDisplacedStepState, Ptid, StopSignal, ThreadInfo};
use crate::arch::{DisplacedStepClosure, Gdbarch};
use crate::displaced::{DisplacedStepBuffers, DisplacedStepError, FinishStatus, PrepareStatus};

/// Debugger-specific errors
#[derive(Error, Debug)]
pub enum DebugError {
    #[error("Failed to attach to process {pid}: {reason}")]
    AttachFailed { pid: u32, reason: String },

    #[error("Failed to detach from process {pid}: {reason}")]
    DetachFailed { pid: u32, reason: String },

    #[error("Process not found: {pid}")]
    ProcessNotFound { pid: u32 },

    #[error("Thread not found: {0}")]
    ThreadNotFound(Ptid),

    #[error("{0} is already in the middle of a displaced step")]
    AlreadyStepping(Ptid),

    #[error("{0} has no displaced step in progress")]
    NotStepping(Ptid),

    #[error(transparent)]
    DisplacedStep(#[from] DisplacedStepError),
}

/// Attaching to and letting go of whole processes.
pub trait ProcessControl {
    fn attach(&mut self, pid: u32) -> Result<(), DebugError>;

    fn detach(&mut self, pid: u32) -> Result<(), DebugError>;

    /// Drop target-side state of a process that no longer exists.
    fn forget_process(&mut self, pid: u32);

    /// Carry target-side state of `parent` over to its fork child.
    fn clone_process(&mut self, parent: u32, child: u32);
}

/// A debugged process.
pub struct Inferior {
    pub pid: u32,
    pub displaced_step_state: InferiorDisplacedStepState,
    pub displaced_buffers: DisplacedStepBuffers,
}

/// Main debugger interface
pub struct Debugger<T: Target + ProcessControl> {
    target: T,
    arch: Rc<dyn Gdbarch>,
    scratch: Vec<u64>,
    inferiors: BTreeMap<u32, Inferior>,
    threads: BTreeMap<Ptid, ThreadInfo>,
}

impl<T: Target + ProcessControl> Debugger<T> {
    /// Create a debugger whose inferiors use scratch buffers at `scratch`.
    pub fn new(target: T, arch: Rc<dyn Gdbarch>, scratch: Vec<u64>) -> Self {
        Self {
            target,
            arch,
            scratch,
            inferiors: BTreeMap::new(),
            threads: BTreeMap::new(),
        }
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    pub fn arch(&self) -> &Rc<dyn Gdbarch> {
        &self.arch
    }

    pub fn inferior(&self, pid: u32) -> Option<&Inferior> {
        self.inferiors.get(&pid)
    }

    pub fn inferiors(&self) -> impl Iterator<Item = &Inferior> {
        self.inferiors.values()
    }

    pub fn thread(&self, ptid: Ptid) -> Option<&ThreadInfo> {
        self.threads.get(&ptid)
    }

    pub fn threads(&self) -> impl Iterator<Item = &ThreadInfo> {
        self.threads.values()
    }

    fn add_inferior(&mut self, pid: u32) {
        let buffers = DisplacedStepBuffers::new(Rc::clone(&self.arch), self.scratch.iter().copied());
        self.inferiors.insert(
            pid,
            Inferior {
                pid,
                displaced_step_state: InferiorDisplacedStepState::default(),
                displaced_buffers: buffers,
            },
        );
        self.threads.insert(Ptid::process(pid), ThreadInfo::new(Ptid::process(pid)));
    }

    /// Attach to an existing process by PID
    pub fn attach(&mut self, pid: u32) -> Result<(), DebugError> {
        log::info!("Attaching to process {}", pid);
        self.target.attach(pid)?;
        self.add_inferior(pid);
        log::info!("Successfully attached to process {}", pid);
        Ok(())
    }

    /// Record a new thread of an attached process.
    pub fn add_thread(&mut self, ptid: Ptid) -> Result<(), DebugError> {
        if !self.inferiors.contains_key(&ptid.pid) {
            return Err(DebugError::ProcessNotFound { pid: ptid.pid });
        }
        self.threads.entry(ptid).or_insert_with(|| ThreadInfo::new(ptid));
        Ok(())
    }

    /// Forget a thread that exited.
    ///
    /// # Panics
    /// If the thread still owns a scratch buffer.
    pub fn remove_thread(&mut self, ptid: Ptid) {
        if let Some(thread) = self.threads.remove(&ptid) {
            assert!(
                !thread.displaced_step_state.in_progress(),
                "{} exited in the middle of a displaced step",
                ptid
            );
        }
    }

    /// Move `ptid` into a scratch buffer so it can step over the
    /// instruction at its PC without lifting a breakpoint there.
    pub fn displaced_step_prepare(&mut self, ptid: Ptid) -> Result<PrepareStatus, DebugError> {
        let inferior = self
            .inferiors
            .get_mut(&ptid.pid)
            .ok_or(DebugError::ProcessNotFound { pid: ptid.pid })?;
        let thread = self
            .threads
            .get_mut(&ptid)
            .ok_or(DebugError::ThreadNotFound(ptid))?;
        if thread.displaced_step_state.in_progress() {
            return Err(DebugError::AlreadyStepping(ptid));
        }

        let status = inferior.displaced_buffers.prepare(
            thread,
            &mut inferior.displaced_step_state,
            &mut self.target,
        )?;
        Ok(status)
    }

    /// Complete the displaced step of `ptid`, which stopped with `signal`.
    pub fn displaced_step_finish(
        &mut self,
        ptid: Ptid,
        signal: StopSignal,
    ) -> Result<FinishStatus, DebugError> {
        let inferior = self
            .inferiors
            .get_mut(&ptid.pid)
            .ok_or(DebugError::ProcessNotFound { pid: ptid.pid })?;
        let thread = self
            .threads
            .get_mut(&ptid)
            .ok_or(DebugError::ThreadNotFound(ptid))?;
        if !thread.displaced_step_state.in_progress() {
            return Err(DebugError::NotStepping(ptid));
        }

        let status = inferior.displaced_buffers.finish(
            thread,
            &mut inferior.displaced_step_state,
            &mut self.target,
            signal,
        )?;
        Ok(status)
    }

    /// Relocation record of an in-flight displaced step at `addr`, letting a
    /// stop inside a scratch buffer be told apart from a user breakpoint.
    pub fn displaced_step_closure_at(&self, pid: u32, addr: u64) -> Option<&dyn DisplacedStepClosure> {
        self.inferiors
            .get(&pid)?
            .displaced_buffers
            .copy_insn_closure_by_addr(addr)
    }

    /// Put the original contents of every busy scratch buffer of `pid` back,
    /// writing into `into`.
    pub fn restore_scratch(&mut self, pid: u32, into: Ptid) -> Result<(), DebugError> {
        let inferior = self
            .inferiors
            .get(&pid)
            .ok_or(DebugError::ProcessNotFound { pid })?;
        inferior
            .displaced_buffers
            .restore_in_ptid(into, &mut self.target)?;
        Ok(())
    }

    /// Detach from the current process
    pub fn detach(&mut self, pid: u32) -> Result<(), DebugError> {
        let inferior = self
            .inferiors
            .get(&pid)
            .ok_or(DebugError::ProcessNotFound { pid })?;
        log::info!("Detaching from process {}", pid);

        // Don't leave relocated instructions behind in the scratch pads.
        if let Err(e) = inferior
            .displaced_buffers
            .restore_in_ptid(Ptid::process(pid), &mut self.target)
        {
            log::warn!("Scratch space of process {} not fully restored: {}", pid, e);
        }

        self.target.detach(pid)?;
        self.drop_inferior(pid);

        log::info!("Successfully detached from process {}", pid);
        Ok(())
    }

    /// The process exited; drop everything known about it.
    pub fn handle_exit(&mut self, pid: u32) {
        if let Some(inferior) = self.inferiors.get(&pid) {
            // Best effort: the address space is usually gone already.
            if let Err(e) = inferior
                .displaced_buffers
                .restore_in_ptid(Ptid::process(pid), &mut self.target)
            {
                log::debug!("Scratch space of exited process {} not restored: {}", pid, e);
            }
        }

        self.target.forget_process(pid);
        self.drop_inferior(pid);
        log::info!("Process {} exited", pid);
    }

    /// `parent` forked `child`.
    ///
    /// The child inherited the parent's scratch pads, relocated instructions
    /// included; those are put back before the child is tracked.
    pub fn handle_fork(&mut self, parent: Ptid, child: u32) -> Result<(), DebugError> {
        let inferior = self
            .inferiors
            .get(&parent.pid)
            .ok_or(DebugError::ProcessNotFound { pid: parent.pid })?;

        // Breakpoint records first, so the restore writes around any
        // breakpoint inserted into a busy scratch range.
        self.target.clone_process(parent.pid, child);
        inferior
            .displaced_buffers
            .restore_in_ptid(Ptid::process(child), &mut self.target)?;

        self.add_inferior(child);
        log::info!("{} forked process {}", parent, child);
        Ok(())
    }

    fn drop_inferior(&mut self, pid: u32) {
        self.inferiors.remove(&pid);
        self.threads.retain(|ptid, _| ptid.pid != pid);
    }
}
