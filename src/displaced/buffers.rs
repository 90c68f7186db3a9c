//! Scratch buffer pool.

use std::rc::Rc;

use super::{dump_bytes, DisplacedStepError, FinishStatus, PrepareStatus, LOG_TARGET};
use crate::arch::{DisplacedStepClosure, Gdbarch};
use crate::core::registers::Regcache;
use crate::core::target::Target;
use crate::core::types::{InferiorDisplacedStepState, Ptid, StopSignal, ThreadInfo};

/// One scratch location in the debuggee.
#[derive(Debug)]
struct DisplacedStepBuffer {
    addr: u64,

    /// Thread currently using this buffer, `None` when free.
    current_thread: Option<Ptid>,

    /// PC of the thread before it was moved into the buffer.
    original_pc: u64,

    /// Contents of the buffer before the relocated instruction went in.
    saved_copy: Vec<u8>,

    copy_insn_closure: Option<Box<dyn DisplacedStepClosure>>,
}

impl DisplacedStepBuffer {
    fn new(addr: u64) -> Self {
        Self {
            addr,
            current_thread: None,
            original_pc: 0,
            saved_copy: Vec::new(),
            copy_insn_closure: None,
        }
    }
}

/// Fixed pool of displaced-stepping scratch buffers of one architecture.
///
/// Each buffer serves at most one thread at a time. Buffers are handed out
/// in pool order, so allocation is deterministic.
pub struct DisplacedStepBuffers {
    arch: Rc<dyn Gdbarch>,
    buffers: Vec<DisplacedStepBuffer>,
}

impl DisplacedStepBuffers {
    /// Create a pool over the given scratch addresses.
    ///
    /// # Panics
    /// If `addrs` is empty or contains duplicates.
    pub fn new(arch: Rc<dyn Gdbarch>, addrs: impl IntoIterator<Item = u64>) -> Self {
        let mut buffers: Vec<DisplacedStepBuffer> = Vec::new();
        for addr in addrs {
            assert!(
                buffers.iter().all(|b| b.addr != addr),
                "duplicate displaced-step buffer address {:#x}",
                addr
            );
            buffers.push(DisplacedStepBuffer::new(addr));
        }
        assert!(!buffers.is_empty(), "displaced-step buffer pool is empty");

        Self { arch, buffers }
    }

    pub fn arch(&self) -> &Rc<dyn Gdbarch> {
        &self.arch
    }

    /// Whether the architecture can displaced-step at all.
    pub fn supports_displaced_step(&self) -> bool {
        self.arch.displaced_step().is_some()
    }

    /// Scratch addresses in pool order.
    pub fn addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.buffers.iter().map(|b| b.addr)
    }

    /// Thread owning the buffer at `addr`, if that buffer is busy.
    pub fn owner(&self, addr: u64) -> Option<Ptid> {
        self.buffers
            .iter()
            .find(|b| b.addr == addr)
            .and_then(|b| b.current_thread)
    }

    /// Address of the buffer `ptid` is using, if any.
    pub fn buffer_of(&self, ptid: Ptid) -> Option<u64> {
        self.buffers
            .iter()
            .find(|b| b.current_thread == Some(ptid))
            .map(|b| b.addr)
    }

    pub fn has_free_buffer(&self) -> bool {
        self.buffers.iter().any(|b| b.current_thread.is_none())
    }

    /// Move `thread` into a free scratch buffer holding a relocated copy of
    /// the instruction at its PC.
    ///
    /// # Panics
    /// If the thread already has a displaced step in progress.
    pub fn prepare(
        &mut self,
        thread: &mut ThreadInfo,
        inferior: &mut InferiorDisplacedStepState,
        target: &mut dyn Target,
    ) -> Result<PrepareStatus, DisplacedStepError> {
        let ptid = thread.ptid;
        assert!(
            !thread.displaced_step_state.in_progress(),
            "{} already has a displaced step in progress",
            ptid
        );
        for buf in &self.buffers {
            assert!(
                buf.current_thread != Some(ptid),
                "{} already owns displaced-step buffer {:#x}",
                ptid,
                buf.addr
            );
        }

        let arch = Rc::clone(&self.arch);
        let Some(ops) = arch.displaced_step() else {
            return Ok(PrepareStatus::Cannot);
        };
        let len = arch.max_insn_length();

        let mut selected = None;
        let mut fail_status = PrepareStatus::Cannot;
        for (index, candidate) in self.buffers.iter().enumerate() {
            if target.breakpoint_inserted_in_range(ptid, candidate.addr, len) {
                // Inserting that breakpoint would corrupt the scratch pad, and
                // the scratch pad would clobber it. Fall back to in-line
                // stepping over the breakpoint.
                log::debug!(
                    target: LOG_TARGET,
                    "breakpoint set in displaced stepping buffer at {:#x}, can't use.",
                    candidate.addr
                );
            } else if candidate.current_thread.is_none() {
                selected = Some(index);
                break;
            } else {
                fail_status = PrepareStatus::Unavailable;
            }
        }

        let Some(index) = selected else {
            return Ok(fail_status);
        };
        let addr = self.buffers[index].addr;
        log::debug!(target: LOG_TARGET, "selected buffer at {:#x}", addr);

        let original_pc = target.read_pc(ptid)?;

        let mut saved_copy = vec![0u8; len];
        target
            .read_memory(ptid, addr, &mut saved_copy)
            .map_err(|e| DisplacedStepError::ScratchAccess {
                address: addr,
                reason: e.to_string(),
            })?;
        log::debug!(
            target: LOG_TARGET,
            "saved {:#x}: {}",
            addr,
            dump_bytes(&saved_copy)
        );

        let copied = {
            let mut regcache = Regcache::new(target, ptid);
            ops.copy_insn(original_pc, addr, &mut regcache)
        };
        let closure = match copied {
            Ok(Some(closure)) => closure,
            Ok(None) => {
                // The architecture can't relocate this instruction; step it
                // in-line instead.
                log::debug!(
                    target: LOG_TARGET,
                    "{} declined to copy instruction at {:#x}",
                    arch.name(),
                    original_pc
                );
                unwind_scratch(target, ptid, addr, &saved_copy);
                return Ok(PrepareStatus::Cannot);
            }
            Err(e) => {
                unwind_scratch(target, ptid, addr, &saved_copy);
                return Err(e);
            }
        };

        if let Err(e) = target.write_pc(ptid, addr) {
            unwind_scratch(target, ptid, addr, &saved_copy);
            return Err(e.into());
        }

        let buffer = &mut self.buffers[index];
        buffer.current_thread = Some(ptid);
        buffer.original_pc = original_pc;
        buffer.saved_copy = saved_copy;
        buffer.copy_insn_closure = Some(closure);
        thread.displaced_step_state.set_in_progress(true);

        inferior.unavailable = !self.has_free_buffer();

        log::debug!(
            target: LOG_TARGET,
            "displaced pc to {:#x} for {} (original pc {:#x})",
            addr,
            ptid,
            original_pc
        );
        Ok(PrepareStatus::Ok { displaced_pc: addr })
    }

    /// Release the buffer `thread` is using and make the thread look as if it
    /// had stepped the original instruction in place.
    ///
    /// # Panics
    /// If the thread has no displaced step in progress.
    pub fn finish(
        &mut self,
        thread: &mut ThreadInfo,
        inferior: &mut InferiorDisplacedStepState,
        target: &mut dyn Target,
        signal: StopSignal,
    ) -> Result<FinishStatus, DisplacedStepError> {
        let ptid = thread.ptid;
        assert!(
            thread.displaced_step_state.in_progress(),
            "{} has no displaced step in progress",
            ptid
        );

        let buffer = self
            .buffers
            .iter_mut()
            .find(|b| b.current_thread == Some(ptid))
            .unwrap_or_else(|| panic!("no displaced-step buffer owned by {}", ptid));

        let addr = buffer.addr;
        let original_pc = buffer.original_pc;
        let closure = buffer
            .copy_insn_closure
            .take()
            .unwrap_or_else(|| panic!("displaced-step buffer {:#x} has no closure", addr));

        // Free everything before anything below can fail.
        buffer.current_thread = None;
        thread.displaced_step_state.set_in_progress(false);
        inferior.unavailable = false;

        // Addressed to the stepped thread, whatever the caller has selected.
        target.write_memory(ptid, addr, &buffer.saved_copy)?;
        log::debug!(target: LOG_TARGET, "restored {} {:#x}", ptid, addr);

        let arch = Rc::clone(&self.arch);
        let executed = instruction_executed_successfully(arch.as_ref(), &*target, ptid, signal);
        let mut regcache = Regcache::new(target, ptid);

        if executed {
            let ops = arch
                .displaced_step()
                .unwrap_or_else(|| panic!("{} lost its displaced-step hooks", arch.name()));
            ops.fixup(closure, original_pc, addr, &mut regcache)?;
            Ok(FinishStatus::Ok)
        } else {
            // The instruction didn't complete; all that can be done is to
            // relocate the PC.
            let pc = regcache.read_pc()?;
            let pc = original_pc.wrapping_add(pc.wrapping_sub(addr));
            regcache.write_pc(pc)?;
            log::debug!(
                target: LOG_TARGET,
                "{} stopped with {} before completing, pc relocated to {:#x}",
                ptid,
                signal,
                pc
            );
            Ok(FinishStatus::NotExecuted)
        }
    }

    /// Relocation record of the busy buffer at `addr`.
    pub fn copy_insn_closure_by_addr(&self, addr: u64) -> Option<&dyn DisplacedStepClosure> {
        self.buffers
            .iter()
            .find(|b| b.addr == addr)
            .and_then(|b| b.copy_insn_closure.as_deref())
    }

    /// Put the original contents back into every busy buffer, writing to
    /// process/thread `ptid`.
    ///
    /// Used when a process is detached, exits or forks. Buffer ownership is
    /// left alone. Every buffer is attempted; the first failure is returned.
    pub fn restore_in_ptid(&self, ptid: Ptid, target: &mut dyn Target) -> Result<(), DisplacedStepError> {
        let mut first_error = None;

        for buffer in self.buffers.iter().filter(|b| b.current_thread.is_some()) {
            match target.write_memory(ptid, buffer.addr, &buffer.saved_copy) {
                Ok(()) => {
                    log::debug!(target: LOG_TARGET, "restored in ptid {} {:#x}", ptid, buffer.addr);
                }
                Err(e) => {
                    log::warn!(
                        "Could not restore displaced-step buffer {:#x} in {}: {}",
                        buffer.addr,
                        ptid,
                        e
                    );
                    first_error.get_or_insert(DisplacedStepError::from(e));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Put back scratch contents a failed prepare may have overwritten.
fn unwind_scratch(target: &mut dyn Target, ptid: Ptid, addr: u64, saved_copy: &[u8]) {
    if let Err(e) = target.write_memory(ptid, addr, saved_copy) {
        log::warn!(
            "Could not restore displaced-step buffer {:#x} after failed prepare: {}",
            addr,
            e
        );
    }
}

/// Whether a thread that stopped with `signal` after being resumed in a
/// scratch buffer actually ran the relocated instruction.
fn instruction_executed_successfully(
    arch: &dyn Gdbarch,
    target: &dyn Target,
    ptid: Ptid,
    signal: StopSignal,
) -> bool {
    if signal != arch.single_step_signal() {
        return false;
    }

    // A watchpoint that fires before the access leaves the instruction
    // unexecuted.
    if target.stopped_by_watchpoint(ptid)
        && (arch.have_nonsteppable_watchpoint() || target.have_steppable_watchpoint())
    {
        return false;
    }

    true
}
