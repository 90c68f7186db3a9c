//! Architecture abstraction for displaced stepping.
//!
//! A [`Gdbarch`] supplies per-target facts (instruction length, breakpoint
//! encoding, signals) and, when the architecture supports it, the
//! [`DisplacedStepOps`] pair that relocates one instruction into a scratch
//! buffer and fixes up its effects afterwards.

pub mod x86_64;

use std::any::Any;
use std::fmt;

use crate::core::registers::Regcache;
use crate::core::types::StopSignal;
use crate::displaced::DisplacedStepError;

pub use x86_64::Amd64;

/// Opaque record describing how one instruction was relocated.
///
/// Produced by [`DisplacedStepOps::copy_insn`] and handed back, by value, to
/// [`DisplacedStepOps::fixup`]. Architectures downcast it through
/// [`as_any`](Self::as_any).
pub trait DisplacedStepClosure: fmt::Debug {
    fn as_any(&self) -> &dyn Any;
}

/// Instruction relocation hooks of an architecture.
pub trait DisplacedStepOps {
    /// Copy the instruction at `from` into the scratch buffer at `to`,
    /// adjusting it and the thread's registers as needed.
    ///
    /// `Ok(None)` means this instruction cannot be displaced-stepped.
    fn copy_insn(
        &self,
        from: u64,
        to: u64,
        regcache: &mut Regcache<'_>,
    ) -> Result<Option<Box<dyn DisplacedStepClosure>>, DisplacedStepError>;

    /// Make the thread look as if the instruction had executed at `from`
    /// after it executed at `to`.
    fn fixup(
        &self,
        closure: Box<dyn DisplacedStepClosure>,
        from: u64,
        to: u64,
        regcache: &mut Regcache<'_>,
    ) -> Result<(), DisplacedStepError>;
}

/// Per-architecture facts consumed by the displaced-step machinery.
pub trait Gdbarch {
    /// Architecture name (e.g. "i386:x86-64")
    fn name(&self) -> &str;

    /// Longest instruction the architecture may need to relocate, in bytes.
    fn max_insn_length(&self) -> usize;

    /// Software breakpoint instruction to place at `pc`.
    fn breakpoint_from_pc(&self, pc: u64) -> &[u8];

    /// Signal a thread reports after a clean single-step.
    fn single_step_signal(&self) -> StopSignal {
        StopSignal::Trap
    }

    /// Whether watchpoints trigger before the access completes, leaving the
    /// instruction unexecuted.
    fn have_nonsteppable_watchpoint(&self) -> bool {
        false
    }

    /// Whether single-stepping is emulated with breakpoints.
    fn software_single_step(&self) -> bool {
        false
    }

    /// Whether a displaced instruction is stepped with hardware single-step.
    fn displaced_step_hw_singlestep(&self) -> bool {
        !self.software_single_step()
    }

    /// Displaced-step hooks, or `None` if the architecture has none.
    fn displaced_step(&self) -> Option<&dyn DisplacedStepOps> {
        None
    }
}

/// Scratch address next to the program entry point.
///
/// Inferior function calls put a breakpoint on the entry point, so the
/// scratch area starts two breakpoint lengths past it.
pub fn displaced_step_at_entry_point(arch: &dyn Gdbarch, entry_point: u64) -> u64 {
    let bp_len = arch.breakpoint_from_pc(entry_point).len() as u64;
    entry_point + bp_len * 2
}

/// Addresses of `count` back-to-back scratch buffers starting at
/// [`displaced_step_at_entry_point`].
pub fn displaced_step_buffer_addresses(
    arch: &dyn Gdbarch,
    entry_point: u64,
    count: usize,
) -> Vec<u64> {
    let first = displaced_step_at_entry_point(arch, entry_point);
    let stride = arch.max_insn_length() as u64;
    (0..count as u64).map(|i| first + i * stride).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Riscish;

    impl Gdbarch for Riscish {
        fn name(&self) -> &str {
            "riscish"
        }

        fn max_insn_length(&self) -> usize {
            4
        }

        fn breakpoint_from_pc(&self, _pc: u64) -> &[u8] {
            &[0x00, 0x00, 0x20, 0xd4]
        }

        fn software_single_step(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_entry_point_scratch() {
        assert_eq!(displaced_step_at_entry_point(&Riscish, 0x400000), 0x400008);
        assert_eq!(displaced_step_at_entry_point(&Amd64, 0x401000), 0x401002);
    }

    #[test]
    fn test_buffer_layout() {
        assert_eq!(
            displaced_step_buffer_addresses(&Riscish, 0x1000, 3),
            vec![0x1008, 0x100c, 0x1010]
        );
        assert!(displaced_step_buffer_addresses(&Riscish, 0x1000, 0).is_empty());
    }

    #[test]
    fn test_defaults() {
        assert!(Riscish.displaced_step().is_none());
        assert!(!Riscish.displaced_step_hw_singlestep());
        assert_eq!(Riscish.single_step_signal(), StopSignal::Trap);
        assert!(!Riscish.have_nonsteppable_watchpoint());
    }
}
