//! Displaced stepping - scratch buffer pool and its prepare/finish protocol.
//!
//! Debug output of this module goes to the `displaced` log target; enable it
//! with `RUST_LOG=displaced=debug` or `--debug-displaced`.

mod buffers;

pub use buffers::DisplacedStepBuffers;

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::core::memory::MemoryError;
use crate::core::registers::RegisterError;

/// Log target of displaced-stepping debug output.
pub const LOG_TARGET: &str = "displaced";

static DEBUG_DISPLACED: AtomicBool = AtomicBool::new(false);

/// Turn displaced-stepping debug output on or off ("set debug displaced").
pub fn set_debug(enabled: bool) {
    DEBUG_DISPLACED.store(enabled, Ordering::Relaxed);
}

pub fn debug_enabled() -> bool {
    DEBUG_DISPLACED.load(Ordering::Relaxed)
}

/// Outcome of preparing a thread for a displaced step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareStatus {
    /// The thread now sits at `displaced_pc`, ready to be stepped.
    Ok { displaced_pc: u64 },
    /// Displaced stepping is impossible here; step the thread in place.
    Cannot,
    /// Every usable buffer is taken; try again once one is released.
    Unavailable,
}

/// Outcome of finishing a displaced step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishStatus {
    /// The instruction executed and its effects were fixed up.
    Ok,
    /// The instruction did not complete; the PC was moved back next to the
    /// original instruction and the step must be redone.
    NotExecuted,
}

/// Infrastructure failures while using a scratch buffer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DisplacedStepError {
    #[error("Error accessing memory address {address:#x} ({reason}) for displaced-stepping scratch space.")]
    ScratchAccess { address: u64, reason: String },

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Register(#[from] RegisterError),
}

/// Render bytes the way displaced-step debug output shows them: "0f 1f 00".
pub fn dump_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| hex::encode([*b]))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_bytes() {
        assert_eq!(dump_bytes(&[0x0f, 0x1f, 0x00]), "0f 1f 00");
        assert_eq!(dump_bytes(&[]), "");
    }

    #[test]
    fn test_scratch_error_message() {
        let err = DisplacedStepError::ScratchAccess {
            address: 0x401002,
            reason: "Input/output error".into(),
        };
        assert_eq!(
            err.to_string(),
            "Error accessing memory address 0x401002 (Input/output error) for displaced-stepping scratch space."
        );
    }
}
