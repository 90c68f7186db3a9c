//! Core module - Debugger backend and low-level operations
//!
//! This module contains the target abstraction, its simulated and ptrace
//! implementations, and the session that ties threads to scratch buffers.

pub mod breakpoints;
pub mod debugger;
pub mod memory;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod ptrace;
pub mod registers;
pub mod sim;
pub mod target;
pub mod types;

// Re-export common types
pub use debugger::{DebugError, Debugger, ProcessControl};
pub use target::Target;
pub use types::{Ptid, StopSignal};
