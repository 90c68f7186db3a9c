//! App module - shared application state and commands
//!
//! Provides the session state and command parsing used by the REPL.

mod commands;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod live;
mod state;

pub use commands::*;
pub use state::*;
