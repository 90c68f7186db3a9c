//! dstep - displaced-stepping scratch buffer management for native debuggers
//!
//! A thread stopped on a breakpoint steps over the instruction underneath
//! by executing a relocated copy of it in a scratch buffer, leaving the
//! breakpoint inserted for every other thread.

pub mod app;
pub mod arch;
pub mod core;
pub mod displaced;
pub mod loader;
pub mod logging;
pub mod ui;
