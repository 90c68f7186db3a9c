//! UI module - Command Line Interface
//!
//! Provides the reedline-based maintenance REPL.

pub mod cli;
