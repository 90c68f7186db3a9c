//! Command processing
//!
//! Maintenance commands understood by the REPL.

use crate::core::StopSignal;

/// A thread named on the command line: `<tid>` in the current process or
/// `<pid>.<tid>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadRef {
    pub pid: Option<u32>,
    pub tid: u32,
}

/// Application commands that can be executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppCommand {
    /// Map zero-filled memory: map <addr> <size>
    Map { address: u64, size: usize },
    /// Unmap a region: unmap <addr>
    Unmap(u64),
    /// Show memory map: dm
    MemoryMap,
    /// Write bytes: poke <addr> <hex>
    Poke { address: u64, bytes: Vec<u8> },
    /// Examine memory: x <addr> [len]
    Examine { address: u64, len: usize },
    /// Add a stopped thread: thread <tid> <pc>
    Thread { tid: u32, pc: u64 },
    /// List threads: threads
    Threads,
    /// Show or set a thread's PC: pc <thread> [value]
    Pc { thread: ThreadRef, value: Option<u64> },
    /// Set breakpoint: db <addr>
    BreakpointSet(u64),
    /// Delete breakpoint: db- <addr>
    BreakpointDelete(u64),
    /// Displaced-step prepare: prepare <thread>
    Prepare(ThreadRef),
    /// Displaced-step finish: finish <thread> [signal]
    Finish { thread: ThreadRef, signal: StopSignal },
    /// Report the next stop as a watchpoint hit: watch <thread> on|off
    Watch { thread: ThreadRef, stopped: bool },
    /// Show scratch buffers: buffers
    Buffers,
    /// Restore scratch contents into a process: restore <pid>
    Restore(u32),
    /// Fork a thread's process: fork <thread> <child-pid>
    Fork { parent: ThreadRef, child: u32 },
    /// Switch process: process <pid>
    Process(u32),
    /// Detach from the current process
    Detach,
    /// The current process exits
    Kill,
    /// set debug displaced on|off
    SetDebugDisplaced(bool),
    /// show debug displaced
    ShowDebugDisplaced,
    /// Show help
    Help,
    /// Quit application
    Quit,
    /// Unknown command
    Unknown(String),
}

/// Parse a command string into AppCommand
pub fn parse_command(input: &str) -> AppCommand {
    let input = input.trim();
    let args: Vec<&str> = input.split_whitespace().collect();
    let Some((cmd, rest)) = args.split_first() else {
        return AppCommand::Unknown(String::new());
    };

    let parsed = match (*cmd, rest) {
        ("map", [addr, size]) => parse_address(addr)
            .zip(parse_address(size))
            .map(|(address, size)| AppCommand::Map {
                address,
                size: size as usize,
            }),
        ("unmap", [addr]) => parse_address(addr).map(AppCommand::Unmap),
        ("dm", []) => Some(AppCommand::MemoryMap),
        ("poke", [addr, bytes @ ..]) if !bytes.is_empty() => {
            let hex_str: String = bytes.concat();
            parse_address(addr)
                .zip(hex::decode(hex_str).ok())
                .map(|(address, bytes)| AppCommand::Poke { address, bytes })
        }
        ("x", [addr]) => parse_address(addr).map(|address| AppCommand::Examine { address, len: 16 }),
        ("x", [addr, len]) => parse_address(addr)
            .zip(len.parse().ok())
            .map(|(address, len)| AppCommand::Examine { address, len }),
        ("thread", [tid, pc]) => tid
            .parse()
            .ok()
            .zip(parse_address(pc))
            .map(|(tid, pc)| AppCommand::Thread { tid, pc }),
        ("threads", []) => Some(AppCommand::Threads),
        ("pc", [thread]) => parse_thread(thread).map(|thread| AppCommand::Pc { thread, value: None }),
        ("pc", [thread, value]) => parse_thread(thread)
            .zip(parse_address(value))
            .map(|(thread, value)| AppCommand::Pc {
                thread,
                value: Some(value),
            }),
        ("db", [addr]) => match addr.strip_prefix('-') {
            Some(addr) => parse_address(addr).map(AppCommand::BreakpointDelete),
            None => parse_address(addr).map(AppCommand::BreakpointSet),
        },
        ("db-", [addr]) => parse_address(addr).map(AppCommand::BreakpointDelete),
        ("prepare", [thread]) => parse_thread(thread).map(AppCommand::Prepare),
        ("finish", [thread]) => parse_thread(thread).map(|thread| AppCommand::Finish {
            thread,
            signal: StopSignal::Trap,
        }),
        ("finish", [thread, signal]) => parse_thread(thread)
            .zip(StopSignal::parse(signal))
            .map(|(thread, signal)| AppCommand::Finish { thread, signal }),
        ("watch", [thread, state]) => parse_thread(thread)
            .zip(parse_switch(state))
            .map(|(thread, stopped)| AppCommand::Watch { thread, stopped }),
        ("buffers", []) => Some(AppCommand::Buffers),
        ("restore", [pid]) => pid.parse().ok().map(AppCommand::Restore),
        ("fork", [thread, child]) => parse_thread(thread)
            .zip(child.parse().ok())
            .map(|(parent, child)| AppCommand::Fork { parent, child }),
        ("process", [pid]) => pid.parse().ok().map(AppCommand::Process),
        ("detach", []) => Some(AppCommand::Detach),
        ("kill", []) => Some(AppCommand::Kill),
        ("set", ["debug", "displaced", state]) => parse_switch(state).map(AppCommand::SetDebugDisplaced),
        ("show", ["debug", "displaced"]) => Some(AppCommand::ShowDebugDisplaced),
        ("help" | "?", _) => Some(AppCommand::Help),
        ("quit" | "exit" | "q", _) => Some(AppCommand::Quit),
        _ => None,
    };

    parsed.unwrap_or_else(|| AppCommand::Unknown(input.to_string()))
}

/// Parse an address string (supports 0x prefix and decimal)
pub fn parse_address(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

fn parse_thread(s: &str) -> Option<ThreadRef> {
    match s.split_once('.') {
        Some((pid, tid)) => Some(ThreadRef {
            pid: Some(pid.parse().ok()?),
            tid: tid.parse().ok()?,
        }),
        None => Some(ThreadRef {
            pid: None,
            tid: s.parse().ok()?,
        }),
    }
}

fn parse_switch(s: &str) -> Option<bool> {
    match s {
        "on" | "1" => Some(true),
        "off" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x401000"), Some(0x401000));
        assert_eq!(parse_address("0X10"), Some(0x10));
        assert_eq!(parse_address("4096"), Some(4096));
        assert_eq!(parse_address("zz"), None);
    }

    #[test]
    fn test_memory_commands() {
        assert_eq!(
            parse_command("poke 0x1000 90 90 cc"),
            AppCommand::Poke {
                address: 0x1000,
                bytes: vec![0x90, 0x90, 0xcc]
            }
        );
        assert_eq!(
            parse_command("x 0x1000"),
            AppCommand::Examine {
                address: 0x1000,
                len: 16
            }
        );
        assert_eq!(
            parse_command("map 0x2000 0x1000"),
            AppCommand::Map {
                address: 0x2000,
                size: 0x1000
            }
        );
        assert_eq!(parse_command("unmap 0x2000"), AppCommand::Unmap(0x2000));
        assert!(matches!(parse_command("poke 0x1000 9"), AppCommand::Unknown(_)));
    }

    #[test]
    fn test_thread_references() {
        assert_eq!(
            parse_command("prepare 7"),
            AppCommand::Prepare(ThreadRef { pid: None, tid: 7 })
        );
        assert_eq!(
            parse_command("finish 1000.7 segv"),
            AppCommand::Finish {
                thread: ThreadRef {
                    pid: Some(1000),
                    tid: 7
                },
                signal: StopSignal::Segv
            }
        );
        assert_eq!(
            parse_command("finish 7"),
            AppCommand::Finish {
                thread: ThreadRef { pid: None, tid: 7 },
                signal: StopSignal::Trap
            }
        );
        assert!(matches!(parse_command("prepare x.7"), AppCommand::Unknown(_)));
    }

    #[test]
    fn test_breakpoints() {
        assert_eq!(parse_command("db 0x1000"), AppCommand::BreakpointSet(0x1000));
        assert_eq!(parse_command("db -0x1000"), AppCommand::BreakpointDelete(0x1000));
        assert_eq!(parse_command("db- 0x1000"), AppCommand::BreakpointDelete(0x1000));
    }

    #[test]
    fn test_debug_switch() {
        assert_eq!(
            parse_command("set debug displaced on"),
            AppCommand::SetDebugDisplaced(true)
        );
        assert_eq!(
            parse_command("set debug displaced off"),
            AppCommand::SetDebugDisplaced(false)
        );
        assert_eq!(
            parse_command("show debug displaced"),
            AppCommand::ShowDebugDisplaced
        );
        assert!(matches!(
            parse_command("set debug displaced maybe"),
            AppCommand::Unknown(_)
        ));
    }

    #[test]
    fn test_unknown() {
        assert_eq!(parse_command("frobnicate"), AppCommand::Unknown("frobnicate".into()));
        assert_eq!(parse_command("  "), AppCommand::Unknown(String::new()));
        assert_eq!(parse_command("q"), AppCommand::Quit);
    }
}
