//! Common types shared by the target layer and the displaced-step machinery.

use std::fmt;

/// Process/thread identity of a debuggee thread.
///
/// Memory and register requests are always addressed to a `Ptid` rather than
/// to whatever thread happens to be selected in the debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ptid {
    /// Process ID
    pub pid: u32,
    /// Thread ID (equal to `pid` for the main thread)
    pub tid: u32,
}

impl Ptid {
    pub const fn new(pid: u32, tid: u32) -> Self {
        Self { pid, tid }
    }

    /// Ptid naming a whole process (its main thread).
    pub const fn process(pid: u32) -> Self {
        Self { pid, tid: pid }
    }
}

impl fmt::Display for Ptid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pid == self.tid {
            write!(f, "process {}", self.pid)
        } else {
            write!(f, "Thread {}.{}", self.pid, self.tid)
        }
    }
}

/// Signal a thread reported when it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopSignal {
    /// SIGTRAP - breakpoint or single-step trap
    Trap,
    /// SIGINT - user interrupt
    Int,
    /// SIGSEGV
    Segv,
    /// SIGILL
    Ill,
    /// SIGBUS
    Bus,
    /// SIGFPE
    Fpe,
    /// SIGSTOP
    Stop,
    /// Anything else, by raw signal number
    Other(i32),
}

impl StopSignal {
    /// Map a raw Unix signal number.
    pub fn from_raw(signo: i32) -> Self {
        match signo {
            2 => StopSignal::Int,
            4 => StopSignal::Ill,
            5 => StopSignal::Trap,
            7 => StopSignal::Bus,
            8 => StopSignal::Fpe,
            11 => StopSignal::Segv,
            19 => StopSignal::Stop,
            other => StopSignal::Other(other),
        }
    }

    /// Parse a signal name as typed by a user ("trap", "SIGSEGV", "11").
    pub fn parse(name: &str) -> Option<Self> {
        let lower = name.trim().to_lowercase();
        let bare = lower.strip_prefix("sig").unwrap_or(&lower);
        match bare {
            "trap" => Some(StopSignal::Trap),
            "int" => Some(StopSignal::Int),
            "segv" => Some(StopSignal::Segv),
            "ill" => Some(StopSignal::Ill),
            "bus" => Some(StopSignal::Bus),
            "fpe" => Some(StopSignal::Fpe),
            "stop" => Some(StopSignal::Stop),
            _ => bare.parse().ok().map(StopSignal::from_raw),
        }
    }
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopSignal::Trap => f.write_str("SIGTRAP"),
            StopSignal::Int => f.write_str("SIGINT"),
            StopSignal::Segv => f.write_str("SIGSEGV"),
            StopSignal::Ill => f.write_str("SIGILL"),
            StopSignal::Bus => f.write_str("SIGBUS"),
            StopSignal::Fpe => f.write_str("SIGFPE"),
            StopSignal::Stop => f.write_str("SIGSTOP"),
            StopSignal::Other(n) => write!(f, "signal {}", n),
        }
    }
}

/// Per-thread displaced-step bookkeeping.
///
/// A thread is in progress while it owns a scratch buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadDisplacedStepState {
    in_progress: bool,
}

impl ThreadDisplacedStepState {
    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    pub(crate) fn set_in_progress(&mut self, in_progress: bool) {
        self.in_progress = in_progress;
    }
}

/// Per-process displaced-step bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InferiorDisplacedStepState {
    /// True when every scratch buffer is taken; callers should not ask
    /// for another displaced step until one is released.
    pub unavailable: bool,
}

/// A debuggee thread known to the debugger.
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub ptid: Ptid,
    pub displaced_step_state: ThreadDisplacedStepState,
}

impl ThreadInfo {
    pub fn new(ptid: Ptid) -> Self {
        Self {
            ptid,
            displaced_step_state: ThreadDisplacedStepState::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ptid_display() {
        assert_eq!(Ptid::process(42).to_string(), "process 42");
        assert_eq!(Ptid::new(42, 43).to_string(), "Thread 42.43");
    }

    #[test]
    fn test_parse_signal_names() {
        assert_eq!(StopSignal::parse("trap"), Some(StopSignal::Trap));
        assert_eq!(StopSignal::parse("SIGSEGV"), Some(StopSignal::Segv));
        assert_eq!(StopSignal::parse("5"), Some(StopSignal::Trap));
        assert_eq!(StopSignal::parse("34"), Some(StopSignal::Other(34)));
        assert_eq!(StopSignal::parse("bogus"), None);
    }

    #[test]
    fn test_new_thread_not_in_progress() {
        let thread = ThreadInfo::new(Ptid::new(1, 2));
        assert!(!thread.displaced_step_state.in_progress());
    }
}
