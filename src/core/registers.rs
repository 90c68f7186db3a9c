//! Registers - per-thread register state and the regcache handle.

use thiserror::Error;

use super::memory::{MemoryError, TargetMemory};
use super::target::Target;
use super::types::Ptid;

/// Register access errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    #[error("Unknown thread {0}")]
    UnknownThread(Ptid),

    #[error("Invalid register number {0}")]
    InvalidRegister(usize),

    #[error("Failed to access registers of {ptid}: {reason}")]
    AccessFailed { ptid: Ptid, reason: String },
}

/// AMD64 register numbers, in the order debuggers conventionally use.
pub mod amd64 {
    pub const RAX: usize = 0;
    pub const RBX: usize = 1;
    pub const RCX: usize = 2;
    pub const RDX: usize = 3;
    pub const RSI: usize = 4;
    pub const RDI: usize = 5;
    pub const RBP: usize = 6;
    pub const RSP: usize = 7;
    pub const R8: usize = 8;
    pub const R15: usize = 15;
    pub const RIP: usize = 16;
    pub const EFLAGS: usize = 17;
    pub const NUM_REGS: usize = 18;
}

/// CPU register state (x64)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterState {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

impl RegisterState {
    /// Register state of a thread stopped at `pc`.
    pub fn at_pc(pc: u64) -> Self {
        Self {
            rip: pc,
            ..Self::default()
        }
    }

    fn slot_mut(&mut self, regnum: usize) -> Result<&mut u64, RegisterError> {
        Ok(match regnum {
            0 => &mut self.rax,
            1 => &mut self.rbx,
            2 => &mut self.rcx,
            3 => &mut self.rdx,
            4 => &mut self.rsi,
            5 => &mut self.rdi,
            6 => &mut self.rbp,
            7 => &mut self.rsp,
            8 => &mut self.r8,
            9 => &mut self.r9,
            10 => &mut self.r10,
            11 => &mut self.r11,
            12 => &mut self.r12,
            13 => &mut self.r13,
            14 => &mut self.r14,
            15 => &mut self.r15,
            16 => &mut self.rip,
            17 => &mut self.rflags,
            _ => return Err(RegisterError::InvalidRegister(regnum)),
        })
    }

    pub fn get(&self, regnum: usize) -> Result<u64, RegisterError> {
        Ok(match regnum {
            0 => self.rax,
            1 => self.rbx,
            2 => self.rcx,
            3 => self.rdx,
            4 => self.rsi,
            5 => self.rdi,
            6 => self.rbp,
            7 => self.rsp,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            15 => self.r15,
            16 => self.rip,
            17 => self.rflags,
            _ => return Err(RegisterError::InvalidRegister(regnum)),
        })
    }

    pub fn set(&mut self, regnum: usize, value: u64) -> Result<(), RegisterError> {
        *self.slot_mut(regnum)? = value;
        Ok(())
    }
}

/// Register (and memory) access bound to one thread.
///
/// Architecture hooks receive a `Regcache` instead of the whole target, so
/// everything they touch is addressed to the thread being stepped.
pub struct Regcache<'a> {
    target: &'a mut dyn Target,
    ptid: Ptid,
}

impl<'a> Regcache<'a> {
    pub fn new(target: &'a mut dyn Target, ptid: Ptid) -> Self {
        Self { target, ptid }
    }

    pub fn ptid(&self) -> Ptid {
        self.ptid
    }

    pub fn read_pc(&mut self) -> Result<u64, RegisterError> {
        self.target.read_pc(self.ptid)
    }

    pub fn write_pc(&mut self, pc: u64) -> Result<(), RegisterError> {
        self.target.write_pc(self.ptid, pc)
    }

    pub fn read_register(&mut self, regnum: usize) -> Result<u64, RegisterError> {
        self.target.read_register(self.ptid, regnum)
    }

    pub fn write_register(&mut self, regnum: usize, value: u64) -> Result<(), RegisterError> {
        self.target.write_register(self.ptid, regnum, value)
    }

    pub fn read_memory(&mut self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.target.read_memory(self.ptid, address, buf)
    }

    pub fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.target.write_memory(self.ptid, address, data)
    }

    pub fn read_u64(&mut self, address: u64) -> Result<u64, MemoryError> {
        self.target.read_u64(self.ptid, address)
    }

    pub fn write_u64(&mut self, address: u64, value: u64) -> Result<(), MemoryError> {
        self.target.write_u64(self.ptid, address, value)
    }
}
