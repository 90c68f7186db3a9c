//! x86-64 displaced stepping.
//!
//! Instructions are copied verbatim. After a step the PC is moved back by
//! the buffer offset unless the instruction jumps to an absolute target, and
//! the return address pushed by a call is moved back the same way.
//!
//! Instructions this module cannot relocate safely are declined: traps and
//! system calls, VEX/EVEX encodings, and anything with a RIP-relative
//! memory operand.

use std::any::Any;

use iced_x86::{Code, Decoder, DecoderOptions, EncodingKind, FlowControl, Instruction};

use super::{DisplacedStepClosure, DisplacedStepOps, Gdbarch};
use crate::core::registers::{amd64, Regcache};
use crate::displaced::{dump_bytes, DisplacedStepError, LOG_TARGET};

/// Longest legal x86 instruction.
pub const MAX_INSN_LENGTH: usize = 16;

const INT3: [u8; 1] = [0xcc];

/// The x86-64 architecture.
#[derive(Debug, Default, Clone, Copy)]
pub struct Amd64;

/// How control leaves a relocated instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
    /// Falls through or branches relative to the PC.
    Relative,
    /// Relative call: pushes a return address, target relative to the PC.
    RelativeCall,
    /// Jumps to an absolute target (ret, indirect jmp).
    Absolute,
    /// Indirect call: pushes a return address, absolute target.
    AbsoluteCall,
}

/// Decoded shape of the instruction being relocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Amd64Closure {
    /// Bytes copied into the scratch buffer.
    pub insn: Vec<u8>,
    pub control_flow: ControlFlow,
}

impl DisplacedStepClosure for Amd64Closure {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn decode(from: u64, bytes: &[u8]) -> Option<Instruction> {
    let mut decoder = Decoder::with_ip(64, bytes, from, DecoderOptions::NONE);
    let insn = decoder.decode();
    (!insn.is_invalid()).then_some(insn)
}

/// Whether the instruction cannot be run from a scratch buffer as is.
fn must_decline(insn: &Instruction) -> bool {
    // int3, int n, int1 and the like
    if insn.flow_control() == FlowControl::Interrupt {
        return true;
    }
    // Transactional regions abort on a single-step.
    if insn.flow_control() == FlowControl::XbeginXabortXend {
        return true;
    }
    matches!(insn.code(), Code::Syscall | Code::Sysenter)
        || insn.encoding() != EncodingKind::Legacy
        || insn.is_ip_rel_memory_operand()
}

fn control_flow(insn: &Instruction) -> ControlFlow {
    match insn.flow_control() {
        FlowControl::Call => ControlFlow::RelativeCall,
        FlowControl::IndirectCall => ControlFlow::AbsoluteCall,
        FlowControl::Return | FlowControl::IndirectBranch => ControlFlow::Absolute,
        _ => ControlFlow::Relative,
    }
}

impl Gdbarch for Amd64 {
    fn name(&self) -> &str {
        "i386:x86-64"
    }

    fn max_insn_length(&self) -> usize {
        MAX_INSN_LENGTH
    }

    fn breakpoint_from_pc(&self, _pc: u64) -> &[u8] {
        &INT3
    }

    fn displaced_step(&self) -> Option<&dyn DisplacedStepOps> {
        Some(self)
    }
}

impl DisplacedStepOps for Amd64 {
    fn copy_insn(
        &self,
        from: u64,
        to: u64,
        regcache: &mut Regcache<'_>,
    ) -> Result<Option<Box<dyn DisplacedStepClosure>>, DisplacedStepError> {
        let mut bytes = vec![0u8; MAX_INSN_LENGTH];
        regcache.read_memory(from, &mut bytes)?;

        let Some(decoded) = decode(from, &bytes) else {
            log::debug!(
                target: LOG_TARGET,
                "undecodable instruction at {:#x}: {}",
                from,
                dump_bytes(&bytes)
            );
            return Ok(None);
        };
        bytes.truncate(decoded.len());
        if must_decline(&decoded) {
            log::debug!(
                target: LOG_TARGET,
                "can't displace {:?} at {:#x}: {}",
                decoded.code(),
                from,
                dump_bytes(&bytes)
            );
            return Ok(None);
        }

        regcache.write_memory(to, &bytes)?;
        log::debug!(
            target: LOG_TARGET,
            "copy {:#x}->{:#x}: {}",
            from,
            to,
            dump_bytes(&bytes)
        );

        Ok(Some(Box::new(Amd64Closure {
            insn: bytes,
            control_flow: control_flow(&decoded),
        })))
    }

    fn fixup(
        &self,
        closure: Box<dyn DisplacedStepClosure>,
        from: u64,
        to: u64,
        regcache: &mut Regcache<'_>,
    ) -> Result<(), DisplacedStepError> {
        let closure = closure
            .as_any()
            .downcast_ref::<Amd64Closure>()
            .unwrap_or_else(|| panic!("foreign displaced-step closure {:?}", closure));

        let pc = regcache.read_pc()?;
        match closure.control_flow {
            ControlFlow::Relative | ControlFlow::RelativeCall => {
                let fixed = pc.wrapping_sub(to).wrapping_add(from);
                regcache.write_pc(fixed)?;
                log::debug!(
                    target: LOG_TARGET,
                    "fixup: relocated pc from {:#x} to {:#x}",
                    pc,
                    fixed
                );
            }
            ControlFlow::Absolute | ControlFlow::AbsoluteCall => {}
        }

        if matches!(
            closure.control_flow,
            ControlFlow::RelativeCall | ControlFlow::AbsoluteCall
        ) {
            let rsp = regcache.read_register(amd64::RSP)?;
            let retaddr = regcache.read_u64(rsp)?;
            let fixed = retaddr.wrapping_sub(to).wrapping_add(from);
            regcache.write_u64(rsp, fixed)?;
            log::debug!(
                target: LOG_TARGET,
                "fixup: return address {:#x} -> {:#x} at {:#x}",
                retaddr,
                fixed,
                rsp
            );
        }

        Ok(())
    }
}
