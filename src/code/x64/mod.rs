//! x86-64 code generation: jumps, instruction relocation and the mid-hook context stub

use iced_x86::code_asm::*;
use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, FlowControl, IcedError,
    Instruction, InstructionBlock,
};
use thiserror::Error;

/// Longest possible x86 instruction
pub const MAX_INSTR_LEN: usize = 15;

/// Length of `jmp rel32`
pub const JMP_REL32_LEN: usize = 5;

/// Length of the sequence built by [`jmp_abs`]
pub const JMP_ABS_LEN: usize = 14;

/// Bytes the stub reserves below the interrupted stack pointer before saving anything.
/// System V code may keep live data in the 128 bytes below `rsp`.
pub const RED_ZONE: i32 = 0x80;

/// Errors while generating or moving code
#[derive(Debug, Error)]
pub enum CodeError {
    /// Error from the assembler or block encoder
    #[error("{0}")]
    Iced(#[from] IcedError),
    /// The bytes at the address don't decode to a valid instruction
    #[error("invalid instruction at {0:#x}")]
    InvalidInstruction(u64),
    /// The buffer ended before enough instructions were decoded
    #[error("ran out of code at {0:#x}")]
    Truncated(u64),
    /// Execution leaves the region before enough bytes were covered
    #[error("control flow leaves the patched region at {0:#x}")]
    FlowEscapes(u64),
}

/// Generates an absolute jump to a specified address: `jmp [rip+0]` followed by the target
pub fn jmp_abs(target: usize) -> [u8; JMP_ABS_LEN] {
    let mut code = [0u8; JMP_ABS_LEN];
    code[..6].copy_from_slice(&[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]);
    code[6..].copy_from_slice(&(target as u64).to_le_bytes());
    code
}

/// Generates a `jmp rel32` placed at `from` that lands on `to`, or `None` if `to` is out of reach
pub fn jmp_rel32(from: usize, to: usize) -> Option<[u8; JMP_REL32_LEN]> {
    let displacement = (to as i64).wrapping_sub((from + JMP_REL32_LEN) as i64);
    let displacement = i32::try_from(displacement).ok()?;
    let mut code = [0xE9, 0, 0, 0, 0];
    code[1..].copy_from_slice(&displacement.to_le_bytes());
    Some(code)
}

/// Decodes whole instructions from the start of `code` (located at `ip`) until at least `min_len` bytes are covered.
///
/// Only the last decoded instruction may unconditionally transfer control elsewhere,
/// anything after it would not belong to the same instruction stream.
pub fn steal(code: &[u8], ip: u64, min_len: usize) -> Result<Vec<Instruction>, CodeError> {
    let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
    let mut instructions = Vec::new();
    let mut len = 0;

    while len < min_len {
        let at = ip + len as u64;
        if let Some(last) = instructions.last() {
            if ends_stream(last) {
                return Err(CodeError::FlowEscapes(at));
            }
        }
        if !decoder.can_decode() {
            return Err(CodeError::Truncated(at));
        }
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(CodeError::InvalidInstruction(at));
        }
        len += instruction.len();
        instructions.push(instruction);
    }
    Ok(instructions)
}

/// Whether execution never falls through to the instruction after `instruction`
fn ends_stream(instruction: &Instruction) -> bool {
    matches!(
        instruction.flow_control(),
        FlowControl::Return
            | FlowControl::UnconditionalBranch
            | FlowControl::IndirectBranch
            | FlowControl::Interrupt
            | FlowControl::Exception
    )
}

/// Total encoded length of decoded instructions
pub fn encoded_len(instructions: &[Instruction]) -> usize {
    instructions.iter().map(Instruction::len).sum()
}

/// Re-encodes `instructions` so they behave the same when executed from `ip`.
///
/// Relative branches and RIP-relative operands are rewritten, short branches are widened if needed.
pub fn relocate(instructions: &[Instruction], ip: u64) -> Result<Vec<u8>, CodeError> {
    let block = InstructionBlock::new(instructions, ip);
    let encoded = BlockEncoder::encode(64, block, BlockEncoderOptions::NONE)?;
    Ok(encoded.code_buffer)
}

/// XMM registers in save order
const XMM: [AsmRegisterXmm; 16] = [
    xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7, xmm8, xmm9, xmm10, xmm11, xmm12, xmm13,
    xmm14, xmm15,
];

/// General purpose registers pushed after `rflags`, in push order.
/// The stack pointer slot is filled in between `rbx` and `rbp`.
const PUSHED_LOW: [AsmRegister64; 4] = [rax, rcx, rdx, rbx];
/// General purpose registers pushed after the stack pointer slot, in push order
const PUSHED_HIGH: [AsmRegister64; 11] = [rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15];

/// Size of the saved vector state
const XMM_SAVE: i32 = 16 * 16;

/// Assembles the context stub placed at `ip`.
///
/// The stub saves every general purpose register, `rflags` and `xmm0`-`xmm15` on the stack
/// (laid out as [`crate::hook::Context`]), calls `callback(context, data)` with the platform's C
/// calling convention, then reloads everything from the possibly modified context and falls
/// through to whatever follows the stub.
pub fn context_stub(ip: u64, callback: usize, data: usize) -> Result<Vec<u8>, CodeError> {
    let mut a = CodeAssembler::new(64)?;

    // save
    a.lea(rsp, qword_ptr(rsp - RED_ZONE))?;
    a.pushfq()?;
    for reg in PUSHED_LOW {
        a.push(reg)?;
    }
    // rsp as it was when the hooked instruction was reached
    a.lea(rax, qword_ptr(rsp + (RED_ZONE + 8 * (PUSHED_LOW.len() as i32 + 1))))?;
    a.push(rax)?;
    for reg in PUSHED_HIGH {
        a.push(reg)?;
    }
    a.sub(rsp, XMM_SAVE)?;
    for (i, reg) in XMM.into_iter().enumerate() {
        a.movdqu(xmmword_ptr(rsp + 16 * i as i32), reg)?;
    }

    // call, with the context pointer in the first argument register of both ABIs
    a.cld()?;
    a.mov(rbx, rsp)?;
    a.mov(rcx, rsp)?;
    a.mov(rdi, rsp)?;
    a.mov(rdx, data as u64)?;
    a.mov(rsi, data as u64)?;
    a.and(rsp, -16)?;
    // shadow space for the Windows ABI
    a.sub(rsp, 0x20)?;
    a.mov(rax, callback as u64)?;
    a.call(rax)?;
    a.mov(rsp, rbx)?;

    // restore
    for (i, reg) in XMM.into_iter().enumerate() {
        a.movdqu(reg, xmmword_ptr(rsp + 16 * i as i32))?;
    }
    a.add(rsp, XMM_SAVE)?;
    for reg in PUSHED_HIGH.into_iter().rev() {
        a.pop(reg)?;
    }
    // the saved stack pointer is informational, writes to it are dropped
    a.add(rsp, 8)?;
    for reg in PUSHED_LOW.into_iter().rev() {
        a.pop(reg)?;
    }
    a.popfq()?;
    a.lea(rsp, qword_ptr(rsp + RED_ZONE))?;

    Ok(a.assemble(ip)?)
}

#[cfg(test)]
mod tests {
    use iced_x86::{Decoder, DecoderOptions, Mnemonic};

    use super::{context_stub, jmp_abs, jmp_rel32, relocate, steal, CodeError};

    #[test]
    /// Absolute jump encoding
    fn test_jmp_abs() {
        let code = jmp_abs(0x1122_3344_5566_7788);
        assert_eq!(
            code,
            [0xFF, 0x25, 0, 0, 0, 0, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    /// Relative jumps, and targets out of rel32 range
    fn test_jmp_rel32() {
        assert_eq!(jmp_rel32(0x1000, 0x1005), Some([0xE9, 0, 0, 0, 0]));
        assert_eq!(jmp_rel32(0x1000, 0x1000), Some([0xE9, 0xFB, 0xFF, 0xFF, 0xFF]));
        assert_eq!(jmp_rel32(0x1000, 0x1_0000_1000), None);
    }

    #[test]
    /// Enough whole instructions are taken to cover the requested length
    fn test_steal_whole_instructions() {
        // xor eax, eax; mov ecx, 0; jz +6
        let code = [0x31, 0xC0, 0xB9, 0x00, 0x00, 0x00, 0x00, 0x74, 0x06];
        let stolen = steal(&code, 0x1000, 5).unwrap();
        assert_eq!(stolen.len(), 2);
        assert_eq!(stolen[0].mnemonic(), Mnemonic::Xor);
        assert_eq!(stolen[1].mnemonic(), Mnemonic::Mov);
    }

    #[test]
    /// Code that leaves early or is cut short can't be stolen
    fn test_steal_errors() {
        // ret followed by unrelated bytes
        let code = [0xC3, 0x90, 0x90, 0x90, 0x90, 0x90];
        assert!(matches!(
            steal(&code, 0x1000, 5),
            Err(CodeError::FlowEscapes(0x1001))
        ));

        // mov eax, imm32 cut short
        let code = [0x90, 0xB8, 0x01];
        assert!(matches!(
            steal(&code, 0x1000, 5),
            Err(CodeError::InvalidInstruction(0x1001) | CodeError::Truncated(_))
        ));
    }

    #[test]
    /// A short conditional jump moved far away still reaches its original target
    fn test_relocate_branch() {
        // jz 0x1008 located at 0x1000
        let code = [0x74, 0x06];
        let stolen = steal(&code, 0x1000, 2).unwrap();

        let moved = relocate(&stolen, 0x10_0000).unwrap();
        let mut decoder = Decoder::with_ip(64, &moved, 0x10_0000, DecoderOptions::NONE);
        let branch = decoder.decode();
        assert_eq!(branch.mnemonic(), Mnemonic::Je);
        assert_eq!(branch.near_branch_target(), 0x1008);
    }

    #[test]
    /// The stub decodes cleanly and calls the callback exactly once
    fn test_context_stub_shape() {
        let code = context_stub(0x4000, 0xDEAD_BEEF, 0x1234).unwrap();
        let decoder = Decoder::with_ip(64, &code, 0x4000, DecoderOptions::NONE);
        let instructions: Vec<_> = decoder.into_iter().collect();

        assert!(instructions.iter().all(|i| !i.is_invalid()));
        assert_eq!(
            instructions.iter().filter(|i| i.mnemonic() == Mnemonic::Call).count(),
            1
        );
        assert_eq!(instructions.first().map(|i| i.mnemonic()), Some(Mnemonic::Lea));
        assert_eq!(instructions.last().map(|i| i.mnemonic()), Some(Mnemonic::Lea));
    }
}
