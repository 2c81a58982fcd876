//! The disassembly primitive backing the trampoline/thunk generator: finding
//! the smallest `n >= min_len` such that the first `n` bytes of a target form
//! whole instructions, and relocating that span to a new address.
//!
//! This only ever needs to decode, never to synthesize, arbitrary
//! instructions — only a minimum-instruction-length scan plus relocation of
//! the handful of control-transfer shapes a function prologue can plausibly
//! contain.

use crate::error::{Error, Result};
use cfg_if::cfg_if;
use iced_x86::{BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, FlowControl, Instruction, InstructionBlock};

cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        const BITNESS: u32 = 64;
    } else {
        const BITNESS: u32 = 32;
    }
}

/// The decoded, still-relocatable prologue captured from a target address.
pub struct Prologue {
    pub instructions: Vec<Instruction>,
    pub length: usize,
}

/// Decodes whole instructions starting at `address` (backed by `bytes`,
/// which must contain at least `min_len`'s worth of valid code plus slack
/// for the last instruction to finish) until at least `min_len` bytes have
/// been covered.
///
/// Fails with [`Error::UnsupportedPrologue`] if decoding hits an invalid
/// opcode, or a control-transfer instruction that cannot be safely relocated
/// (an indirect branch/call, an interrupt, or a *short* — single rel8 —
/// conditional/unconditional jump).
pub fn decode_prologue(bytes: &[u8], address: u64, min_len: usize) -> Result<Prologue> {
    let mut decoder = Decoder::with_ip(BITNESS, bytes, address, DecoderOptions::NONE);
    let mut instructions = Vec::new();
    let mut total = 0usize;

    while total < min_len {
        if decoder.position() >= bytes.len() {
            return Err(Error::UnsupportedPrologue(
                "ran out of bytes before reaching the minimum prologue length".into(),
            ));
        }

        let instr = decoder.decode();
        if instr.is_invalid() {
            return Err(Error::UnsupportedPrologue(format!(
                "invalid opcode at offset {}",
                total
            )));
        }

        if is_short_branch(&instr) {
            return Err(Error::UnsupportedPrologue(format!(
                "short (rel8) branch at offset {total} cannot be relocated"
            )));
        }

        match instr.flow_control() {
            FlowControl::Next
            | FlowControl::Return
            | FlowControl::Call
            | FlowControl::UnconditionalBranch
            | FlowControl::ConditionalBranch => {
                total += instr.len();
                instructions.push(instr);
            }
            FlowControl::IndirectBranch
            | FlowControl::IndirectCall
            | FlowControl::Interrupt
            | FlowControl::XbeginXabortXend
            | FlowControl::Exception => {
                return Err(Error::UnsupportedPrologue(format!(
                    "non-relocatable control transfer ({:?}) at offset {total}",
                    instr.flow_control()
                )));
            }
        }
    }

    Ok(Prologue {
        instructions,
        length: total,
    })
}

/// A near (rel32) branch/call is 5-6 bytes; a short (rel8) one is 2 bytes.
/// iced-x86 exposes no direct "is short" predicate, so this distinguishes by
/// encoded length, which is exact for both x86 and x86-64.
fn is_short_branch(instr: &Instruction) -> bool {
    matches!(
        instr.flow_control(),
        FlowControl::ConditionalBranch | FlowControl::UnconditionalBranch | FlowControl::Call
    ) && instr.len() <= 2
}

/// Re-encodes `prologue`'s instructions to run correctly at `new_address`,
/// fixing up RIP-relative operands and rel32 branch/call displacements in
/// the process (iced-x86's `BlockEncoder` does this automatically; anything
/// with no relative operand round-trips byte-for-byte).
pub fn relocate(prologue: &Prologue, new_address: u64) -> Result<Vec<u8>> {
    let block = InstructionBlock::new(&prologue.instructions, new_address);
    let result = BlockEncoder::encode(BITNESS, block, BlockEncoderOptions::NONE)
        .map_err(|e| Error::UnsupportedPrologue(format!("relocation failed: {e}")))?;
    Ok(result.code_buffer)
}

/// Emits an absolute jump to `target`: `mov rax, target; jmp rax` on x86-64
/// (7 + 2 = 9 bytes, always reachable regardless of distance), or a rel32
/// `jmp` on x86 when `target` is within range, falling back to the same
/// indirect form otherwise.
pub fn emit_absolute_jump(target: u64) -> Vec<u8> {
    #[cfg(target_pointer_width = "64")]
    {
        let mut code = vec![0x48, 0xB8]; // mov rax, imm64
        code.extend_from_slice(&target.to_le_bytes());
        code.extend_from_slice(&[0xFF, 0xE0]); // jmp rax
        code
    }
    #[cfg(target_pointer_width = "32")]
    {
        let mut code = vec![0xB8]; // mov eax, imm32
        code.extend_from_slice(&(target as u32).to_le_bytes());
        code.extend_from_slice(&[0xFF, 0xE0]); // jmp eax
        code
    }
}

/// Emits a direct rel32 `jmp` from `from` (the address immediately after the
/// 5-byte instruction) to `target`, used to overwrite a target's prologue.
pub fn emit_rel32_jump(from: u64, target: u64) -> [u8; 5] {
    let displacement = (target as i64 - (from as i64 + 5)) as i32;
    let mut code = [0u8; 5];
    code[0] = 0xE9;
    code[1..].copy_from_slice(&displacement.to_le_bytes());
    code
}

pub const JUMP_INSTRUCTION_LEN: usize = 5;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_simple_x86_64_prologue() {
        // push rbp; mov rbp, rsp; sub rsp, 0x10 -- 1 + 3 + 4 = 8 bytes.
        let bytes = [0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x10, 0xC3];
        let prologue = decode_prologue(&bytes, 0x1000, 5).unwrap();
        assert!(prologue.length >= 5);
        assert!(prologue.length <= bytes.len());
    }

    #[test]
    fn rejects_invalid_opcode() {
        let bytes = [0x0F, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
        let err = decode_prologue(&bytes, 0x1000, 5).unwrap_err();
        matches::assert_matches!(err, Error::UnsupportedPrologue(_));
    }

    #[test]
    fn relocates_rel32_call() {
        // call rel32 (e8 + 4-byte displacement) then a few NOPs for slack.
        let bytes = [0xE8, 0x00, 0x00, 0x00, 0x00, 0x90, 0x90, 0x90, 0x90];
        let prologue = decode_prologue(&bytes, 0x1000, 5).unwrap();
        let relocated = relocate(&prologue, 0x2000).unwrap();
        assert!(!relocated.is_empty());
    }

    #[test]
    fn emits_five_byte_rel32_jump() {
        let code = emit_rel32_jump(0x1000, 0x2000);
        assert_eq!(code[0], 0xE9);
        assert_eq!(code.len(), JUMP_INSTRUCTION_LEN);
    }

    #[test]
    fn rejects_short_unconditional_jump() {
        // jmp rel8 (eb + 1-byte displacement), padded with NOPs.
        let bytes = [0xEB, 0x02, 0x90, 0x90, 0x90, 0x90, 0x90];
        let err = decode_prologue(&bytes, 0x1000, 5).unwrap_err();
        matches::assert_matches!(err, Error::UnsupportedPrologue(_));
    }

    #[test]
    fn rejects_short_conditional_jump() {
        // jz rel8 (74 + 1-byte displacement), padded with NOPs.
        let bytes = [0x74, 0x02, 0x90, 0x90, 0x90, 0x90, 0x90];
        let err = decode_prologue(&bytes, 0x1000, 5).unwrap_err();
        matches::assert_matches!(err, Error::UnsupportedPrologue(_));
    }
}
