//! Encoders for the few x86 instructions written over patch targets

use thiserror::Error;

/// Length of `jmp rel32`
pub const JMP_REL32_LEN: usize = 5;

/// Opcode of `jmp rel32`
const JMP_REL32: u8 = 0xE9;

/// Single byte `nop`, used to fill the rest of a window after the replacement code
pub const NOP: u8 = 0x90;

/// `xor eax, eax; ret`
///
/// Returns zero (false) to the caller without running any of the original function
pub const RETURN_ZERO: [u8; 3] = [0x31, 0xC0, 0xC3];

/// Errors when encoding instructions
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodeError {
    /// The destination cannot be expressed as a signed 32-bit displacement
    #[error("{to:#x} is out of rel32 range of the jump at {from:#x}")]
    OutOfRange {
        /// Address of the jump instruction
        from: usize,
        /// Requested destination
        to: usize,
    },
}

/// Computes the displacement of a relative branch.
///
/// The displacement is relative to the end of the instruction:
/// `to == from + len + offset`. On a 32-bit address space every destination is
/// reachable since the addition wraps at 32 bits.
pub fn rel32(from: usize, len: usize, to: usize) -> Result<i32, CodeError> {
    let next = from.wrapping_add(len);
    let offset = to.wrapping_sub(next) as isize;

    if usize::BITS <= 32 {
        return Ok(offset as i32);
    }
    i32::try_from(offset).map_err(|_| CodeError::OutOfRange { from, to })
}

/// Encodes a `jmp rel32` placed at `from` that lands on `to`
pub fn jmp_rel32(from: usize, to: usize) -> Result<[u8; JMP_REL32_LEN], CodeError> {
    let offset = rel32(from, JMP_REL32_LEN, to)?;

    let mut code = [JMP_REL32, 0, 0, 0, 0];
    code[1..].copy_from_slice(&offset.to_le_bytes());
    Ok(code)
}

/// Pads `code` with `nop`s up to `len` bytes.
///
/// Filling the whole window keeps the bytes after the replacement decodable if a
/// disassembler or another thread walks through them.
pub fn pad(code: &[u8], len: usize) -> Vec<u8> {
    let mut padded = Vec::with_capacity(len.max(code.len()));
    padded.extend_from_slice(code);
    padded.resize(len.max(code.len()), NOP);
    padded
}
