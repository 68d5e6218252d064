//! Instruction boundaries of patch windows
//!
//! A window must never end in the middle of an instruction: code that runs through the
//! remaining bytes, or a trampoline that executes a copy of the window, would decode garbage.
//! These helpers decode the original bytes to grow a requested window to the next boundary.

use iced_x86::{Decoder, DecoderError, DecoderOptions, FlowControl, Instruction};
use thiserror::Error;

/// Longest encodable x86 instruction
pub const MAX_INSTR_LEN: usize = 15;

/// Decoder bitness matching the address space we run in
pub const BITNESS: u32 = usize::BITS;

/// Errors while decoding a patch window
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The bytes at `ip` are not a valid instruction
    #[error("invalid instruction at {0:#x}")]
    Invalid(u64),
    /// Ran out of readable bytes before the window was covered
    #[error("code ended before {needed} bytes were covered")]
    Truncated {
        /// Number of bytes the window needed
        needed: usize,
    },
    /// The instruction behaves differently when executed from another address
    #[error("`{text}` at {ip:#x} cannot be relocated")]
    Unrelocatable {
        /// Address of the instruction
        ip: u64,
        /// Disassembly of the instruction
        text: String,
    },
}

/// Decodes whole instructions from `code` (located at `ip`) until at least `min_len` bytes are covered.
///
/// Returns the instructions and their total length, which is `>= min_len`.
pub fn cover(code: &[u8], ip: usize, min_len: usize) -> Result<(Vec<Instruction>, usize), DecodeError> {
    let mut decoder = Decoder::with_ip(BITNESS, code, ip as u64, DecoderOptions::NONE);
    let mut instructions = Vec::new();
    let mut len = 0;

    while len < min_len {
        if !decoder.can_decode() {
            return Err(DecodeError::Truncated { needed: min_len });
        }
        let instr = decoder.decode();
        if instr.is_invalid() {
            // an instruction cut off by the end of `code` also decodes as invalid
            return Err(match decoder.last_error() {
                DecoderError::NoMoreBytes => DecodeError::Truncated { needed: min_len },
                _ => DecodeError::Invalid(instr.ip()),
            });
        }
        len += instr.len();
        instructions.push(instr);
    }

    Ok((instructions, len))
}

/// Length of the smallest window of whole instructions covering `min_len` bytes
pub fn boundary(code: &[u8], ip: usize, min_len: usize) -> Result<usize, DecodeError> {
    cover(code, ip, min_len).map(|(_, len)| len)
}

/// Like [`boundary`], but also requires that the covered instructions can run verbatim
/// from a different address.
///
/// Relative branches, calls, returns and IP-relative memory operands all depend on where
/// they execute, so a prefix containing one cannot be copied into a trampoline as-is.
pub fn relocatable_boundary(code: &[u8], ip: usize, min_len: usize) -> Result<usize, DecodeError> {
    let (instructions, len) = cover(code, ip, min_len)?;

    let fixed = instructions
        .iter()
        .find(|i| i.flow_control() != FlowControl::Next || i.is_ip_rel_memory_operand());
    if let Some(instr) = fixed {
        return Err(DecodeError::Unrelocatable {
            ip: instr.ip(),
            text: instr.to_string(),
        });
    }

    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `push ebp; mov ebp, esp`
    const FRAME: [u8; 3] = [0x55, 0x8B, 0xEC];
    /// `xor eax, eax; add eax, 42; ret`
    const FORTY_TWO: [u8; 8] = [0x31, 0xC0, 0x05, 0x2A, 0x00, 0x00, 0x00, 0xC3];

    #[test]
    /// A window that already ends on a boundary is kept as-is
    fn test_exact_boundary() {
        assert_eq!(boundary(&FRAME, 0x1000, 3), Ok(3));
        assert_eq!(boundary(&FRAME, 0x1000, 1), Ok(1));
        assert_eq!(boundary(&FRAME, 0x1000, 0), Ok(0));
    }

    #[test]
    /// A window ending inside an instruction grows to the end of that instruction
    fn test_extend() {
        assert_eq!(boundary(&FRAME, 0x1000, 2), Ok(3));
        // a 5 byte jump over `xor eax, eax` has to take the whole 5 byte `add` with it
        assert_eq!(boundary(&FORTY_TWO, 0x1000, 5), Ok(7));
        assert_eq!(relocatable_boundary(&FORTY_TWO, 0x1000, 5), Ok(7));
    }

    #[test]
    /// Running out of bytes is reported instead of guessing a length
    fn test_truncated() {
        assert_eq!(
            boundary(&FRAME[..1], 0x1000, 3),
            Err(DecodeError::Truncated { needed: 3 })
        );
        // `add eax, imm32` cut short
        assert_eq!(
            boundary(&FORTY_TWO[..4], 0x1000, 3),
            Err(DecodeError::Truncated { needed: 3 })
        );
    }

    #[test]
    /// Prefixes with position-dependent instructions cannot be copied into a trampoline
    fn test_unrelocatable() {
        // call rel32
        let call = [0xE8, 0x00, 0x10, 0x00, 0x00, 0xC3];
        assert!(matches!(
            relocatable_boundary(&call, 0x1000, 5),
            Err(DecodeError::Unrelocatable { ip: 0x1000, .. })
        ));
        // a short-circuit only needs boundaries, so the same bytes are fine there
        assert_eq!(boundary(&call, 0x1000, 5), Ok(5));

        // `ret` inside the prefix
        assert!(relocatable_boundary(&FORTY_TWO, 0x1000, 8).is_err());
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    /// Opcodes removed in long mode are invalid
    fn test_invalid() {
        // push es
        assert_eq!(boundary(&[0x06, 0x90], 0x1000, 1), Err(DecodeError::Invalid(0x1000)));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    /// RIP-relative loads read through their own address
    fn test_rip_relative() {
        // mov rax, [rip + 0x10]
        let load = [0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00];
        assert!(matches!(
            relocatable_boundary(&load, 0x1000, 5),
            Err(DecodeError::Unrelocatable { .. })
        ));
    }
}
