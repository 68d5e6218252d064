//! # Trampoline
//!
//! A trampoline is a relocated copy of the start of a function followed by a jump back to
//! the first instruction that was not copied. Once the start of the function is overwritten,
//! calling the trampoline is the only way left to run the original code.

use std::slice;

use log::debug;
use thiserror::Error;

use crate::alloc::{self, AllocationError, ExecutableMemory};
use crate::code::x86::{self, CodeError, JMP_REL32_LEN};

/// Errors while building a trampoline
#[derive(Debug, Error)]
pub enum TrampolineError {
    /// Executable memory could not be obtained near the original
    #[error("{0}")]
    Allocation(#[from] AllocationError),
    /// The jump back could not be encoded
    #[error("{0}")]
    Code(#[from] CodeError),
}

/// A relocated prefix of a function plus a jump back into it
pub struct Trampoline {
    /// Memory holding the stub
    memory: ExecutableMemory,
    /// Number of original bytes copied into the stub
    prefix_len: usize,
}

impl Trampoline {
    /// Builds a trampoline for the function at `original` that runs its first `prefix_len` bytes
    /// and then continues at `original + prefix_len`.
    ///
    /// Must be called before the original bytes are overwritten: they are the copy source.
    ///
    /// # Safety
    ///
    /// - `original` must be [valid](https://doc.rust-lang.org/stable/std/ptr/index.html#safety)
    ///   for reads of `prefix_len` bytes
    /// - the first `prefix_len` bytes must be whole instructions that can execute from any address
    pub unsafe fn build(original: usize, prefix_len: usize) -> Result<Self, TrampolineError> {
        let mut memory = alloc::allocate_near(original, prefix_len + JMP_REL32_LEN)?;
        let entry = memory.address();

        // the jump back is encoded relative to its own slot in the stub
        let jmp_back = x86::jmp_rel32(entry + prefix_len, original + prefix_len)?;

        memory[..prefix_len].copy_from_slice(slice::from_raw_parts(original as *const u8, prefix_len));
        memory[prefix_len..prefix_len + JMP_REL32_LEN].copy_from_slice(&jmp_back);

        debug!(
            "trampoline for {original:#x} at {entry:#x}: {:02x?}",
            &memory[..prefix_len + JMP_REL32_LEN]
        );

        Ok(Self { memory, prefix_len })
    }

    /// Address to call to run the original function
    pub fn entry(&self) -> usize {
        self.memory.address()
    }

    /// Number of original bytes relocated into the stub
    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    /// The stub's code: the relocated prefix followed by the jump back
    pub fn code(&self) -> &[u8] {
        &self.memory[..self.prefix_len + JMP_REL32_LEN]
    }
}
