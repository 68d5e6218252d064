//! # Alloc
//!
//! Executable memory for trampolines.
//!
//! A trampoline jumps back into the code it was copied from with a `jmp rel32`, and the
//! patched code jumps to its replacement the same way, so every block handed out here lies
//! within [`MAX_DISTANCE`] of the address it serves.
//!
//! Taken from detour-rs with slight modifications: https://github.com/darfink/detour-rs

// detour-rs - A cross-platform detour library written in Rust
// Copyright (C) 2017 Elliott Linder.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
//
// ===============================================================================
//
// minhook-rs - A minimalist x86/x86-64 hooking library for Rust
// Copyright (C) 2015 Jascha Neutelings.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

pub mod search;

use std::ops::{Deref, DerefMut};
use std::slice;
use std::sync::{Mutex, PoisonError};

use lazy_static::lazy_static;
use log::debug;
use thiserror::Error;

/// Furthest a block may start from its origin.
///
/// Kept below 2 GiB so the end of a block is still reachable with a signed 32-bit displacement.
pub const MAX_DISTANCE: usize = 0x7FF0_0000;

lazy_static! {
    /// Serializes the search-then-map sequence so two threads never map over the same free page.
    ///
    /// Only calls through this module take the lock. Anything else in the process can still map
    /// a page between [`is_free`] and [`map_at`]; on Linux `MAP_FIXED_NOREPLACE` turns that into
    /// a failed candidate, while other Unix systems map with `MAP_FIXED` and replace it.
    static ref MAP_LOCK: Mutex<()> = Mutex::new(());
}

/// Errors when allocating executable memory
#[derive(Debug, Error)]
pub enum AllocationError {
    /// No free pages could be mapped within range of the origin
    #[error("no executable memory could be mapped within range of {0:#x}")]
    OutOfRange(usize),
    /// Error while walking the address space
    #[error("error querying memory regions")]
    Query(#[from] region::Error),
}

/// A block of read-, write- and executable memory. Unmapped when dropped.
pub struct ExecutableMemory {
    /// Mapping backing the block
    map: mmap::MemoryMap,
}

// The mapping is plain memory owned by this handle; nothing ties it to the creating thread
unsafe impl Send for ExecutableMemory {}

impl ExecutableMemory {
    /// Address of the first byte of the block
    pub fn address(&self) -> usize {
        self.map.data() as usize
    }
}

impl Deref for ExecutableMemory {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        unsafe { slice::from_raw_parts(self.map.data(), self.map.len()) }
    }
}

impl DerefMut for ExecutableMemory {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.map.data(), self.map.len()) }
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        debug!(
            "releasing {:#x} bytes of executable memory at {:#x}",
            self.map.len(),
            self.address()
        );
    }
}

/// Maps at least `size` bytes of executable memory within [`MAX_DISTANCE`] of `origin`.
///
/// Pages after `origin` are tried first, then pages before it.
///
/// Note: the contents of the returned block are unspecified
pub fn allocate_near(origin: usize, size: usize) -> Result<ExecutableMemory, AllocationError> {
    let page = region::page::size();
    let size = size.max(1).div_ceil(page) * page;
    let bounds = origin.saturating_sub(MAX_DISTANCE)..origin.saturating_add(MAX_DISTANCE);
    let _lock = MAP_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

    let candidates =
        search::above(origin, bounds.clone()).chain(search::below(origin, bounds.clone()));
    for candidate in candidates {
        let address = candidate?;
        if address.saturating_add(size) > bounds.end || !is_free(address, size) {
            continue;
        }

        match map_at(address, size) {
            Ok(memory) if bounds.contains(&memory.address()) => {
                debug!(
                    "mapped {size:#x} bytes of executable memory at {:#x} for {origin:#x}",
                    memory.address()
                );
                return Ok(memory);
            }
            // the system placed the mapping somewhere else; dropping it unmaps it again
            Ok(_) => continue,
            Err(e) => debug!("mapping {size:#x} bytes at {address:#x} failed: {e}"),
        }
    }

    Err(AllocationError::OutOfRange(origin))
}

/// Returns true if none of the pages in `address..address + size` are mapped
fn is_free(address: usize, size: usize) -> bool {
    let page = region::page::size();
    (address..address + size).step_by(page).all(|page| {
        matches!(
            region::query(page as *const u8),
            Err(region::Error::UnmappedRegion)
        )
    })
}

/// Maps `size` bytes at `address`
///
/// On Linux the mapping never replaces an existing one. Kernels older than 4.17 treat the
/// address as a hint instead, so the caller checks where the block landed.
fn map_at(address: usize, size: usize) -> Result<ExecutableMemory, mmap::MapError> {
    mmap::MemoryMap::new(
        size,
        &[
            mmap::MapOption::MapReadable,
            mmap::MapOption::MapWritable,
            mmap::MapOption::MapExecutable,
            mmap::MapOption::MapAddr(address as *const u8),
            #[cfg(target_os = "linux")]
            mmap::MapOption::MapNonStandardFlags(
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
            ),
        ],
    )
    .map(|map| ExecutableMemory { map })
}
