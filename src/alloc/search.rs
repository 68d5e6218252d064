//! Walks the address space for unmapped pages close to an origin
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

use std::ops::Range;

/// Direction a [`FreePages`] walk moves in
#[derive(Debug, Clone, Copy)]
enum Direction {
    /// Towards higher addresses
    Up,
    /// Towards lower addresses
    Down,
}

/// Iterator over page-aligned addresses that are not mapped, moving away from an origin.
///
/// Mapped regions are skipped as a whole, so the walk costs one query per region rather
/// than one per page. The walk ends when it leaves `bounds` or a query fails.
#[derive(Debug)]
pub struct FreePages {
    /// Addresses the walk may visit
    bounds: Range<usize>,
    /// Next address to query. Zero ends the walk
    cursor: usize,
    /// Direction of the walk
    direction: Direction,
}

/// Free pages at or above `origin`, nearest first
pub fn above(origin: usize, bounds: Range<usize>) -> FreePages {
    FreePages::new(origin, bounds, Direction::Up)
}

/// Free pages below `origin`, nearest first
pub fn below(origin: usize, bounds: Range<usize>) -> FreePages {
    let start = page_floor(origin).saturating_sub(region::page::size());
    FreePages::new(start, bounds, Direction::Down)
}

/// Rounds `address` down to the start of its page
fn page_floor(address: usize) -> usize {
    address & !(region::page::size() - 1)
}

impl FreePages {
    /// Starts a walk at the page containing `origin`
    fn new(origin: usize, bounds: Range<usize>, direction: Direction) -> Self {
        Self {
            bounds,
            cursor: page_floor(origin),
            direction,
        }
    }

    /// Moves the cursor one page in the walk's direction
    fn step(&mut self, page: usize) {
        self.cursor = match self.direction {
            Direction::Up => self.cursor.checked_add(page).unwrap_or(0),
            Direction::Down => self.cursor.saturating_sub(page),
        };
    }
}

impl Iterator for FreePages {
    type Item = Result<usize, region::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let page = region::page::size();

        while self.cursor != 0 && self.bounds.contains(&self.cursor) {
            match region::query(self.cursor as *const u8) {
                Ok(mapped) => {
                    let range = mapped.as_range();
                    self.cursor = match self.direction {
                        Direction::Up => range.end,
                        Direction::Down => range.start.saturating_sub(page),
                    };
                }
                Err(region::Error::UnmappedRegion) => {
                    let free = self.cursor;
                    self.step(page);
                    return Some(Ok(free));
                }
                Err(e) => {
                    self.cursor = 0;
                    return Some(Err(e));
                }
            }
        }

        None
    }
}
