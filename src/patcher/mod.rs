//! # Patcher
//!
//! A [`CodePatch`] owns one modification site: the target address, the window of original
//! bytes it overwrites, the snapshot of those bytes, and (for diverting patches) the
//! trampoline that keeps the original callable. Patches can be applied and reverted any
//! number of times; reverting restores the snapshot byte for byte.

pub mod mem;

use std::fmt;

use log::{debug, info};
use thiserror::Error;

use crate::code::decode::{self, DecodeError, MAX_INSTR_LEN};
use crate::code::x86::{self, CodeError, JMP_REL32_LEN};
use crate::hook::trampoline::{Trampoline, TrampolineError};
use crate::hook::{self, Detour, Slot};

use self::mem::ProtectionError;

/// Errors when applying or reverting a patch
#[derive(Debug, Error)]
pub enum PatchError {
    /// Nothing is mapped at the target
    #[error("target {0:#x} is not mapped")]
    TargetUnmapped(usize),
    /// The target's protection could not be changed
    #[error("{0}")]
    ProtectionDenied(#[source] ProtectionError),
    /// The bytes at the target are not the ones the patch was written for
    #[error("unexpected bytes at {address:#x}: expected {expected:02x?}, found {found:02x?}")]
    SignatureMismatch {
        /// Target address
        address: usize,
        /// Configured original bytes
        expected: Vec<u8>,
        /// Bytes actually present
        found: Vec<u8>,
    },
    /// The window could not be aligned to whole instructions
    #[error("{0}")]
    Decode(#[from] DecodeError),
    /// The replacement could not be encoded
    #[error("{0}")]
    Code(#[from] CodeError),
    /// The trampoline could not be built
    #[error("{0}")]
    Trampoline(#[from] TrampolineError),
}

impl From<ProtectionError> for PatchError {
    fn from(e: ProtectionError) -> Self {
        match e {
            ProtectionError::Unmapped(address) => Self::TargetUnmapped(address),
            e => Self::ProtectionDenied(e),
        }
    }
}

/// What gets written over a target
#[derive(Clone)]
pub enum Replacement {
    /// Fixed code that replaces the function outright, e.g. [`x86::RETURN_ZERO`]
    ShortCircuit(Vec<u8>),
    /// A `jmp rel32` to `entry`. The overwritten prefix is relocated into a trampoline that
    /// gets bound to `original`
    Divert {
        /// Address of the replacement
        entry: usize,
        /// Slot the replacement calls the original through
        original: &'static dyn Slot,
    },
}

impl Replacement {
    /// Replaces the start of the target with `code`
    pub fn short_circuit(code: &[u8]) -> Self {
        Self::ShortCircuit(code.to_vec())
    }

    /// Diverts the target to `D`'s replacement and binds `D`'s slot to the trampoline
    pub fn divert<D: Detour>() -> Self {
        Self::Divert {
            entry: hook::address_of(D::replacement()),
            original: D::original(),
        }
    }

    /// Smallest window the replacement fits in
    fn min_len(&self) -> usize {
        match self {
            Self::ShortCircuit(code) => code.len(),
            Self::Divert { .. } => JMP_REL32_LEN,
        }
    }

    /// Generates the bytes written at `address`, padded to `window`
    fn generate(&self, address: usize, window: usize) -> Result<Vec<u8>, CodeError> {
        let code = match self {
            Self::ShortCircuit(code) => code.clone(),
            Self::Divert { entry, .. } => x86::jmp_rel32(address, *entry)?.to_vec(),
        };
        Ok(x86::pad(&code, window))
    }
}

impl fmt::Debug for Replacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShortCircuit(code) => f.debug_tuple("ShortCircuit").field(code).finish(),
            Self::Divert { entry, original } => f
                .debug_struct("Divert")
                .field("entry", &format_args!("{entry:#x}"))
                .field("bound", &original.bound())
                .finish(),
        }
    }
}

/// One modification site and everything needed to undo it
pub struct CodePatch {
    /// Name used in logs
    name: String,
    /// Target address
    address: usize,
    /// Minimum number of bytes owned by the patch. Grown to the next instruction boundary on apply
    window: usize,
    /// Expected original bytes at the target, checked before anything is written
    signature: Option<Vec<u8>>,
    /// Code written over the target
    replacement: Replacement,
    /// Original bytes of the effective window, present while applied
    snapshot: Option<Vec<u8>>,
    /// Relocated original code for diverting patches, present while applied
    trampoline: Option<Trampoline>,
    /// Whether the target currently holds the replacement
    applied: bool,
}

impl CodePatch {
    /// Creates an unapplied patch for the code at `address`.
    ///
    /// # Safety
    ///
    /// - `address` must point to the start of an instruction in code that is valid for reads
    ///   of at least `window` bytes plus the longest instruction
    /// - the replacement must be valid for whatever calls the target (see [`Detour`])
    pub unsafe fn new(
        name: impl Into<String>,
        address: usize,
        window: usize,
        replacement: Replacement,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            window,
            signature: None,
            replacement,
            snapshot: None,
            trampoline: None,
            applied: false,
        }
    }

    /// Refuses to apply unless the target starts with `expected`
    pub fn with_signature(mut self, expected: &[u8]) -> Self {
        self.signature = Some(expected.to_vec());
        self
    }

    /// Name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Target address
    pub fn address(&self) -> usize {
        self.address
    }

    /// Whether the target currently holds the replacement
    pub fn is_applied(&self) -> bool {
        self.applied
    }

    /// Original bytes of the effective window while applied
    pub fn snapshot(&self) -> Option<&[u8]> {
        self.snapshot.as_deref()
    }

    /// Trampoline to the original while a diverting patch is applied
    pub fn trampoline(&self) -> Option<&Trampoline> {
        self.trampoline.as_ref()
    }

    /// Writes the replacement over the target.
    ///
    /// Applying an applied patch does nothing. On error nothing at the target has changed
    /// and no trampoline is left allocated.
    pub fn apply(&mut self) -> Result<(), PatchError> {
        if self.applied {
            return Ok(());
        }

        let min_len = self.window.max(self.replacement.min_len());
        // SAFETY: the constructor's contract covers the window plus one more instruction
        let live = unsafe { mem::read_code(self.address, min_len + MAX_INSTR_LEN - 1)? };

        if let Some(expected) = &self.signature {
            if !live.starts_with(expected) {
                return Err(PatchError::SignatureMismatch {
                    address: self.address,
                    expected: expected.clone(),
                    found: live[..expected.len().min(live.len())].to_vec(),
                });
            }
        }

        let window = match self.replacement {
            Replacement::ShortCircuit(_) => decode::boundary(&live, self.address, min_len)?,
            Replacement::Divert { .. } => {
                decode::relocatable_boundary(&live, self.address, min_len)?
            }
        };
        let code = self.replacement.generate(self.address, window)?;

        let trampoline = match &self.replacement {
            Replacement::ShortCircuit(_) => None,
            // SAFETY: `window` was decoded as whole relocatable instructions
            Replacement::Divert { original, .. } => {
                let trampoline = unsafe { Trampoline::build(self.address, window)? };
                // the replacement may run as soon as the jump lands, so bind first
                original.bind(trampoline.entry());
                Some(trampoline)
            }
        };

        // SAFETY: the window lies inside the bytes read above
        if let Err(e) = unsafe { mem::write_code(self.address, &code) } {
            if let Replacement::Divert { original, .. } = &self.replacement {
                original.clear();
            }
            return Err(e.into());
        }

        info!(
            "applied `{}` at {:#x} ({} bytes)",
            self.name, self.address, window
        );
        debug!(
            "`{}`: {:02x?} -> {:02x?}",
            self.name,
            &live[..window],
            code
        );

        self.snapshot = Some(live[..window].to_vec());
        self.trampoline = trampoline;
        self.applied = true;
        Ok(())
    }

    /// Restores the original bytes and frees the trampoline.
    ///
    /// Reverting a patch that is not applied does nothing. On error the patch stays applied
    /// with its snapshot and trampoline intact, so the revert can be retried.
    pub fn revert(&mut self) -> Result<(), PatchError> {
        if !self.applied {
            return Ok(());
        }

        if let Some(snapshot) = &self.snapshot {
            // SAFETY: the snapshot was read from this exact window when the patch was applied
            unsafe { mem::write_code(self.address, snapshot)? };
        }

        if let Replacement::Divert { original, .. } = &self.replacement {
            original.clear();
        }
        self.trampoline = None;
        self.snapshot = None;
        self.applied = false;

        info!("reverted `{}` at {:#x}", self.name, self.address);
        Ok(())
    }
}

impl fmt::Debug for CodePatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodePatch")
            .field("name", &self.name)
            .field("address", &format_args!("{:#x}", self.address))
            .field("window", &self.window)
            .field("replacement", &self.replacement)
            .field("applied", &self.applied)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::slice;

    use region::Protection;

    use super::*;

    /// `push ebp; mov ebp, esp` followed by padding
    const FRAME: [u8; 8] = [0x55, 0x8B, 0xEC, 0x90, 0x90, 0x90, 0x90, 0xC3];

    /// Maps a read-only, executable page starting with `code`
    fn code_page(code: &[u8]) -> region::Allocation {
        let mut page = region::alloc(region::page::size(), Protection::READ_WRITE).unwrap();
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), page.as_mut_ptr::<u8>(), code.len());
            region::protect(page.as_ptr::<u8>(), page.len(), Protection::READ_EXECUTE).unwrap();
        }
        page
    }

    /// Reads `len` bytes at `address`
    fn bytes_at(address: usize, len: usize) -> Vec<u8> {
        unsafe { slice::from_raw_parts(address as *const u8, len).to_vec() }
    }

    #[test]
    /// Short-circuit a `push ebp; mov ebp, esp` prologue and restore it
    fn test_short_circuit() {
        let page = code_page(&FRAME);
        let address = page.as_ptr::<u8>() as usize;

        let mut patch = unsafe {
            CodePatch::new(
                "frame",
                address,
                3,
                Replacement::short_circuit(&x86::RETURN_ZERO),
            )
        };

        patch.apply().unwrap();
        assert!(patch.is_applied());
        assert_eq!(bytes_at(address, 3), [0x31, 0xC0, 0xC3]);
        assert_eq!(patch.snapshot(), Some(&[0x55, 0x8B, 0xEC][..]));
        assert!(patch.trampoline().is_none());

        patch.revert().unwrap();
        assert!(!patch.is_applied());
        assert_eq!(bytes_at(address, 8), FRAME);
    }

    #[test]
    /// `apply(); revert(); revert();` leaves the original bytes and the second revert is a no-op
    fn test_revert_twice() {
        let page = code_page(&FRAME);
        let address = page.as_ptr::<u8>() as usize;
        let before = bytes_at(address, 8);

        let mut patch = unsafe {
            CodePatch::new("frame", address, 3, Replacement::short_circuit(&x86::RETURN_ZERO))
        };
        patch.apply().unwrap();
        patch.revert().unwrap();
        patch.revert().unwrap();

        assert_eq!(bytes_at(address, 8), before);
        assert!(patch.snapshot().is_none());
    }

    #[test]
    /// Applying twice keeps the first snapshot instead of snapshotting the replacement
    fn test_apply_twice() {
        let page = code_page(&FRAME);
        let address = page.as_ptr::<u8>() as usize;

        let mut patch = unsafe {
            CodePatch::new("frame", address, 3, Replacement::short_circuit(&x86::RETURN_ZERO))
        };
        patch.apply().unwrap();
        patch.apply().unwrap();
        patch.revert().unwrap();

        assert_eq!(bytes_at(address, 8), FRAME);
    }

    #[test]
    /// A window ending mid-instruction grows to the boundary and the tail is padded with `nop`s
    fn test_window_extended() {
        // xor eax, eax; add eax, 42; ret
        let code = [0x31, 0xC0, 0x05, 0x2A, 0x00, 0x00, 0x00, 0xC3];
        let page = code_page(&code);
        let address = page.as_ptr::<u8>() as usize;

        let mut patch = unsafe {
            CodePatch::new("add", address, 3, Replacement::short_circuit(&x86::RETURN_ZERO))
        };
        patch.apply().unwrap();

        assert_eq!(patch.snapshot(), Some(&code[..7]));
        assert_eq!(
            bytes_at(address, 8),
            [0x31, 0xC0, 0xC3, 0x90, 0x90, 0x90, 0x90, 0xC3]
        );

        patch.revert().unwrap();
        assert_eq!(bytes_at(address, 8), code);
    }

    #[test]
    /// Unexpected original bytes abort the patch before anything is written
    fn test_signature_mismatch() {
        let page = code_page(&FRAME);
        let address = page.as_ptr::<u8>() as usize;

        let mut patch = unsafe {
            CodePatch::new("frame", address, 3, Replacement::short_circuit(&x86::RETURN_ZERO))
        }
        .with_signature(&[0x83, 0xEC, 0x10]);

        let result = patch.apply();
        assert!(matches!(result, Err(PatchError::SignatureMismatch { .. })));
        assert!(!patch.is_applied());
        assert_eq!(bytes_at(address, 8), FRAME);

        let mut patch = unsafe {
            CodePatch::new("frame", address, 3, Replacement::short_circuit(&x86::RETURN_ZERO))
        }
        .with_signature(&FRAME[..3]);
        patch.apply().unwrap();
        patch.revert().unwrap();
    }

    #[test]
    /// Targets that are not mapped fail with `TargetUnmapped`
    fn test_unmapped() {
        let mut patch = unsafe {
            CodePatch::new("nowhere", 0x1000, 3, Replacement::short_circuit(&x86::RETURN_ZERO))
        };
        assert!(matches!(patch.apply(), Err(PatchError::TargetUnmapped(0x1000))));
        assert!(!patch.is_applied());

        // reverting a patch that never applied is fine
        patch.revert().unwrap();
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    mod divert {
        use super::*;
        use crate::hook::trampoline::tests::{call, function_near, FORTY_TWO};
        use crate::hook::CallThrough;

        /// Signature of the synthetic functions
        type Answer = extern "C" fn() -> u32;

        /// Original of [`bump`]
        static BUMP: CallThrough<Answer> = CallThrough::new();

        /// Adds one to whatever the original returns
        extern "C" fn bump() -> u32 {
            BUMP.get().map_or(0, |original| original() + 1)
        }

        /// Detour for [`bump`]
        struct Bump;
        unsafe impl Detour for Bump {
            type Target = Answer;

            fn replacement() -> Answer {
                bump
            }

            fn original() -> &'static CallThrough<Answer> {
                &BUMP
            }
        }

        #[test]
        /// Diverted calls reach the replacement, which reaches the original through the trampoline
        fn test_divert() {
            let reference = function_near(bump as usize, &FORTY_TWO);
            let function = function_near(bump as usize, &FORTY_TWO);
            let address = function.address();

            let mut patch = unsafe { CodePatch::new("answer", address, 5, Replacement::divert::<Bump>()) };
            patch.apply().unwrap();

            // the 5 byte jump swallowed `xor` and `add`, and the rest of the window is padded
            assert_eq!(patch.snapshot(), Some(&FORTY_TWO[..7]));
            assert_eq!(bytes_at(address, 1), [0xE9]);
            assert_eq!(bytes_at(address + 5, 2), [0x90, 0x90]);

            let trampoline = patch.trampoline().unwrap();
            assert_eq!(BUMP.bound(), Some(trampoline.entry()));
            assert_eq!(call(trampoline.entry()), call(reference.address()));
            assert_eq!(call(address), 43);

            patch.revert().unwrap();
            assert!(BUMP.get().is_none());
            assert!(patch.trampoline().is_none());
            assert_eq!(bytes_at(address, 8), FORTY_TWO);
            assert_eq!(call(address), 42);
        }

        /// Slot for [`Unmoved`]
        static UNMOVED: CallThrough<Answer> = CallThrough::new();

        /// Diverts to [`bump`] but never runs it
        struct Unmoved;
        unsafe impl Detour for Unmoved {
            type Target = Answer;

            fn replacement() -> Answer {
                bump
            }

            fn original() -> &'static CallThrough<Answer> {
                &UNMOVED
            }
        }

        #[test]
        /// A prefix starting with a relative call cannot be moved into a trampoline
        fn test_divert_unrelocatable() {
            // call $+5; ret
            let code = [0xE8, 0x00, 0x00, 0x00, 0x00, 0xC3];
            let function = function_near(bump as usize, &code);
            let address = function.address();

            let mut patch =
                unsafe { CodePatch::new("call", address, 5, Replacement::divert::<Unmoved>()) };
            let result = patch.apply();

            assert!(matches!(
                result,
                Err(PatchError::Decode(DecodeError::Unrelocatable { ip, .. })) if ip == address as u64
            ));
            assert!(!patch.is_applied());
            assert!(patch.trampoline().is_none());
            assert!(UNMOVED.get().is_none());
            assert_eq!(bytes_at(address, 6), code);
        }

        #[cfg(target_os = "linux")]
        mod denied {
            use std::fs::{self, File};
            use std::os::unix::io::AsRawFd;
            use std::{env, process};

            use super::*;
            use crate::alloc::{search, MAX_DISTANCE};

            /// Slot for [`ReadOnly`]
            static READ_ONLY: CallThrough<Answer> = CallThrough::new();

            /// Diverts to [`bump`] but never runs it
            struct ReadOnly;
            unsafe impl Detour for ReadOnly {
                type Target = Answer;

                fn replacement() -> Answer {
                    bump
                }

                fn original() -> &'static CallThrough<Answer> {
                    &READ_ONLY
                }
            }

            /// Shared mapping of a file opened read-only, within jump range of `near`.
            /// It can never be made writable.
            fn read_only_near(near: usize, file: &File) -> mmap::MemoryMap {
                let bounds = near.saturating_sub(MAX_DISTANCE)..near.saturating_add(MAX_DISTANCE);
                search::above(near, bounds)
                    .map(Result::unwrap)
                    .find_map(|address| {
                        mmap::MemoryMap::new(
                            region::page::size(),
                            &[
                                mmap::MapOption::MapReadable,
                                mmap::MapOption::MapFd(file.as_raw_fd()),
                                mmap::MapOption::MapAddr(address as *const u8),
                                mmap::MapOption::MapNonStandardFlags(
                                    libc::MAP_SHARED | libc::MAP_FIXED_NOREPLACE,
                                ),
                            ],
                        )
                        .ok()
                        .filter(|map| map.data() as usize == address)
                    })
                    .unwrap()
            }

            #[test]
            /// A target whose protection cannot be changed is left untouched, and the slot
            /// bound for it is cleared again
            fn test_divert_denied() {
                let path = env::temp_dir().join(format!("clienthook-denied-{}", process::id()));
                let mut contents = vec![0xCC; region::page::size()];
                contents[..FORTY_TWO.len()].copy_from_slice(&FORTY_TWO);
                fs::write(&path, &contents).unwrap();
                let file = File::open(&path).unwrap();

                let map = read_only_near(bump as usize, &file);
                let address = map.data() as usize;

                let mut patch = unsafe {
                    CodePatch::new("read-only", address, 5, Replacement::divert::<ReadOnly>())
                };
                let result = patch.apply();

                assert!(matches!(result, Err(PatchError::ProtectionDenied(_))));
                assert!(!patch.is_applied());
                assert!(patch.trampoline().is_none());
                assert!(READ_ONLY.get().is_none());
                assert_eq!(bytes_at(address, 8), FORTY_TWO);

                drop(map);
                fs::remove_file(&path).unwrap();
            }
        }
    }
}
