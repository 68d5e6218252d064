//! # Profile
//!
//! Where to patch and with what, for one known build of a host binary.
//!
//! Addresses are bound to one specific executable layout, so they are grouped under a
//! fingerprint naming that layout instead of being scattered through the patching code.
//! Tests build their own profiles against synthetic code.

use crate::code::x86;
use crate::dispatch::OpenDataFile;
use crate::patcher::{CodePatch, Replacement};

/// Fingerprint of the client build the built-in addresses belong to
pub const ACCLIENT: &str = "acclient.exe (32-bit retail)";

/// `Client::IsAlreadyRunning`
pub const IS_ALREADY_RUNNING: usize = 0x0041_22A0;

/// `CLBlockAllocator::OpenDataFile`
pub const OPEN_DATA_FILE: usize = 0x0067_5920;

/// One patch target
#[derive(Debug, Clone)]
pub struct TargetDescriptor {
    /// Name used in logs
    pub name: &'static str,
    /// Absolute address of the first instruction to overwrite
    pub address: usize,
    /// Minimum number of bytes to own. Grown to the next instruction boundary when applied
    pub window: usize,
    /// Expected original bytes, if known
    pub signature: Option<&'static [u8]>,
    /// What to write over the target
    pub replacement: Replacement,
}

impl TargetDescriptor {
    /// Turns the descriptor into an unapplied patch
    ///
    /// # Safety
    ///
    /// The descriptor must describe real code in this process, see [`CodePatch::new`]
    pub unsafe fn into_patch(self) -> CodePatch {
        let patch = CodePatch::new(self.name, self.address, self.window, self.replacement);
        match self.signature {
            Some(expected) => patch.with_signature(expected),
            None => patch,
        }
    }
}

/// Every target of one host build, in install order
#[derive(Debug, Clone)]
pub struct TargetProfile {
    /// Identifier of the host build
    pub fingerprint: String,
    /// Targets in install order
    pub targets: Vec<TargetDescriptor>,
}

impl TargetProfile {
    /// Whether the profile has nothing to patch
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Targets in the 32-bit game client that stop it from running twice.
///
/// 1. `Client::IsAlreadyRunning` always reports that no other client is running.
/// 2. `CLBlockAllocator::OpenDataFile` opens the shared data files with `FILE_SHARE_READ`,
///    so a second client can open them while the first holds them.
pub fn acclient() -> TargetProfile {
    TargetProfile {
        fingerprint: ACCLIENT.to_owned(),
        targets: vec![
            TargetDescriptor {
                name: "Client::IsAlreadyRunning",
                address: IS_ALREADY_RUNNING,
                window: x86::RETURN_ZERO.len(),
                signature: None,
                replacement: Replacement::short_circuit(&x86::RETURN_ZERO),
            },
            TargetDescriptor {
                name: "CLBlockAllocator::OpenDataFile",
                address: OPEN_DATA_FILE,
                window: x86::JMP_REL32_LEN,
                signature: None,
                replacement: Replacement::divert::<OpenDataFile>(),
            },
        ],
    }
}

/// Profile installed by the exported entry point.
///
/// The client is a 32-bit executable; in any other address space its addresses mean
/// nothing, so the profile is empty there.
pub fn builtin() -> TargetProfile {
    if cfg!(target_arch = "x86") {
        acclient()
    } else {
        TargetProfile {
            fingerprint: ACCLIENT.to_owned(),
            targets: Vec::new(),
        }
    }
}
