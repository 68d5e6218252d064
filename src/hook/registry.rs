//! # Registry
//!
//! The [`HookRegistry`] owns a fixed, ordered set of [`CodePatch`]es and moves them through
//! one install/uninstall cycle at a time.
//!
//! ```text
//! Uninstalled -> Installing -> Installed
//!                           \-> Faulted      (a patch failed after others were applied)
//! Installed | Faulted -> Uninstalling -> Uninstalled
//!                                     \-> Faulted  (a revert failed; uninstall again to retry)
//! ```
//!
//! A failed install is not rolled back: rolling back writes to code again and can fail too.
//! Every applied patch keeps its snapshot and trampoline, so a later uninstall always has
//! what it needs to restore the original bytes.

use log::{error, info, warn};
use thiserror::Error;

use crate::patcher::{CodePatch, PatchError};
use crate::profile::TargetProfile;

/// Lifecycle state of a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
    /// No patch is applied
    Uninstalled,
    /// `install_all` is running
    Installing,
    /// Every patch is applied
    Installed,
    /// Some but not necessarily all patches are applied
    Faulted,
    /// `uninstall_all` is running
    Uninstalling,
}

/// Errors when installing a registry
#[derive(Debug, Error)]
pub enum InstallError {
    /// Installs only start from [`InstallState::Uninstalled`]
    #[error("cannot install while {0:?}")]
    NotUninstalled(InstallState),
    /// The first patch failed; nothing was changed
    #[error("patch `{name}` failed: {error}")]
    Patch {
        /// Name of the failed patch
        name: String,
        /// Why it failed
        #[source]
        error: PatchError,
    },
    /// A patch failed after earlier patches were applied. Those stay applied
    #[error("patch `{name}` failed with {applied} patch(es) already applied: {error}")]
    PartialInstall {
        /// Name of the failed patch
        name: String,
        /// Number of patches that were applied before the failure
        applied: usize,
        /// Why it failed
        #[source]
        error: PatchError,
    },
}

/// Installs and uninstalls a set of patches as a unit
#[derive(Debug)]
pub struct HookRegistry {
    /// Identifier of the binary layout the patches were written for
    fingerprint: String,
    /// Patches in install order
    patches: Vec<CodePatch>,
    /// Current lifecycle state
    state: InstallState,
}

impl HookRegistry {
    /// Creates an uninstalled registry for `patches`, installed in the given order
    pub fn new(fingerprint: impl Into<String>, patches: Vec<CodePatch>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            patches,
            state: InstallState::Uninstalled,
        }
    }

    /// Creates a registry with one patch per target of `profile`
    ///
    /// # Safety
    ///
    /// Every target must describe real code in this process, see [`CodePatch::new`]
    pub unsafe fn from_profile(profile: TargetProfile) -> Self {
        let patches = profile
            .targets
            .into_iter()
            .map(|target| target.into_patch())
            .collect();
        Self::new(profile.fingerprint, patches)
    }

    /// Identifier of the binary layout the patches were written for
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Current lifecycle state
    pub fn state(&self) -> InstallState {
        self.state
    }

    /// Whether every patch is applied
    pub fn is_installed(&self) -> bool {
        self.state == InstallState::Installed
    }

    /// Patches in install order
    pub fn patches(&self) -> &[CodePatch] {
        &self.patches
    }

    /// Looks up a patch by name
    pub fn patch(&self, name: &str) -> Option<&CodePatch> {
        self.patches.iter().find(|p| p.name() == name)
    }

    /// Applies every patch in order, stopping at the first failure.
    ///
    /// On failure the registry is not [`InstallState::Installed`]. Patches applied before the
    /// failure stay applied and the registry becomes [`InstallState::Faulted`];
    /// [`HookRegistry::uninstall_all`] reverts them.
    pub fn install_all(&mut self) -> Result<(), InstallError> {
        if self.state != InstallState::Uninstalled {
            return Err(InstallError::NotUninstalled(self.state));
        }

        info!(
            "installing {} patch(es) for {}",
            self.patches.len(),
            self.fingerprint
        );
        self.state = InstallState::Installing;

        for (applied, patch) in self.patches.iter_mut().enumerate() {
            let Err(error) = patch.apply() else {
                continue;
            };

            let name = patch.name().to_owned();
            error!("failed to apply `{name}`: {error}");

            if applied == 0 {
                self.state = InstallState::Uninstalled;
                return Err(InstallError::Patch { name, error });
            }
            warn!("leaving {applied} applied patch(es) in place until uninstall");
            self.state = InstallState::Faulted;
            return Err(InstallError::PartialInstall {
                name,
                applied,
                error,
            });
        }

        self.state = InstallState::Installed;
        info!("installed {}", self.fingerprint);
        Ok(())
    }

    /// Reverts every applied patch in reverse order and frees their trampolines.
    ///
    /// Does nothing when [`InstallState::Uninstalled`]. Never fails: a patch that cannot be
    /// reverted is logged and kept, and the registry becomes [`InstallState::Faulted`] so a
    /// later call can try again.
    pub fn uninstall_all(&mut self) {
        if self.state == InstallState::Uninstalled {
            return;
        }

        self.state = InstallState::Uninstalling;

        let mut failed = 0;
        for patch in self.patches.iter_mut().rev() {
            if let Err(e) = patch.revert() {
                error!("failed to revert `{}`: {e}", patch.name());
                failed += 1;
            }
        }

        if failed == 0 {
            self.state = InstallState::Uninstalled;
            info!("uninstalled {}", self.fingerprint);
        } else {
            self.state = InstallState::Faulted;
            warn!("{failed} patch(es) of {} are still applied", self.fingerprint);
        }
    }
}

impl Drop for HookRegistry {
    fn drop(&mut self) {
        self.uninstall_all();
    }
}
