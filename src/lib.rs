#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod alloc;
pub mod code;
pub mod dispatch;
pub mod hook;
pub mod logger;
pub mod patcher;
pub mod profile;
#[cfg(windows)]
mod win;

use std::sync::{Mutex, MutexGuard, PoisonError};

use lazy_static::lazy_static;
use log::{error, info, warn};

use crate::hook::registry::HookRegistry;

lazy_static! {
    /// Registry behind the exported entry points. Created by the first [`startup`]
    static ref REGISTRY: Mutex<Option<HookRegistry>> = Mutex::new(None);
}

/// Locks the process-wide registry. A panic while holding the lock never leaves it unusable:
/// teardown must still be able to revert whatever was applied.
fn registry() -> MutexGuard<'static, Option<HookRegistry>> {
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Installs the built-in patches into this process.
///
/// Returns `true` once every patch is live. Calling it again after a success does nothing.
/// After a failed attempt, whatever was applied is reverted before installing again.
pub fn startup() -> bool {
    // the host may have its own logger
    let _ = logger::init();

    let mut slot = registry();
    if slot.is_none() {
        let profile = profile::builtin();
        if profile.is_empty() {
            warn!("no patch targets for {} in this process", profile.fingerprint);
            return false;
        }
        // SAFETY: the built-in profile describes the client executable this library is
        // injected into
        *slot = Some(unsafe { HookRegistry::from_profile(profile) });
    }
    let Some(registry) = slot.as_mut() else {
        return false;
    };

    if registry.is_installed() {
        info!("patches are already installed");
        return true;
    }

    // clears what a previous, failed attempt left applied
    registry.uninstall_all();

    match registry.install_all() {
        Ok(()) => true,
        Err(e) => {
            error!("install failed: {e}");
            false
        }
    }
}

/// Reverts every applied patch. Safe to call at any time, including before [`startup`] or
/// after a failed one.
pub fn teardown() {
    if let Some(registry) = registry().as_mut() {
        registry.uninstall_all();
    }
}

/// Entry point called by the injector once the library is loaded.
///
/// Returns 1 if every patch was installed and 0 otherwise.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "C" fn HookStartup() -> i32 {
    i32::from(startup())
}

/// Disables thread notifications on load and reverts every patch on unload.
///
/// # Safety
///
/// Only the Windows loader calls this.
#[cfg(windows)]
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "system" fn DllMain(
    dll: *mut std::ffi::c_void,
    reason: u32,
    _: *mut std::ffi::c_void,
) -> i32 {
    match reason {
        win::DLL_PROCESS_ATTACH => {
            win::DisableThreadLibraryCalls(dll);
        }
        win::DLL_PROCESS_DETACH => teardown(),
        _ => {}
    }
    1
}
