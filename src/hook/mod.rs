//! # Hook
//!
//! This module covers hooks, which redirect execution from a target to a replacement,
//! the trampolines that keep the original reachable, and the registry that installs them.

pub mod registry;
pub mod trampoline;

use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Type-erased side of a [`CallThrough`], bound by the patch that owns the trampoline
pub trait Slot: Sync {
    /// Points the slot at a trampoline entry
    fn bind(&self, entry: usize);
    /// Forgets the trampoline; callers see the original as unavailable
    fn clear(&self);
    /// Currently bound trampoline entry
    fn bound(&self) -> Option<usize>;
}

/// Holds the callable original of a hooked function.
///
/// `F` is the function pointer type of the original. The patch binds the slot to its
/// trampoline before the diverting jump is written and clears it after the original bytes
/// are back, so a replacement never sees a dangling trampoline through [`CallThrough::get`].
pub struct CallThrough<F> {
    /// Trampoline entry, zero when unbound
    entry: AtomicUsize,
    /// Signature of the original
    _signature: PhantomData<F>,
}

impl<F: Copy> CallThrough<F> {
    /// Creates an unbound slot
    pub const fn new() -> Self {
        Self {
            entry: AtomicUsize::new(0),
            _signature: PhantomData,
        }
    }

    /// Returns the original function, or `None` if no trampoline is live
    pub fn get(&self) -> Option<F> {
        if mem::size_of::<F>() != mem::size_of::<usize>() {
            return None;
        }
        match self.entry.load(Ordering::Acquire) {
            0 => None,
            // SAFETY: `F` is pointer-sized and the slot only ever holds trampoline entries
            // built for a function of type `F`
            entry => Some(unsafe { mem::transmute_copy(&entry) }),
        }
    }
}

impl<F: Copy> Default for CallThrough<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Copy + Sync> Slot for CallThrough<F> {
    fn bind(&self, entry: usize) {
        self.entry.store(entry, Ordering::Release);
    }

    fn clear(&self) {
        self.entry.store(0, Ordering::Release);
    }

    fn bound(&self) -> Option<usize> {
        match self.entry.load(Ordering::Acquire) {
            0 => None,
            entry => Some(entry),
        }
    }
}

/// A replacement function that can be diverted to, paired with the slot holding its original.
///
/// The replacement and the original share the type [`Detour::Target`], which is how the
/// parameter layout contract is checked: a replacement with a different signature or calling
/// convention does not type-check against the slot it calls through.
///
/// # Safety
///
/// `Target` must be a function pointer type whose signature and calling convention exactly
/// match the hooked function. A mismatch corrupts the caller's stack.
pub unsafe trait Detour: 'static {
    /// Function pointer type of both the original and the replacement
    type Target: Copy + Sync + 'static;

    /// The replacement the target is diverted to
    fn replacement() -> Self::Target;

    /// The slot the replacement calls the original through
    fn original() -> &'static CallThrough<Self::Target>;
}

/// Compile-time proof that a type is pointer-sized
trait PointerSized {
    /// Evaluated once per type at compile time; fails the build for anything else
    const CHECK: ();
}

impl<F> PointerSized for F {
    const CHECK: () = assert!(
        mem::size_of::<F>() == mem::size_of::<usize>(),
        "not a function pointer"
    );
}

/// Address of a function pointer
///
/// Types that are not pointer-sized are rejected when the call is compiled:
///
/// ```compile_fail
/// clienthook::hook::address_of((0usize, 0usize));
/// ```
pub fn address_of<F: Copy>(f: F) -> usize {
    #[allow(clippy::let_unit_value)]
    let () = <F as PointerSized>::CHECK;
    // SAFETY: `CHECK` holds, so `F` and `usize` have the same size
    unsafe { mem::transmute_copy(&f) }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Stand-in original
    extern "C" fn seven() -> u32 {
        7
    }

    #[test]
    /// Slots hand out the bound function until cleared
    fn test_call_through() {
        let slot: CallThrough<extern "C" fn() -> u32> = CallThrough::new();
        assert!(slot.get().is_none());
        assert_eq!(slot.bound(), None);

        slot.bind(address_of(seven as extern "C" fn() -> u32));
        let original = slot.get().unwrap();
        assert_eq!(original(), 7);
        assert_eq!(slot.bound(), Some(seven as usize));

        slot.clear();
        assert!(slot.get().is_none());
    }

    #[test]
    /// Replacement addresses match the function they were taken from
    fn test_address_of() {
        let f: extern "C" fn() -> u32 = seven;
        assert_eq!(address_of(f), seven as usize);
    }

    #[test]
    /// Non-pointer types are never handed out
    fn test_wrong_size() {
        let slot: CallThrough<(usize, usize)> = CallThrough::new();
        slot.entry.store(0x1000, Ordering::Release);
        assert!(slot.get().is_none());
    }
}
