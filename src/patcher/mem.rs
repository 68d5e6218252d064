//! Scoped write access to code pages, and the raw reads and writes done under it

use std::ptr;

use log::debug;
use region::Protection;
use thiserror::Error;

/// Errors when changing memory protections
#[derive(Debug, Error)]
pub enum ProtectionError {
    /// Nothing is mapped at the address
    #[error("{0:#x} is not mapped")]
    Unmapped(usize),
    /// The system refused to change or query the protection
    #[error("changing protection of {len:#x} bytes at {address:#x} was denied")]
    Denied {
        /// Start of the region
        address: usize,
        /// Length of the region
        len: usize,
        /// Underlying error
        #[source]
        error: region::Error,
    },
}

impl ProtectionError {
    /// Sorts a `region` error into unmapped or denied
    fn classify(address: usize, len: usize, error: region::Error) -> Self {
        match error {
            region::Error::UnmappedRegion => Self::Unmapped(address),
            error => Self::Denied {
                address,
                len,
                error,
            },
        }
    }
}

/// Makes a region writable (and executable) for as long as the guard lives.
///
/// Dropping the guard restores the protection every page had before, so the previous
/// state comes back on every exit path, including early returns and unwinding.
pub struct WritableGuard {
    /// Restores the previous protections when dropped
    _handle: region::ProtectGuard,
    /// Protection of the first page before the guard was acquired
    previous: Protection,
}

impl WritableGuard {
    /// Makes `address..address + len` readable, writable and executable.
    ///
    /// # Safety
    ///
    /// Other code relying on the region being read-only (or non-executable) will see it
    /// writable until the guard is dropped.
    pub unsafe fn acquire(address: usize, len: usize) -> Result<Self, ProtectionError> {
        let previous = region::query(address as *const u8)
            .map_err(|e| ProtectionError::classify(address, len, e))?
            .protection();
        let handle = region::protect_with_handle(
            address as *const u8,
            len,
            Protection::READ_WRITE_EXECUTE,
        )
        .map_err(|e| ProtectionError::classify(address, len, e))?;

        Ok(Self {
            _handle: handle,
            previous,
        })
    }

    /// Protection the region had before the guard was acquired
    pub fn previous(&self) -> Protection {
        self.previous
    }
}

/// Reads up to `max_len` bytes at `address`, stopping at the end of the mapped region.
///
/// # Safety
///
/// The mapped region containing `address` must be readable.
pub unsafe fn read_code(address: usize, max_len: usize) -> Result<Vec<u8>, ProtectionError> {
    let mapped = region::query(address as *const u8)
        .map_err(|e| ProtectionError::classify(address, max_len, e))?;
    let len = max_len.min(mapped.as_range().end - address);

    let mut bytes = vec![0u8; len];
    ptr::copy_nonoverlapping(address as *const u8, bytes.as_mut_ptr(), len);
    Ok(bytes)
}

/// Overwrites memory at `address` with `bytes` under a [`WritableGuard`].
///
/// # Safety
///
/// `address` must be valid for `bytes.len()` bytes, and nothing may be executing or reading
/// those bytes while they are written.
pub unsafe fn write_code(address: usize, bytes: &[u8]) -> Result<(), ProtectionError> {
    let guard = WritableGuard::acquire(address, bytes.len())?;
    debug!(
        "writing {:02x?} at {address:#x} (was {:?})",
        bytes,
        guard.previous()
    );

    ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
    Ok(())
}
