//! # Dispatch
//!
//! Replacement functions wired over the client's code.
//!
//! Each replacement has exactly the signature and calling convention of the function it
//! replaces. The client's methods are `thiscall`, which only exists on 32-bit x86; other
//! targets use the C convention so the forwarding logic can still be built and tested there.

use std::ffi::c_void;

use crate::hook::{CallThrough, Detour};

/// `FILE_SHARE_READ` from the Win32 headers
pub const FILE_SHARE_READ: u32 = 0x0000_0004;

/// Signature of `CLBlockAllocator::OpenDataFile`
#[cfg(target_arch = "x86")]
pub type OpenDataFileFn = unsafe extern "thiscall" fn(
    this: *mut c_void,
    file_info: *mut c_void,
    file_name: *mut c_void,
    path_to_use: *mut c_void,
    open_flags: u32,
    tran_info: *mut c_void,
) -> u32;

/// Signature of `CLBlockAllocator::OpenDataFile`
#[cfg(not(target_arch = "x86"))]
pub type OpenDataFileFn = unsafe extern "C" fn(
    this: *mut c_void,
    file_info: *mut c_void,
    file_name: *mut c_void,
    path_to_use: *mut c_void,
    open_flags: u32,
    tran_info: *mut c_void,
) -> u32;

/// Trampoline to the original `OpenDataFile`
static OPEN_DATA_FILE: CallThrough<OpenDataFileFn> = CallThrough::new();

/// Diverts `CLBlockAllocator::OpenDataFile` to [`open_data_file`]
pub struct OpenDataFile;

unsafe impl Detour for OpenDataFile {
    type Target = OpenDataFileFn;

    fn replacement() -> OpenDataFileFn {
        open_data_file
    }

    fn original() -> &'static CallThrough<OpenDataFileFn> {
        &OPEN_DATA_FILE
    }
}

/// Adds shared read access to a set of open flags
pub fn share_read(open_flags: u32) -> u32 {
    open_flags | FILE_SHARE_READ
}

/// Calls the original with shared read access added. Without a live trampoline the call
/// fails the way the client treats a failed open, by returning 0.
unsafe fn forward_open_data_file(
    this: *mut c_void,
    file_info: *mut c_void,
    file_name: *mut c_void,
    path_to_use: *mut c_void,
    open_flags: u32,
    tran_info: *mut c_void,
) -> u32 {
    match OPEN_DATA_FILE.get() {
        Some(original) => original(
            this,
            file_info,
            file_name,
            path_to_use,
            share_read(open_flags),
            tran_info,
        ),
        None => 0,
    }
}

/// Replacement for `CLBlockAllocator::OpenDataFile`
#[cfg(target_arch = "x86")]
unsafe extern "thiscall" fn open_data_file(
    this: *mut c_void,
    file_info: *mut c_void,
    file_name: *mut c_void,
    path_to_use: *mut c_void,
    open_flags: u32,
    tran_info: *mut c_void,
) -> u32 {
    forward_open_data_file(this, file_info, file_name, path_to_use, open_flags, tran_info)
}

/// Replacement for `CLBlockAllocator::OpenDataFile`
#[cfg(not(target_arch = "x86"))]
unsafe extern "C" fn open_data_file(
    this: *mut c_void,
    file_info: *mut c_void,
    file_name: *mut c_void,
    path_to_use: *mut c_void,
    open_flags: u32,
    tran_info: *mut c_void,
) -> u32 {
    forward_open_data_file(this, file_info, file_name, path_to_use, open_flags, tran_info)
}
