// https://docs.microsoft.com/en-us/windows/win32/winprog/windows-data-types

use std::ffi::c_void;

/// `DllMain` reason: the library is being unloaded
pub const DLL_PROCESS_DETACH: u32 = 0;
/// `DllMain` reason: the library was just loaded
pub const DLL_PROCESS_ATTACH: u32 = 1;

#[link(name = "Kernel32")]
extern "system" {
    /// Stops `DllMain` from being called for thread creation and exit
    pub fn DisableThreadLibraryCalls(dll: *mut c_void) -> i32;
    /// Sends a NUL-terminated string to an attached debugger
    fn OutputDebugStringA(output: *const u8);
}

/// Sends `text` to an attached debugger
pub fn output_debug_string(text: &str) {
    let mut buffer = Vec::with_capacity(text.len() + 1);
    // interior NULs would cut the line short
    buffer.extend(text.bytes().filter(|&b| b != 0));
    buffer.push(0);

    unsafe { OutputDebugStringA(buffer.as_ptr()) };
}
