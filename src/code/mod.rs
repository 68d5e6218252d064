//! # Code
//!
//! Machine code the patches write, and the decoding used to size patch windows.
//!
//! Nothing in here touches live memory: encoders take addresses and return bytes,
//! and the decoder works on byte slices that have already been read.

pub mod decode;
pub mod x86;
