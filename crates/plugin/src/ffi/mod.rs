//! C ABI
//!
//! The generated header is written to `crates/plugin/include/vulpes.h`.

pub mod exports;
