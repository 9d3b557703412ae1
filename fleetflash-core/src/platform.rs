//! Provides platform-specific functionality.
//!
//! This module contains the logic for interacting with the operating system to
//! perform tasks that are not cross-platform: discovering block devices,
//! unmounting their volumes and probing their size.
//!
//! It uses conditional compilation (`#[cfg]`) to expose the correct implementation
//! for the target OS. Each submodule exposes the same public API, so that the
//! rest of the library can use it without worrying about the underlying platform.
//! Only Linux is implemented.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;
