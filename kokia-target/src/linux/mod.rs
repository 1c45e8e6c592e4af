//! ptraceによるLinux実装

pub mod memory;
pub mod platform;
pub mod process;
mod registers;

pub use platform::LinuxPlatform;
pub use process::{LinuxProcess, LinuxThread};
