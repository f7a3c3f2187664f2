#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod block;
pub mod config;
pub mod fs;
pub mod mem;
pub mod process;
pub mod sync;

pub use config::VmConfig;
pub use mem::{VirtualMemory, VmError, VmResult};
