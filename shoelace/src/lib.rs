//! shoelace - boot a kernel with a disposable initramfs
//!
//! Packs busybox, an init program, kernel modules and arbitrary files into a
//! newc cpio archive, then boots the kernel under QEMU/KVM with it:
//!
//! ```text
//! shoelace.toml ──► Config ──┬──► kernel version ──► modules
//!                            │
//!            busybox, init ──┴──► InitRd (cpio) ──► qemu-system-x86_64
//! ```

pub mod busybox;
pub mod cli;
pub mod config;
pub mod initrd;
pub mod kernel;
pub mod modules;
pub mod qemu;

pub use config::{Config, ConfigError};
pub use initrd::{Contents, InitRd, InitrdError};

/// Path of the init program inside the guest
pub const KERNEL_INIT: &str = "/init";
