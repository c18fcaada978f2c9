//! Machine control
//!
//! The few system calls the boot sequence needs, behind a trait so the
//! sequence can run against a simulated machine.

use std::io;

/// Whole-system operations used by the boot sequence
pub trait System {
    /// Flush all filesystem buffers to storage. Cannot report failure.
    fn sync(&mut self);

    /// Ask the kernel to power the machine off.
    ///
    /// Only returns if the request failed, with the status the call produced.
    fn power_off(&mut self) -> i32;

    /// Suspend the calling process until a signal arrives.
    fn park(&mut self);
}

/// The running Linux kernel
#[derive(Debug, Default, Clone, Copy)]
pub struct Host;

impl System for Host {
    fn sync(&mut self) {
        log::debug!("sync");
        // SAFETY: no arguments, no memory shared with the kernel.
        unsafe { libc::sync() };
    }

    fn power_off(&mut self) -> i32 {
        log::debug!("reboot(RB_POWER_OFF)");
        // SAFETY: plain integer command; returns only on failure.
        let ret = unsafe { libc::reboot(libc::RB_POWER_OFF) };
        if ret != 0 {
            log::warn!("power off failed: {}", io::Error::last_os_error());
        }
        ret
    }

    fn park(&mut self) {
        log::debug!("parking pid {}", std::process::id());
        // SAFETY: blocks until a signal; touches no memory.
        unsafe { libc::pause() };
    }
}
