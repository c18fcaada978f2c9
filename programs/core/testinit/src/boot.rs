//! Boot sequence driver
//!
//! Banner, argv, two directory listings, sync, power off. A power-off that
//! comes back leaves the process parked in [`State::Stuck`].

use std::ffi::OsStr;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use crate::dirlist::show_dir;
use crate::sys::System;
use crate::InitError;

/// First line printed on boot
pub const BANNER: &str = "HELLO WORLD!";

/// Filesystem root, listed first
pub const ROOT_DIR: &str = "/";

/// Binary directory, listed second
pub const BIN_DIR: &str = "/bin";

/// Where the driver is in the boot sequence
///
/// A successful power-off is never observed from inside the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Running,
    Stuck,
}

/// Write `argv:` and one `[<i>] = "<arg>"` line per argument.
pub fn write_args<W: Write, A: AsRef<OsStr>>(out: &mut W, args: &[A]) -> io::Result<()> {
    writeln!(out, "argv:")?;
    for (i, arg) in args.iter().enumerate() {
        write!(out, "[{}] = \"", i)?;
        out.write_all(arg.as_ref().as_bytes())?;
        out.write_all(b"\"\n")?;
    }
    Ok(())
}

/// The boot sequence, bound to a machine and a pair of console streams
pub struct Boot<S, O, E> {
    sys: S,
    out: O,
    err: E,
    dirs: [PathBuf; 2],
    state: State,
}

impl<S: System, O: Write, E: Write> Boot<S, O, E> {
    pub fn new(sys: S, out: O, err: E) -> Self {
        Self {
            sys,
            out,
            err,
            dirs: [PathBuf::from(ROOT_DIR), PathBuf::from(BIN_DIR)],
            state: State::Running,
        }
    }

    /// List `first` and `second` instead of `/` and `/bin`.
    pub fn with_dirs(mut self, first: impl Into<PathBuf>, second: impl Into<PathBuf>) -> Self {
        self.dirs = [first.into(), second.into()];
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn into_parts(self) -> (S, O, E) {
        (self.sys, self.out, self.err)
    }

    /// Run the whole sequence.
    ///
    /// Returns only if the machine stayed up and the final park was
    /// interrupted.
    pub fn run<A: AsRef<OsStr>>(&mut self, args: &[A]) -> State {
        if let Err(e) = self.report(args) {
            log::warn!("console write failed: {}", e);
        }

        self.sys.sync();

        let code = self.sys.power_off();
        self.state = State::Stuck;
        if code != 0 {
            let _ = writeln!(self.out, "{}", InitError::PowerOff { code });
        }
        let _ = self.out.flush();

        self.sys.park();
        log::debug!("park returned");
        self.state
    }

    /// Everything printed before the machine is touched
    pub fn report<A: AsRef<OsStr>>(&mut self, args: &[A]) -> io::Result<()> {
        writeln!(self.out, "{}", BANNER)?;
        write_args(&mut self.out, args)?;

        let [first, second] = &self.dirs;
        show_dir(first, &mut self.out, &mut self.err)?;
        writeln!(self.out)?;
        show_dir(second, &mut self.out, &mut self.err)?;

        self.out.flush()?;
        self.err.flush()
    }
}
