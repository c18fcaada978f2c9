//! Failures the boot sequence reports
//!
//! The display strings are the exact lines written to the console.

use std::io;
use std::path::PathBuf;

/// Init errors
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    /// A directory could not be opened for listing. Reported on stderr.
    #[error("Failed to open {}", .path.display())]
    OpenDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The power-off request came back. Reported on stdout.
    #[error("reboot() returned {code}")]
    PowerOff { code: i32 },
}
