//! testinit - a throwaway PID 1 for kernel boot testing
//!
//! Runs as `/init` (or `rdinit=`) inside a disposable VM, reports what it
//! can see of the system and powers the machine off again:
//!
//! ```text
//! HELLO WORLD!
//! argv:
//! [0] = "/init"
//! Contents of /:
//! bin/
//! etc/
//! init
//!
//! Contents of /bin:
//! busybox
//! ```
//!
//! If the power-off request fails the failure code is printed and the
//! process parks forever; PID 1 has nowhere else to go.

pub mod boot;
pub mod dirlist;
pub mod error;
pub mod sys;

pub use boot::{Boot, State, BANNER, BIN_DIR, ROOT_DIR};
pub use dirlist::{show_dir, DirEntry, EntryKind, Listing};
pub use error::InitError;
pub use sys::{Host, System};
