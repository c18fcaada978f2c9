//! testinit - PID 1 for boot smoke tests
//!
//! Usage:
//!   testinit [ARGS...]
//!
//! Arguments are echoed, never interpreted. Set RUST_LOG for diagnostics on
//! stderr.

use std::ffi::OsString;
use std::io;

use testinit::{Boot, Host};

fn main() {
    env_logger::init();

    let args: Vec<OsString> = std::env::args_os().collect();
    log::debug!("started as pid {} with {} args", std::process::id(), args.len());

    let mut boot = Boot::new(Host, io::stdout(), io::stderr());
    let state = boot.run(&args);

    log::info!("boot sequence ended in {:?}", state);
}
