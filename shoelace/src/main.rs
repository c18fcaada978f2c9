//! shoelace - boot a kernel with a throwaway initramfs
//!
//! Usage: shoelace [OPTIONS]
//!
//! Reads ./shoelace.toml when no --config is given.

use std::process::ExitCode;

use shoelace::cli::{self, USAGE};

fn setup_logging(debug: bool) {
    let level = if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    // RUST_LOG still wins
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn main() -> ExitCode {
    let opts = match cli::parse_args(std::env::args_os().skip(1)) {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("shoelace: {}", e);
            eprintln!("{}", USAGE);
            return ExitCode::from(2);
        }
    };

    if opts.help {
        println!("shoelace {}", env!("CARGO_PKG_VERSION"));
        println!("{}", USAGE);
        return ExitCode::SUCCESS;
    }

    setup_logging(opts.debug);

    match cli::run(&opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
