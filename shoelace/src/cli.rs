//! Command line handling and the top-level boot flow

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};

use crate::config::{load_config, Config};
use crate::initrd::{Contents, InitRd};
use crate::modules::{copy_modules, ModuleTree};
use crate::qemu::QemuLaunch;
use crate::{busybox, initrd, kernel, KERNEL_INIT};

/// Config file picked up from the working directory
pub const DEFAULT_CONFIG: &str = "shoelace.toml";

pub const USAGE: &str = "\
Usage: shoelace [OPTIONS]

Options:
  -c, --config <FILE>   Path to a shoelace.toml config file
  -i, --init <FILE>     Program to run as init; if not given, busybox is used
      --busybox <FILE>  Path to statically-linked busybox binary
      --debug           Verbose logging; confirm before launching QEMU
  -h, --help            Show this help message";

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Not a file: {}", .0.display())]
    NotAFile(PathBuf),

    #[error("File not readable: {}", .0.display())]
    NotReadable(PathBuf),

    #[error("Missing value for {0}")]
    MissingValue(String),

    #[error("Unknown option: {0}")]
    UnknownOption(String),

    #[error("busybox not provided or found")]
    NoBusybox,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Options {
    pub config: Option<PathBuf>,
    pub init: Option<PathBuf>,
    pub busybox: Option<PathBuf>,
    pub debug: bool,
    pub help: bool,
}

/// Require an existing, readable regular file.
pub fn readable_file(path: impl Into<PathBuf>) -> Result<PathBuf, CliError> {
    let path = path.into();
    if !path.exists() {
        return Err(CliError::NotFound(path));
    }
    if !path.is_file() {
        return Err(CliError::NotAFile(path));
    }
    if File::open(&path).is_err() {
        return Err(CliError::NotReadable(path));
    }
    Ok(path)
}

/// Parse arguments (without the program name).
///
/// Option values are paths and need not be UTF-8.
pub fn parse_args<I: IntoIterator<Item = OsString>>(args: I) -> Result<Options, CliError> {
    let mut opts = Options::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        let mut file_value = |name: &str| -> Result<PathBuf, CliError> {
            let value = args.next().ok_or_else(|| CliError::MissingValue(name.to_string()))?;
            readable_file(value)
        };

        match arg.to_str() {
            Some("-h" | "--help") => opts.help = true,
            Some("--debug") => opts.debug = true,
            Some("-c" | "--config") => opts.config = Some(file_value("--config")?),
            Some("-i" | "--init") => opts.init = Some(file_value("--init")?),
            Some("--busybox") => opts.busybox = Some(file_value("--busybox")?),
            _ => return Err(CliError::UnknownOption(arg.to_string_lossy().into_owned())),
        }
    }

    Ok(opts)
}

/// First executable `name` on a PATH-style search list
pub fn find_in_path(name: &str, path_var: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| {
            candidate
                .metadata()
                .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
}

/// Kernel command line: serial console, our init, then the config's args
pub fn kernel_cmdline(debug: bool, extra: &[String]) -> Vec<String> {
    let mut args = vec!["console=ttyS0".to_string(), format!("rdinit={}", KERNEL_INIT)];
    if !debug {
        args.push("quiet".to_string());
    }
    args.extend(extra.iter().cloned());
    args
}

/// Everything that goes into one initrd
#[derive(Debug, Default)]
pub struct InitrdPlan<'a> {
    pub busybox: Option<&'a Path>,
    pub init: Option<&'a Path>,
    pub release: &'a str,
    pub modules_dir: Option<&'a Path>,
    pub modules: &'a [String],
    pub ext_modules: &'a [PathBuf],
    /// guest path -> host path
    pub files: Option<&'a BTreeMap<PathBuf, PathBuf>>,
}

impl<'a> InitrdPlan<'a> {
    pub fn from_config(config: &'a Config, release: &'a str) -> Self {
        Self {
            busybox: None,
            init: None,
            release,
            modules_dir: config.kernel.modules_dir.as_deref(),
            modules: &config.initrd.modules,
            ext_modules: &config.initrd.ext_modules,
            files: Some(&config.initrd.files),
        }
    }
}

/// Write the initrd described by `plan` to `out`.
pub fn build_initrd<W: Write>(out: W, plan: &InitrdPlan<'_>) -> anyhow::Result<W> {
    let mut initrd = InitRd::new(out);

    if let Some(bb) = plan.busybox {
        busybox::install(&mut initrd, bb)?;
    }

    match plan.init {
        Some(init) => initrd.add_file(KERNEL_INIT, Contents::Host(init), None)?,
        None if plan.busybox.is_some() => initrd.add_symlink(KERNEL_INIT, busybox::INSTALL_PATH)?,
        None => return Err(anyhow!("no init program and no busybox to fall back on")),
    }

    if !plan.modules.is_empty() || !plan.ext_modules.is_empty() {
        let basedir = plan.modules_dir.ok_or_else(|| anyhow!("modules basedir not set"))?;
        let tree = ModuleTree::load(basedir, plan.release)
            .with_context(|| format!("loading modules from {}", basedir.display()))?;
        copy_modules(&mut initrd, &tree, plan.modules, plan.ext_modules)?;
    }

    for (guest, host) in plan.files.into_iter().flatten() {
        initrd.add_file(guest, Contents::Host(host), None)?;
    }

    Ok(initrd.finish()?)
}

/// Config file to load: the one given, else `shoelace.toml` in `cwd` if present
pub fn select_config(explicit: Option<&Path>, cwd: &Path) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let path = cwd.join(DEFAULT_CONFIG);
    path.is_file().then_some(path)
}

/// Busybox to install: the one given, else the first on `path_var`
pub fn locate_busybox(explicit: Option<&Path>, path_var: Option<&OsStr>) -> Result<PathBuf, CliError> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => path_var
            .and_then(|path| find_in_path("busybox", path))
            .ok_or(CliError::NoBusybox),
    }
}

/// Build the initrd and boot the configured kernel with it.
pub fn run(opts: &Options) -> anyhow::Result<()> {
    let cwd = std::env::current_dir()?;
    let config_path = select_config(opts.config.as_deref(), &cwd);
    let config = load_config(config_path.as_deref()).context("Config error")?;
    log::debug!("Config:\n{}", config);

    let busybox = locate_busybox(opts.busybox.as_deref(), std::env::var_os("PATH").as_deref())?;
    log::debug!("Using busybox {}", busybox.display());

    let release = kernel::image_release(&config.kernel.image)
        .with_context(|| format!("reading kernel image {}", config.kernel.image.display()))?;
    log::info!("Detected kernel version: {}", release);

    let mut qemu_opts = config.qemu.options.clone();
    for dev in &config.qemu.devices {
        qemu_opts.push("-device".to_string());
        qemu_opts.push(dev.clone());
    }

    // Removed when dropped
    let mut tmp = tempfile::Builder::new()
        .prefix("shoelace_initrd_")
        .suffix(".img")
        .tempfile()?;
    log::info!("Building initrd tempfile: {}", tmp.path().display());

    let plan = InitrdPlan {
        busybox: Some(busybox.as_path()),
        init: opts.init.as_deref(),
        ..InitrdPlan::from_config(&config, &release)
    };
    build_initrd(BufWriter::new(tmp.as_file_mut()), &plan)?;

    if log::log_enabled!(log::Level::Debug) {
        let image = std::fs::read(tmp.path())?;
        for entry in initrd::entries(&image)? {
            log::debug!("initrd: {:o} {}", entry.mode, entry.name);
        }
    }

    let launch = QemuLaunch {
        kernel_args: kernel_cmdline(opts.debug, &config.kernel.args),
        memory: Some(config.qemu.memory.clone()),
        cpus: Some(config.qemu.cpus),
        options: qemu_opts,
        ..QemuLaunch::new(&config.kernel.image, tmp.path())
    };

    let mut child = launch.spawn(opts.debug).context("starting QEMU")?;
    let status = child.wait()?;
    log::info!("QEMU exited: {}", status);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn args(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    #[test]
    fn test_parse_flags() {
        let dir = tempfile::tempdir().unwrap();
        let init = dir.path().join("testinit");
        fs::write(&init, b"").unwrap();
        let init_str = init.to_str().unwrap();

        let opts = parse_args(args(&["--debug", "-i", init_str])).unwrap();
        assert!(opts.debug);
        assert_eq!(opts.init, Some(init.clone()));
        assert_eq!(opts.config, None);

        let opts = parse_args(args(&["--busybox", init_str, "--help"])).unwrap();
        assert_eq!(opts.busybox, Some(init));
        assert!(opts.help);
    }

    #[test]
    fn test_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");

        assert!(matches!(parse_args(args(&["-x"])), Err(CliError::UnknownOption(_))));
        assert!(matches!(parse_args(args(&["--init"])), Err(CliError::MissingValue(_))));
        assert!(matches!(
            parse_args(args(&["-c", missing.to_str().unwrap()])),
            Err(CliError::NotFound(_))
        ));
        assert!(matches!(
            parse_args(args(&["-c", dir.path().to_str().unwrap()])),
            Err(CliError::NotAFile(_))
        ));
    }

    #[test]
    fn test_parse_non_utf8_path() {
        use std::os::unix::ffi::OsStringExt;

        let dir = tempfile::tempdir().unwrap();
        let init = dir.path().join(OsString::from_vec(b"init\xff".to_vec()));
        fs::write(&init, b"").unwrap();

        let opts = parse_args(vec![OsString::from("--init"), init.clone().into_os_string()]).unwrap();
        assert_eq!(opts.init, Some(init));

        let bad = OsString::from_vec(b"--x\xff".to_vec());
        assert!(matches!(parse_args(vec![bad]), Err(CliError::UnknownOption(_))));
    }

    #[test]
    fn test_select_config() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(select_config(None, dir.path()), None);

        let local = dir.path().join(DEFAULT_CONFIG);
        fs::write(&local, "").unwrap();
        assert_eq!(select_config(None, dir.path()), Some(local));

        let other = Path::new("/etc/other.toml");
        assert_eq!(select_config(Some(other), dir.path()), Some(other.to_path_buf()));
    }

    #[test]
    fn test_locate_busybox() {
        let empty = tempfile::tempdir().unwrap();
        let path_var = std::env::join_paths([empty.path()]).unwrap();

        assert!(matches!(locate_busybox(None, Some(path_var.as_os_str())), Err(CliError::NoBusybox)));
        assert!(matches!(locate_busybox(None, None), Err(CliError::NoBusybox)));
        assert_eq!(
            CliError::NoBusybox.to_string(),
            "busybox not provided or found"
        );

        let bin = tempfile::tempdir().unwrap();
        let exe = bin.path().join("busybox");
        fs::write(&exe, b"").unwrap();
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();
        let path_var = std::env::join_paths([empty.path(), bin.path()]).unwrap();
        assert_eq!(locate_busybox(None, Some(path_var.as_os_str())).unwrap(), exe);

        let given = Path::new("/opt/busybox");
        assert_eq!(locate_busybox(Some(given), None).unwrap(), given);
    }

    #[test]
    fn test_find_in_path() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        fs::write(a.path().join("busybox"), b"").unwrap();
        let exe = b.path().join("busybox");
        fs::write(&exe, b"").unwrap();
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();

        let path_var = std::env::join_paths([a.path(), b.path()]).unwrap();
        assert_eq!(find_in_path("busybox", &path_var), Some(exe));
        assert_eq!(find_in_path("nope", &path_var), None);
    }

    #[test]
    fn test_kernel_cmdline() {
        assert_eq!(kernel_cmdline(false, &[]), ["console=ttyS0", "rdinit=/init", "quiet"]);
        assert_eq!(
            kernel_cmdline(true, &["loglevel=7".to_string()]),
            ["console=ttyS0", "rdinit=/init", "loglevel=7"]
        );
    }

    #[test]
    fn test_initrd_needs_an_init() {
        let plan = InitrdPlan::default();
        assert!(build_initrd(Vec::new(), &plan).is_err());
    }
}
