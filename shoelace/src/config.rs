//! shoelace.toml
//!
//! Everything lives under a top-level `[shoelace]` table; every key is
//! optional. Host paths are resolved relative to the config file.

use std::collections::BTreeMap;
use std::ffi::CStr;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::qemu::DEFAULT_MEMORY;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Specified path not found: {}", .0.display())]
    PathNotFound(PathBuf),

    #[error("Guest path must be absolute: {}", .0.display())]
    RelativeGuestPath(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawFile {
    shoelace: RawConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    kernel: RawKernel,
    initrd: RawInitrd,
    qemu: RawQemu,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawKernel {
    image: Option<String>,
    modules_dir: Option<String>,
    args: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawInitrd {
    modules: Vec<String>,
    ext_modules: Vec<String>,
    files: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawQemu {
    memory: Option<String>,
    cpus: Option<u32>,
    options: Vec<String>,
    devices: Vec<String>,
}

/// Resolved configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub kernel: KernelConfig,
    pub initrd: InitrdConfig,
    pub qemu: QemuConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    pub image: PathBuf,
    pub modules_dir: Option<PathBuf>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitrdConfig {
    /// Module names (file stems) to copy along with their dependencies
    pub modules: Vec<String>,
    pub ext_modules: Vec<PathBuf>,
    /// guest path -> host path
    pub files: BTreeMap<PathBuf, PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QemuConfig {
    pub memory: String,
    pub cpus: u32,
    pub options: Vec<String>,
    pub devices: Vec<String>,
}

/// Load `path`, or the defaults when no file was given.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    match path {
        None => Config::default_for_host(),
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
            log::debug!("Loading config {} (base dir {})", path.display(), base_dir.display());
            Config::parse(&text, base_dir)
        }
    }
}

impl Config {
    /// Defaults: boot the host kernel with its installed modules.
    pub fn default_for_host() -> Result<Self, ConfigError> {
        Self::parse("", Path::new("."))
    }

    /// Parse config text; relative paths are resolved against `base_dir`.
    pub fn parse(text: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let raw: RawFile = toml::from_str(text)?;
        let RawConfig { kernel, initrd, qemu } = raw.shoelace;
        let resolver = PathResolver { base_dir };

        let kernel = match kernel.image {
            Some(image) => KernelConfig {
                image: resolver.resolve(&image)?,
                modules_dir: kernel.modules_dir.map(|d| resolver.resolve(&d)).transpose()?,
                args: kernel.args,
            },
            None => {
                let release = host_release()?;
                let modules_dir = match kernel.modules_dir {
                    Some(dir) => resolver.resolve(&dir)?,
                    None => PathBuf::from("/lib/modules"),
                };
                KernelConfig {
                    image: PathBuf::from(format!("/boot/vmlinuz-{}", release)),
                    modules_dir: Some(modules_dir),
                    args: kernel.args,
                }
            }
        };

        let mut files = BTreeMap::new();
        for (guest, host) in initrd.files {
            let guest = PathBuf::from(guest);
            if !guest.is_absolute() {
                return Err(ConfigError::RelativeGuestPath(guest));
            }
            files.insert(guest, resolver.resolve(&host)?);
        }

        let initrd = InitrdConfig {
            modules: initrd.modules,
            ext_modules: initrd
                .ext_modules
                .iter()
                .map(|p| resolver.resolve(p))
                .collect::<Result<_, _>>()?,
            files,
        };

        let qemu = QemuConfig {
            memory: qemu.memory.unwrap_or_else(|| DEFAULT_MEMORY.to_string()),
            cpus: qemu.cpus.unwrap_or(1),
            options: qemu.options,
            devices: qemu.devices,
        };

        Ok(Config { kernel, initrd, qemu })
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "kernel:")?;
        writeln!(f, "    image: {}", self.kernel.image.display())?;
        match &self.kernel.modules_dir {
            Some(dir) => writeln!(f, "    modules_dir: {}", dir.display())?,
            None => writeln!(f, "    modules_dir: -")?,
        }
        writeln!(f, "    args: {:?}", self.kernel.args)?;
        writeln!(f, "initrd:")?;
        writeln!(f, "    modules: {:?}", self.initrd.modules)?;
        writeln!(f, "    ext_modules: {:?}", self.initrd.ext_modules)?;
        writeln!(f, "    files: {:?}", self.initrd.files)?;
        writeln!(f, "qemu:")?;
        writeln!(f, "    memory: {}", self.qemu.memory)?;
        writeln!(f, "    cpus: {}", self.qemu.cpus)?;
        writeln!(f, "    options: {:?}", self.qemu.options)?;
        write!(f, "    devices: {:?}", self.qemu.devices)
    }
}

struct PathResolver<'a> {
    base_dir: &'a Path,
}

impl PathResolver<'_> {
    /// Expand `~`, anchor relative paths at the base dir, require existence.
    fn resolve(&self, path: &str) -> Result<PathBuf, ConfigError> {
        let path = expand_home(path);
        let path = if path.is_absolute() {
            path
        } else {
            self.base_dir.join(path)
        };

        if !path.exists() {
            return Err(ConfigError::PathNotFound(path));
        }
        Ok(path)
    }
}

/// `~` and `~/...` against the user's home directory, falling back to the
/// passwd entry when `$HOME` is unset.
fn expand_home(path: &str) -> PathBuf {
    let rest = match path {
        "~" => "",
        p => match p.strip_prefix("~/") {
            Some(rest) => rest,
            None => return PathBuf::from(p),
        },
    };
    match dirs::home_dir() {
        Some(home) if rest.is_empty() => home,
        Some(home) => home.join(rest),
        None => {
            log::warn!("No home directory to expand {}", path);
            PathBuf::from(path)
        }
    }
}

/// Release of the running kernel, as `uname -r` prints it
pub fn host_release() -> io::Result<String> {
    // SAFETY: utsname is plain C arrays; all-zero is a valid value.
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: uname() NUL-terminates every field it fills in.
    let release = unsafe { CStr::from_ptr(uts.release.as_ptr()) };
    Ok(release.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_defaults() {
        let config = Config::parse("", Path::new(".")).unwrap();
        let release = host_release().unwrap();

        assert_eq!(config.kernel.image, PathBuf::from(format!("/boot/vmlinuz-{}", release)));
        assert_eq!(config.kernel.modules_dir, Some(PathBuf::from("/lib/modules")));
        assert!(config.kernel.args.is_empty());
        assert!(config.initrd.modules.is_empty());
        assert_eq!(config.qemu.memory, "1G");
        assert_eq!(config.qemu.cpus, 1);
    }

    #[test]
    fn test_full_config() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bzImage"), b"").unwrap();
        fs::create_dir(dir.path().join("mods")).unwrap();
        fs::write(dir.path().join("hello.ko"), b"").unwrap();
        fs::write(dir.path().join("motd"), b"hi").unwrap();

        let text = r#"
            [shoelace.kernel]
            image = "bzImage"
            modules_dir = "mods"
            args = ["loglevel=7"]

            [shoelace.initrd]
            modules = ["virtio_net"]
            ext_modules = ["hello.ko"]
            files = { "/etc/motd" = "motd" }

            [shoelace.qemu]
            memory = "2G"
            cpus = 4
            options = ["-no-reboot"]
            devices = ["virtio-rng-pci"]
        "#;
        let config = Config::parse(text, dir.path()).unwrap();

        assert_eq!(config.kernel.image, dir.path().join("bzImage"));
        assert_eq!(config.kernel.modules_dir, Some(dir.path().join("mods")));
        assert_eq!(config.kernel.args, ["loglevel=7"]);
        assert_eq!(config.initrd.modules, ["virtio_net"]);
        assert_eq!(config.initrd.ext_modules, [dir.path().join("hello.ko")]);
        assert_eq!(config.initrd.files[Path::new("/etc/motd")], dir.path().join("motd"));
        assert_eq!(config.qemu.memory, "2G");
        assert_eq!(config.qemu.cpus, 4);
        assert_eq!(config.qemu.options, ["-no-reboot"]);
        assert_eq!(config.qemu.devices, ["virtio-rng-pci"]);
    }

    #[test]
    fn test_explicit_image_has_no_default_modules() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bzImage"), b"").unwrap();

        let config = Config::parse("[shoelace.kernel]\nimage = \"bzImage\"\n", dir.path()).unwrap();
        assert_eq!(config.kernel.modules_dir, None);
    }

    #[test]
    fn test_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::parse("[shoelace.kernel]\nimage = \"nope\"\n", dir.path()).unwrap_err();

        assert!(matches!(err, ConfigError::PathNotFound(_)));
        assert!(err.to_string().starts_with("Specified path not found: "));
    }

    #[test]
    fn test_wrong_type() {
        let err = Config::parse("[shoelace.qemu]\ncpus = \"many\"\n", Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().starts_with("Parse error: "));
    }

    #[test]
    fn test_relative_guest_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("motd"), b"").unwrap();
        let text = "[shoelace.initrd]\nfiles = { \"etc/motd\" = \"motd\" }\n";

        let err = Config::parse(text, dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::RelativeGuestPath(_)));
    }

    #[test]
    fn test_load_relative_to_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bzImage"), b"").unwrap();
        let path = dir.path().join("shoelace.toml");
        fs::write(&path, "[shoelace.kernel]\nimage = \"bzImage\"\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.kernel.image, dir.path().join("bzImage"));
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/abs"), PathBuf::from("/abs"));
        assert_eq!(expand_home("rel"), PathBuf::from("rel"));
        assert_eq!(expand_home("~user/x"), PathBuf::from("~user/x"));

        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_home("~"), home);
        assert_eq!(expand_home("~/x"), home.join("x"));

        // Only this test touches HOME
        let saved = std::env::var_os("HOME");
        std::env::remove_var("HOME");
        let expanded = expand_home("~/x");
        if let Some(saved) = saved {
            std::env::set_var("HOME", saved);
        }

        assert!(expanded.is_absolute());
        assert!(expanded.ends_with("x"));
        assert!(!expanded.starts_with("~"));
    }
}
