//! QEMU launcher

use std::ffi::OsString;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};

pub const DEFAULT_MEMORY: &str = "1G";
pub const QEMU_BINARY: &str = "qemu-system-x86_64";

/// One QEMU/KVM boot of a kernel + initrd
#[derive(Debug, Clone)]
pub struct QemuLaunch {
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    pub kernel_args: Vec<String>,
    pub memory: Option<String>,
    pub cpus: Option<u32>,
    pub options: Vec<String>,
}

impl QemuLaunch {
    pub fn new(kernel: &Path, initrd: &Path) -> Self {
        Self {
            kernel: kernel.to_path_buf(),
            initrd: initrd.to_path_buf(),
            kernel_args: Vec::new(),
            memory: None,
            cpus: None,
            options: Vec::new(),
        }
    }

    /// Kernel command line, space separated
    pub fn cmdline(&self) -> String {
        self.kernel_args.join(" ")
    }

    /// Full argument vector, program first
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            QEMU_BINARY.into(),
            "-machine".into(),
            "accel=kvm".into(),
            "-m".into(),
            self.memory.as_deref().unwrap_or(DEFAULT_MEMORY).into(),
            "-nographic".into(),
            "-kernel".into(),
            self.kernel.clone().into(),
            "-initrd".into(),
            self.initrd.clone().into(),
            "-append".into(),
            self.cmdline().into(),
        ];

        if let Some(cpus) = self.cpus.filter(|&n| n > 0) {
            args.push("-smp".into());
            args.push(format!("cores={}", cpus).into());
        }
        args.extend(self.options.iter().map(OsString::from));
        args
    }

    pub fn command(&self) -> Command {
        let args = self.args();
        let mut cmd = Command::new(&args[0]);
        cmd.args(&args[1..]);
        cmd
    }

    /// Start QEMU.
    ///
    /// With `confirm` the argument list is printed first and the launch waits
    /// for ENTER on stdin.
    pub fn spawn(&self, confirm: bool) -> io::Result<Child> {
        if confirm {
            println!("About to run:");
            for arg in self.args() {
                println!("    {:?}", arg);
            }
            print!("Press ENTER to continue");
            io::stdout().flush()?;
            io::stdin().lock().read_line(&mut String::new())?;
        }

        log::info!("Starting {} with cmdline: {}", QEMU_BINARY, self.cmdline());
        self.command().spawn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let mut launch = QemuLaunch::new(Path::new("/boot/bzImage"), Path::new("/tmp/initrd.img"));
        launch.kernel_args = vec!["console=ttyS0".into(), "rdinit=/init".into()];

        let args: Vec<String> = launch.args().into_iter().map(|a| a.into_string().unwrap()).collect();
        assert_eq!(
            args,
            [
                "qemu-system-x86_64",
                "-machine",
                "accel=kvm",
                "-m",
                "1G",
                "-nographic",
                "-kernel",
                "/boot/bzImage",
                "-initrd",
                "/tmp/initrd.img",
                "-append",
                "console=ttyS0 rdinit=/init",
            ]
        );
    }

    #[test]
    fn test_cpus_memory_and_options() {
        let mut launch = QemuLaunch::new(Path::new("k"), Path::new("i"));
        launch.memory = Some("4G".into());
        launch.cpus = Some(2);
        launch.options = vec!["-device".into(), "virtio-rng-pci".into()];

        let args: Vec<String> = launch.args().into_iter().map(|a| a.into_string().unwrap()).collect();
        assert_eq!(args[4], "4G");
        assert_eq!(&args[12..], ["-smp", "cores=2", "-device", "virtio-rng-pci"]);
    }

    #[test]
    fn test_zero_cpus_omits_smp() {
        let mut launch = QemuLaunch::new(Path::new("k"), Path::new("i"));
        launch.cpus = Some(0);
        assert!(!launch.args().iter().any(|a| a == "-smp"));
    }

    #[test]
    fn test_command_program() {
        let launch = QemuLaunch::new(Path::new("k"), Path::new("i"));
        assert_eq!(launch.command().get_program(), QEMU_BINARY);
    }
}
