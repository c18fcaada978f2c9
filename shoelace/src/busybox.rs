//! Busybox installation
//!
//! The guest has no dynamic loader, so busybox must be static: an ELF file
//! with no PT_INTERP program header.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::initrd::{Contents, InitRd, InitrdError};

/// Where busybox lives in the guest
pub const INSTALL_PATH: &str = "/bin/busybox";

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const PT_INTERP: u32 = 3;

/// Busybox errors
#[derive(Debug, thiserror::Error)]
pub enum BusyboxError {
    #[error("Not an ELF executable: {}", .0.display())]
    NotElf(PathBuf),

    #[error("Not statically-linked: {}", .0.display())]
    NotStatic(PathBuf),

    #[error("{} --list-full failed: {}", .path.display(), .status)]
    ListFailed { path: PathBuf, status: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Initrd(#[from] InitrdError),
}

/// EI_CLASS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElfClass {
    Elf32,
    Elf64,
}

struct ElfReader<'a> {
    data: &'a [u8],
    little_endian: bool,
}

impl ElfReader<'_> {
    fn u16(&self, off: usize) -> Option<u16> {
        let b: [u8; 2] = self.data.get(off..off + 2)?.try_into().ok()?;
        Some(if self.little_endian { u16::from_le_bytes(b) } else { u16::from_be_bytes(b) })
    }

    fn u32(&self, off: usize) -> Option<u32> {
        let b: [u8; 4] = self.data.get(off..off + 4)?.try_into().ok()?;
        Some(if self.little_endian { u32::from_le_bytes(b) } else { u32::from_be_bytes(b) })
    }

    fn u64(&self, off: usize) -> Option<u64> {
        let b: [u8; 8] = self.data.get(off..off + 8)?.try_into().ok()?;
        Some(if self.little_endian { u64::from_le_bytes(b) } else { u64::from_be_bytes(b) })
    }
}

/// Whether the ELF image requests a program interpreter.
///
/// Returns `None` if `data` is not a well-formed ELF file.
pub fn has_interpreter(data: &[u8]) -> Option<bool> {
    if data.get(..4)? != ELF_MAGIC {
        return None;
    }
    let class = match *data.get(4)? {
        1 => ElfClass::Elf32,
        2 => ElfClass::Elf64,
        _ => return None,
    };
    let little_endian = match *data.get(5)? {
        1 => true,
        2 => false,
        _ => return None,
    };
    let elf = ElfReader { data, little_endian };

    // e_phoff, e_phentsize, e_phnum
    let (phoff, phentsize, phnum) = match class {
        ElfClass::Elf32 => (elf.u32(0x1C)? as usize, elf.u16(0x2A)? as usize, elf.u16(0x2C)? as usize),
        ElfClass::Elf64 => (elf.u64(0x20)? as usize, elf.u16(0x36)? as usize, elf.u16(0x38)? as usize),
    };

    for i in 0..phnum {
        let p_type = elf.u32(phoff.checked_add(i.checked_mul(phentsize)?)?)?;
        if p_type == PT_INTERP {
            return Some(true);
        }
    }
    Some(false)
}

/// Fail unless `path` is a statically linked ELF executable.
pub fn check_static(path: &Path) -> Result<(), BusyboxError> {
    let data = std::fs::read(path)?;
    match has_interpreter(&data) {
        None => Err(BusyboxError::NotElf(path.to_path_buf())),
        Some(true) => Err(BusyboxError::NotStatic(path.to_path_buf())),
        Some(false) => Ok(()),
    }
}

/// Applet paths busybox reports, e.g. `bin/ls`, `usr/sbin/chroot`
pub fn list_applets(busybox: &Path) -> Result<Vec<String>, BusyboxError> {
    let output = Command::new(busybox).arg("--list-full").output()?;
    if !output.status.success() {
        return Err(BusyboxError::ListFailed {
            path: busybox.to_path_buf(),
            status: output.status.to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

/// Symlink each applet path to /bin/busybox, skipping busybox itself.
///
/// Returns the number of links created.
pub fn link_applets<W: Write, S: AsRef<str>>(initrd: &mut InitRd<W>, applets: &[S]) -> Result<usize, BusyboxError> {
    let mut links = 0;
    for applet in applets {
        let path = format!("/{}", applet.as_ref().trim_start_matches('/'));
        log::debug!("Busybox app: {}", path);
        if path.contains("busybox") {
            continue;
        }
        initrd.add_symlink(&path, INSTALL_PATH)?;
        links += 1;
    }
    Ok(links)
}

/// Install busybox at /bin/busybox and link every applet to it.
///
/// Returns the number of applet links created.
pub fn install<W: Write>(initrd: &mut InitRd<W>, busybox: &Path) -> Result<usize, BusyboxError> {
    check_static(busybox)?;
    initrd.add_file(INSTALL_PATH, Contents::Host(busybox), None)?;

    let applets = list_applets(busybox)?;
    let links = link_applets(initrd, applets.as_slice())?;
    log::info!("Installed busybox with {} applets", links);
    Ok(links)
}
