//! x86 bzImage inspection
//!
//! See Documentation/arch/x86/boot.rst in the kernel tree. The setup header
//! starts at 0x1F1; `kernel_version` at 0x20E is an offset, relative to
//! 0x200, of the NUL-terminated version string.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// Setup header magic ("HdrS") offset
const HEADER_MAGIC_OFFSET: u64 = 0x202;
const HEADER_MAGIC: &[u8; 4] = b"HdrS";

/// Offset of the u16 `kernel_version` pointer
const VERSION_PTR_OFFSET: u64 = 0x20E;
const VERSION_BASE: u64 = 0x200;

/// Version strings are short; anything longer is garbage
const MAX_VERSION_LEN: usize = 512;

/// Kernel image errors
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("Invalid kernel image")]
    InvalidImage,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Read exactly `buf.len()` bytes at `offset`, leaving the position alone.
fn pread<R: Read + Seek>(image: &mut R, offset: u64, buf: &mut [u8]) -> Result<(), KernelError> {
    let orig = image.stream_position()?;
    image.seek(SeekFrom::Start(offset))?;
    let res = image.read_exact(buf);
    image.seek(SeekFrom::Start(orig))?;

    match res {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(KernelError::InvalidImage),
        Err(e) => Err(e.into()),
    }
}

/// Read a NUL-terminated ASCII string at `offset`.
fn pread_cstring<R: Read + Seek>(image: &mut R, offset: u64) -> Result<String, KernelError> {
    let orig = image.stream_position()?;
    image.seek(SeekFrom::Start(offset))?;

    let mut buf = Vec::new();
    let res = image
        .by_ref()
        .take(MAX_VERSION_LEN as u64)
        .read_to_end(&mut buf);
    image.seek(SeekFrom::Start(orig))?;
    res?;

    let Some(end) = buf.iter().position(|&b| b == 0) else {
        return Err(KernelError::InvalidImage);
    };
    buf.truncate(end);

    if !buf.is_ascii() {
        return Err(KernelError::InvalidImage);
    }
    String::from_utf8(buf).map_err(|_| KernelError::InvalidImage)
}

/// Full version string of a bzImage, e.g.
/// `6.1.0-13-amd64 (debian-kernel@lists.debian.org) #1 SMP ...`
pub fn kernel_version<R: Read + Seek>(image: &mut R) -> Result<String, KernelError> {
    let mut magic = [0u8; 4];
    pread(image, HEADER_MAGIC_OFFSET, &mut magic)?;
    if &magic != HEADER_MAGIC {
        return Err(KernelError::InvalidImage);
    }

    let mut ptr = [0u8; 2];
    pread(image, VERSION_PTR_OFFSET, &mut ptr)?;
    let ptr = u16::from_le_bytes(ptr) as u64;

    pread_cstring(image, VERSION_BASE + ptr)
}

/// Release part of the version string (`uname -r`)
pub fn release(version: &str) -> Result<&str, KernelError> {
    version.split_whitespace().next().ok_or(KernelError::InvalidImage)
}

/// Open `path` and return its kernel release.
pub fn image_release(path: &Path) -> Result<String, KernelError> {
    let mut file = File::open(path)?;
    let version = kernel_version(&mut file)?;
    log::debug!("Kernel version string: {}", version);
    Ok(release(&version)?.to_string())
}

#[cfg(test)]
pub(crate) fn fake_bzimage(version: &str) -> Vec<u8> {
    let ptr: u16 = 0x300;
    let mut image = vec![0u8; VERSION_BASE as usize + ptr as usize];
    image[HEADER_MAGIC_OFFSET as usize..][..4].copy_from_slice(HEADER_MAGIC);
    image[VERSION_PTR_OFFSET as usize..][..2].copy_from_slice(&ptr.to_le_bytes());
    image.extend_from_slice(version.as_bytes());
    image.push(0);
    image.extend_from_slice(&[0xAA; 64]);
    image
}
