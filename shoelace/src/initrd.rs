//! initramfs image writer
//!
//! Writes the SVR4 "newc" cpio format the kernel unpacks into rootfs:
//!
//! ```text
//! ┌──────────────┬───────────────┬─────┬──────────┬─────┐
//! │ 110 byte hdr │ name\0        │ pad │ data     │ pad │  ... TRAILER!!!
//! └──────────────┴───────────────┴─────┴──────────┴─────┘
//! ```
//!
//! Header fields are 8 hex digits each; name and data are padded to a
//! 4 byte boundary.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

const NEWC_MAGIC: &[u8; 6] = b"070701";
const HEADER_LEN: usize = 110;
const TRAILER: &str = "TRAILER!!!";

/// Archive is padded to a whole number of these
const BLOCK_SIZE: u64 = 512;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

/// Default permissions
pub const DIR_PERM: u32 = 0o755;
pub const DATA_PERM: u32 = 0o664;
pub const SYMLINK_PERM: u32 = 0o777;

/// initrd errors
#[derive(Debug, thiserror::Error)]
pub enum InitrdError {
    #[error("path must be absolute: {}", .0.display())]
    RelativePath(PathBuf),

    #[error("{} too large for newc: {} bytes", .name.display(), .size)]
    TooLarge { name: PathBuf, size: usize },

    #[error("malformed archive: {0}")]
    Malformed(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, InitrdError>;

/// What to put in a regular file
#[derive(Debug, Clone, Copy)]
pub enum Contents<'a> {
    /// Copy a file from the host. Permissions default to the host file's.
    Host(&'a Path),
    /// Literal bytes. Permissions default to 0o664.
    Bytes(&'a [u8]),
}

/// Streaming newc archive writer
pub struct InitRd<W: Write> {
    out: W,
    written: u64,
    next_ino: u32,
    dirs: BTreeSet<PathBuf>,
    entries: usize,
}

impl<W: Write> InitRd<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            written: 0,
            next_ino: 1,
            dirs: BTreeSet::new(),
            entries: 0,
        }
    }

    /// Number of entries written so far
    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Add a regular file at `path`, creating parent directories.
    pub fn add_file(&mut self, path: impl AsRef<Path>, contents: Contents<'_>, permission: Option<u32>) -> Result<()> {
        let path = path.as_ref();
        let name = archive_name(path)?;

        let (data, permission) = match contents {
            Contents::Host(src) => {
                let data = fs::read(src)?;
                let permission = match permission {
                    Some(p) => p,
                    None => fs::metadata(src)?.permissions().mode() & 0o777,
                };
                (data, permission)
            }
            Contents::Bytes(bytes) => (bytes.to_vec(), permission.unwrap_or(DATA_PERM)),
        };

        log::debug!(
            "Adding file to initrd: name={} size={} permission={:o}",
            name.display(),
            data.len(),
            permission
        );

        self.create_parents(path)?;
        self.write_entry(name.as_os_str().as_bytes(), S_IFREG | permission, 1, &data)?;
        Ok(())
    }

    /// Add a symlink at `path` pointing to `target`.
    pub fn add_symlink(&mut self, path: impl AsRef<Path>, target: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let target = target.as_ref();
        let name = archive_name(path)?;

        log::debug!("Adding symlink to initrd: {} -> {}", name.display(), target.display());

        self.create_parents(path)?;
        self.write_entry(
            name.as_os_str().as_bytes(),
            S_IFLNK | SYMLINK_PERM,
            1,
            target.as_os_str().as_bytes(),
        )?;
        Ok(())
    }

    fn create_parents(&mut self, path: &Path) -> Result<()> {
        let parents: Vec<&Path> = path.ancestors().skip(1).collect();
        for dir in parents.into_iter().rev() {
            if dir == Path::new("/") || dir.as_os_str().is_empty() {
                continue;
            }
            self.create_directory(dir)?;
        }
        Ok(())
    }

    fn create_directory(&mut self, path: &Path) -> Result<()> {
        let name = archive_name(path)?;
        if !self.dirs.insert(name.clone()) {
            return Ok(());
        }

        log::debug!("Creating directory in initrd: {}", name.display());
        self.write_entry(name.as_os_str().as_bytes(), S_IFDIR | DIR_PERM, 2, &[])
    }

    fn write_entry(&mut self, name: &[u8], mode: u32, nlink: u32, data: &[u8]) -> Result<()> {
        let size = member_size(name, data.len())?;
        let ino = self.next_ino;
        self.next_ino += 1;
        self.write_header(ino, mode, nlink, name, size)?;
        self.write_padded(data)?;
        self.entries += 1;
        Ok(())
    }

    fn write_header(&mut self, ino: u32, mode: u32, nlink: u32, name: &[u8], size: u32) -> io::Result<()> {
        let fields: [u32; 13] = [
            ino,
            mode,
            0, // uid
            0, // gid
            nlink,
            0, // mtime
            size,
            0, // devmajor
            0, // devminor
            0, // rdevmajor
            0, // rdevminor
            name.len() as u32 + 1,
            0, // check
        ];

        let mut header = Vec::with_capacity(HEADER_LEN + name.len() + 1);
        header.extend_from_slice(NEWC_MAGIC);
        for field in fields {
            header.extend_from_slice(format!("{:08X}", field).as_bytes());
        }
        header.extend_from_slice(name);
        header.push(0);
        self.write_padded(&header)
    }

    fn write_padded(&mut self, buf: &[u8]) -> io::Result<()> {
        self.out.write_all(buf)?;
        self.written += buf.len() as u64;
        self.pad_to(4)
    }

    fn pad_to(&mut self, align: u64) -> io::Result<()> {
        let pad = (align - self.written % align) % align;
        if pad > 0 {
            self.out.write_all(&vec![0u8; pad as usize])?;
            self.written += pad;
        }
        Ok(())
    }

    /// Write the trailer record and return the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.write_header(0, 0, 1, TRAILER.as_bytes(), 0)?;
        self.pad_to(BLOCK_SIZE)?;
        self.out.flush()?;
        log::debug!("initrd complete: {} entries, {} bytes", self.entries, self.written);
        Ok(self.out)
    }
}

/// newc sizes are 32 bits wide
fn member_size(name: &[u8], len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| InitrdError::TooLarge {
        name: PathBuf::from(OsStr::from_bytes(name)),
        size: len,
    })
}

/// Archive member name: the absolute path without its leading `/`.
fn archive_name(path: &Path) -> Result<PathBuf> {
    if !path.is_absolute() {
        return Err(InitrdError::RelativePath(path.to_path_buf()));
    }
    Ok(path
        .components()
        .filter(|c| !matches!(c, Component::RootDir))
        .collect())
}

/// One member of an existing archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub mode: u32,
    pub data: Vec<u8>,
}

impl Entry {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

fn hex_field(header: &[u8], index: usize) -> Result<u32> {
    let start = NEWC_MAGIC.len() + index * 8;
    let field = std::str::from_utf8(&header[start..start + 8]).map_err(|_| InitrdError::Malformed("header field"))?;
    u32::from_str_radix(field, 16).map_err(|_| InitrdError::Malformed("header field"))
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// List the members of a newc archive, stopping at the trailer.
pub fn entries(archive: &[u8]) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    let mut pos = 0usize;

    loop {
        let header = archive
            .get(pos..pos + HEADER_LEN)
            .ok_or(InitrdError::Malformed("truncated header"))?;
        if &header[..6] != NEWC_MAGIC {
            return Err(InitrdError::Malformed("bad magic"));
        }

        let mode = hex_field(header, 1)?;
        let size = hex_field(header, 6)? as usize;
        let namesize = hex_field(header, 11)? as usize;
        if namesize == 0 {
            return Err(InitrdError::Malformed("empty name"));
        }

        let name_start = pos + HEADER_LEN;
        let name = archive
            .get(name_start..name_start + namesize - 1)
            .ok_or(InitrdError::Malformed("truncated name"))?;
        let name = String::from_utf8_lossy(name).into_owned();

        let data_start = align4(name_start + namesize);
        if name == TRAILER {
            break;
        }

        let data = archive
            .get(data_start..data_start + size)
            .ok_or(InitrdError::Malformed("truncated data"))?
            .to_vec();
        pos = align4(data_start + size);

        entries.push(Entry { name, mode, data });
    }

    Ok(entries)
}
