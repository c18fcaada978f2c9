//! Directory listing
//!
//! One pass over a directory handle, printing each name with a trailing `/`
//! for sub-directories. Order is whatever the filesystem hands back.

use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::InitError;

/// Coarse entry type, as far as the listing cares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    Other,
}

impl EntryKind {
    /// Symlinks are `Other`, even when they point at a directory.
    pub fn from_file_type(file_type: fs::FileType) -> Self {
        if file_type.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::Other
        }
    }

    /// Suffix printed after the entry name
    pub fn suffix(self) -> &'static str {
        match self {
            EntryKind::Directory => "/",
            EntryKind::Other => "",
        }
    }
}

/// A single directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: EntryKind,
}

impl DirEntry {
    /// Write the entry as one console line
    pub fn write_line<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(self.name.as_bytes())?;
        out.write_all(self.kind.suffix().as_bytes())?;
        out.write_all(b"\n")
    }
}

/// Open directory handle yielding entries until exhausted
///
/// The handle is closed when the listing is dropped.
pub struct Listing {
    path: PathBuf,
    entries: Option<fs::ReadDir>,
}

impl Listing {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, InitError> {
        let path = path.as_ref();
        let entries = fs::read_dir(path).map_err(|source| InitError::OpenDir {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            entries: Some(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Iterator for Listing {
    type Item = DirEntry;

    fn next(&mut self) -> Option<DirEntry> {
        let entry = match self.entries.as_mut()?.next()? {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("readdir {} failed: {}", self.path.display(), e);
                // Stop here and release the handle early
                self.entries = None;
                return None;
            }
        };

        let kind = match entry.file_type() {
            Ok(file_type) => EntryKind::from_file_type(file_type),
            Err(e) => {
                log::debug!("no type for {:?}: {}", entry.file_name(), e);
                EntryKind::Other
            }
        };

        Some(DirEntry {
            name: entry.file_name(),
            kind,
        })
    }
}

/// Print the contents of `path` to `out`.
///
/// If the directory cannot be opened a single line goes to `err` instead and
/// nothing is written to `out`. Only failures writing to `out` are returned.
pub fn show_dir<O: Write, E: Write>(path: impl AsRef<Path>, out: &mut O, err: &mut E) -> io::Result<()> {
    let listing = match Listing::open(path) {
        Ok(listing) => listing,
        Err(e) => {
            if let InitError::OpenDir { source, .. } = &e {
                log::debug!("{}: {}", e, source);
            }
            if let Err(write_err) = writeln!(err, "{}", e) {
                log::warn!("stderr write failed: {}", write_err);
            }
            return Ok(());
        }
    };

    writeln!(out, "Contents of {}:", listing.path().display())?;

    let mut count = 0usize;
    for entry in listing {
        entry.write_line(out)?;
        count += 1;
    }
    log::debug!("listed {} entries", count);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn list(path: &Path) -> (String, String) {
        let mut out = Vec::new();
        let mut err = Vec::new();
        show_dir(path, &mut out, &mut err).unwrap();
        (String::from_utf8(out).unwrap(), String::from_utf8(err).unwrap())
    }

    #[test]
    fn test_entry_kind_suffix() {
        assert_eq!(EntryKind::Directory.suffix(), "/");
        assert_eq!(EntryKind::Other.suffix(), "");
    }

    #[test]
    fn test_entry_line() {
        let mut out = Vec::new();
        DirEntry { name: "bin".into(), kind: EntryKind::Directory }
            .write_line(&mut out)
            .unwrap();
        DirEntry { name: "init".into(), kind: EntryKind::Other }
            .write_line(&mut out)
            .unwrap();
        assert_eq!(out, b"bin/\ninit\n");
    }

    #[test]
    fn test_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (out, err) = list(dir.path());

        assert_eq!(out, format!("Contents of {}:\n", dir.path().display()));
        assert!(err.is_empty());
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let (out, err) = list(&missing);

        assert!(out.is_empty());
        assert_eq!(err, format!("Failed to open {}\n", missing.display()));
    }

    struct Closed;

    impl Write for Closed {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }
    }

    #[test]
    fn test_missing_directory_closed_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = Vec::new();

        show_dir(dir.path().join("missing"), &mut out, &mut Closed).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_not_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, b"x").unwrap();
        let (out, err) = list(&file);

        assert!(out.is_empty());
        assert_eq!(err.lines().count(), 1);
    }

    #[test]
    fn test_directory_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("bin")).unwrap();
        fs::create_dir(dir.path().join("etc")).unwrap();
        fs::write(dir.path().join("init"), b"").unwrap();
        std::os::unix::fs::symlink("bin", dir.path().join("sbin")).unwrap();

        let (out, err) = list(dir.path());
        assert!(err.is_empty());

        let mut lines = out.lines();
        assert_eq!(lines.next().unwrap(), format!("Contents of {}:", dir.path().display()));

        let entries: BTreeSet<&str> = lines.collect();
        let expected: BTreeSet<&str> = ["bin/", "etc/", "init", "sbin"].into_iter().collect();
        assert_eq!(entries, expected);
    }

    #[test]
    fn test_listing_visits_each_entry_once() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..32 {
            fs::write(dir.path().join(format!("f{i}")), b"").unwrap();
        }

        let names: Vec<OsString> = Listing::open(dir.path()).unwrap().map(|e| e.name).collect();
        let unique: BTreeSet<&OsString> = names.iter().collect();
        assert_eq!(names.len(), 32);
        assert_eq!(unique.len(), 32);
    }
}
