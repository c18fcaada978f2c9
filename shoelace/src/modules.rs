//! Kernel module selection
//!
//! Copies the requested modules, everything they depend on according to
//! `modules.dep`, and the depmod metadata into `/lib/modules/<release>/`,
//! then writes `/etc/modules` so the guest can load them at boot.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::initrd::{Contents, InitRd, InitrdError};

/// depmod output copied verbatim
pub const METADATA_FILES: [&str; 7] = [
    "modules.alias",
    "modules.builtin",
    "modules.dep",
    "modules.devname",
    "modules.order",
    "modules.softdep",
    "modules.symbols",
];

/// Module file extensions, compressed or not
const MODULE_SUFFIXES: [&str; 4] = [".ko", ".ko.xz", ".ko.zst", ".ko.gz"];

/// Module errors
#[derive(Debug, thiserror::Error)]
pub enum ModulesError {
    #[error("Module named {0} already identified")]
    DuplicateName(String),

    #[error("Module not found: {0}")]
    UnknownModule(String),

    #[error("Module missing from modules.dep: {}", .0.display())]
    NotInDepFile(PathBuf),

    #[error("modules.dep line {line}: {reason}")]
    BadDepLine { line: usize, reason: &'static str },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Initrd(#[from] InitrdError),
}

/// Module name for a file name, if it looks like a module
pub fn module_name(file_name: &str) -> Option<&str> {
    MODULE_SUFFIXES
        .iter()
        .find_map(|suffix| file_name.strip_suffix(suffix))
        .filter(|name| !name.is_empty())
}

/// Parse `modules.dep`: `kernel/a.ko: kernel/b.ko kernel/c.ko`
pub fn parse_dep(text: &str) -> Result<BTreeMap<PathBuf, Vec<PathBuf>>, ModulesError> {
    let mut deps = BTreeMap::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut parts = line.split_whitespace();
        let module = parts.next().ok_or(ModulesError::BadDepLine { line: i + 1, reason: "empty" })?;
        let module = module
            .strip_suffix(':')
            .ok_or(ModulesError::BadDepLine { line: i + 1, reason: "missing ':'" })?;

        deps.insert(PathBuf::from(module), parts.map(PathBuf::from).collect());
    }
    Ok(deps)
}

/// Installed module tree for one kernel release
#[derive(Debug)]
pub struct ModuleTree {
    dir: PathBuf,
    release: String,
    /// module name -> path relative to `dir`
    names: BTreeMap<String, PathBuf>,
    deps: BTreeMap<PathBuf, Vec<PathBuf>>,
}

impl ModuleTree {
    /// Index `<basedir>/<release>`.
    pub fn load(basedir: &Path, release: &str) -> Result<Self, ModulesError> {
        let dir = basedir.join(release);

        let mut names = BTreeMap::new();
        index_modules(&dir, &dir.join("kernel"), &mut names)?;
        log::debug!("Indexed {} modules under {}", names.len(), dir.display());

        let deps = parse_dep(&fs::read_to_string(dir.join("modules.dep"))?)?;

        Ok(Self {
            dir,
            release: release.to_string(),
            names,
            deps,
        })
    }

    pub fn release(&self) -> &str {
        &self.release
    }

    /// Path of `name` relative to the tree
    pub fn path_of(&self, name: &str) -> Result<&Path, ModulesError> {
        self.names
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| ModulesError::UnknownModule(name.to_string()))
    }

    /// `name` followed by its dependencies, as relative paths
    pub fn resolve(&self, name: &str) -> Result<Vec<PathBuf>, ModulesError> {
        let path = self.path_of(name)?;
        let deps = self
            .deps
            .get(path)
            .ok_or_else(|| ModulesError::NotInDepFile(path.to_path_buf()))?;

        let mut files = vec![path.to_path_buf()];
        files.extend(deps.iter().cloned());
        Ok(files)
    }

    fn guest_dir(&self) -> PathBuf {
        Path::new("/lib/modules").join(&self.release)
    }
}

fn index_modules(root: &Path, dir: &Path, names: &mut BTreeMap<String, PathBuf>) -> Result<(), ModulesError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            index_modules(root, &path, names)?;
            continue;
        }

        let file_name = entry.file_name();
        let Some(name) = file_name.to_str().and_then(module_name) else {
            continue;
        };
        if names.contains_key(name) {
            return Err(ModulesError::DuplicateName(name.to_string()));
        }
        let rel = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        names.insert(name.to_string(), rel);
    }
    Ok(())
}

/// Copy modules into the initrd.
///
/// `names` are resolved against `tree` together with their dependencies;
/// `external` module files go to `extra/`.
pub fn copy_modules<W: Write>(
    initrd: &mut InitRd<W>,
    tree: &ModuleTree,
    names: &[String],
    external: &[PathBuf],
) -> Result<(), ModulesError> {
    let target = tree.guest_dir();
    let mut copied: BTreeSet<PathBuf> = BTreeSet::new();

    for file in METADATA_FILES {
        let src = tree.dir.join(file);
        if !src.exists() {
            log::warn!("Missing module metadata {}", src.display());
            continue;
        }
        initrd.add_file(target.join(file), Contents::Host(&src), None)?;
        copied.insert(PathBuf::from(file));
    }

    for name in names {
        for rel in tree.resolve(name)? {
            if !copied.insert(rel.clone()) {
                continue;
            }
            initrd.add_file(target.join(&rel), Contents::Host(&tree.dir.join(&rel)), None)?;
        }
    }

    let mut etc_modules: Vec<String> = names.to_vec();
    for path in external {
        let file_name = path
            .file_name()
            .ok_or_else(|| ModulesError::UnknownModule(path.display().to_string()))?;
        initrd.add_file(target.join("extra").join(file_name), Contents::Host(path), None)?;

        if let Some(name) = file_name.to_str().and_then(module_name) {
            etc_modules.push(name.to_string());
        }
    }

    let content: String = etc_modules.iter().map(|name| format!("{}\n", name)).collect();
    initrd.add_file("/etc/modules", Contents::Bytes(content.as_bytes()), None)?;

    log::info!(
        "Copied {} module files for {} ({} external)",
        copied.len(),
        tree.release(),
        external.len()
    );
    Ok(())
}
