use super::command::{CommandOutcome, CommandSpec};
use crate::util::{hash_bytes, hash_str, resolve_repo_path_allow_new};
use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use git2::Repository;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

const LOCK_DIR: &str = "patchloop-locks";

/// Which files are compared after a revert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevertCheck {
    /// Only the paths the patch declares.
    #[default]
    Touched,
    /// Every tracked file (git index, or the whole tree outside git).
    Tracked,
    Off,
}

/// A checkout that patches are applied to and verified in.
#[derive(Debug, Clone)]
pub struct WorkingCopy {
    pub name: String,
    pub root: PathBuf,
    pub verify: CommandSpec,
    pub verify_timeout: Duration,
    pub revert_check: RevertCheck,
}

impl WorkingCopy {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>, verify: CommandSpec) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            verify,
            verify_timeout: Duration::from_secs(60),
            revert_check: RevertCheck::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }

    pub fn with_revert_check(mut self, check: RevertCheck) -> Self {
        self.revert_check = check;
        self
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    pub fn run_verify(&self) -> CommandOutcome {
        self.verify.run(&self.root, self.verify_timeout)
    }

    /// Exclusive advisory lock held for as long as the guard lives.
    pub fn lock(&self) -> Result<CopyLock> {
        CopyLock::acquire(&self.root)
    }

    /// Content hashes to compare against after a revert, per `revert_check`.
    pub fn snapshot<'a, I>(&self, touched: I) -> Result<Option<Snapshot>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        match self.revert_check {
            RevertCheck::Off => Ok(None),
            RevertCheck::Touched => Snapshot::capture_paths(&self.root, touched).map(Some),
            RevertCheck::Tracked => Snapshot::capture_tracked(&self.root).map(Some),
        }
    }
}

/// Lock file kept outside the working copy so it never shows up in a diff.
pub struct CopyLock {
    file: File,
    path: PathBuf,
}

impl CopyLock {
    pub fn acquire(root: &Path) -> Result<Self> {
        let canonical = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve working copy '{}'", root.display()))?;
        let dir = std::env::temp_dir().join(LOCK_DIR);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create lock directory '{}'", dir.display()))?;
        let path = dir.join(format!("{}.lock", hash_str(&canonical.to_string_lossy())));

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open lock file '{}'", path.display()))?;
        file.try_lock_exclusive().map_err(|_| {
            anyhow!(
                "Working copy '{}' is in use by another patchloop process",
                canonical.display()
            )
        })?;

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CopyLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Content hashes keyed by repo-relative path; `None` marks an absent file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    files: BTreeMap<String, Option<String>>,
}

impl Snapshot {
    /// Hash the given repo-relative paths. Paths that would escape the root
    /// are skipped.
    pub fn capture_paths<'a, I>(root: &Path, paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut files = BTreeMap::new();
        for rel in paths {
            let Ok(absolute) = resolve_repo_path_allow_new(root, Path::new(rel)) else {
                tracing::debug!(path = rel, "skipping path outside working copy");
                continue;
            };
            files.insert(rel.to_string(), hash_file(&absolute)?);
        }
        Ok(Self { files })
    }

    /// Hash every tracked file: the git index when `root` is a repository
    /// work tree, otherwise every file under `root` except `.git`.
    pub fn capture_tracked(root: &Path) -> Result<Self> {
        let paths = match tracked_paths_from_git(root)? {
            Some(paths) => paths,
            None => walk_paths(root)?,
        };

        let mut files = BTreeMap::new();
        for rel in paths {
            let hash = hash_file(&root.join(&rel))?;
            files.insert(rel, hash);
        }
        Ok(Self { files })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Paths whose content differs between `self` and a later snapshot.
    pub fn changed_since(&self, later: &Snapshot) -> Vec<String> {
        let mut changed: Vec<String> = self
            .files
            .iter()
            .filter(|(path, hash)| later.files.get(*path) != Some(*hash))
            .map(|(path, _)| path.clone())
            .collect();
        changed.extend(
            later
                .files
                .keys()
                .filter(|path| !self.files.contains_key(*path))
                .cloned(),
        );
        changed
    }
}

fn hash_file(path: &Path) -> Result<Option<String>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(hash_bytes(&bytes))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("Failed to read '{}'", path.display())),
    }
}

fn tracked_paths_from_git(root: &Path) -> Result<Option<Vec<String>>> {
    let Ok(repo) = Repository::open(root) else {
        return Ok(None);
    };
    let Some(workdir) = repo.workdir() else {
        return Ok(None);
    };
    let same_root = workdir.canonicalize().ok() == root.canonicalize().ok();
    if !same_root {
        return Ok(None);
    }

    let index = repo.index().context("Failed to read git index")?;
    let paths = index
        .iter()
        .map(|entry| String::from_utf8_lossy(&entry.path).to_string())
        .collect();
    Ok(Some(paths))
}

fn walk_paths(root: &Path) -> Result<Vec<String>> {
    let mut paths = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk '{}'", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            paths.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(paths)
}
