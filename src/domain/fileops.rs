//! Filesystem primitives used by the action executor, and the uniqueness
//! resolver that keeps destination names collision-free.

use super::provider::TagStore;
use crate::config::DEFAULT_UNIQUE_ATTEMPTS;
use crate::error::{Result, SorterError};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum FileOpError {
    /// The destination is taken. Callers pick another name and retry.
    #[error("destination already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("failed to {op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        source: io::Error,
    },

    #[error("failed to move {} to the trash: {reason}", path.display())]
    Trash { path: PathBuf, reason: String },

    #[error("failed to update tags of {}: {reason}", path.display())]
    Tags { path: PathBuf, reason: String },

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

impl FileOpError {
    fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::AlreadyExists {
            return FileOpError::AlreadyExists(path.to_path_buf());
        }
        FileOpError::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    fn tags(path: &Path, err: SorterError) -> Self {
        FileOpError::Tags {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    }
}

pub type OpResult<T> = std::result::Result<T, FileOpError>;

/// OS primitives consumed by the action executor.
///
/// `move_item`, `copy_item` and `create_alias` never replace an existing
/// entry: they fail with [`FileOpError::AlreadyExists`] instead.
pub trait FileOperations: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    fn create_dir_all(&self, path: &Path) -> OpResult<()>;
    /// Removes `path` only if it is an empty directory.
    fn remove_empty_dir(&self, path: &Path) -> OpResult<()>;
    fn move_item(&self, from: &Path, to: &Path) -> OpResult<()>;
    fn copy_item(&self, from: &Path, to: &Path) -> OpResult<()>;
    fn create_alias(&self, target: &Path, link: &Path) -> OpResult<()>;
    fn trash(&self, path: &Path) -> OpResult<()>;
    fn read_tags(&self, path: &Path) -> Vec<String>;
    fn write_tags(&self, path: &Path, tags: Vec<String>) -> OpResult<()>;
}

/// Where trashed files go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrashTarget {
    /// The platform trash / recycle bin
    System,
    /// A plain directory; files can be moved back by hand
    Staging(PathBuf),
}

/// [`FileOperations`] backed by `std::fs`, the `trash` crate and a [`TagStore`].
#[derive(Debug, Clone)]
pub struct StdFileOperations {
    tags: Arc<TagStore>,
    trash: TrashTarget,
    max_unique_attempts: usize,
}

impl StdFileOperations {
    pub fn new(tags: Arc<TagStore>) -> Self {
        Self {
            tags,
            trash: TrashTarget::System,
            max_unique_attempts: DEFAULT_UNIQUE_ATTEMPTS,
        }
    }

    pub fn with_trash_target(mut self, trash: TrashTarget) -> Self {
        self.trash = trash;
        self
    }

    /// Bounds the name search inside a staging trash directory.
    pub fn with_max_unique_attempts(mut self, attempts: usize) -> Self {
        self.max_unique_attempts = attempts.max(1);
        self
    }

    pub fn trash_target(&self) -> &TrashTarget {
        &self.trash
    }

    fn move_file(&self, from: &Path, to: &Path) -> OpResult<()> {
        match fs::hard_link(from, to) {
            Ok(()) => {
                if let Err(e) = fs::remove_file(from) {
                    fs::remove_file(to).ok();
                    return Err(FileOpError::io("remove", from, e));
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(FileOpError::AlreadyExists(to.to_path_buf()))
            }
            Err(e) => {
                // Cross-device or no hard link support
                tracing::debug!(
                    "hard link {} -> {} failed ({}), copying instead",
                    from.display(),
                    to.display(),
                    e
                );
                copy_file_exclusive(from, to)?;
                if let Err(e) = fs::remove_file(from) {
                    fs::remove_file(to).ok();
                    return Err(FileOpError::io("remove", from, e));
                }
                Ok(())
            }
        }
    }

    fn stage(&self, path: &Path, staging_dir: &Path) -> OpResult<()> {
        fs::create_dir_all(staging_dir).map_err(|e| FileOpError::io("create", staging_dir, e))?;
        let file_name = path
            .file_name()
            .ok_or_else(|| FileOpError::Trash {
                path: path.to_path_buf(),
                reason: "path has no file name".to_string(),
            })?;

        let base = staging_dir.join(file_name);
        for _ in 0..self.max_unique_attempts {
            let candidate = generate_unique_file_name(&base, self.max_unique_attempts).map_err(
                |e| FileOpError::Trash {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                },
            )?;
            match self.move_item(path, &candidate) {
                Err(FileOpError::AlreadyExists(_)) => continue,
                other => return other,
            }
        }

        Err(FileOpError::Trash {
            path: path.to_path_buf(),
            reason: format!(
                "staging names kept being taken after {} attempts",
                self.max_unique_attempts
            ),
        })
    }

    /// Tag bookkeeping after a change that is already on disk. The disk is
    /// the truth, so a tag file that cannot be written is only logged.
    fn follow_tags(&self, path: &Path, result: Result<()>) {
        if let Err(e) = result {
            tracing::warn!("tags of {} not saved: {}", path.display(), e);
        }
    }
}

impl FileOperations for StdFileOperations {
    fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }

    fn create_dir_all(&self, path: &Path) -> OpResult<()> {
        fs::create_dir_all(path).map_err(|e| FileOpError::io("create", path, e))
    }

    fn remove_empty_dir(&self, path: &Path) -> OpResult<()> {
        fs::remove_dir(path).map_err(|e| FileOpError::io("remove", path, e))
    }

    fn move_item(&self, from: &Path, to: &Path) -> OpResult<()> {
        let meta = fs::symlink_metadata(from).map_err(|e| FileOpError::io("read", from, e))?;

        if meta.is_dir() {
            if self.exists(to) {
                return Err(FileOpError::AlreadyExists(to.to_path_buf()));
            }
            fs::rename(from, to).map_err(|e| FileOpError::io("move", from, e))?;
        } else {
            self.move_file(from, to)?;
        }

        self.follow_tags(to, self.tags.relocate(from, to));
        Ok(())
    }

    fn copy_item(&self, from: &Path, to: &Path) -> OpResult<()> {
        let meta = fs::metadata(from).map_err(|e| FileOpError::io("read", from, e))?;

        if meta.is_dir() {
            copy_dir_exclusive(from, to)?;
        } else {
            copy_file_exclusive(from, to)?;
        }

        self.follow_tags(to, self.tags.duplicate(from, to));
        Ok(())
    }

    fn create_alias(&self, target: &Path, link: &Path) -> OpResult<()> {
        let target = std::path::absolute(target).map_err(|e| FileOpError::io("resolve", target, e))?;
        symlink(&target, link).map_err(|e| FileOpError::io("link", link, e))
    }

    fn trash(&self, path: &Path) -> OpResult<()> {
        match &self.trash {
            TrashTarget::System => {
                trash::delete(path).map_err(|e| FileOpError::Trash {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
                self.follow_tags(path, self.tags.forget(path));
                Ok(())
            }
            TrashTarget::Staging(dir) => self.stage(path, dir),
        }
    }

    fn read_tags(&self, path: &Path) -> Vec<String> {
        self.tags.get(path)
    }

    fn write_tags(&self, path: &Path, tags: Vec<String>) -> OpResult<()> {
        self.tags.set(path, tags).map_err(|e| FileOpError::tags(path, e))
    }
}

/// Copies a regular file to a path that must not exist yet.
///
/// The destination is opened with `create_new`, so a concurrent writer that
/// wins the race surfaces as [`FileOpError::AlreadyExists`]. Permissions and
/// the modification time are carried over; a partial copy is removed.
fn copy_file_exclusive(from: &Path, to: &Path) -> OpResult<()> {
    let mut source = File::open(from).map_err(|e| FileOpError::io("open", from, e))?;
    let mut dest = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(to)
        .map_err(|e| FileOpError::io("create", to, e))?;

    let result = (|| -> io::Result<()> {
        io::copy(&mut source, &mut dest)?;
        let meta = source.metadata()?;
        dest.set_permissions(meta.permissions())?;
        dest.set_modified(meta.modified()?)?;
        dest.sync_all()
    })();

    if let Err(e) = result {
        drop(dest);
        fs::remove_file(to).ok();
        return Err(FileOpError::io("copy", from, e));
    }
    Ok(())
}

fn copy_dir_exclusive(from: &Path, to: &Path) -> OpResult<()> {
    fs::create_dir(to).map_err(|e| FileOpError::io("create", to, e))?;

    let result = (|| -> OpResult<()> {
        for entry in WalkDir::new(from).min_depth(1) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(from).to_path_buf();
                FileOpError::io("read", &path, e.into())
            })?;
            let relative = entry.path().strip_prefix(from).unwrap_or(entry.path());
            let dest = to.join(relative);
            if entry.file_type().is_dir() {
                fs::create_dir(&dest).map_err(|e| FileOpError::io("create", &dest, e))?;
            } else {
                copy_file_exclusive(entry.path(), &dest)?;
            }
        }
        Ok(())
    })();

    if result.is_err() {
        fs::remove_dir_all(to).ok();
    }
    result
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    if target.is_dir() {
        std::os::windows::fs::symlink_dir(target, link)
    } else {
        std::os::windows::fs::symlink_file(target, link)
    }
}

#[cfg(not(any(unix, windows)))]
fn symlink(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symbolic links are not supported on this platform",
    ))
}

/// Per-directory mutexes held while a destination name is resolved and
/// committed, so two workers never settle on the same disambiguated name.
#[derive(Debug, Default)]
pub struct DirectoryLocks {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl DirectoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, dir: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(dir.to_path_buf()).or_default())
    }
}

/// Returns `path` if nothing exists there, otherwise the first free
/// `"<stem> N.<ext>"` sibling with N counting up from 2.
pub fn generate_unique_file_name(path: &Path, max_attempts: usize) -> Result<PathBuf> {
    generate_unique_file_name_with(path, max_attempts, |p| fs::symlink_metadata(p).is_ok())
}

/// [`generate_unique_file_name`] with a caller-supplied existence check.
pub fn generate_unique_file_name_with(
    path: &Path,
    max_attempts: usize,
    exists: impl Fn(&Path) -> bool,
) -> Result<PathBuf> {
    if !exists(path) {
        return Ok(path.to_path_buf());
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| SorterError::InvalidFileName(path.display().to_string()))?;
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());

    for n in (2usize..).take(max_attempts) {
        let name = match &extension {
            Some(ext) => format!("{} {}.{}", stem, n, ext),
            None => format!("{} {}", stem, n),
        };
        let candidate = path.with_file_name(name);
        if !exists(&candidate) {
            return Ok(candidate);
        }
    }

    Err(SorterError::NameResolutionExhausted {
        path: path.to_path_buf(),
        attempts: max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ops() -> StdFileOperations {
        StdFileOperations::new(Arc::new(TagStore::in_memory()))
    }

    mod unique_name_tests {
        use super::*;

        #[test]
        fn test_free_path_is_returned_unchanged() {
            let temp_dir = TempDir::new().unwrap();
            let path = temp_dir.path().join("report.txt");
            assert_eq!(generate_unique_file_name(&path, 10).unwrap(), path);
        }

        #[test]
        fn test_counts_up_before_the_extension() {
            let temp_dir = TempDir::new().unwrap();
            let path = temp_dir.path().join("report.txt");
            fs::write(&path, b"v1").unwrap();

            let second = generate_unique_file_name(&path, 10).unwrap();
            assert_eq!(second, temp_dir.path().join("report 2.txt"));

            fs::write(&second, b"v2").unwrap();
            let third = generate_unique_file_name(&path, 10).unwrap();
            assert_eq!(third, temp_dir.path().join("report 3.txt"));
        }

        #[test]
        fn test_names_without_extension() {
            let temp_dir = TempDir::new().unwrap();
            let path = temp_dir.path().join("Makefile");
            fs::write(&path, b"all:").unwrap();

            assert_eq!(
                generate_unique_file_name(&path, 10).unwrap(),
                temp_dir.path().join("Makefile 2")
            );
        }

        #[test]
        fn test_search_is_bounded() {
            let result =
                generate_unique_file_name_with(Path::new("/virtual/report.txt"), 5, |_| true);
            assert!(matches!(
                result,
                Err(SorterError::NameResolutionExhausted { attempts: 5, .. })
            ));
        }
    }

    mod std_ops_tests {
        use super::*;

        #[test]
        fn test_move_relocates_file_and_tags() {
            let temp_dir = TempDir::new().unwrap();
            let from = temp_dir.path().join("a.txt");
            let to = temp_dir.path().join("b.txt");
            fs::write(&from, b"data").unwrap();

            let ops = ops();
            ops.write_tags(&from, vec!["red".to_string()]).unwrap();
            ops.move_item(&from, &to).unwrap();

            assert!(!from.exists());
            assert_eq!(fs::read(&to).unwrap(), b"data");
            assert_eq!(ops.read_tags(&to), vec!["red".to_string()]);
            assert!(ops.read_tags(&from).is_empty());
        }

        #[test]
        fn test_move_never_overwrites() {
            let temp_dir = TempDir::new().unwrap();
            let from = temp_dir.path().join("a.txt");
            let to = temp_dir.path().join("b.txt");
            fs::write(&from, b"new").unwrap();
            fs::write(&to, b"old").unwrap();

            let result = ops().move_item(&from, &to);

            assert!(matches!(result, Err(FileOpError::AlreadyExists(_))));
            assert_eq!(fs::read(&from).unwrap(), b"new");
            assert_eq!(fs::read(&to).unwrap(), b"old");
        }

        #[test]
        fn test_move_directory() {
            let temp_dir = TempDir::new().unwrap();
            let from = temp_dir.path().join("album");
            fs::create_dir(&from).unwrap();
            fs::write(from.join("track.mp3"), b"x").unwrap();
            let to = temp_dir.path().join("archive");

            ops().move_item(&from, &to).unwrap();

            assert!(!from.exists());
            assert!(to.join("track.mp3").exists());
        }

        #[test]
        fn test_copy_keeps_source_and_duplicates_tags() {
            let temp_dir = TempDir::new().unwrap();
            let from = temp_dir.path().join("a.txt");
            let to = temp_dir.path().join("copy.txt");
            fs::write(&from, b"data").unwrap();

            let ops = ops();
            ops.write_tags(&from, vec!["blue".to_string()]).unwrap();
            ops.copy_item(&from, &to).unwrap();

            assert_eq!(fs::read(&from).unwrap(), b"data");
            assert_eq!(fs::read(&to).unwrap(), b"data");
            assert_eq!(ops.read_tags(&to), vec!["blue".to_string()]);
            assert_eq!(
                fs::metadata(&from).unwrap().modified().unwrap(),
                fs::metadata(&to).unwrap().modified().unwrap()
            );
        }

        #[test]
        fn test_copy_refuses_existing_destination() {
            let temp_dir = TempDir::new().unwrap();
            let from = temp_dir.path().join("a.txt");
            let to = temp_dir.path().join("b.txt");
            fs::write(&from, b"new").unwrap();
            fs::write(&to, b"old").unwrap();

            let result = ops().copy_item(&from, &to);

            assert!(matches!(result, Err(FileOpError::AlreadyExists(_))));
            assert_eq!(fs::read(&to).unwrap(), b"old");
        }

        #[test]
        fn test_copy_directory_tree() {
            let temp_dir = TempDir::new().unwrap();
            let from = temp_dir.path().join("project");
            fs::create_dir_all(from.join("src")).unwrap();
            fs::write(from.join("src").join("main.rs"), b"fn main() {}").unwrap();
            let to = temp_dir.path().join("backup");

            ops().copy_item(&from, &to).unwrap();

            assert!(from.join("src").join("main.rs").exists());
            assert_eq!(
                fs::read(to.join("src").join("main.rs")).unwrap(),
                b"fn main() {}"
            );
        }

        #[test]
        fn test_missing_source_is_an_io_error() {
            let temp_dir = TempDir::new().unwrap();
            let result = ops().move_item(
                &temp_dir.path().join("missing.txt"),
                &temp_dir.path().join("b.txt"),
            );
            assert!(matches!(result, Err(FileOpError::Io { .. })));
        }

        #[cfg(unix)]
        #[test]
        fn test_create_alias_points_at_target() {
            let temp_dir = TempDir::new().unwrap();
            let target = temp_dir.path().join("a.txt");
            let link = temp_dir.path().join("link.txt");
            fs::write(&target, b"data").unwrap();

            let ops = ops();
            ops.create_alias(&target, &link).unwrap();

            assert_eq!(fs::read_link(&link).unwrap(), target);
            assert!(matches!(
                ops.create_alias(&target, &link),
                Err(FileOpError::AlreadyExists(_))
            ));
        }

        #[test]
        fn test_staged_trash_is_reversible() {
            let temp_dir = TempDir::new().unwrap();
            let staging = temp_dir.path().join("staging");
            let first = temp_dir.path().join("one").join("notes.txt");
            let second = temp_dir.path().join("two").join("notes.txt");
            for path in [&first, &second] {
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(path, b"keep me").unwrap();
            }

            let ops = ops().with_trash_target(TrashTarget::Staging(staging.clone()));
            ops.trash(&first).unwrap();
            ops.trash(&second).unwrap();

            assert!(!first.exists());
            assert!(!second.exists());
            assert_eq!(fs::read(staging.join("notes.txt")).unwrap(), b"keep me");
            assert_eq!(fs::read(staging.join("notes 2.txt")).unwrap(), b"keep me");
        }
    }

    mod tag_file_failure_tests {
        use super::*;

        /// A store whose tag file has been replaced by a directory, so every
        /// later write fails.
        fn unwritable_store(temp_dir: &TempDir, tagged: &Path) -> Arc<TagStore> {
            let tag_file = temp_dir.path().join("tags.json");
            let store = Arc::new(TagStore::open(&tag_file).unwrap());
            store.set(tagged, vec!["red".to_string()]).unwrap();
            fs::remove_file(&tag_file).unwrap();
            fs::create_dir(&tag_file).unwrap();
            store
        }

        #[test]
        fn test_move_succeeds_when_tag_file_cannot_be_written() {
            let temp_dir = TempDir::new().unwrap();
            let from = temp_dir.path().join("a.txt");
            let to = temp_dir.path().join("dest").join("a.txt");
            fs::write(&from, b"data").unwrap();
            fs::create_dir(temp_dir.path().join("dest")).unwrap();
            let ops = StdFileOperations::new(unwritable_store(&temp_dir, &from));

            ops.move_item(&from, &to).unwrap();

            assert!(!from.exists());
            assert!(to.exists());
            assert_eq!(ops.read_tags(&to), vec!["red".to_string()]);
        }

        #[test]
        fn test_copy_succeeds_when_tag_file_cannot_be_written() {
            let temp_dir = TempDir::new().unwrap();
            let from = temp_dir.path().join("a.txt");
            let to = temp_dir.path().join("b.txt");
            fs::write(&from, b"data").unwrap();
            let ops = StdFileOperations::new(unwritable_store(&temp_dir, &from));

            ops.copy_item(&from, &to).unwrap();

            assert_eq!(fs::read(&to).unwrap(), b"data");
            assert_eq!(ops.read_tags(&to), vec!["red".to_string()]);
        }

        #[test]
        fn test_failed_tag_write_is_an_error_and_keeps_old_tags() {
            let temp_dir = TempDir::new().unwrap();
            let path = temp_dir.path().join("a.txt");
            fs::write(&path, b"data").unwrap();
            let ops = StdFileOperations::new(unwritable_store(&temp_dir, &path));

            let result = ops.write_tags(&path, vec!["red".to_string(), "blue".to_string()]);

            assert!(matches!(result, Err(FileOpError::Tags { .. })));
            assert_eq!(ops.read_tags(&path), vec!["red".to_string()]);
        }
    }

    mod staging_tests {
        use super::*;

        #[test]
        fn test_staging_name_search_is_bounded() {
            let temp_dir = TempDir::new().unwrap();
            let staging = temp_dir.path().join("staging");
            fs::create_dir(&staging).unwrap();
            for name in ["notes.txt", "notes 2.txt", "notes 3.txt"] {
                fs::write(staging.join(name), b"older").unwrap();
            }
            let path = temp_dir.path().join("notes.txt");
            fs::write(&path, b"keep me").unwrap();

            let ops = ops()
                .with_trash_target(TrashTarget::Staging(staging.clone()))
                .with_max_unique_attempts(2);
            let result = ops.trash(&path);

            assert!(matches!(result, Err(FileOpError::Trash { .. })));
            assert_eq!(fs::read(&path).unwrap(), b"keep me");
        }

        #[test]
        fn test_remove_empty_dir_keeps_populated_dirs() {
            let temp_dir = TempDir::new().unwrap();
            let empty = temp_dir.path().join("empty");
            let full = temp_dir.path().join("full");
            fs::create_dir(&empty).unwrap();
            fs::create_dir(&full).unwrap();
            fs::write(full.join("a.txt"), b"x").unwrap();

            let ops = ops();
            ops.remove_empty_dir(&empty).unwrap();
            assert!(ops.remove_empty_dir(&full).is_err());

            assert!(!empty.exists());
            assert!(full.join("a.txt").exists());
        }
    }

    mod directory_lock_tests {
        use super::*;

        #[test]
        fn test_same_directory_shares_a_lock() {
            let locks = DirectoryLocks::new();
            let a = locks.lock_for(Path::new("/tmp/out"));
            let b = locks.lock_for(Path::new("/tmp/out"));
            let c = locks.lock_for(Path::new("/tmp/other"));

            assert!(Arc::ptr_eq(&a, &b));
            assert!(!Arc::ptr_eq(&a, &c));
        }
    }
}
