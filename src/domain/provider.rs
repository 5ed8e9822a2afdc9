//! Attribute and metadata providers, plus the tag store they read tags from.

use super::{FileAttribute, FileType, Value};
use crate::error::{Result, SorterError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

/// Supplies attribute and desktop-metadata values for a path.
///
/// Implementations return [`SorterError::AttributeUnavailable`] when they
/// cannot answer; any other error is treated as a failure of the lookup.
pub trait MetadataProvider: Send + Sync {
    fn resolve(&self, path: &Path, key: &str) -> Result<Value>;
}

fn unavailable(path: &Path, key: &str) -> SorterError {
    SorterError::AttributeUnavailable {
        key: key.to_string(),
        path: path.to_path_buf(),
    }
}

/// Reads attributes from the local filesystem and tags from a [`TagStore`].
#[derive(Debug, Clone)]
pub struct FsMetadataProvider {
    tags: Arc<TagStore>,
}

impl FsMetadataProvider {
    pub fn new(tags: Arc<TagStore>) -> Self {
        Self { tags }
    }

    fn file_attribute(&self, path: &Path, attr: FileAttribute) -> Result<Value> {
        let key = attr.key();
        let os_str = |s: Option<&std::ffi::OsStr>| {
            s.map(|s| Value::String(s.to_string_lossy().into_owned()))
                .ok_or_else(|| unavailable(path, key))
        };
        let extension = || {
            path.extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_default()
        };

        match attr {
            FileAttribute::Name => os_str(path.file_stem()),
            FileAttribute::FileName => os_str(path.file_name()),
            FileAttribute::Extension => Ok(Value::String(extension())),
            FileAttribute::Path => Ok(Value::String(path.to_string_lossy().into_owned())),
            FileAttribute::Parent => os_str(path.parent().and_then(Path::file_name)),
            FileAttribute::Type => Ok(Value::String(
                FileType::from_extension(&extension()).as_str().to_string(),
            )),
            FileAttribute::Hidden => {
                let hidden = path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with('.'));
                Ok(Value::Number(if hidden { 1.0 } else { 0.0 }))
            }
            FileAttribute::Kind => {
                let meta = fs::symlink_metadata(path).map_err(|e| io_unavailable(path, key, e))?;
                let kind = if meta.file_type().is_symlink() {
                    "symlink"
                } else if meta.is_dir() {
                    "directory"
                } else {
                    "file"
                };
                Ok(Value::String(kind.to_string()))
            }
            FileAttribute::Size => {
                let meta = fs::metadata(path).map_err(|e| io_unavailable(path, key, e))?;
                Ok(Value::Number(meta.len() as f64))
            }
            FileAttribute::Permissions => {
                let meta = fs::metadata(path).map_err(|e| io_unavailable(path, key, e))?;
                Ok(Value::Number(permission_bits(&meta) as f64))
            }
            FileAttribute::Created => self.timestamp(path, key, |m| m.created()),
            FileAttribute::Modified => self.timestamp(path, key, |m| m.modified()),
            FileAttribute::Accessed => self.timestamp(path, key, |m| m.accessed()),
            FileAttribute::Tags => Ok(Value::Array(self.tags.get(path))),
        }
    }

    fn timestamp(
        &self,
        path: &Path,
        key: &str,
        read: impl Fn(&fs::Metadata) -> io::Result<SystemTime>,
    ) -> Result<Value> {
        let meta = fs::metadata(path).map_err(|e| io_unavailable(path, key, e))?;
        let time = read(&meta).map_err(|e| io_unavailable(path, key, e))?;
        let date: DateTime<Utc> = time.into();
        Ok(Value::Date(date))
    }

    /// Desktop metadata. Only image dimensions are indexed locally.
    fn index_attribute(&self, path: &Path, key: &str) -> Result<Value> {
        match key {
            "pixel_width" | "pixel_height" => {
                let ext = path
                    .extension()
                    .map(|e| e.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if FileType::from_extension(&ext) != FileType::Image {
                    return Err(unavailable(path, key));
                }
                let (width, height) = image::image_dimensions(path).map_err(|e| {
                    tracing::debug!("No image header for {}: {}", path.display(), e);
                    unavailable(path, key)
                })?;
                let pixels = if key == "pixel_width" { width } else { height };
                Ok(Value::Number(pixels as f64))
            }
            _ => Err(unavailable(path, key)),
        }
    }
}

impl MetadataProvider for FsMetadataProvider {
    fn resolve(&self, path: &Path, key: &str) -> Result<Value> {
        match FileAttribute::from_key(key) {
            Some(attr) => self.file_attribute(path, attr),
            None => self.index_attribute(path, key),
        }
    }
}

fn io_unavailable(path: &Path, key: &str, err: io::Error) -> SorterError {
    tracing::debug!("Cannot read '{}' for {}: {}", key, path.display(), err);
    unavailable(path, key)
}

#[cfg(unix)]
fn permission_bits(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TagFile {
    tags: BTreeMap<String, Vec<String>>,
}

/// Tag sets keyed by absolute path.
///
/// Kept in memory and, when opened from a file, written back as JSON after
/// every change.
#[derive(Debug, Default)]
pub struct TagStore {
    entries: Mutex<HashMap<PathBuf, Vec<String>>>,
    persist_path: Option<PathBuf>,
}

impl TagStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Get the default tag file path (~/.local/share/sorter/tags.json)
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("sorter").join("tags.json"))
    }

    /// Load tags from a JSON file; a missing file starts an empty store.
    pub fn open(path: &Path) -> Result<Self> {
        let mut entries = HashMap::new();
        if path.exists() {
            let contents = fs::read_to_string(path).map_err(|e| {
                SorterError::ConfigError(format!("Failed to read tag file: {}", e))
            })?;
            let file: TagFile = serde_json::from_str(&contents).map_err(|e| {
                SorterError::ConfigError(format!("Failed to parse tag file: {}", e))
            })?;
            entries = file
                .tags
                .into_iter()
                .map(|(path, tags)| (PathBuf::from(path), tags))
                .collect();
        }

        Ok(Self {
            entries: Mutex::new(entries),
            persist_path: Some(path.to_path_buf()),
        })
    }

    pub fn get(&self, path: &Path) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(&store_key(path)).cloned().unwrap_or_default()
    }

    /// Replaces the tag set of `path`. An empty set removes the entry.
    ///
    /// If the tag file cannot be written the previous set is restored.
    pub fn set(&self, path: &Path, tags: Vec<String>) -> Result<()> {
        let key = store_key(path);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = if tags.is_empty() {
            entries.remove(&key)
        } else {
            entries.insert(key.clone(), tags)
        };

        if let Err(e) = self.persist(&entries) {
            match previous {
                Some(previous) => entries.insert(key, previous),
                None => entries.remove(&key),
            };
            return Err(e);
        }
        Ok(())
    }

    // relocate, duplicate and forget follow a change that already happened
    // on disk, so the in-memory entry changes even if persisting fails.

    /// Moves the tag set along with a relocated file.
    pub fn relocate(&self, from: &Path, to: &Path) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.remove(&store_key(from)) {
            Some(tags) => {
                entries.insert(store_key(to), tags);
                self.persist(&entries)
            }
            None => Ok(()),
        }
    }

    /// Gives a copy the same tags as its source.
    pub fn duplicate(&self, from: &Path, to: &Path) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(&store_key(from)).cloned() {
            Some(tags) => {
                entries.insert(store_key(to), tags);
                self.persist(&entries)
            }
            None => Ok(()),
        }
    }

    pub fn forget(&self, path: &Path) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.remove(&store_key(path)).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }

    fn persist(&self, entries: &HashMap<PathBuf, Vec<String>>) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = TagFile {
            tags: entries
                .iter()
                .map(|(path, tags)| (path.to_string_lossy().into_owned(), tags.clone()))
                .collect(),
        };
        let contents = serde_json::to_string_pretty(&file).map_err(|e| {
            SorterError::ConfigError(format!("Failed to serialize tag file: {}", e))
        })?;
        fs::write(path, contents)?;
        Ok(())
    }
}

fn store_key(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    mod fs_provider_tests {
        use super::*;

        fn provider() -> FsMetadataProvider {
            FsMetadataProvider::new(Arc::new(TagStore::in_memory()))
        }

        #[test]
        fn test_path_derived_attributes() {
            let provider = provider();
            let path = Path::new("/data/reports/Q1 summary.PDF");

            assert_eq!(
                provider.resolve(path, "name").unwrap(),
                Value::String("Q1 summary".to_string())
            );
            assert_eq!(
                provider.resolve(path, "filename").unwrap(),
                Value::String("Q1 summary.PDF".to_string())
            );
            assert_eq!(
                provider.resolve(path, "extension").unwrap(),
                Value::String("PDF".to_string())
            );
            assert_eq!(
                provider.resolve(path, "parent").unwrap(),
                Value::String("reports".to_string())
            );
            assert_eq!(
                provider.resolve(path, "type").unwrap(),
                Value::String("pdf".to_string())
            );
            assert_eq!(provider.resolve(path, "hidden").unwrap(), Value::Number(0.0));
        }

        #[test]
        fn test_missing_extension_is_empty_string() {
            let provider = provider();
            assert_eq!(
                provider.resolve(Path::new("/tmp/Makefile"), "extension").unwrap(),
                Value::String(String::new())
            );
        }

        #[test]
        fn test_stat_attributes() {
            let temp_dir = TempDir::new().unwrap();
            let path = temp_dir.path().join("notes.txt");
            fs::write(&path, b"hello").unwrap();

            let provider = provider();
            assert_eq!(provider.resolve(&path, "size").unwrap(), Value::Number(5.0));
            assert_eq!(
                provider.resolve(&path, "kind").unwrap(),
                Value::String("file".to_string())
            );
            assert!(matches!(
                provider.resolve(&path, "modified").unwrap(),
                Value::Date(_)
            ));
        }

        #[test]
        fn test_missing_file_is_unavailable() {
            let provider = provider();
            let result = provider.resolve(Path::new("/nonexistent/file.txt"), "size");
            assert!(matches!(result, Err(SorterError::AttributeUnavailable { .. })));
        }

        #[test]
        fn test_unknown_metadata_key_is_unavailable() {
            let temp_dir = TempDir::new().unwrap();
            let path = temp_dir.path().join("notes.txt");
            fs::write(&path, b"hello").unwrap();

            let provider = provider();
            for key in ["author", "pixel_width"] {
                let result = provider.resolve(&path, key);
                assert!(matches!(result, Err(SorterError::AttributeUnavailable { .. })));
            }
        }

        #[test]
        fn test_tags_come_from_store() {
            let store = Arc::new(TagStore::in_memory());
            let provider = FsMetadataProvider::new(Arc::clone(&store));
            let path = Path::new("/tmp/a.txt");

            assert_eq!(provider.resolve(path, "tags").unwrap(), Value::Array(vec![]));
            store.set(path, vec!["urgent".to_string()]).unwrap();
            assert_eq!(
                provider.resolve(path, "tags").unwrap(),
                Value::Array(vec!["urgent".to_string()])
            );
        }
    }

    mod tag_store_tests {
        use super::*;

        #[test]
        fn test_relocate_moves_tags() {
            let store = TagStore::in_memory();
            let from = Path::new("/tmp/a.txt");
            let to = Path::new("/tmp/b/a.txt");
            store.set(from, vec!["x".to_string()]).unwrap();

            store.relocate(from, to).unwrap();

            assert!(store.get(from).is_empty());
            assert_eq!(store.get(to), vec!["x".to_string()]);
        }

        #[test]
        fn test_duplicate_keeps_source_tags() {
            let store = TagStore::in_memory();
            let from = Path::new("/tmp/a.txt");
            let to = Path::new("/tmp/copy/a.txt");
            store.set(from, vec!["x".to_string()]).unwrap();

            store.duplicate(from, to).unwrap();

            assert_eq!(store.get(from), vec!["x".to_string()]);
            assert_eq!(store.get(to), vec!["x".to_string()]);
        }

        #[test]
        fn test_empty_set_removes_entry() {
            let store = TagStore::in_memory();
            let path = Path::new("/tmp/a.txt");
            store.set(path, vec!["x".to_string()]).unwrap();
            store.set(path, vec![]).unwrap();
            assert!(store.get(path).is_empty());
        }

        #[test]
        fn test_persisted_store_round_trips_through_disk() {
            let temp_dir = TempDir::new().unwrap();
            let tag_file = temp_dir.path().join("state").join("tags.json");
            let tagged = temp_dir.path().join("a.txt");

            let store = TagStore::open(&tag_file).unwrap();
            store
                .set(&tagged, vec!["urgent".to_string(), "work".to_string()])
                .unwrap();
            assert!(tag_file.exists());

            let reopened = TagStore::open(&tag_file).unwrap();
            assert_eq!(
                reopened.get(&tagged),
                vec!["urgent".to_string(), "work".to_string()]
            );
        }

        #[test]
        fn test_failed_write_restores_previous_tags() {
            let temp_dir = TempDir::new().unwrap();
            let tag_file = temp_dir.path().join("tags.json");
            let tagged = temp_dir.path().join("a.txt");
            let fresh = temp_dir.path().join("b.txt");

            let store = TagStore::open(&tag_file).unwrap();
            store.set(&tagged, vec!["urgent".to_string()]).unwrap();
            fs::remove_file(&tag_file).unwrap();
            fs::create_dir(&tag_file).unwrap();

            assert!(store.set(&tagged, vec!["done".to_string()]).is_err());
            assert!(store.set(&fresh, vec!["new".to_string()]).is_err());
            assert!(store.set(&tagged, vec![]).is_err());

            assert_eq!(store.get(&tagged), vec!["urgent".to_string()]);
            assert!(store.get(&fresh).is_empty());
        }

        #[test]
        fn test_relocate_follows_disk_even_if_not_persisted() {
            let temp_dir = TempDir::new().unwrap();
            let tag_file = temp_dir.path().join("tags.json");
            let from = temp_dir.path().join("a.txt");
            let to = temp_dir.path().join("b.txt");

            let store = TagStore::open(&tag_file).unwrap();
            store.set(&from, vec!["urgent".to_string()]).unwrap();
            fs::remove_file(&tag_file).unwrap();
            fs::create_dir(&tag_file).unwrap();

            assert!(store.relocate(&from, &to).is_err());
            assert!(store.get(&from).is_empty());
            assert_eq!(store.get(&to), vec!["urgent".to_string()]);
        }

        #[test]
        fn test_open_rejects_corrupt_file() {
            let temp_dir = TempDir::new().unwrap();
            let tag_file = temp_dir.path().join("tags.json");
            fs::write(&tag_file, b"not json").unwrap();

            let result = TagStore::open(&tag_file);
            assert!(matches!(result, Err(SorterError::ConfigError(_))));
        }
    }
}
