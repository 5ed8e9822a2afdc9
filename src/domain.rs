//! Core domain types: typed attribute values, the per-file entity with its
//! lazily populated attribute cache, and candidate discovery.

pub mod action;
pub mod clock;
pub mod condition;
pub mod fileops;
pub mod notifier;
pub mod processor;
pub mod provider;
pub mod tokenizer;

use crate::error::{Result, SorterError};
use chrono::{DateTime, Local, Utc};
use provider::MetadataProvider;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Declared type of a condition subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Numeric,
    String,
    Date,
    Array,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Numeric => "numeric",
            ValueKind::String => "string",
            ValueKind::Date => "date",
            ValueKind::Array => "array",
        };
        f.write_str(name)
    }
}

/// A resolved attribute or metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    String(String),
    Date(DateTime<Utc>),
    Array(Vec<String>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Number(_) => ValueKind::Numeric,
            Value::String(_) => ValueKind::String,
            Value::Date(_) => ValueKind::Date,
            Value::Array(_) => ValueKind::Array,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[String]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Default textual rendering used when a placeholder carries no format.
    pub fn render(&self) -> String {
        match self {
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            Value::Date(d) => d.with_timezone(&Local).format("%Y-%m-%d").to_string(),
            Value::Array(items) => items.join(", "),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Text,
    Image,
    Audio,
    Video,
    Archive,
    Document,
    Pdf,
    Binary,
}

impl FileType {
    pub fn from_extension(ext: &str) -> Self {
        let ext = ext.to_lowercase();
        match ext.as_str() {
            // Text files
            "txt" | "md" | "rs" | "py" | "js" | "ts" | "jsx" | "tsx" | "json" | "yaml" | "yml"
            | "toml" | "xml" | "html" | "css" | "sh" | "bash" | "c" | "cpp" | "h" | "hpp"
            | "java" | "go" | "rb" | "php" | "swift" | "kt" | "cs" | "sql" | "csv" | "log" => {
                FileType::Text
            }

            "png" | "jpg" | "jpeg" | "gif" | "bmp" | "webp" | "svg" | "ico" | "tif" | "tiff"
            | "heic" => FileType::Image,

            "mp3" | "wav" | "flac" | "aac" | "ogg" | "m4a" => FileType::Audio,

            "mp4" | "mov" | "mkv" | "avi" | "webm" | "m4v" => FileType::Video,

            "zip" | "tar" | "gz" | "tgz" | "bz2" | "xz" | "7z" | "rar" | "dmg" => FileType::Archive,

            "doc" | "docx" | "odt" | "rtf" | "pages" | "xls" | "xlsx" | "ods" | "ppt" | "pptx"
            | "key" | "numbers" => FileType::Document,

            "pdf" => FileType::Pdf,

            // Everything else is binary
            _ => FileType::Binary,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Text => "text",
            FileType::Image => "image",
            FileType::Audio => "audio",
            FileType::Video => "video",
            FileType::Archive => "archive",
            FileType::Document => "document",
            FileType::Pdf => "pdf",
            FileType::Binary => "binary",
        }
    }
}

/// Filesystem attribute keys. Anything else is looked up as desktop metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAttribute {
    Name,
    FileName,
    Extension,
    Path,
    Parent,
    Type,
    Kind,
    Hidden,
    Size,
    Permissions,
    Created,
    Modified,
    Accessed,
    Tags,
}

impl FileAttribute {
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "name" => Some(FileAttribute::Name),
            "filename" => Some(FileAttribute::FileName),
            "extension" => Some(FileAttribute::Extension),
            "path" => Some(FileAttribute::Path),
            "parent" => Some(FileAttribute::Parent),
            "type" => Some(FileAttribute::Type),
            "kind" => Some(FileAttribute::Kind),
            "hidden" => Some(FileAttribute::Hidden),
            "size" => Some(FileAttribute::Size),
            "permissions" => Some(FileAttribute::Permissions),
            "created" => Some(FileAttribute::Created),
            "modified" => Some(FileAttribute::Modified),
            "accessed" => Some(FileAttribute::Accessed),
            "tags" => Some(FileAttribute::Tags),
            _ => None,
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            FileAttribute::Name => "name",
            FileAttribute::FileName => "filename",
            FileAttribute::Extension => "extension",
            FileAttribute::Path => "path",
            FileAttribute::Parent => "parent",
            FileAttribute::Type => "type",
            FileAttribute::Kind => "kind",
            FileAttribute::Hidden => "hidden",
            FileAttribute::Size => "size",
            FileAttribute::Permissions => "permissions",
            FileAttribute::Created => "created",
            FileAttribute::Modified => "modified",
            FileAttribute::Accessed => "accessed",
            FileAttribute::Tags => "tags",
        }
    }

    /// Keys computed from the path itself; stale as soon as the file moves.
    pub fn is_path_derived(&self) -> bool {
        matches!(
            self,
            FileAttribute::Name
                | FileAttribute::FileName
                | FileAttribute::Extension
                | FileAttribute::Path
                | FileAttribute::Parent
                | FileAttribute::Type
                | FileAttribute::Hidden
        )
    }
}

/// One filesystem object under evaluation.
///
/// Attribute and metadata values are fetched from a [`MetadataProvider`] the
/// first time a key is requested and cached for the life of the entity,
/// including "unavailable" answers. A location change drops the path-derived
/// entries; dates, size and metadata stay cached.
#[derive(Debug, Clone)]
pub struct FileEntity {
    location: PathBuf,
    original_location: PathBuf,
    attributes: HashMap<String, Option<Value>>,
    metadata: HashMap<String, Option<Value>>,
    trashed: bool,
}

impl FileEntity {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            location: path.clone(),
            original_location: path,
            attributes: HashMap::new(),
            metadata: HashMap::new(),
            trashed: false,
        }
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn original_location(&self) -> &Path {
        &self.original_location
    }

    pub fn is_trashed(&self) -> bool {
        self.trashed
    }

    pub(crate) fn mark_trashed(&mut self) {
        self.trashed = true;
    }

    /// Re-points the entity after a successful move or rename.
    pub fn update_location(&mut self, new_path: PathBuf) {
        self.location = new_path;
        self.attributes.retain(|key, _| {
            FileAttribute::from_key(key).map_or(true, |attr| !attr.is_path_derived())
        });
    }

    /// Forgets a single cached key so the next lookup asks the provider again.
    pub fn invalidate(&mut self, key: &str) {
        self.attributes.remove(key);
        self.metadata.remove(key);
    }

    pub fn is_cached(&self, key: &str) -> bool {
        self.attributes.contains_key(key) || self.metadata.contains_key(key)
    }

    /// Resolves a key without a declared kind.
    pub fn value(&mut self, key: &str, provider: &dyn MetadataProvider) -> Result<Value> {
        let cache = if FileAttribute::from_key(key).is_some() {
            &mut self.attributes
        } else {
            &mut self.metadata
        };

        let cached = match cache.get(key) {
            Some(entry) => entry.clone(),
            None => {
                let fetched = match provider.resolve(&self.location, key) {
                    Ok(value) => Some(value),
                    Err(SorterError::AttributeUnavailable { .. }) => None,
                    Err(e) => return Err(e),
                };
                cache.insert(key.to_string(), fetched.clone());
                fetched
            }
        };

        cached.ok_or_else(|| SorterError::AttributeUnavailable {
            key: key.to_string(),
            path: self.location.clone(),
        })
    }

    /// Resolves a key and checks it against the declared kind.
    pub fn resolve(
        &mut self,
        key: &str,
        kind: ValueKind,
        provider: &dyn MetadataProvider,
    ) -> Result<Value> {
        let value = self.value(key, provider)?;
        if value.kind() != kind {
            return Err(SorterError::TypeMismatch {
                subject: key.to_string(),
                expected: kind,
                found: value.kind().to_string(),
            });
        }
        Ok(value)
    }
}

/// Options for file discovery
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOptions {
    /// Include files and directories whose names start with '.'
    pub show_hidden: bool,
    /// Descend into subdirectories
    pub recursive: bool,
}

/// Discovers candidate files in a directory with the default options.
pub fn discover_files(dir_path: &Path) -> io::Result<Vec<PathBuf>> {
    discover_files_with_options(dir_path, &DiscoveryOptions::default())
}

/// Discovers candidate files, skipping directories and unreadable entries.
///
/// Results are ordered by case-insensitive file name so passes are repeatable.
pub fn discover_files_with_options(
    dir_path: &Path,
    options: &DiscoveryOptions,
) -> io::Result<Vec<PathBuf>> {
    if !dir_path.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Not a directory: {}", dir_path.display()),
        ));
    }

    let max_depth = if options.recursive { usize::MAX } else { 1 };
    let walker = WalkDir::new(dir_path)
        .min_depth(1)
        .max_depth(max_depth)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || options.show_hidden
                || !entry.file_name().to_string_lossy().starts_with('.')
        });

    let mut files: Vec<PathBuf> = walker
        // Skip entries that cannot be read (permission errors, etc.)
        .filter_map(|entry| entry.ok())
        .filter(|entry| !entry.file_type().is_dir())
        .map(|entry| entry.into_path())
        .collect();

    files.sort_by_key(|path| {
        path.file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default()
    });

    Ok(files)
}

/// Parse a size string (e.g., "5MB", "100KB") into bytes
pub fn parse_size(size_str: &str) -> Option<u64> {
    let size_str = size_str.trim().to_uppercase();

    let (num_str, multiplier) = if let Some(num) = size_str.strip_suffix("GB") {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = size_str.strip_suffix("MB") {
        (num, 1024 * 1024)
    } else if let Some(num) = size_str.strip_suffix("KB") {
        (num, 1024)
    } else if let Some(num) = size_str.strip_suffix('B') {
        (num, 1)
    } else {
        // Assume bytes if no suffix
        (size_str.as_str(), 1)
    };

    let num: f64 = num_str.trim().parse().ok()?;
    if num < 0.0 {
        return None;
    }

    Some((num * multiplier as f64) as u64)
}
