//! Action compilation and execution.
//!
//! Every action is all-or-nothing from the caller's point of view: when
//! [`ActionExecutor::perform`] returns an error the entity still points at the
//! path it had before the call.

use super::clock::Clock;
use super::fileops::{generate_unique_file_name_with, DirectoryLocks, FileOpError, FileOperations};
use super::provider::MetadataProvider;
use super::tokenizer::{ldml_to_strftime, Segment, Template};
use super::{FileEntity, Value, ValueKind};
use crate::config::{ActionSpec, DEFAULT_UNIQUE_ATTEMPTS};
use crate::error::{Result, SorterError};
use chrono::{DateTime, Local, Utc};
use std::fmt::{self, Write as _};
use std::fs;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::sync::{Arc, PoisonError};

/// A compiled action. Name and path parameters are pre-tokenized templates.
#[derive(Debug, Clone)]
pub enum Action {
    Rename(Template),
    Prepend(Template),
    Append(Template),
    Move(Template),
    Copy { to: Template, follow: bool },
    ChangeExtension(Template),
    AddTag(Template),
    RemoveTag(Template),
    UpdateTags(Vec<Template>),
    CreateAlias(Template),
    MoveToTrash,
    RunCommand {
        program: Template,
        args: Vec<Template>,
        fatal: bool,
    },
}

impl Action {
    pub fn compile(spec: &ActionSpec, max_depth: usize) -> Result<Self> {
        let parse = |source: &str| Template::parse_with_depth(source, max_depth);

        let action = match spec {
            ActionSpec::Rename { to } => Action::Rename(parse(to)?),
            ActionSpec::Prepend { text } => Action::Prepend(parse(text)?),
            ActionSpec::Append { text } => Action::Append(parse(text)?),
            ActionSpec::Move { to } => Action::Move(parse(to)?),
            ActionSpec::Copy { to, follow } => Action::Copy {
                to: parse(to)?,
                follow: *follow,
            },
            ActionSpec::ChangeExtension { to } => Action::ChangeExtension(parse(to)?),
            ActionSpec::AddTag { tag } => Action::AddTag(parse(tag)?),
            ActionSpec::RemoveTag { tag } => Action::RemoveTag(parse(tag)?),
            ActionSpec::UpdateTags { tags } => {
                Action::UpdateTags(tags.iter().map(|t| parse(t)).collect::<Result<_>>()?)
            }
            ActionSpec::CreateAlias { at } => Action::CreateAlias(parse(at)?),
            ActionSpec::MoveToTrash => Action::MoveToTrash,
            ActionSpec::RunCommand {
                program,
                args,
                fatal,
            } => Action::RunCommand {
                program: parse(program)?,
                args: args.iter().map(|a| parse(a)).collect::<Result<_>>()?,
                fatal: *fatal,
            },
        };
        Ok(action)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::Rename(_) => "rename",
            Action::Prepend(_) => "prepend",
            Action::Append(_) => "append",
            Action::Move(_) => "move",
            Action::Copy { .. } => "copy",
            Action::ChangeExtension(_) => "change_extension",
            Action::AddTag(_) => "add_tag",
            Action::RemoveTag(_) => "remove_tag",
            Action::UpdateTags(_) => "update_tags",
            Action::CreateAlias(_) => "create_alias",
            Action::MoveToTrash => "move_to_trash",
            Action::RunCommand { .. } => "run_command",
        }
    }

    /// Whether a failure of this action stops the rest of the rule.
    pub fn aborts_rule_on_failure(&self) -> bool {
        !matches!(self, Action::RunCommand { fatal: false, .. })
    }
}

/// What a successful action did.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Relocated { from: PathBuf, to: PathBuf },
    Copied { to: PathBuf, followed: bool },
    TagsUpdated(Vec<String>),
    AliasCreated(PathBuf),
    Trashed,
    CommandSucceeded,
    /// The action resolved to the file's current state
    Unchanged,
}

impl fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionOutcome::Relocated { to, .. } => write!(f, "now at {}", to.display()),
            ActionOutcome::Copied { to, .. } => write!(f, "copied to {}", to.display()),
            ActionOutcome::TagsUpdated(tags) => write!(f, "tags [{}]", tags.join(", ")),
            ActionOutcome::AliasCreated(link) => write!(f, "alias at {}", link.display()),
            ActionOutcome::Trashed => write!(f, "moved to trash"),
            ActionOutcome::CommandSucceeded => write!(f, "command succeeded"),
            ActionOutcome::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Runs external programs for `run_command`.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<()>;
}

/// [`CommandRunner`] built on `duct`. Output is captured, not inherited.
#[derive(Debug, Clone, Copy, Default)]
pub struct DuctRunner;

impl CommandRunner for DuctRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<()> {
        let output = duct::cmd(program, args)
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .run()
            .map_err(|e| SorterError::CommandFailed {
                program: program.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SorterError::CommandFailed {
                program: program.to_string(),
                reason: format!("{}: {}", output.status, stderr.trim()),
            });
        }

        tracing::debug!(
            "{} wrote {} bytes to stdout",
            program,
            output.stdout.len()
        );
        Ok(())
    }
}

/// Performs compiled actions against file entities.
#[derive(Clone)]
pub struct ActionExecutor {
    ops: Arc<dyn FileOperations>,
    provider: Arc<dyn MetadataProvider>,
    runner: Arc<dyn CommandRunner>,
    clock: Arc<dyn Clock>,
    locks: Arc<DirectoryLocks>,
    max_unique_attempts: usize,
}

impl ActionExecutor {
    pub fn new(
        ops: Arc<dyn FileOperations>,
        provider: Arc<dyn MetadataProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ops,
            provider,
            runner: Arc::new(DuctRunner),
            clock,
            locks: Arc::new(DirectoryLocks::new()),
            max_unique_attempts: DEFAULT_UNIQUE_ATTEMPTS,
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_locks(mut self, locks: Arc<DirectoryLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_max_unique_attempts(mut self, attempts: usize) -> Self {
        self.max_unique_attempts = attempts;
        self
    }

    pub fn perform(&self, action: &Action, file: &mut FileEntity) -> Result<ActionOutcome> {
        match action {
            Action::Rename(template) => {
                let name = self.expand_name(template, file)?;
                let candidate = with_stem(file.location(), &name);
                self.relocate(file, candidate)
            }
            Action::Prepend(template) => {
                let text = self.expand(template, file)?;
                let name = format!("{}{}", text, stem(file.location()));
                validate_name(&name)?;
                let candidate = with_stem(file.location(), &name);
                self.relocate(file, candidate)
            }
            Action::Append(template) => {
                let text = self.expand(template, file)?;
                let name = format!("{}{}", stem(file.location()), text);
                validate_name(&name)?;
                let candidate = with_stem(file.location(), &name);
                self.relocate(file, candidate)
            }
            Action::ChangeExtension(template) => {
                let expanded = self.expand(template, file)?;
                let extension = expanded.trim_start_matches('.');
                let name = if extension.is_empty() {
                    stem(file.location())
                } else {
                    format!("{}.{}", stem(file.location()), extension)
                };
                validate_name(&name)?;
                let candidate = file.location().with_file_name(name);
                self.relocate(file, candidate)
            }
            Action::Move(template) => {
                let dir = self.expand_dir(template, file)?;
                let candidate = dir.join(file_name(file.location())?);
                let created = self.prepare_dir(&dir)?;
                let result = self.relocate(file, candidate);
                if result.is_err() {
                    self.discard_dirs(&created);
                }
                result
            }
            Action::Copy { to, follow } => self.copy(to, *follow, file),
            Action::AddTag(template) => {
                let tag = self.expand_tag(template, file)?;
                let mut tags = self.ops.read_tags(file.location());
                if !tags.contains(&tag) {
                    tags.push(tag);
                }
                self.store_tags(file, tags)
            }
            Action::RemoveTag(template) => {
                let tag = self.expand_tag(template, file)?;
                let mut tags = self.ops.read_tags(file.location());
                tags.retain(|t| *t != tag);
                self.store_tags(file, tags)
            }
            Action::UpdateTags(templates) => {
                let mut tags: Vec<String> = Vec::with_capacity(templates.len());
                for template in templates {
                    let tag = self.expand_tag(template, file)?;
                    if !tags.contains(&tag) {
                        tags.push(tag);
                    }
                }
                self.store_tags(file, tags)
            }
            Action::CreateAlias(template) => self.create_alias(template, file),
            Action::MoveToTrash => {
                self.ops.trash(file.location())?;
                file.mark_trashed();
                Ok(ActionOutcome::Trashed)
            }
            Action::RunCommand { program, args, .. } => {
                let program = self.expand(program, file)?;
                let args = if args.is_empty() {
                    vec![file.location().to_string_lossy().into_owned()]
                } else {
                    args.iter()
                        .map(|arg| self.expand(arg, file))
                        .collect::<Result<Vec<_>>>()?
                };
                tracing::debug!("running {} {:?}", program, args);
                self.runner.run(&program, &args)?;
                Ok(ActionOutcome::CommandSucceeded)
            }
        }
    }

    /// One-line description of what `action` would do, without touching the
    /// filesystem. Destinations are shown before uniqueness resolution.
    pub fn describe(&self, action: &Action, file: &mut FileEntity) -> Result<String> {
        let description = match action {
            Action::Rename(template) => {
                let name = self.expand_name(template, file)?;
                format!("rename to {}", display_name(&with_stem(file.location(), &name)))
            }
            Action::Prepend(template) => format!("prepend '{}'", self.expand(template, file)?),
            Action::Append(template) => format!("append '{}'", self.expand(template, file)?),
            Action::ChangeExtension(template) => {
                format!("change extension to '{}'", self.expand(template, file)?)
            }
            Action::Move(template) => {
                format!("move into {}", self.expand_dir(template, file)?.display())
            }
            Action::Copy { to, .. } => format!("copy into {}", self.expand_dir(to, file)?.display()),
            Action::AddTag(template) => format!("add tag '{}'", self.expand_tag(template, file)?),
            Action::RemoveTag(template) => {
                format!("remove tag '{}'", self.expand_tag(template, file)?)
            }
            Action::UpdateTags(templates) => {
                let tags = templates
                    .iter()
                    .map(|t| self.expand_tag(t, file))
                    .collect::<Result<Vec<_>>>()?;
                format!("set tags [{}]", tags.join(", "))
            }
            Action::CreateAlias(template) => {
                format!("create alias in {}", self.expand_dir(template, file)?.display())
            }
            Action::MoveToTrash => "move to trash".to_string(),
            Action::RunCommand { program, .. } => format!("run {}", self.expand(program, file)?),
        };
        Ok(description)
    }

    /// Substitutes the entity's values into a template.
    pub fn expand(&self, template: &Template, file: &mut FileEntity) -> Result<String> {
        self.expand_segments(template.segments(), file)
    }

    fn expand_segments(&self, segments: &[Segment], file: &mut FileEntity) -> Result<String> {
        let mut out = String::new();
        for segment in segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(placeholder) => {
                    let value = self.placeholder_value(&placeholder.key, file)?;
                    match &placeholder.format {
                        None => out.push_str(&value.render()),
                        Some(format) => {
                            let pattern = self.expand_pattern(format, file)?;
                            let date = value.as_date().ok_or_else(|| SorterError::TypeMismatch {
                                subject: placeholder.key.clone(),
                                expected: ValueKind::Date,
                                found: value.kind().to_string(),
                            })?;
                            format_date(&mut out, date, &pattern)?;
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Expands a date pattern. Values of nested placeholders are quoted so
    /// their letters are not read as pattern fields.
    fn expand_pattern(&self, segments: &[Segment], file: &mut FileEntity) -> Result<String> {
        let mut pattern = String::new();
        for segment in segments {
            match segment {
                Segment::Literal(text) => pattern.push_str(text),
                Segment::Placeholder(_) => {
                    let value = self.expand_segments(std::slice::from_ref(segment), file)?;
                    pattern.push_str(&quote_ldml(&value));
                }
            }
        }
        Ok(pattern)
    }

    fn placeholder_value(&self, key: &str, file: &mut FileEntity) -> Result<Value> {
        let modified_part = |file: &mut FileEntity, spec: &str| -> Result<Value> {
            let modified = file.resolve("modified", ValueKind::Date, self.provider.as_ref())?;
            let date = modified.as_date().unwrap_or_default();
            Ok(Value::String(date.with_timezone(&Local).format(spec).to_string()))
        };

        match key {
            "year" => modified_part(file, "%Y"),
            "month" => modified_part(file, "%m"),
            "day" => modified_part(file, "%d"),
            "date" => file.resolve("modified", ValueKind::Date, self.provider.as_ref()),
            "now" => Ok(Value::Date(self.clock.now())),
            _ => file.value(key, self.provider.as_ref()),
        }
    }

    fn expand_name(&self, template: &Template, file: &mut FileEntity) -> Result<String> {
        let name = self.expand(template, file)?;
        validate_name(&name)?;
        Ok(name)
    }

    fn expand_tag(&self, template: &Template, file: &mut FileEntity) -> Result<String> {
        let tag = self.expand(template, file)?;
        if tag.trim().is_empty() {
            return Err(SorterError::ConfigError(format!(
                "tag template '{}' expands to an empty tag",
                template.source()
            )));
        }
        Ok(tag)
    }

    /// Expands a destination directory: `~` is the home directory and
    /// relative paths start at the file's current directory.
    fn expand_dir(&self, template: &Template, file: &mut FileEntity) -> Result<PathBuf> {
        let expanded = self.expand(template, file)?;
        if expanded.trim().is_empty() {
            return Err(SorterError::InvalidFileName(expanded));
        }

        let path = match expanded.strip_prefix('~') {
            Some(rest) if rest.is_empty() || rest.starts_with(['/', MAIN_SEPARATOR]) => {
                let home = dirs::home_dir().ok_or_else(|| {
                    SorterError::ConfigError("Could not determine home directory".to_string())
                })?;
                home.join(rest.trim_start_matches(['/', MAIN_SEPARATOR]))
            }
            _ => PathBuf::from(&expanded),
        };

        if path.is_absolute() {
            return Ok(path);
        }
        let base = file.location().parent().unwrap_or_else(|| Path::new("."));
        Ok(base.join(path))
    }

    /// Moves the entity to `candidate`, or the first free variant of it.
    fn relocate(&self, file: &mut FileEntity, candidate: PathBuf) -> Result<ActionOutcome> {
        let from = file.location().to_path_buf();
        if same_path(&from, &candidate) {
            return Ok(ActionOutcome::Unchanged);
        }

        let to = self.commit_unique(&candidate, |target| self.ops.move_item(&from, target))?;
        tracing::info!("{} -> {}", from.display(), to.display());
        file.update_location(to.clone());
        file.invalidate("tags");
        Ok(ActionOutcome::Relocated { from, to })
    }

    /// Creates `dir` and returns the directories that did not exist before,
    /// deepest first.
    fn prepare_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let created: Vec<PathBuf> = dir
            .ancestors()
            .take_while(|p| !p.as_os_str().is_empty() && !self.ops.exists(p))
            .map(Path::to_path_buf)
            .collect();
        self.ops.create_dir_all(dir)?;
        Ok(created)
    }

    /// Removes directories made by [`Self::prepare_dir`] for an action that
    /// then failed. Directories something else has filled in are kept.
    fn discard_dirs(&self, created: &[PathBuf]) {
        for dir in created {
            if let Err(e) = self.ops.remove_empty_dir(dir) {
                tracing::debug!("keeping {}: {}", dir.display(), e);
                break;
            }
        }
    }

    fn copy(&self, template: &Template, follow: bool, file: &mut FileEntity) -> Result<ActionOutcome> {
        let dir = self.expand_dir(template, file)?;
        let from = file.location().to_path_buf();
        let candidate = dir.join(file_name(&from)?);

        let created = self.prepare_dir(&dir)?;
        let to = self
            .commit_unique(&candidate, |target| self.ops.copy_item(&from, target))
            .inspect_err(|_| self.discard_dirs(&created))?;
        tracing::info!("{} copied to {}", from.display(), to.display());

        if follow {
            file.update_location(to.clone());
            for key in ["created", "accessed", "tags"] {
                file.invalidate(key);
            }
        }
        Ok(ActionOutcome::Copied { to, followed: follow })
    }

    fn create_alias(&self, template: &Template, file: &mut FileEntity) -> Result<ActionOutcome> {
        let dir = self.expand_dir(template, file)?;
        let target = file.location().to_path_buf();
        let candidate = dir.join(file_name(&target)?);

        let created = self.prepare_dir(&dir)?;
        let link = self
            .commit_unique(&candidate, |link| self.ops.create_alias(&target, link))
            .inspect_err(|_| self.discard_dirs(&created))?;
        tracing::info!("alias {} -> {}", link.display(), target.display());
        Ok(ActionOutcome::AliasCreated(link))
    }

    /// Resolves a free name next to `candidate` and runs `commit` on it while
    /// holding the directory lock. A name taken between the check and the
    /// commit triggers another round of resolution.
    fn commit_unique(
        &self,
        candidate: &Path,
        commit: impl Fn(&Path) -> std::result::Result<(), FileOpError>,
    ) -> Result<PathBuf> {
        let dir = candidate.parent().unwrap_or_else(|| Path::new("."));
        let lock = self.locks.lock_for(dir);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        for _ in 0..self.max_unique_attempts.max(1) {
            let target = generate_unique_file_name_with(candidate, self.max_unique_attempts, |p| {
                self.ops.exists(p)
            })?;
            match commit(&target) {
                Ok(()) => return Ok(target),
                Err(FileOpError::AlreadyExists(taken)) => {
                    tracing::debug!("{} was taken, resolving again", taken.display());
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(SorterError::NameResolutionExhausted {
            path: candidate.to_path_buf(),
            attempts: self.max_unique_attempts,
        })
    }

    fn store_tags(&self, file: &mut FileEntity, tags: Vec<String>) -> Result<ActionOutcome> {
        self.ops.write_tags(file.location(), tags.clone())?;
        file.invalidate("tags");
        tracing::info!("{} tags [{}]", file.location().display(), tags.join(", "));
        Ok(ActionOutcome::TagsUpdated(tags))
    }
}

fn format_date(out: &mut String, date: DateTime<Utc>, pattern: &str) -> Result<()> {
    let strftime = ldml_to_strftime(pattern);
    write!(out, "{}", date.with_timezone(&Local).format(&strftime)).map_err(|_| {
        SorterError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: "not a valid date format".to_string(),
        }
    })
}

/// Makes `text` literal inside an LDML pattern: runs are quoted and each
/// `'` is written as `''` between them.
fn quote_ldml(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    for (i, part) in text.split('\'').enumerate() {
        if i > 0 {
            out.push_str("''");
        }
        if !part.is_empty() {
            out.push('\'');
            out.push_str(part);
            out.push('\'');
        }
    }
    out
}

/// Rejects names that would escape or collapse the destination directory.
fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains(MAIN_SEPARATOR)
    {
        return Err(SorterError::InvalidFileName(name.to_string()));
    }
    Ok(())
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn file_name(path: &Path) -> Result<&std::ffi::OsStr> {
    path.file_name()
        .ok_or_else(|| SorterError::InvalidFileName(path.display().to_string()))
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `path` with its stem replaced and its extension kept.
fn with_stem(path: &Path, new_stem: &str) -> PathBuf {
    match path.extension() {
        Some(ext) => path.with_file_name(format!("{}.{}", new_stem, ext.to_string_lossy())),
        None => path.with_file_name(new_stem),
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
