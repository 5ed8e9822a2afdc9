//! Sorter - a rule-based file organizer library
//!
//! This crate provides the rule engine behind the `sorter` binary: typed
//! conditions over file attributes, templated actions that rename, move,
//! copy, tag, alias or trash files, and a bounded concurrent processing pass.

pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;

// Re-export primary types for convenience
pub use config::{ActionSpec, ConditionSpec, Configuration, MatchSpec, Rule};
pub use domain::action::{Action, ActionExecutor, ActionOutcome, CommandRunner, DuctRunner};
pub use domain::clock::{Clock, FixedClock, SystemClock};
pub use domain::condition::{Condition, ConditionEvaluator, Match};
pub use domain::fileops::{
    generate_unique_file_name, DirectoryLocks, FileOpError, FileOperations, StdFileOperations,
    TrashTarget,
};
pub use domain::notifier::{
    ChannelNotifier, Event, EventKind, FanoutNotifier, Notifier, TracingNotifier,
};
pub use domain::processor::{FileReport, PassSummary, RuleProcessor};
pub use domain::provider::{FsMetadataProvider, MetadataProvider, TagStore};
pub use domain::tokenizer::{tokenize, Segment, Template};
pub use domain::{
    discover_files, discover_files_with_options, DiscoveryOptions, FileEntity, FileType, Value,
    ValueKind,
};
pub use error::{Result, SorterError};
