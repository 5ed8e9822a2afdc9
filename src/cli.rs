// CLI module for argument parsing and configuration

use clap::{ArgAction, Parser};
use std::path::PathBuf;

/// Sorter - rule-based file organizer
///
/// Applies the rules from a JSON configuration to every file in the given
/// directories: rename, move, copy, tag, alias or trash what matches.
#[derive(Parser, Debug, Clone)]
#[command(name = "sorter")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Directories to organize
    ///
    /// If not specified, defaults to the current directory.
    #[arg(default_value = ".")]
    pub directories: Vec<PathBuf>,

    /// Rule configuration file
    ///
    /// Defaults to ~/.config/sorter/rules.json
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Dry run mode - report matching actions without performing them
    #[arg(short = 'n', long = "dry-run", action = ArgAction::SetTrue)]
    pub dry_run: bool,

    /// Include hidden files (files starting with .)
    #[arg(long = "hidden", action = ArgAction::SetTrue)]
    pub show_hidden: bool,

    /// Descend into subdirectories
    #[arg(short = 'R', long = "recursive", action = ArgAction::SetTrue)]
    pub recursive: bool,

    /// Number of files processed at the same time
    #[arg(short = 'j', long = "jobs")]
    pub jobs: Option<usize>,

    /// Move trashed files into this directory instead of the system trash
    #[arg(long = "trash-dir")]
    pub trash_dir: Option<PathBuf>,

    /// Tag store file
    ///
    /// Defaults to ~/.local/share/sorter/tags.json
    #[arg(long = "tags-file")]
    pub tags_file: Option<PathBuf>,

    /// Stop at the first matching rule for each file
    #[arg(long = "first-match", action = ArgAction::SetTrue)]
    pub first_match: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Args::parse()
    }

    /// Validate the arguments and return any errors
    pub fn validate(&self) -> Result<(), String> {
        for directory in &self.directories {
            if !directory.exists() {
                return Err(format!(
                    "Directory does not exist: {}",
                    directory.display()
                ));
            }

            if !directory.is_dir() {
                return Err(format!("Path is not a directory: {}", directory.display()));
            }
        }

        if let Some(config) = &self.config {
            if !config.is_file() {
                return Err(format!("Config file not found: {}", config.display()));
            }
        }

        if self.jobs == Some(0) {
            return Err("--jobs must be at least 1".to_string());
        }

        if let Some(trash_dir) = &self.trash_dir {
            if trash_dir.exists() && !trash_dir.is_dir() {
                return Err(format!(
                    "Trash directory is not a directory: {}",
                    trash_dir.display()
                ));
            }
        }

        Ok(())
    }
}

/// Configuration derived from CLI arguments
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub directories: Vec<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub dry_run: bool,
    pub show_hidden: bool,
    pub recursive: bool,
    pub jobs: Option<usize>,
    pub trash_dir: Option<PathBuf>,
    pub tags_file: Option<PathBuf>,
    pub first_match: bool,
    pub verbosity: u8,
}

impl From<Args> for AppConfig {
    fn from(args: Args) -> Self {
        AppConfig {
            directories: args.directories,
            config_path: args.config,
            dry_run: args.dry_run,
            show_hidden: args.show_hidden,
            recursive: args.recursive,
            jobs: args.jobs,
            trash_dir: args.trash_dir,
            tags_file: args.tags_file,
            first_match: args.first_match,
            verbosity: args.verbose,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            directories: vec![PathBuf::from(".")],
            config_path: None,
            dry_run: false,
            show_hidden: false,
            recursive: false,
            jobs: None,
            trash_dir: None,
            tags_file: None,
            first_match: false,
            verbosity: 0,
        }
    }
}
