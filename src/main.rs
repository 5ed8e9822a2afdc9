use sorter::cli::{AppConfig, Args};
use sorter::config::Configuration;
use sorter::domain::action::ActionExecutor;
use sorter::domain::clock::SystemClock;
use sorter::domain::condition::ConditionEvaluator;
use sorter::domain::fileops::{StdFileOperations, TrashTarget};
use sorter::domain::notifier::{ChannelNotifier, FanoutNotifier, TracingNotifier};
use sorter::domain::processor::{PassSummary, RuleProcessor};
use sorter::domain::provider::{FsMetadataProvider, TagStore};
use sorter::domain::{discover_files_with_options, DiscoveryOptions};
use sorter::logging;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Convert to config
    let config: AppConfig = args.into();
    logging::init_tracing(config.verbosity);

    match run(&config).await {
        Ok(summary) if summary.actions_failed > 0 || summary.evaluation_errors > 0 => {
            std::process::exit(2)
        }
        Ok(_) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn load_rules(config: &AppConfig) -> sorter::Result<Configuration> {
    let mut rules = match &config.config_path {
        Some(path) => Configuration::load(path)?,
        None => Configuration::load_default()?,
    };
    if config.first_match {
        rules.first_match_only = true;
    }
    Ok(rules)
}

fn open_tag_store(config: &AppConfig) -> sorter::Result<TagStore> {
    match config.tags_file.clone().or_else(TagStore::default_path) {
        Some(path) => TagStore::open(&path),
        None => {
            tracing::warn!("No data directory; tags will not be saved");
            Ok(TagStore::in_memory())
        }
    }
}

/// Runs one pass over the configured directories
async fn run(config: &AppConfig) -> sorter::Result<PassSummary> {
    let rules = load_rules(config)?;
    if rules.rules.is_empty() {
        println!("No rules configured.");
        if let Some(path) = Configuration::config_path() {
            println!("   Add rules to {} or pass --config", path.display());
        }
        return Ok(PassSummary::default());
    }

    // Discover files in every directory
    let discovery_options = DiscoveryOptions {
        show_hidden: config.show_hidden,
        recursive: config.recursive,
    };
    let mut files = Vec::new();
    for directory in &config.directories {
        files.extend(discover_files_with_options(directory, &discovery_options)?);
    }

    if files.is_empty() {
        println!("No files found.");
        return Ok(PassSummary::default());
    }

    if config.dry_run {
        println!("[DRY RUN] No files will be changed");
    }
    println!("   Found {} files, {} rules", files.len(), rules.rules.len());

    let tags = Arc::new(open_tag_store(config)?);
    let trash = match &config.trash_dir {
        Some(dir) => TrashTarget::Staging(dir.clone()),
        None => TrashTarget::System,
    };
    let ops = Arc::new(
        StdFileOperations::new(Arc::clone(&tags))
            .with_trash_target(trash)
            .with_max_unique_attempts(rules.max_unique_attempts),
    );
    let provider = Arc::new(FsMetadataProvider::new(tags));
    let clock = Arc::new(SystemClock);

    let (channel, mut events) = ChannelNotifier::new();
    let notifier = FanoutNotifier::new()
        .with(Arc::new(TracingNotifier))
        .with(Arc::new(channel));
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{}", event);
        }
    });

    let evaluator = ConditionEvaluator::new(provider.clone(), clock.clone());
    let executor = ActionExecutor::new(ops, provider, clock);
    let mut processor = RuleProcessor::new(&rules, evaluator, executor, Arc::new(notifier))
        .with_dry_run(config.dry_run);
    if let Some(jobs) = config.jobs {
        processor = processor.with_jobs(jobs);
    }

    // Ctrl-C stops dispatching new files
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted, finishing files in progress...");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let processor = Arc::new(processor);
    let summary = Arc::clone(&processor).run_pass(files, cancel).await;
    let misconfigured = processor.misconfigured_rules();

    // The processor owned the only sender, so the printer drains and stops
    drop(processor);
    if let Err(e) = printer.await {
        tracing::error!("Event printer failed: {}", e);
    }
    for rule in misconfigured {
        eprintln!("Warning: rule '{}' needs fixing, see the errors above", rule);
    }

    if config.dry_run {
        println!("\n[DRY RUN] Complete");
    }
    println!("\n{}", summary);

    Ok(summary)
}
