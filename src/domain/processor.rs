//! Rule processing: one pass applies the ordered rule list to every file.
//!
//! Per file the processor walks `Idle -> Evaluating(i) -> Acting(i) -> ...
//! -> Done`. Files are independent and run on a bounded pool of blocking
//! tasks; within one file everything is sequential.

use super::action::{Action, ActionExecutor};
use super::condition::{ConditionEvaluator, Match};
use super::notifier::{Event, EventKind, Notifier};
use super::FileEntity;
use crate::config::Configuration;
use crate::error::{Result, SorterError};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// A rule whose condition and actions compiled successfully.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    pub condition: Match,
    pub actions: Vec<Action>,
}

impl CompiledRule {
    fn compile(name: String, rule: &crate::config::Rule, max_depth: usize) -> Result<Self> {
        let condition = Match::compile(&rule.condition)?;
        let actions = rule
            .actions
            .iter()
            .map(|spec| Action::compile(spec, max_depth))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name,
            condition,
            actions,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassState {
    Idle,
    Evaluating(usize),
    Acting(usize),
    Done,
}

/// What happened to one file during a pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileReport {
    pub matched_rules: Vec<String>,
    pub actions_succeeded: usize,
    pub actions_failed: usize,
    pub evaluation_errors: usize,
    pub transitions: Vec<PassState>,
}

/// Totals for a whole pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub files_processed: usize,
    pub rule_matches: usize,
    pub actions_succeeded: usize,
    pub actions_failed: usize,
    pub evaluation_errors: usize,
    pub skipped_rules: usize,
    pub cancelled: bool,
}

impl PassSummary {
    fn record(&mut self, report: &FileReport) {
        self.files_processed += 1;
        self.rule_matches += report.matched_rules.len();
        self.actions_succeeded += report.actions_succeeded;
        self.actions_failed += report.actions_failed;
        self.evaluation_errors += report.evaluation_errors;
    }
}

impl fmt::Display for PassSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} files, {} rule matches, {} actions ok, {} failed, {} evaluation errors, {} rules skipped",
            self.files_processed,
            self.rule_matches,
            self.actions_succeeded,
            self.actions_failed,
            self.evaluation_errors,
            self.skipped_rules
        )?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}

pub struct RuleProcessor {
    rules: Vec<CompiledRule>,
    skipped_rules: usize,
    /// Set once a rule has produced a configuration error at run time
    misconfigured: Vec<AtomicBool>,
    evaluator: ConditionEvaluator,
    executor: ActionExecutor,
    notifier: Arc<dyn Notifier>,
    first_match_only: bool,
    dry_run: bool,
    jobs: usize,
}

impl RuleProcessor {
    /// Compiles the configuration once for the whole pass. Rules that fail to
    /// compile are reported to the notifier and left out.
    pub fn new(
        config: &Configuration,
        evaluator: ConditionEvaluator,
        executor: ActionExecutor,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let mut rules = Vec::with_capacity(config.rules.len());
        let mut skipped_rules = 0;

        for (index, rule) in config.rules.iter().enumerate() {
            let name = if rule.name.is_empty() {
                format!("rule #{}", index + 1)
            } else {
                rule.name.clone()
            };

            match CompiledRule::compile(name.clone(), rule, config.max_template_depth) {
                Ok(compiled) => rules.push(compiled),
                Err(e) => {
                    skipped_rules += 1;
                    notifier.notify(Event {
                        rule: name,
                        file: None,
                        kind: EventKind::RuleSkipped {
                            error: e.to_string(),
                        },
                    });
                }
            }
        }

        let jobs = std::thread::available_parallelism().map_or(4, |n| n.get());
        let misconfigured = rules.iter().map(|_| AtomicBool::new(false)).collect();

        Self {
            rules,
            skipped_rules,
            misconfigured,
            evaluator,
            executor: executor.with_max_unique_attempts(config.max_unique_attempts),
            notifier,
            first_match_only: config.first_match_only,
            dry_run: false,
            jobs,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    pub fn skipped_rules(&self) -> usize {
        self.skipped_rules
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Rules that hit a configuration error while processing files.
    pub fn misconfigured_rules(&self) -> Vec<String> {
        self.rules
            .iter()
            .zip(&self.misconfigured)
            .filter(|(_, flag)| flag.load(Ordering::Relaxed))
            .map(|(rule, _)| rule.name.clone())
            .collect()
    }

    /// Applies every rule, in order, to one file.
    pub fn process_file(&self, file: &mut FileEntity) -> FileReport {
        let mut report = FileReport::default();
        self.transition(file, &mut report, PassState::Idle);

        for (index, rule) in self.rules.iter().enumerate() {
            if file.is_trashed() {
                break;
            }

            self.transition(file, &mut report, PassState::Evaluating(index));
            let matched = match self.evaluator.evaluate_match(&rule.condition, file) {
                Ok(matched) => matched,
                Err(e) => {
                    report.evaluation_errors += 1;
                    self.note_misconfiguration(index, &e);
                    self.emit(rule, file, EventKind::ConditionFailed {
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            if !matched {
                continue;
            }

            report.matched_rules.push(rule.name.clone());
            self.transition(file, &mut report, PassState::Acting(index));
            self.run_actions(index, file, &mut report);

            if self.first_match_only {
                break;
            }
        }

        self.transition(file, &mut report, PassState::Done);
        report
    }

    fn run_actions(&self, index: usize, file: &mut FileEntity, report: &mut FileReport) {
        let rule = &self.rules[index];
        for action in &rule.actions {
            if file.is_trashed() {
                break;
            }

            if self.dry_run {
                match self.executor.describe(action, file) {
                    Ok(detail) => {
                        report.actions_succeeded += 1;
                        self.emit(rule, file, EventKind::WouldPerform {
                            action: action.name().to_string(),
                            detail,
                        });
                    }
                    Err(e) => self.action_failed(index, action, file, report, &e),
                }
                continue;
            }

            match self.executor.perform(action, file) {
                Ok(outcome) => {
                    report.actions_succeeded += 1;
                    self.emit(rule, file, EventKind::ActionSucceeded {
                        action: action.name().to_string(),
                        detail: outcome.to_string(),
                    });
                }
                Err(e) => {
                    self.action_failed(index, action, file, report, &e);
                    if action.aborts_rule_on_failure() {
                        tracing::warn!(
                            "'{}': skipping remaining actions for {}",
                            rule.name,
                            file.original_location().display()
                        );
                        break;
                    }
                }
            }
        }
    }

    fn action_failed(
        &self,
        index: usize,
        action: &Action,
        file: &FileEntity,
        report: &mut FileReport,
        error: &SorterError,
    ) {
        report.actions_failed += 1;
        self.note_misconfiguration(index, error);
        self.emit(&self.rules[index], file, EventKind::ActionFailed {
            action: action.name().to_string(),
            error: error.to_string(),
        });
    }

    /// Warns once per rule when an error points at the rule itself rather
    /// than at the file being processed.
    fn note_misconfiguration(&self, index: usize, error: &SorterError) {
        if !error.is_configuration_error() {
            return;
        }
        if !self.misconfigured[index].swap(true, Ordering::Relaxed) {
            tracing::warn!(
                "rule '{}' is misconfigured: {}",
                self.rules[index].name,
                error
            );
        }
    }

    fn transition(&self, file: &FileEntity, report: &mut FileReport, state: PassState) {
        tracing::debug!("{}: {:?}", file.location().display(), state);
        report.transitions.push(state);
    }

    fn emit(&self, rule: &CompiledRule, file: &FileEntity, kind: EventKind) {
        self.notifier.notify(Event {
            rule: rule.name.clone(),
            file: Some(file.original_location().to_path_buf()),
            kind,
        });
    }

    /// Processes `paths` with at most `jobs` files in flight.
    ///
    /// Cancellation is checked before each file is dispatched; files already
    /// running finish normally.
    pub async fn run_pass(self: Arc<Self>, paths: Vec<PathBuf>, cancel: Arc<AtomicBool>) -> PassSummary {
        let mut summary = PassSummary {
            skipped_rules: self.skipped_rules,
            ..Default::default()
        };
        if self.rules.is_empty() {
            tracing::info!("No rules to apply");
        }

        let semaphore = Arc::new(Semaphore::new(self.jobs));
        let mut join_set: JoinSet<FileReport> = JoinSet::new();

        for path in paths {
            if cancel.load(Ordering::Relaxed) {
                summary.cancelled = true;
                break;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            // A slot may have taken a while to free up
            if cancel.load(Ordering::Relaxed) {
                summary.cancelled = true;
                break;
            }

            let processor = Arc::clone(&self);
            join_set.spawn_blocking(move || {
                let _permit = permit;
                let mut file = FileEntity::new(path);
                processor.process_file(&mut file)
            });
        }

        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(report) => summary.record(&report),
                Err(e) => tracing::error!("File task failed: {}", e),
            }
        }

        tracing::info!("Pass finished: {}", summary);
        summary
    }
}
