//! Terminal events per file, rule and action.
//!
//! Notifiers are fire-and-forget: `notify` must return quickly and never
//! fail, so a slow consumer cannot stall a pass.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    ActionSucceeded { action: String, detail: String },
    ActionFailed { action: String, error: String },
    /// Dry run: the action matched but was not performed
    WouldPerform { action: String, detail: String },
    /// The rule failed to compile and is not evaluated at all
    RuleSkipped { error: String },
    /// Evaluating the rule's condition failed for this file
    ConditionFailed { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub rule: String,
    /// Location of the file when the pass started
    pub file: Option<PathBuf>,
    pub kind: EventKind,
}

impl Event {
    pub fn is_failure(&self) -> bool {
        matches!(
            self.kind,
            EventKind::ActionFailed { .. }
                | EventKind::RuleSkipped { .. }
                | EventKind::ConditionFailed { .. }
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let file = self
            .file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string());

        match &self.kind {
            EventKind::ActionSucceeded { action, detail } => {
                write!(f, "[{}] {}: {} ({})", self.rule, file, action, detail)
            }
            EventKind::ActionFailed { action, error } => {
                write!(f, "[{}] {}: {} failed: {}", self.rule, file, action, error)
            }
            EventKind::WouldPerform { action, detail } => {
                write!(f, "[{}] {}: would {} ({})", self.rule, file, action, detail)
            }
            EventKind::RuleSkipped { error } => {
                write!(f, "[{}] rule skipped: {}", self.rule, error)
            }
            EventKind::ConditionFailed { error } => {
                write!(f, "[{}] {}: condition error: {}", self.rule, file, error)
            }
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: Event);
}

/// Logs every event through `tracing`: failures at `warn`, the rest at `debug`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: Event) {
        if event.is_failure() {
            tracing::warn!(target: "sorter::events", "{}", event);
        } else {
            tracing::debug!(target: "sorter::events", "{}", event);
        }
    }
}

/// Hands each event to several notifiers in order.
#[derive(Clone, Default)]
pub struct FanoutNotifier {
    targets: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.targets.push(notifier);
        self
    }
}

impl Notifier for FanoutNotifier {
    fn notify(&self, event: Event) {
        if let Some((last, rest)) = self.targets.split_last() {
            for target in rest {
                target.notify(event.clone());
            }
            last.notify(event);
        }
    }
}

/// Forwards events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<Event>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, event: Event) {
        // The receiver going away only means nobody is listening any more
        if self.sender.send(event).is_err() {
            tracing::trace!("event receiver dropped");
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Event>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed() -> Event {
        Event {
            rule: "PDFs".to_string(),
            file: Some(PathBuf::from("/in/a.pdf")),
            kind: EventKind::ActionFailed {
                action: "move".to_string(),
                error: "permission denied".to_string(),
            },
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(
            failed().to_string(),
            "[PDFs] /in/a.pdf: move failed: permission denied"
        );

        let skipped = Event {
            rule: "bad".to_string(),
            file: None,
            kind: EventKind::RuleSkipped {
                error: "boom".to_string(),
            },
        };
        assert_eq!(skipped.to_string(), "[bad] rule skipped: boom");
        assert!(skipped.is_failure());
    }

    #[test]
    fn test_recording_notifier_keeps_order() {
        let notifier = RecordingNotifier::new();
        notifier.notify(failed());
        notifier.notify(Event {
            rule: "PDFs".to_string(),
            file: None,
            kind: EventKind::ActionSucceeded {
                action: "add_tag".to_string(),
                detail: "tags [x]".to_string(),
            },
        });

        let events = notifier.events();
        assert_eq!(events.len(), 2);
        assert!(events[0].is_failure());
        assert!(!events[1].is_failure());
    }

    #[tokio::test]
    async fn test_channel_notifier_forwards_events() {
        let (notifier, mut receiver) = ChannelNotifier::new();
        notifier.notify(failed());
        drop(notifier);

        assert_eq!(receiver.recv().await, Some(failed()));
        assert_eq!(receiver.recv().await, None);
    }

    #[test]
    fn test_fanout_reaches_every_target() {
        let first = Arc::new(RecordingNotifier::new());
        let second = Arc::new(RecordingNotifier::new());
        let fanout = FanoutNotifier::new()
            .with(first.clone())
            .with(second.clone());

        fanout.notify(failed());

        assert_eq!(first.events(), vec![failed()]);
        assert_eq!(second.events(), vec![failed()]);
        FanoutNotifier::new().notify(failed());
    }

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_tracing_notifier_logs_failures_as_warnings() {
        let buffer = SharedBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            TracingNotifier.notify(failed());
            TracingNotifier.notify(Event {
                rule: "PDFs".to_string(),
                file: None,
                kind: EventKind::ActionSucceeded {
                    action: "add_tag".to_string(),
                    detail: "tags [quiet]".to_string(),
                },
            });
        });

        let output = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("WARN"));
        assert!(output.contains("move failed: permission denied"));
        // Successes are debug-level and filtered out here
        assert!(!output.contains("quiet"));
    }

    #[test]
    fn test_channel_notifier_survives_closed_receiver() {
        let (notifier, receiver) = ChannelNotifier::new();
        drop(receiver);
        notifier.notify(failed());
    }
}
