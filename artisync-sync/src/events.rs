//! Completion aggregation.
//!
//! Every job reports exactly one [`JobEvent`] to a single ordered sink per
//! session. A pipeline that needs several jobs opens a batch with the number
//! of jobs it will submit and awaits the batch outcome instead of the
//! individual completions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};

use artisync_core::SaveName;

use crate::job::JobOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    pub save_name: SaveName,
    pub batch: Option<BatchId>,
    pub outcome: JobOutcome,
}

/// Aggregate of one batch, in completion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: Vec<SaveName>,
    pub deduped: Vec<SaveName>,
    pub failed: Vec<(SaveName, String)>,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn completed(&self) -> usize {
        self.succeeded.len() + self.deduped.len() + self.failed.len()
    }

    fn record(&mut self, event: &JobEvent) {
        match &event.outcome {
            JobOutcome::Uploaded => self.succeeded.push(event.save_name.clone()),
            JobOutcome::Deduped => self.deduped.push(event.save_name.clone()),
            JobOutcome::Failed(reason) => self
                .failed
                .push((event.save_name.clone(), reason.clone())),
        }
    }
}

enum Message {
    Open {
        batch: BatchId,
        expected: usize,
        respond_to: oneshot::Sender<BatchOutcome>,
    },
    Event(JobEvent),
}

struct Tracker {
    expected: usize,
    outcome: BatchOutcome,
    respond_to: oneshot::Sender<BatchOutcome>,
}

/// Writing end used by the scheduler.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Message>,
}

impl EventSender {
    pub fn send(&self, event: JobEvent) {
        if self.tx.send(Message::Event(event)).is_err() {
            tracing::debug!("completion sink closed, dropping job event");
        }
    }
}

/// Session-wide completion sink.
#[derive(Clone)]
pub struct CompletionSink {
    tx: mpsc::UnboundedSender<Message>,
    next_batch: Arc<AtomicU64>,
    broadcast: broadcast::Sender<JobEvent>,
}

impl CompletionSink {
    /// Spawn the aggregator task on the current runtime.
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (broadcast, _) = broadcast::channel(256);
        tokio::spawn(aggregate(rx, broadcast.clone()));
        Self {
            tx,
            next_batch: Arc::new(AtomicU64::new(1)),
            broadcast,
        }
    }

    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    /// Open a batch of `expected` jobs. Must be called before the first job
    /// of the batch is submitted. A batch of zero resolves immediately.
    pub fn open_batch(&self, expected: usize) -> (BatchId, oneshot::Receiver<BatchOutcome>) {
        let batch = BatchId(self.next_batch.fetch_add(1, Ordering::Relaxed));
        let (respond_to, rx) = oneshot::channel();
        let message = Message::Open {
            batch,
            expected,
            respond_to,
        };
        if self.tx.send(message).is_err() {
            tracing::warn!("completion sink closed, batch will never resolve");
        }
        (batch, rx)
    }

    /// Observe every job event of the session.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.broadcast.subscribe()
    }
}

async fn aggregate(mut rx: mpsc::UnboundedReceiver<Message>, broadcast: broadcast::Sender<JobEvent>) {
    let mut trackers: HashMap<BatchId, Tracker> = HashMap::new();

    while let Some(message) = rx.recv().await {
        match message {
            Message::Open {
                batch,
                expected,
                respond_to,
            } => {
                if expected == 0 {
                    let _ = respond_to.send(BatchOutcome::default());
                    continue;
                }
                trackers.insert(
                    batch,
                    Tracker {
                        expected,
                        outcome: BatchOutcome::default(),
                        respond_to,
                    },
                );
            }
            Message::Event(event) => {
                if let Some(batch) = event.batch {
                    let done = match trackers.get_mut(&batch) {
                        Some(tracker) => {
                            tracker.outcome.record(&event);
                            tracker.outcome.completed() >= tracker.expected
                        }
                        None => {
                            tracing::warn!(save_name = %event.save_name, "event for unknown batch");
                            false
                        }
                    };
                    if done {
                        if let Some(tracker) = trackers.remove(&batch) {
                            let _ = tracker.respond_to.send(tracker.outcome);
                        }
                    }
                }
                // No subscribers is fine.
                let _ = broadcast.send(event);
            }
        }
    }

    if !trackers.is_empty() {
        tracing::warn!(open = trackers.len(), "completion sink closed with open batches");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str, batch: BatchId, outcome: JobOutcome) -> JobEvent {
        JobEvent {
            save_name: SaveName::from(name),
            batch: Some(batch),
            outcome,
        }
    }

    #[tokio::test]
    async fn batch_resolves_after_all_events() {
        let sink = CompletionSink::start();
        let sender = sink.sender();
        let (batch, mut done) = sink.open_batch(3);

        sender.send(event("a", batch, JobOutcome::Uploaded));
        sender.send(event("b", batch, JobOutcome::Failed("boom".into())));
        tokio::task::yield_now().await;
        assert!(done.try_recv().is_err());

        sender.send(event("c", batch, JobOutcome::Deduped));
        let outcome = done.await.expect("batch outcome");
        assert_eq!(outcome.completed(), 3);
        assert!(!outcome.is_success());
        assert_eq!(outcome.failed[0].0, SaveName::from("b"));
    }

    #[tokio::test]
    async fn empty_batch_resolves_immediately() {
        let sink = CompletionSink::start();
        let (_, done) = sink.open_batch(0);
        let outcome = done.await.expect("batch outcome");
        assert!(outcome.is_success());
        assert_eq!(outcome.completed(), 0);
    }

    #[tokio::test]
    async fn batches_are_independent() {
        let sink = CompletionSink::start();
        let sender = sink.sender();
        let (first, first_done) = sink.open_batch(1);
        let (second, mut second_done) = sink.open_batch(1);
        assert_ne!(first, second);

        sender.send(event("a", first, JobOutcome::Uploaded));
        assert!(first_done.await.expect("first").is_success());
        tokio::task::yield_now().await;
        assert!(second_done.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscribers_see_every_event() {
        let sink = CompletionSink::start();
        let mut events = sink.subscribe();
        sink.sender().send(JobEvent {
            save_name: SaveName::from("loose"),
            batch: None,
            outcome: JobOutcome::Uploaded,
        });
        let seen = events.recv().await.expect("event");
        assert_eq!(seen.save_name, SaveName::from("loose"));
    }
}
