//! `StepUpload`: the bounded upload worker pool.
//!
//! One tokio task owns the pending queue, the set of busy destinations and
//! the running jobs. Admission is FIFO, except that a request whose save
//! name is already running stays queued while later requests go ahead.
//! Each attempt runs in its own spawned task so a panic becomes a failure
//! completion instead of taking the loop down. Requests arriving after
//! shutdown complete at once as failures, so every submitted request still
//! yields exactly one completion event.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use artisync_core::{ArtifactId, SaveName};

use crate::error::SyncError;
use crate::events::{BatchId, EventSender, JobEvent};
use crate::job::{Attempt, JobContext, JobOutcome, UploadJob, UploadStrategy};

/// Describes one file to upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub save_name: SaveName,
    pub path: PathBuf,
    pub size: u64,
    pub artifact_id: Option<ArtifactId>,
    pub strategy: UploadStrategy,
    /// `path` is a temporary copy to delete after the terminal outcome.
    pub copied: bool,
    /// Count this file in the session's transfer stats.
    pub tracked: bool,
    pub batch: Option<BatchId>,
}

impl UploadRequest {
    pub fn new(save_name: impl Into<SaveName>, path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            save_name: save_name.into(),
            path: path.into(),
            size,
            artifact_id: None,
            strategy: UploadStrategy::Classic,
            copied: false,
            tracked: true,
            batch: None,
        }
    }

    pub fn with_strategy(mut self, strategy: UploadStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn for_artifact(mut self, artifact_id: ArtifactId) -> Self {
        self.artifact_id = Some(artifact_id);
        self
    }

    pub fn copied(mut self, copied: bool) -> Self {
        self.copied = copied;
        self
    }

    pub fn untracked(mut self) -> Self {
        self.tracked = false;
        self
    }

    pub fn in_batch(mut self, batch: BatchId) -> Self {
        self.batch = Some(batch);
        self
    }
}

/// Resolves to the job's terminal outcome. Dropping it discards the result;
/// the job still runs.
#[derive(Debug)]
pub struct JobCompletion {
    rx: oneshot::Receiver<JobOutcome>,
}

impl Future for JobCompletion {
    type Output = Result<JobOutcome, SyncError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| SyncError::ChannelClosed("upload job")))
    }
}

/// Scheduler knobs, taken from [`SyncConfig`](crate::SyncConfig).
#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub workers: usize,
    pub resubmit_delay: Duration,
    pub max_resubmits: u32,
}

struct Ticket {
    save_name: SaveName,
    tracked: bool,
    batch: Option<BatchId>,
    resubmits: u32,
    respond_to: oneshot::Sender<JobOutcome>,
}

struct Pending {
    job: UploadJob,
    ticket: Ticket,
}

struct Settled {
    ticket: Ticket,
    /// `Err` carries the panic message.
    result: Result<(UploadJob, Attempt), String>,
}

enum Command {
    Submit(Pending),
    Shutdown,
}

#[derive(Clone)]
pub struct StepUpload {
    tx: mpsc::UnboundedSender<Command>,
    ctx: JobContext,
    events: EventSender,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl StepUpload {
    /// Spawn the scheduler loop on the current runtime.
    pub fn start(settings: SchedulerSettings, ctx: JobContext, events: EventSender) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = ctx.stats.clone();
        let handle = tokio::spawn(run_loop(rx, settings, events.clone(), stats));
        Self {
            tx,
            ctx,
            events,
            handle: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Queue a request. Statistics for tracked files are registered now, so
    /// totals include queued work.
    pub fn submit(&self, request: UploadRequest) -> JobCompletion {
        let (respond_to, rx) = oneshot::channel();
        if request.tracked {
            self.ctx.stats.init_file(
                request.save_name.as_str(),
                request.size,
                request.artifact_id.is_some(),
            );
        }
        let job = UploadJob::new(
            request.save_name.clone(),
            request.path,
            request.artifact_id,
            request.strategy,
            request.copied,
            self.ctx.clone(),
        );
        let pending = Pending {
            job,
            ticket: Ticket {
                save_name: request.save_name,
                tracked: request.tracked,
                batch: request.batch,
                resubmits: 0,
                respond_to,
            },
        };
        if let Err(mpsc::error::SendError(Command::Submit(pending))) =
            self.tx.send(Command::Submit(pending))
        {
            reject(pending, &self.events, &self.ctx.stats);
        }
        JobCompletion { rx }
    }

    /// Stop admitting requests, let queued and running jobs finish, and wait
    /// for the loop to exit.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "upload scheduler task failed");
            }
        }
    }
}

struct LoopState {
    queue: VecDeque<Pending>,
    deferred: Vec<(Instant, Pending)>,
    running: JoinSet<Settled>,
    busy: HashSet<SaveName>,
}

async fn run_loop(
    mut rx: mpsc::UnboundedReceiver<Command>,
    settings: SchedulerSettings,
    events: EventSender,
    stats: Arc<crate::stats::TransferStats>,
) {
    let workers = settings.workers.max(1);
    let mut state = LoopState {
        queue: VecDeque::new(),
        deferred: Vec::new(),
        running: JoinSet::new(),
        busy: HashSet::new(),
    };
    let mut accepting = true;
    let mut open = true;

    loop {
        promote_due(&mut state);
        admit(&mut state, workers);

        if !accepting
            && state.queue.is_empty()
            && state.deferred.is_empty()
            && state.running.is_empty()
        {
            break;
        }

        let next_deferred = state.deferred.iter().map(|(at, _)| *at).min();
        tokio::select! {
            command = rx.recv(), if open => match command {
                Some(Command::Submit(pending)) if accepting => state.queue.push_back(pending),
                Some(Command::Submit(pending)) => reject(pending, &events, &stats),
                Some(Command::Shutdown) => accepting = false,
                None => {
                    open = false;
                    accepting = false;
                }
            },
            Some(joined) = state.running.join_next(), if !state.running.is_empty() => {
                match joined {
                    Ok(settled) => settle(&mut state, settled, &settings, &events, &stats),
                    Err(err) => tracing::error!(error = %err, "upload supervisor task failed"),
                }
            }
            _ = tokio::time::sleep_until(next_deferred.unwrap_or_else(Instant::now)), if next_deferred.is_some() => {}
        }
    }

    rx.close();
    while let Ok(command) = rx.try_recv() {
        if let Command::Submit(pending) = command {
            reject(pending, &events, &stats);
        }
    }
    tracing::debug!("upload scheduler stopped");
}

fn promote_due(state: &mut LoopState) {
    let now = Instant::now();
    let mut i = 0;
    while i < state.deferred.len() {
        if state.deferred[i].0 <= now {
            let (_, pending) = state.deferred.swap_remove(i);
            state.queue.push_back(pending);
        } else {
            i += 1;
        }
    }
}

fn admit(state: &mut LoopState, workers: usize) {
    while state.running.len() < workers {
        let Some(pos) = state
            .queue
            .iter()
            .position(|p| !state.busy.contains(&p.ticket.save_name))
        else {
            break;
        };
        let Some(Pending { job, ticket }) = state.queue.remove(pos) else {
            break;
        };
        state.busy.insert(ticket.save_name.clone());
        state.running.spawn(async move {
            let attempt = tokio::spawn(async move {
                let attempt = job.run().await;
                (job, attempt)
            });
            let result = attempt.await.map_err(panic_message);
            Settled { ticket, result }
        });
    }
}

fn settle(
    state: &mut LoopState,
    settled: Settled,
    settings: &SchedulerSettings,
    events: &EventSender,
    stats: &crate::stats::TransferStats,
) {
    let Settled { mut ticket, result } = settled;
    state.busy.remove(&ticket.save_name);

    let outcome = match result {
        Ok((job, Attempt::Finished(outcome))) => {
            drop(job);
            outcome
        }
        Ok((job, Attempt::Requeue(err))) if ticket.resubmits < settings.max_resubmits => {
            ticket.resubmits += 1;
            tracing::warn!(
                save_name = %ticket.save_name,
                attempt = ticket.resubmits,
                error = %err,
                "backend unavailable, resubmitting upload",
            );
            let at = Instant::now() + settings.resubmit_delay;
            state.deferred.push((at, Pending { job, ticket }));
            return;
        }
        Ok((job, Attempt::Requeue(err))) => {
            let outcome = job.give_up(err);
            drop(job);
            outcome
        }
        Err(panic) => {
            if ticket.tracked {
                stats.update_failed_file(ticket.save_name.as_str());
            }
            let line = format!("Error uploading \"{}\": Panic, {panic}", ticket.save_name);
            tracing::error!(save_name = %ticket.save_name, "{line}");
            JobOutcome::Failed(line)
        }
    };

    complete(ticket, outcome, events);
}

/// Fail a request the stopped scheduler will never run.
fn reject(pending: Pending, events: &EventSender, stats: &crate::stats::TransferStats) {
    let Pending { job, ticket } = pending;
    // Removes a temporary copy.
    drop(job);
    if ticket.tracked {
        stats.update_failed_file(ticket.save_name.as_str());
    }
    let line = format!(
        "Error uploading \"{}\": Shutdown, upload scheduler is shut down",
        ticket.save_name
    );
    tracing::warn!(save_name = %ticket.save_name, "{line}");
    complete(ticket, JobOutcome::Failed(line), events);
}

fn complete(ticket: Ticket, outcome: JobOutcome, events: &EventSender) {
    events.send(JobEvent {
        save_name: ticket.save_name.clone(),
        batch: ticket.batch,
        outcome: outcome.clone(),
    });
    let _ = ticket.respond_to.send(outcome);
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "job panicked".to_string()
    }
}
