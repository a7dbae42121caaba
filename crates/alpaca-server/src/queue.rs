//! FIFO generation queue in front of a single model.
//!
//! One dedicated OS thread owns the [`ModelHandle`] and runs sessions one at
//! a time in submission order. Handlers talk to it through
//! [`GenerationQueue::submit`], which either admits a session or rejects it
//! immediately with [`SessionError::QueueFull`].
//!
//! Admission is counted with a [`QueueSlot`] that travels with the session
//! and is released when the session reaches a terminal state, so capacity
//! covers both waiting and running sessions.

use std::pin::pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use alpaca_engine::{ModelHandle, PromptTemplate, SamplingConfig};
use alpaca_runtime::{GenerationTimer, TelemetryHook};
use crossbeam_channel::{Receiver, Sender};
use futures::future::{self, Either};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::session::{Outcome, Session, SessionError, SessionEvent, SessionShared};

/// Tokens buffered per session before the worker waits for the reader.
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Most sessions admitted at once, running one included.
    pub capacity: usize,
    pub template: PromptTemplate,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 16,
            template: PromptTemplate::alpaca(),
        }
    }
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub capacity: usize,
    pub queued: usize,
    pub active: usize,
    /// Highest `active` ever observed.
    pub peak_active: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rejected: u64,
}

#[derive(Debug, Default)]
pub(crate) struct QueueCounters {
    admitted: AtomicUsize,
    queued: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    rejected: AtomicU64,
}

impl QueueCounters {
    pub(crate) fn promoted(&self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);
    }

    pub(crate) fn retired(&self, outcome: &Outcome) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        let counter = match outcome {
            Outcome::Finished => &self.completed,
            Outcome::Failed(_) => &self.failed,
            Outcome::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn cancelled_while_queued(&self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn unqueued(&self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
    }

    fn snapshot(&self, capacity: usize) -> QueueStats {
        QueueStats {
            capacity,
            queued: self.queued.load(Ordering::SeqCst),
            active: self.active.load(Ordering::SeqCst),
            peak_active: self.peak_active.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
        }
    }
}

/// One unit of queue capacity. Dropping it frees the unit.
pub(crate) struct QueueSlot {
    counters: Arc<QueueCounters>,
}

impl QueueSlot {
    pub(crate) fn counters(&self) -> &QueueCounters {
        &self.counters
    }
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.counters.admitted.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Work item handed to the worker thread.
struct Job {
    seq: u64,
    session_id: Uuid,
    prompt: String,
    config: SamplingConfig,
    shared: Arc<SessionShared>,
    events: mpsc::Sender<SessionEvent>,
}

struct Admission {
    next_seq: u64,
    jobs: Sender<Job>,
}

struct QueueInner {
    capacity: usize,
    template: PromptTemplate,
    model_name: String,
    counters: Arc<QueueCounters>,
    /// Sequence numbers are assigned under the same lock that feeds the
    /// worker, so sequence order is promotion order.
    admission: Mutex<Admission>,
}

/// Handle to the generation worker. Cheap to clone.
///
/// The worker exits once every handle is dropped and the jobs already
/// queued have run.
#[derive(Clone)]
pub struct GenerationQueue {
    inner: Arc<QueueInner>,
}

impl GenerationQueue {
    /// Move `model` onto a new `generation-worker` thread and start serving.
    pub fn start(
        model: Box<dyn ModelHandle>,
        config: QueueConfig,
        telemetry: Arc<dyn TelemetryHook>,
    ) -> std::io::Result<Self> {
        let capacity = config.capacity.max(1);
        let model_name = model.name().to_string();
        let (tx, rx) = crossbeam_channel::unbounded();

        thread::Builder::new()
            .name("generation-worker".to_string())
            .spawn(move || run_worker(model, rx, telemetry))?;

        info!(model = %model_name, capacity, "generation queue started");

        Ok(Self {
            inner: Arc::new(QueueInner {
                capacity,
                template: config.template,
                model_name,
                counters: Arc::new(QueueCounters::default()),
                admission: Mutex::new(Admission {
                    next_seq: 0,
                    jobs: tx,
                }),
            }),
        })
    }

    /// Admit `session`, or reject it without waiting.
    pub fn submit(&self, session: &mut Session) -> Result<(), SessionError> {
        if session.is_submitted() {
            return Err(SessionError::AlreadySubmitted);
        }
        if session.is_cancelled() {
            return Err(SessionError::Cancelled);
        }

        let inner = &self.inner;
        let mut admission = inner
            .admission
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if inner.counters.admitted.load(Ordering::SeqCst) >= inner.capacity {
            inner.counters.rejected.fetch_add(1, Ordering::SeqCst);
            session.shared().reject();
            warn!(session = %session.id(), capacity = inner.capacity, "queue full, rejecting session");
            return Err(SessionError::QueueFull);
        }

        inner.counters.admitted.fetch_add(1, Ordering::SeqCst);
        let slot = QueueSlot {
            counters: Arc::clone(&inner.counters),
        };
        session.shared().enqueue(slot)?;
        inner.counters.queued.fetch_add(1, Ordering::SeqCst);

        let seq = admission.next_seq;
        admission.next_seq += 1;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let job = Job {
            seq,
            session_id: session.id(),
            prompt: inner.template.render(session.prompt()),
            config: session.config().clone(),
            shared: Arc::clone(session.shared()),
            events: tx,
        };

        if admission.jobs.send(job).is_err() {
            session.shared().abandon();
            error!(session = %session.id(), "generation worker has exited");
            return Err(SessionError::WorkerUnavailable);
        }
        drop(admission);

        session.attach(rx);
        debug!(session = %session.id(), seq, "session queued");
        Ok(())
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.counters.snapshot(self.inner.capacity)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Name of the model the worker owns.
    pub fn model_name(&self) -> &str {
        &self.inner.model_name
    }
}

fn run_worker(mut model: Box<dyn ModelHandle>, jobs: Receiver<Job>, telemetry: Arc<dyn TelemetryHook>) {
    for job in jobs.iter() {
        if !job.shared.try_activate() {
            debug!(session = %job.session_id, seq = job.seq, "skipping cancelled session");
            continue;
        }
        debug!(session = %job.session_id, seq = job.seq, "session active");

        let outcome = generate(&mut *model, &job, &telemetry);
        match &outcome {
            Outcome::Failed(e) => error!(session = %job.session_id, error = %e, "generation failed"),
            Outcome::Cancelled => debug!(session = %job.session_id, "generation cancelled"),
            Outcome::Finished => debug!(session = %job.session_id, "generation finished"),
        }

        job.shared.retire(&outcome);
        // The reader may already be gone.
        deliver(&job, outcome.into_event());
    }
    info!("generation worker stopped");
}

/// Run one session to its end, forwarding tokens as they are produced.
fn generate(model: &mut dyn ModelHandle, job: &Job, telemetry: &Arc<dyn TelemetryHook>) -> Outcome {
    let mut timer = GenerationTimer::new(model.name(), job.prompt.len(), Arc::clone(telemetry));

    let outcome = match model.generate(&job.prompt, &job.config) {
        Err(e) => Outcome::Failed(e),
        Ok(mut tokens) => loop {
            if job.shared.is_cancelled() || job.events.is_closed() {
                break Outcome::Cancelled;
            }
            if timer.token_count() >= job.config.n_predict {
                break Outcome::Finished;
            }
            match tokens.next() {
                None => break Outcome::Finished,
                Some(Err(e)) => break Outcome::Failed(e),
                Some(Ok(token)) => {
                    timer.mark_token();
                    if !deliver(job, SessionEvent::Token(token)) {
                        break Outcome::Cancelled;
                    }
                }
            }
        },
    };

    timer.finish();
    outcome
}

/// Hand `event` to the session, waiting while its buffer is full.
///
/// Returns false when the reader is gone or the session is cancelled before
/// the event fits.
fn deliver(job: &Job, event: SessionEvent) -> bool {
    futures::executor::block_on(async {
        let send = pin!(job.events.send(event));
        let cancelled = pin!(job.shared.cancelled());
        match future::select(send, cancelled).await {
            Either::Left((sent, _)) => sent.is_ok(),
            Either::Right(_) => false,
        }
    })
}
