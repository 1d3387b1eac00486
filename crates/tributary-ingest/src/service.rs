//! The ingest service: transform, batch, submit, acknowledge.
//!
//! `run` drives one topic from `Idle` through `Running` and `Draining` to
//! `Stopped`. The loop owns batch assembly; submissions run as separate
//! tasks capped by a semaphore, and a single ack task releases broker
//! positions in delivery order.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, Semaphore, TryAcquireError};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval, Instant, MissedTickBehavior};

use tributary_core::{Batch, IngestResult, KnowledgeSink, RawMessage};
use tributary_deadletter::{DeadLetterEntry, DeadLetterStore, FailureKind};

use crate::ack::{AckBacklog, AckCoordinator, Resolution};
use crate::batch::BatchAssembler;
use crate::broker::{wait_for_signal, AdapterHealth, BrokerAdapter};
use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::stats::{IngestStats, StatsSnapshot};
use crate::submit::{
    dead_letter_resolution, persist_dead_letters, InFlightBatch, InFlightRegistry, Submitter,
};
use crate::transform::{Transformed, Transformer};

/// Service lifecycle. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Idle,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Everything an operator needs to judge the pipeline's health.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub connection: AdapterHealth,
    pub stats: StatsSnapshot,
    pub in_flight: Vec<InFlightBatch>,
    /// Messages awaiting broker acknowledgment.
    pub acks: AckBacklog,
    pub fatal_error: Option<String>,
}

struct Shared {
    state: Mutex<ServiceState>,
    fatal: Mutex<Option<String>>,
    stats: Arc<IngestStats>,
    in_flight: Arc<InFlightRegistry>,
    adapter: Arc<BrokerAdapter>,
    /// Set while a run is active.
    acks: Mutex<Option<Arc<AckCoordinator>>>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn set_state(&self, next: ServiceState) {
        let mut state = self.state.lock();
        tracing::info!(from = %*state, to = %next, "Service state changed");
        *state = next;
    }

    fn status(&self) -> ServiceStatus {
        ServiceStatus {
            state: *self.state.lock(),
            connection: self.adapter.health(),
            stats: self.stats.snapshot(),
            in_flight: self.in_flight.snapshot(),
            acks: self
                .acks
                .lock()
                .as_ref()
                .map(|acks| acks.backlog())
                .unwrap_or_default(),
            fatal_error: self.fatal.lock().clone(),
        }
    }
}

/// Cloneable control handle for a running service.
#[derive(Clone)]
pub struct ServiceHandle {
    shared: Arc<Shared>,
}

impl ServiceHandle {
    /// Begin draining. Idempotent.
    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
    }

    pub fn status(&self) -> ServiceStatus {
        self.shared.status()
    }

    pub fn state(&self) -> ServiceState {
        *self.shared.state.lock()
    }

    pub fn reset_stats(&self) {
        self.shared.stats.reset();
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.shared.stats)
    }
}

pub struct IngestService {
    config: IngestConfig,
    adapter: Arc<BrokerAdapter>,
    transformer: Transformer,
    sink: Arc<dyn KnowledgeSink>,
    dead_letters: Arc<dyn DeadLetterStore>,
    shared: Arc<Shared>,
}

/// Per-run plumbing created once the broker subscription is up.
struct RunContext {
    acks: Arc<AckCoordinator>,
    submitter: Arc<Submitter>,
    permits: Arc<Semaphore>,
    tasks: JoinSet<IngestResult>,
    assembler: BatchAssembler,
    /// Closed batches that never got a permit because shutdown arrived first.
    undispatched: Vec<Batch>,
}

impl IngestService {
    pub fn new(
        config: IngestConfig,
        adapter: Arc<BrokerAdapter>,
        transformer: Transformer,
        sink: Arc<dyn KnowledgeSink>,
        dead_letters: Arc<dyn DeadLetterStore>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            state: Mutex::new(ServiceState::Idle),
            fatal: Mutex::new(None),
            stats: Arc::new(IngestStats::new()),
            in_flight: Arc::new(InFlightRegistry::new()),
            adapter: Arc::clone(&adapter),
            acks: Mutex::new(None),
            shutdown,
        });
        Self {
            config,
            adapter,
            transformer,
            sink,
            dead_letters,
            shared,
        }
    }

    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn status(&self) -> ServiceStatus {
        self.shared.status()
    }

    pub fn reset_stats(&self) {
        self.shared.stats.reset();
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.shared.stats)
    }

    /// Run until shutdown or a fatal error, then drain.
    ///
    /// Returns `Ok` after a requested shutdown and `Err` when ingestion
    /// halted on its own: connection loss after exhausted reconnects, a
    /// message type with no mapping, or a crashed background task.
    pub async fn run(&self) -> Result<()> {
        {
            let state = *self.shared.state.lock();
            if state != ServiceState::Idle {
                return Err(IngestError::InvalidState {
                    action: "run".to_string(),
                    state: state.to_string(),
                });
            }
        }
        self.config.validate()?;
        self.shared.set_state(ServiceState::Running);

        let mut shutdown = self.shared.shutdown.subscribe();
        let started = tokio::select! {
            biased;
            _ = wait_for_signal(&mut shutdown) => None,
            started = self.start_broker() => Some(started),
        };
        let mut stream = match started {
            Some(Ok(stream)) => stream,
            Some(Err(e)) => {
                self.halt(&e);
                self.adapter.shutdown().await;
                self.shared.set_state(ServiceState::Stopped);
                return Err(e);
            }
            None => {
                tracing::info!(topic = %self.config.topic, "Shutdown requested before subscribing");
                self.adapter.shutdown().await;
                self.shared.set_state(ServiceState::Stopped);
                return Ok(());
            }
        };

        let (acks, ack_task) = AckCoordinator::start(Arc::clone(&self.adapter), self.stats());
        *self.shared.acks.lock() = Some(Arc::clone(&acks));
        let (abort_tx, abort_rx) = watch::channel(false);
        let mut ctx = RunContext {
            submitter: Arc::new(Submitter {
                topic: self.config.topic.clone(),
                sink: Arc::clone(&self.sink),
                dead_letters: Arc::clone(&self.dead_letters),
                acks: Arc::clone(&acks),
                stats: self.stats(),
                in_flight: Arc::clone(&self.shared.in_flight),
                retry: self.config.retry.clone(),
                ack_policy: self.config.ack_policy,
                abort: abort_rx,
            }),
            acks,
            permits: Arc::new(Semaphore::new(self.config.max_in_flight)),
            tasks: JoinSet::new(),
            assembler: BatchAssembler::new(self.config.batch.max_size, self.config.batch.max_age()),
            undispatched: Vec::new(),
        };

        let mut ticker = interval(self.config.batch.check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome: Result<()> = loop {
            tokio::select! {
                biased;

                _ = wait_for_signal(&mut shutdown) => {
                    tracing::info!(topic = %self.config.topic, "Shutdown requested");
                    break Ok(());
                }

                Some(joined) = ctx.tasks.join_next(), if !ctx.tasks.is_empty() => {
                    if let Some(e) = joined_failure("batch submission", joined) {
                        break Err(e);
                    }
                }

                _ = ticker.tick() => {
                    if let Some(batch) = ctx.assembler.take_expired(Instant::now()) {
                        tracing::debug!(batch_id = %batch.id, records = batch.len(), "Batch closed by age");
                        if !self.dispatch(&mut ctx, batch, &mut shutdown).await {
                            break Ok(());
                        }
                    }
                }

                next = stream.next() => {
                    let Some(message) = next else {
                        break match self.adapter.fatal_error() {
                            Some(e) => Err(e.into()),
                            None => Ok(()),
                        };
                    };
                    let closed = match self.accept(&mut ctx, message).await {
                        Ok(closed) => closed,
                        Err(e) => break Err(e),
                    };
                    let mut interrupted = false;
                    for batch in closed {
                        if interrupted {
                            ctx.undispatched.push(batch);
                        } else if !self.dispatch(&mut ctx, batch, &mut shutdown).await {
                            interrupted = true;
                        }
                    }
                    if interrupted {
                        break Ok(());
                    }
                }
            }
        };

        if let Err(e) = &outcome {
            self.halt(e);
        }
        drop(stream);
        let drain_failure = self.drain(ctx, abort_tx).await;
        let ack_failure = joined_failure("ack", ack_task.await);
        let mut outcome = outcome;
        for failure in [drain_failure, ack_failure].into_iter().flatten() {
            if outcome.is_ok() {
                self.halt(&failure);
                outcome = Err(failure);
            } else {
                tracing::error!(error = %failure, "Further failure while stopping");
            }
        }
        self.adapter.shutdown().await;
        self.shared.set_state(ServiceState::Stopped);

        tracing::info!(
            topic = %self.config.topic,
            stats = ?self.shared.stats.snapshot(),
            "Ingest service stopped"
        );
        outcome
    }

    async fn start_broker(&self) -> Result<crate::broker::MessageStream> {
        self.adapter.connect().await?;
        Ok(self.adapter.subscribe(&self.config.topic).await?)
    }

    fn halt(&self, error: &IngestError) {
        tracing::error!(topic = %self.config.topic, error = %error, "Ingestion halted");
        *self.shared.fatal.lock() = Some(error.to_string());
    }

    /// Transform one message, dead-letter its invalid parts and feed the
    /// valid records to the assembler. Returns the batches that filled up.
    async fn accept(&self, ctx: &mut RunContext, message: RawMessage) -> Result<Vec<Batch>> {
        let stats = &self.shared.stats;
        stats.received.fetch_add(1, Ordering::Relaxed);
        let token = message.ack_token;

        let candidates = match self.transformer.transform(&message)? {
            Transformed::Rejected(error) => {
                stats.validation_failed.fetch_add(1, Ordering::Relaxed);
                let entry =
                    DeadLetterEntry::for_message(&message, FailureKind::Validation, &error.to_string());
                ctx.acks.register(token, 1);
                let persisted = persist_dead_letters(&self.dead_letters, stats, vec![entry]).await;
                ctx.acks.resolve(token, 1, validation_resolution(persisted));
                return Ok(Vec::new());
            }
            Transformed::Records(candidates) => candidates,
        };

        stats
            .transformed
            .fetch_add(candidates.len() as u64, Ordering::Relaxed);
        tracing::debug!(token = %token, records = candidates.len(), "Message transformed");

        let (valid, invalid): (Vec<_>, Vec<_>) =
            candidates.into_iter().partition(|c| c.is_valid());

        ctx.acks.register(token, valid.len() + invalid.len());

        if !invalid.is_empty() {
            stats
                .validation_failed
                .fetch_add(invalid.len() as u64, Ordering::Relaxed);
            let entries: Vec<DeadLetterEntry> = invalid
                .iter()
                .map(|c| {
                    DeadLetterEntry::for_record(
                        &message.topic,
                        &c.record,
                        token,
                        None,
                        FailureKind::Validation,
                        &c.failure_reason(),
                        0,
                    )
                })
                .collect();
            let persisted = persist_dead_letters(&self.dead_letters, stats, entries).await;
            ctx.acks
                .resolve(token, invalid.len(), validation_resolution(persisted));
        }

        let mut closed = Vec::new();
        for candidate in valid {
            if let Some(batch) = ctx.assembler.push(candidate.record, token) {
                tracing::debug!(batch_id = %batch.id, records = batch.len(), "Batch closed by size");
                closed.push(batch);
            }
        }
        Ok(closed)
    }

    /// Hand a closed batch to a submission task, waiting for an in-flight
    /// slot if all are taken. Returns false if shutdown arrived while waiting.
    async fn dispatch(
        &self,
        ctx: &mut RunContext,
        batch: Batch,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let permit = match Arc::clone(&ctx.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                self.shared
                    .stats
                    .backpressure_pauses
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    max_in_flight = self.config.max_in_flight,
                    "In-flight cap reached, pausing consumption"
                );
                let acquired = tokio::select! {
                    permit = Arc::clone(&ctx.permits).acquire_owned() => permit.ok(),
                    _ = wait_for_signal(shutdown) => None,
                };
                match acquired {
                    Some(permit) => permit,
                    None => {
                        ctx.undispatched.push(batch);
                        return false;
                    }
                }
            }
            Err(TryAcquireError::Closed) => {
                ctx.undispatched.push(batch);
                return false;
            }
        };

        ctx.tasks
            .spawn(Arc::clone(&ctx.submitter).submit(batch, permit));
        true
    }

    /// Let in-flight batches finish, then dead-letter whatever never made it out.
    ///
    /// Returns the first submission task that crashed, if any did.
    async fn drain(&self, mut ctx: RunContext, abort: watch::Sender<bool>) -> Option<IngestError> {
        self.shared.set_state(ServiceState::Draining);

        let timeout = self.config.shutdown_timeout();
        let in_flight = ctx.tasks.len();
        let mut failure = None;
        let finished = tokio::time::timeout(timeout, async {
            while let Some(joined) = ctx.tasks.join_next().await {
                failure = failure.take().or(joined_failure("batch submission", joined));
            }
        })
        .await
        .is_ok();

        if !finished {
            tracing::warn!(
                in_flight,
                timeout_secs = timeout.as_secs(),
                "Shutdown timeout reached, abandoning retries"
            );
            abort.send_replace(true);
            while let Some(joined) = ctx.tasks.join_next().await {
                failure = failure.take().or(joined_failure("batch submission", joined));
            }
        }

        let mut leftovers = std::mem::take(&mut ctx.undispatched);
        leftovers.extend(ctx.assembler.take());
        for batch in leftovers {
            self.flush_to_dead_letters(&ctx.acks, batch).await;
        }

        ctx.acks.close();
        failure
    }

    async fn flush_to_dead_letters(&self, acks: &AckCoordinator, batch: Batch) {
        tracing::warn!(
            batch_id = %batch.id,
            records = batch.len(),
            "Dead-lettering unsubmitted batch on shutdown"
        );
        let entries: Vec<DeadLetterEntry> = batch
            .records()
            .iter()
            .zip(batch.origins())
            .map(|(record, origin)| {
                DeadLetterEntry::for_record(
                    &self.config.topic,
                    record,
                    *origin,
                    Some(batch.id),
                    FailureKind::Shutdown,
                    "service stopped before the batch was submitted",
                    0,
                )
            })
            .collect();
        let persisted = persist_dead_letters(&self.dead_letters, &self.shared.stats, entries).await;
        acks.resolve_counts(
            &batch.origin_counts(),
            dead_letter_resolution(self.config.ack_policy, persisted),
        );
    }
}

/// Turn a crashed task into the error that stops the service.
fn joined_failure<T>(task: &str, joined: std::result::Result<T, JoinError>) -> Option<IngestError> {
    let e = joined.err()?;
    tracing::error!(task, error = %e, "Background task failed");
    Some(IngestError::TaskFailed(format!("{task} task: {e}")))
}

/// Validation dead letters are released once persisted, regardless of policy.
fn validation_resolution(persisted: bool) -> Resolution {
    if persisted {
        Resolution::Release
    } else {
        Resolution::Withhold
    }
}
