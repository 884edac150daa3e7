//! Acknowledgement coordination.
//!
//! Every admitted message is registered with the coordinator when the poller
//! hands it out, and produces exactly one [`AcknowledgementRecord`] when its
//! [`AcknowledgementTicket`] is consumed (or dropped, which abandons it). The
//! coordinator runs as a single task fed by an unbounded channel:
//!
//! - it applies the `Pending -> {Acknowledged, Failed, Abandoned}` state
//!   machine per message,
//! - in [`AcknowledgementOrdering::Ordered`] mode it releases records in
//!   receive order per queue,
//! - it buffers deletable records and flushes them as batched deletes when
//!   the interval elapses or the threshold is reached.
//!
//! Deletes that keep failing are dropped with an `error` log; the messages
//! become visible again once their visibility timeout expires.

use crate::backend::{batch_chunks, QueueBackend};
use crate::error::{AcknowledgementError, ContainerError};
use crate::message::{MessageEnvelope, MessageId, QueueName, ReceiptHandle};
use crate::options::{
    AcknowledgementMode, AcknowledgementOrdering, ConfigurableContainerComponent, ContainerOptions,
};
use crate::permits::Permit;
use crate::retry::RetryPolicy;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "acknowledgement_tests.rs"]
mod tests;

// ============================================================================
// Outcomes and State Machine
// ============================================================================

/// Result of processing one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Success,
    Failure,
    /// Processing never finished, e.g. it was cancelled during shutdown
    Abandoned,
}

/// Acknowledgement state of a single message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Pending,
    Acknowledged,
    Failed,
    Abandoned,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Acknowledged => "acknowledged",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Apply an outcome. Only a pending message may change state.
    pub fn transition(self, outcome: MessageOutcome) -> Result<MessageStatus, AcknowledgementError> {
        let target = match outcome {
            MessageOutcome::Success => Self::Acknowledged,
            MessageOutcome::Failure => Self::Failed,
            MessageOutcome::Abandoned => Self::Abandoned,
        };

        match self {
            Self::Pending => Ok(target),
            _ => Err(AcknowledgementError::InvalidTransition {
                from: self.as_str(),
                to: target.as_str(),
            }),
        }
    }
}

/// Explicit acknowledgement handle given to listeners.
///
/// Only consulted in [`AcknowledgementMode::Manual`], where a message is
/// deleted only if the listener called [`Acknowledgement::acknowledge`]
/// before processing finished.
#[derive(Debug, Clone, Default)]
pub struct Acknowledgement {
    acknowledged: Arc<AtomicBool>,
}

impl Acknowledgement {
    pub fn acknowledge(&self) {
        self.acknowledged.store(true, Ordering::SeqCst);
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::SeqCst)
    }
}

/// Final record of one message, sent to the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcknowledgementRecord {
    pub queue: QueueName,
    pub message_id: MessageId,
    pub receipt_handle: ReceiptHandle,
    pub sequence: u64,
    pub outcome: MessageOutcome,
    pub manually_acknowledged: bool,
}

/// Counters published by the coordinator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcknowledgementStats {
    pub registered: u64,
    pub acknowledged: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub deleted: u64,
    pub delete_failures: u64,
    /// Records that did not match a pending message
    pub rejected: u64,
}

#[derive(Debug)]
enum CoordinatorCommand {
    Register { queue: QueueName, sequence: u64 },
    Complete(AcknowledgementRecord),
    Shutdown,
}

// ============================================================================
// Tickets
// ============================================================================

/// Producer side of the coordinator channel
#[derive(Debug, Clone)]
pub struct AcknowledgementSender {
    tx: mpsc::UnboundedSender<CoordinatorCommand>,
}

impl AcknowledgementSender {
    /// Register a message and bind its permit to the returned ticket
    pub fn register(&self, envelope: &MessageEnvelope, permit: Permit) -> AcknowledgementTicket {
        let command = CoordinatorCommand::Register {
            queue: envelope.queue.clone(),
            sequence: envelope.sequence,
        };
        if self.tx.send(command).is_err() {
            debug!(
                queue = %envelope.queue,
                message_id = %envelope.message_id,
                "Acknowledgement coordinator is gone, message will not be acknowledged"
            );
        }

        AcknowledgementTicket {
            queue: envelope.queue.clone(),
            message_id: envelope.message_id.clone(),
            receipt_handle: envelope.receipt_handle.clone(),
            sequence: envelope.sequence,
            acknowledgement: Acknowledgement::default(),
            tx: self.tx.clone(),
            permit: Some(permit),
            completed: false,
        }
    }
}

/// Obligation to report exactly one outcome for a message.
///
/// Consuming it with [`complete`](Self::complete) sends the record; dropping
/// it unconsumed sends an abandoned record. The message's permit is released
/// right after the record is sent.
#[derive(Debug)]
pub struct AcknowledgementTicket {
    queue: QueueName,
    message_id: MessageId,
    receipt_handle: ReceiptHandle,
    sequence: u64,
    acknowledgement: Acknowledgement,
    tx: mpsc::UnboundedSender<CoordinatorCommand>,
    permit: Option<Permit>,
    completed: bool,
}

impl AcknowledgementTicket {
    pub fn acknowledgement(&self) -> Acknowledgement {
        self.acknowledgement.clone()
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn complete(mut self, outcome: MessageOutcome) {
        self.send(outcome);
    }

    fn send(&mut self, outcome: MessageOutcome) {
        self.completed = true;
        let record = AcknowledgementRecord {
            queue: self.queue.clone(),
            message_id: self.message_id.clone(),
            receipt_handle: self.receipt_handle.clone(),
            sequence: self.sequence,
            outcome,
            manually_acknowledged: self.acknowledgement.is_acknowledged(),
        };

        if self.tx.send(CoordinatorCommand::Complete(record)).is_err() {
            debug!(
                queue = %self.queue,
                message_id = %self.message_id,
                "Acknowledgement coordinator is gone, dropping record"
            );
        }
        self.permit.take();
    }
}

impl Drop for AcknowledgementTicket {
    fn drop(&mut self) {
        if !self.completed {
            self.send(MessageOutcome::Abandoned);
        }
    }
}

/// A message travelling from the poller through a sink into the pipeline
#[derive(Debug)]
pub struct InFlightMessage {
    envelope: MessageEnvelope,
    ticket: AcknowledgementTicket,
}

impl InFlightMessage {
    pub fn new(envelope: MessageEnvelope, ticket: AcknowledgementTicket) -> Self {
        Self { envelope, ticket }
    }

    pub fn envelope(&self) -> &MessageEnvelope {
        &self.envelope
    }

    pub fn acknowledgement(&self) -> Acknowledgement {
        self.ticket.acknowledgement()
    }

    pub fn into_parts(self) -> (MessageEnvelope, AcknowledgementTicket) {
        (self.envelope, self.ticket)
    }
}

// ============================================================================
// Coordinator
// ============================================================================

#[derive(Debug, Clone)]
struct CoordinatorSettings {
    mode: AcknowledgementMode,
    ordering: AcknowledgementOrdering,
    interval: Duration,
    threshold: usize,
    immediate: bool,
    retry_policy: RetryPolicy,
}

impl CoordinatorSettings {
    fn from_options(options: &ContainerOptions, retry_policy: RetryPolicy) -> Self {
        Self {
            mode: options.acknowledgement_mode(),
            ordering: options.acknowledgement_ordering(),
            interval: options.acknowledgement_interval(),
            threshold: options.acknowledgement_threshold(),
            immediate: options.is_immediate_acknowledgement(),
            retry_policy,
        }
    }

    fn is_immediate(&self) -> bool {
        self.immediate
    }

    fn is_deletable(&self, record: &AcknowledgementRecord) -> bool {
        match (self.mode, record.outcome) {
            (_, MessageOutcome::Abandoned) => false,
            (AcknowledgementMode::OnSuccess, outcome) => outcome == MessageOutcome::Success,
            (AcknowledgementMode::Always, _) => true,
            (AcknowledgementMode::Manual, _) => record.manually_acknowledged,
        }
    }
}

/// Collects acknowledgement records and deletes completed messages in batches
pub struct AcknowledgementCoordinator {
    backend: Arc<dyn QueueBackend>,
    settings: CoordinatorSettings,
    tx: mpsc::UnboundedSender<CoordinatorCommand>,
    rx: Option<mpsc::UnboundedReceiver<CoordinatorCommand>>,
    stats: Arc<Mutex<AcknowledgementStats>>,
    task: Option<JoinHandle<()>>,
}

impl AcknowledgementCoordinator {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            backend,
            settings: CoordinatorSettings::from_options(
                &ContainerOptions::default(),
                RetryPolicy::acknowledgement(),
            ),
            tx,
            rx: Some(rx),
            stats: Arc::new(Mutex::new(AcknowledgementStats::default())),
            task: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.settings.retry_policy = policy;
        self
    }

    pub fn sender(&self) -> AcknowledgementSender {
        AcknowledgementSender {
            tx: self.tx.clone(),
        }
    }

    pub fn stats(&self) -> AcknowledgementStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Spawn the coordinator task on `runtime`
    pub fn start(&mut self, runtime: &Handle) -> Result<(), ContainerError> {
        let rx = self.rx.take().ok_or(ContainerError::AlreadyRunning)?;

        let worker = CoordinatorLoop {
            backend: Arc::clone(&self.backend),
            settings: self.settings.clone(),
            queues: HashMap::new(),
            stats: Arc::clone(&self.stats),
        };

        info!(
            mode = ?self.settings.mode,
            ordering = ?self.settings.ordering,
            interval_ms = u64::try_from(self.settings.interval.as_millis()).unwrap_or(u64::MAX),
            threshold = self.settings.threshold,
            "Starting acknowledgement coordinator"
        );
        self.task = Some(runtime.spawn(worker.run(rx)));
        Ok(())
    }

    /// Flush everything still buffered and stop the coordinator task
    pub async fn stop(&mut self) -> AcknowledgementStats {
        if let Some(task) = self.task.take() {
            let _ = self.tx.send(CoordinatorCommand::Shutdown);
            if let Err(e) = task.await {
                error!(error = %e, "Acknowledgement coordinator task failed");
            }
            info!("Acknowledgement coordinator stopped");
        }
        self.stats()
    }
}

impl ConfigurableContainerComponent for AcknowledgementCoordinator {
    fn configure(&mut self, options: ContainerOptions) {
        self.settings = CoordinatorSettings::from_options(&options, self.settings.retry_policy.clone());
    }
}

#[derive(Debug, Default)]
struct QueueAcknowledgements {
    /// Registered messages without a record yet, by receive sequence
    pending: BTreeMap<u64, MessageStatus>,
    /// Ordered mode: completed records waiting for their predecessors
    waiting: BTreeMap<u64, AcknowledgementRecord>,
    to_delete: Vec<AcknowledgementRecord>,
}

impl QueueAcknowledgements {
    /// Pop waiting records that no pending predecessor holds back
    fn release_in_order(&mut self) -> Vec<AcknowledgementRecord> {
        let horizon = self.pending.keys().next().copied();
        let mut released = Vec::new();

        while let Some(entry) = self.waiting.first_entry() {
            if horizon.is_some_and(|first_pending| *entry.key() > first_pending) {
                break;
            }
            released.push(entry.remove());
        }

        released
    }
}

#[derive(Debug, Default)]
struct DeleteSummary {
    deleted: usize,
    dropped: usize,
}

struct CoordinatorLoop {
    backend: Arc<dyn QueueBackend>,
    settings: CoordinatorSettings,
    queues: HashMap<QueueName, QueueAcknowledgements>,
    stats: Arc<Mutex<AcknowledgementStats>>,
}

impl CoordinatorLoop {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<CoordinatorCommand>) {
        let mut ticker = if self.settings.interval.is_zero() {
            None
        } else {
            let period = self.settings.interval;
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(interval)
        };

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(CoordinatorCommand::Shutdown) | None => break,
                    Some(command) => self.handle(command).await,
                },
                _ = next_tick(&mut ticker) => self.flush_all().await,
            }
        }

        rx.close();
        while let Ok(command) = rx.try_recv() {
            if !matches!(command, CoordinatorCommand::Shutdown) {
                self.handle(command).await;
            }
        }

        self.release_stranded();
        self.flush_all().await;
        debug!("Acknowledgement coordinator loop finished");
    }

    async fn handle(&mut self, command: CoordinatorCommand) {
        match command {
            CoordinatorCommand::Register { queue, sequence } => {
                self.queues
                    .entry(queue)
                    .or_default()
                    .pending
                    .insert(sequence, MessageStatus::Pending);
                self.update_stats(|stats| stats.registered += 1);
            }
            CoordinatorCommand::Complete(record) => self.complete(record).await,
            CoordinatorCommand::Shutdown => {}
        }
    }

    async fn complete(&mut self, record: AcknowledgementRecord) {
        let pending = self
            .queues
            .get_mut(&record.queue)
            .and_then(|state| state.pending.remove(&record.sequence));

        let status = match pending {
            Some(status) => status.transition(record.outcome),
            None => Err(AcknowledgementError::InvalidTransition {
                from: "unregistered",
                to: "completed",
            }),
        };

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                warn!(
                    queue = %record.queue,
                    message_id = %record.message_id,
                    sequence = record.sequence,
                    error = %e,
                    "Rejected acknowledgement record"
                );
                self.update_stats(|stats| stats.rejected += 1);
                return;
            }
        };

        let released = match self.settings.ordering {
            AcknowledgementOrdering::Parallel => vec![record.clone()],
            AcknowledgementOrdering::Ordered => {
                let state = self.queues.entry(record.queue.clone()).or_default();
                state.waiting.insert(record.sequence, record.clone());
                state.release_in_order()
            }
        };

        match status {
            MessageStatus::Acknowledged => self.update_stats(|stats| stats.acknowledged += 1),
            MessageStatus::Failed => self.update_stats(|stats| stats.failed += 1),
            MessageStatus::Abandoned => {
                warn!(
                    queue = %record.queue,
                    message_id = %record.message_id,
                    "Message processing abandoned, message will be redelivered"
                );
                self.update_stats(|stats| stats.abandoned += 1);
            }
            MessageStatus::Pending => {}
        }

        self.buffer(&record.queue, released).await;
    }

    async fn buffer(&mut self, queue: &QueueName, released: Vec<AcknowledgementRecord>) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };

        let settings = &self.settings;
        state
            .to_delete
            .extend(released.into_iter().filter(|record| settings.is_deletable(record)));

        let buffered = state.to_delete.len();
        if buffered == 0 {
            return;
        }

        let threshold_reached = self.settings.threshold > 0 && buffered >= self.settings.threshold;
        if self.settings.is_immediate() || threshold_reached {
            self.flush_queue(queue).await;
        }
    }

    /// Ordered mode at shutdown: release records whose predecessors never
    /// produced one
    fn release_stranded(&mut self) {
        let settings = &self.settings;
        for (queue, state) in &mut self.queues {
            if state.waiting.is_empty() {
                continue;
            }
            warn!(
                queue = %queue,
                count = state.waiting.len(),
                "Releasing acknowledgements still waiting for predecessors"
            );
            let stranded = std::mem::take(&mut state.waiting);
            state.to_delete.extend(
                stranded
                    .into_values()
                    .filter(|record| settings.is_deletable(record)),
            );
        }
    }

    async fn flush_all(&mut self) {
        let queues: Vec<QueueName> = self
            .queues
            .iter()
            .filter(|(_, state)| !state.to_delete.is_empty())
            .map(|(queue, _)| queue.clone())
            .collect();

        for queue in queues {
            self.flush_queue(&queue).await;
        }
    }

    async fn flush_queue(&mut self, queue: &QueueName) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };
        if state.to_delete.is_empty() {
            return;
        }

        let receipts: Vec<ReceiptHandle> = std::mem::take(&mut state.to_delete)
            .into_iter()
            .map(|record| record.receipt_handle)
            .collect();

        debug!(queue = %queue, count = receipts.len(), "Flushing acknowledgements");

        let backend = self.backend.as_ref();
        let policy = &self.settings.retry_policy;
        let summaries = match self.settings.ordering {
            AcknowledgementOrdering::Ordered => {
                let mut summaries = Vec::new();
                for chunk in batch_chunks(&receipts) {
                    summaries.push(delete_with_retry(backend, policy, queue, chunk.to_vec()).await);
                }
                summaries
            }
            AcknowledgementOrdering::Parallel => {
                join_all(
                    batch_chunks(&receipts)
                        .map(|chunk| delete_with_retry(backend, policy, queue, chunk.to_vec())),
                )
                .await
            }
        };

        let deleted: usize = summaries.iter().map(|summary| summary.deleted).sum();
        let dropped: usize = summaries.iter().map(|summary| summary.dropped).sum();
        self.update_stats(|stats| {
            stats.deleted += deleted as u64;
            stats.delete_failures += dropped as u64;
        });
    }

    fn update_stats(&self, update: impl FnOnce(&mut AcknowledgementStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut stats);
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Delete one chunk, retrying transient failures with backoff
async fn delete_with_retry(
    backend: &dyn QueueBackend,
    policy: &RetryPolicy,
    queue: &QueueName,
    receipts: Vec<ReceiptHandle>,
) -> DeleteSummary {
    let mut summary = DeleteSummary::default();
    let mut remaining = receipts;
    let mut backoff = policy.backoff();

    loop {
        let mut hint = None;

        match backend.delete_messages(queue, &remaining).await {
            Ok(result) => {
                summary.deleted += result.successful.len();

                for failure in result.failed.iter().filter(|failure| failure.sender_fault) {
                    warn!(
                        queue = %queue,
                        code = %failure.code,
                        message = %failure.message,
                        "Delete rejected by the queue, message will be redelivered"
                    );
                    summary.dropped += 1;
                }

                remaining = result.retryable();
                if remaining.is_empty() {
                    return summary;
                }
            }
            Err(e) if !e.is_transient() => {
                error!(
                    queue = %queue,
                    count = remaining.len(),
                    error = %e,
                    "Delete failed with a permanent error, dropping acknowledgements"
                );
                summary.dropped += remaining.len();
                return summary;
            }
            Err(e) => {
                hint = e.retry_after();
                warn!(
                    queue = %queue,
                    count = remaining.len(),
                    attempt = backoff.retries() + 1,
                    error = %e,
                    "Delete failed, retrying"
                );
            }
        }

        match backoff.next_delay() {
            Some(delay) => {
                tokio::time::sleep(hint.map_or(delay, |hint| hint.max(delay))).await;
            }
            None => {
                error!(
                    queue = %queue,
                    count = remaining.len(),
                    attempts = backoff.retries() + 1,
                    "Delete retries exhausted, dropping acknowledgements"
                );
                summary.dropped += remaining.len();
                return summary;
            }
        }
    }
}
