//! Per-queue admission control.
//!
//! A [`PermitGate`] is a counting semaphore sized to
//! `max_inflight_messages_per_queue`. The poller acquires a [`PermitBatch`]
//! before each receive call; every admitted message then carries one
//! [`Permit`] until its acknowledgement record is produced. Permits release
//! on drop, so each one is returned exactly once.
//!
//! ## Throughput modes
//!
//! In low-throughput mode a poll may only start once every previously
//! admitted message has completed, and at most `messages_per_poll` permits
//! are granted. In high-throughput mode permits are granted as soon as they
//! are free, up to the ceiling. [`BackPressureMode::Auto`] starts low and
//! follows poll results: a non-empty poll switches to high, an empty poll
//! switches back to low.

use crate::message::QueueName;
use crate::options::{BackPressureMode, ContainerOptions};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

#[cfg(test)]
#[path = "permits_tests.rs"]
mod tests;

struct GateState {
    queue: QueueName,
    semaphore: Semaphore,
    max_in_flight: usize,
    messages_per_poll: usize,
    mode: BackPressureMode,
    high_throughput: AtomicBool,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl GateState {
    /// Record permits taken out of the semaphore
    fn admit(&self, count: usize) {
        let now = self.in_flight.fetch_add(count, Ordering::SeqCst) + count;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    /// Return permits to the semaphore
    fn release(&self, count: usize) {
        if count == 0 {
            return;
        }
        // Counter first so in_flight never exceeds the ceiling
        self.in_flight.fetch_sub(count, Ordering::SeqCst);
        self.semaphore.add_permits(count);
    }
}

/// Counting gate bounding in-flight messages for one queue
#[derive(Clone)]
pub struct PermitGate {
    state: Arc<GateState>,
}

impl PermitGate {
    pub fn new(queue: QueueName, options: &ContainerOptions) -> Self {
        let max_in_flight = options.max_inflight_messages_per_queue().max(1);
        let mode = options.back_pressure_mode();

        Self {
            state: Arc::new(GateState {
                queue,
                semaphore: Semaphore::new(max_in_flight),
                max_in_flight,
                messages_per_poll: options.messages_per_poll().clamp(1, max_in_flight),
                mode,
                high_throughput: AtomicBool::new(mode == BackPressureMode::FixedHighThroughput),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Acquire up to `requested` permits, waiting at most `timeout`.
    ///
    /// Returns `None` when nothing could be granted in time; the caller
    /// skips the poll cycle.
    pub async fn acquire(&self, requested: usize, timeout: Duration) -> Option<PermitBatch> {
        let requested = requested.clamp(1, self.state.max_in_flight);

        if self.is_high_throughput() {
            self.acquire_high(requested, timeout).await
        } else {
            self.acquire_low(requested.min(self.state.messages_per_poll), timeout)
                .await
        }
    }

    /// Waits for the gate to drain completely, then keeps only `requested`
    async fn acquire_low(&self, requested: usize, timeout: Duration) -> Option<PermitBatch> {
        let all = self.state.max_in_flight;
        let permit = tokio::time::timeout(timeout, self.state.semaphore.acquire_many(to_u32(all)))
            .await
            .ok()?
            .ok()?;
        permit.forget();

        self.state.semaphore.add_permits(all - requested);
        self.state.admit(requested);
        Some(PermitBatch::new(Arc::clone(&self.state), requested))
    }

    async fn acquire_high(&self, requested: usize, timeout: Duration) -> Option<PermitBatch> {
        let acquired = tokio::time::timeout(
            timeout,
            self.state.semaphore.acquire_many(to_u32(requested)),
        )
        .await;

        match acquired {
            Ok(Ok(permit)) => {
                permit.forget();
                self.state.admit(requested);
                Some(PermitBatch::new(Arc::clone(&self.state), requested))
            }
            Ok(Err(_)) => None,
            Err(_) if self.state.mode == BackPressureMode::AlwaysPollMaxMessages => None,
            Err(_) => {
                // Partial grant of whatever is free right now
                let available = self.state.semaphore.available_permits().min(requested);
                if available == 0 {
                    return None;
                }
                let permit = self
                    .state
                    .semaphore
                    .try_acquire_many(to_u32(available))
                    .ok()?;
                permit.forget();
                self.state.admit(available);
                Some(PermitBatch::new(Arc::clone(&self.state), available))
            }
        }
    }

    /// Feed back how many messages the last poll returned
    pub fn on_poll_result(&self, received: usize) {
        if self.state.mode == BackPressureMode::FixedHighThroughput {
            return;
        }

        let high = received > 0;
        if self.state.high_throughput.swap(high, Ordering::SeqCst) != high {
            debug!(
                queue = %self.state.queue,
                high_throughput = high,
                "Switched throughput mode"
            );
        }
    }

    pub fn is_high_throughput(&self) -> bool {
        self.state.high_throughput.load(Ordering::SeqCst)
    }

    /// Permits currently held by polls or admitted messages
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Highest in-flight count observed since the gate was created
    pub fn peak_in_flight(&self) -> usize {
        self.state.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.state.semaphore.available_permits()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight
    }

    pub fn mode(&self) -> BackPressureMode {
        self.state.mode
    }

    pub fn queue(&self) -> &QueueName {
        &self.state.queue
    }
}

impl std::fmt::Debug for PermitGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermitGate")
            .field("queue", &self.state.queue)
            .field("in_flight", &self.in_flight())
            .field("max_in_flight", &self.state.max_in_flight)
            .field("high_throughput", &self.is_high_throughput())
            .finish()
    }
}

fn to_u32(count: usize) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}

// ============================================================================
// Permits
// ============================================================================

/// Permits granted for one poll. Unused permits return to the gate when the
/// batch drops.
pub struct PermitBatch {
    state: Arc<GateState>,
    remaining: usize,
}

impl PermitBatch {
    fn new(state: Arc<GateState>, count: usize) -> Self {
        Self {
            state,
            remaining: count,
        }
    }

    pub fn len(&self) -> usize {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    /// Move one permit out of the batch, to travel with a message
    pub fn take(&mut self) -> Option<Permit> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(Permit {
            state: Arc::clone(&self.state),
        })
    }
}

impl Drop for PermitBatch {
    fn drop(&mut self) {
        self.state.release(self.remaining);
    }
}

impl std::fmt::Debug for PermitBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermitBatch")
            .field("queue", &self.state.queue)
            .field("remaining", &self.remaining)
            .finish()
    }
}

/// Admission of a single message
pub struct Permit {
    state: Arc<GateState>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.state.release(1);
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("queue", &self.state.queue)
            .finish()
    }
}
