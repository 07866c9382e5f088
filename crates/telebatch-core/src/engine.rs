//! The batching engine.
//!
//! Readings are appended to per-device buffers; the first reading into an
//! empty buffer arms a one-shot flush timer. A flush queues an upload
//! request, and a single worker drains the queue one upload at a time,
//! across all devices.
//!
//! # Architecture
//!
//! ```text
//! submit_reading ──► DeviceBuffers ──► FlushTimers ──(fire)──┐
//!                                                            ▼
//! flush(device) ───────────────────────────────────────► UploadQueue
//!                                                            │ permit
//!                                                            ▼
//!                        BatchStore::upload ◄── snapshot ◄── worker
//!                                 │
//!                 ok ─► trim N, LedgerNotifier::notify, resolve
//!                err ─► report attempt, backoff + requeue, or dead-letter
//! ```
//!
//! All engine state sits behind one mutex that is never held across an
//! `.await`. The worker's only suspension points are the store and ledger
//! calls, so readings that arrive mid-upload simply land in the next batch.
//! A successful upload trims exactly the snapshot it sent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, broadcast};
use tracing::{debug, error, info, warn};

use crate::buffer::DeviceBuffers;
use crate::config::EngineConfig;
use crate::error::{ConfigError, EngineError, Result, UploadError};
use crate::ledger::LedgerNotifier;
use crate::queue::{FlushHandle, FlushOutcome, RequestId, UploadQueue, UploadRequest};
use crate::reading::{Reading, decode_batch, encode_batch};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::scheduler::FlushTimers;
use crate::storage::{BatchStore, ContentId};

/// Capacity of the engine event channel; slow subscribers observe `Lagged`.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Public types
// =============================================================================

/// Immediate answer to an accepted reading. Never waits on upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestAck {
    pub device_id: String,
    /// Buffer length after the append.
    pub buffered: usize,
    /// True when this reading armed the device's flush timer.
    pub timer_armed: bool,
}

/// Point-in-time view of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub buffered: usize,
    pub timer_armed: bool,
    pub queued: usize,
    pub in_flight: bool,
}

/// Monotonic counters for the engine's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub readings_accepted: u64,
    pub flushes_requested: u64,
    pub uploads_succeeded: u64,
    pub readings_uploaded: u64,
    pub attempts_failed: u64,
    pub dead_lettered: u64,
    pub notify_declined: u64,
    pub notify_failures: u64,
}

/// A request that ran out of retries. Its readings are still buffered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub request_id: RequestId,
    pub device_id: String,
    pub attempts: u32,
    pub error: UploadError,
    /// Buffer length when the request was given up.
    pub buffered: usize,
    pub at: DateTime<Utc>,
}

/// Upload lifecycle notifications, for callers that did not keep a handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Uploaded {
        request_id: RequestId,
        device_id: String,
        content_id: ContentId,
        readings: usize,
        attempt: u32,
    },
    AttemptFailed {
        request_id: RequestId,
        device_id: String,
        attempt: u32,
        error: String,
        retry_in_ms: u64,
    },
    DeadLettered {
        request_id: RequestId,
        device_id: String,
        attempts: u32,
        error: String,
    },
}

/// Summary returned by [`BatchEngine::shutdown`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub timers_cancelled: usize,
    /// Flushes queued by shutdown itself.
    pub flushes_requested: usize,
    /// False when the shutdown timeout elapsed before the queue drained.
    pub drained: bool,
    /// Readings still buffered (lost when the process exits).
    pub unflushed_readings: usize,
    pub dead_letters: usize,
}

// =============================================================================
// Builder
// =============================================================================

/// Builds a [`BatchEngine`] around its collaborators.
pub struct EngineBuilder {
    store: Arc<dyn BatchStore>,
    notifier: Option<Arc<dyn LedgerNotifier>>,
    config: EngineConfig,
}

impl EngineBuilder {
    #[must_use]
    pub fn new(store: Arc<dyn BatchStore>) -> Self {
        Self {
            store,
            notifier: None,
            config: EngineConfig::default(),
        }
    }

    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Anchor every successful upload with `notifier`.
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn LedgerNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn build(self) -> std::result::Result<BatchEngine, ConfigError> {
        self.config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(BatchEngine {
            inner: Arc::new(EngineInner {
                retry: RetryPolicy::from(&self.config.retry),
                config: self.config,
                store: self.store,
                notifier: self.notifier,
                state: Mutex::new(EngineState::default()),
                idle: Notify::new(),
                events,
            }),
        })
    }
}

// =============================================================================
// Engine
// =============================================================================

struct EngineInner {
    config: EngineConfig,
    retry: RetryPolicy,
    store: Arc<dyn BatchStore>,
    notifier: Option<Arc<dyn LedgerNotifier>>,
    state: Mutex<EngineState>,
    /// Signalled when the queue drains with nothing backing off.
    idle: Notify,
    events: broadcast::Sender<EngineEvent>,
}

impl EngineInner {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[derive(Default)]
struct EngineState {
    buffers: DeviceBuffers,
    timers: FlushTimers,
    queue: UploadQueue,
    /// Device whose upload is running, if any.
    in_flight: Option<String>,
    /// Requests waiting out a retry delay, off-queue.
    backing_off: usize,
    /// Most recent dead letters, oldest first, bounded by `dead_letter_capacity`.
    dead_letters: VecDeque<DeadLetter>,
    stats: EngineStats,
    next_request_id: RequestId,
    closed: bool,
}

impl EngineState {
    fn is_idle(&self) -> bool {
        self.queue.is_empty() && !self.queue.worker_active() && self.backing_off == 0
    }
}

/// Frees the worker permit if a drain task stops without emptying the queue,
/// e.g. when a store panics mid-upload.
struct WorkerRelease {
    engine: BatchEngine,
    armed: bool,
}

impl Drop for WorkerRelease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let pending = {
            let mut state = self.engine.inner.state();
            state.in_flight = None;
            state.queue.release_worker();
            if state.is_idle() {
                self.engine.inner.idle.notify_waiters();
            }
            state.queue.len()
        };
        error!(pending, "upload worker stopped unexpectedly; permit released");
        if pending > 0 && tokio::runtime::Handle::try_current().is_ok() {
            self.engine.kick();
        }
    }
}

/// Per-device batching with serialized uploads.
///
/// Cheap to clone; clones share one engine. Methods that may arm timers or
/// start the worker must be called from within a tokio runtime.
#[derive(Clone)]
pub struct BatchEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for BatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("BatchEngine")
            .field("buffered", &state.buffers.total_len())
            .field("queued", &state.queue.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl BatchEngine {
    /// Shorthand for [`EngineBuilder::new`].
    #[must_use]
    pub fn builder(store: Arc<dyn BatchStore>) -> EngineBuilder {
        EngineBuilder::new(store)
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // ── Intake ──────────────────────────────────────────────────────────

    /// Buffer a reading and arm its device's flush timer if none is armed.
    ///
    /// Invalid readings are rejected without touching any state.
    pub fn submit_reading(&self, reading: Reading) -> Result<IngestAck> {
        reading.validate()?;

        let mut state = self.inner.state();
        if state.closed {
            return Err(EngineError::Closed.into());
        }

        let device_id = reading.device_id.clone();
        let buffered = state.buffers.append(reading);
        state.stats.readings_accepted += 1;
        let timer_armed = self.arm_timer(&mut state, &device_id);

        debug!(device_id = %device_id, buffered, timer_armed, "reading buffered");
        Ok(IngestAck {
            device_id,
            buffered,
            timer_armed,
        })
    }

    /// Parse a raw device post and buffer it.
    pub fn ingest_json(&self, value: serde_json::Value) -> Result<IngestAck> {
        let reading = Reading::from_json(value)?;
        self.submit_reading(reading)
    }

    fn arm_timer(&self, state: &mut EngineState, device_id: &str) -> bool {
        let engine = Arc::downgrade(&self.inner);
        let device = device_id.to_string();
        state
            .timers
            .arm(device_id, self.inner.config.batch_interval(), move |generation| {
                if let Some(inner) = engine.upgrade() {
                    BatchEngine { inner }.on_timer_fired(&device, generation);
                }
            })
            .is_some()
    }

    fn on_timer_fired(&self, device_id: &str, generation: u64) {
        {
            let mut state = self.inner.state();
            // Clear first so a reading arriving during the flush re-arms.
            if !state.timers.clear_fired(device_id, generation) {
                return;
            }
            debug!(device_id, "flush timer fired");
            // Timer-triggered flushes are observed through events, not handles.
            drop(Self::enqueue_flush(&mut state, device_id));
        }
        self.kick();
    }

    // ── Flush ───────────────────────────────────────────────────────────

    /// Request an upload of everything buffered for `device_id`.
    ///
    /// An empty buffer resolves immediately with [`FlushOutcome::Empty`]
    /// and never reaches the store.
    pub fn flush(&self, device_id: &str) -> FlushHandle {
        let handle = {
            let mut state = self.inner.state();
            Self::enqueue_flush(&mut state, device_id)
        };
        self.kick();
        handle
    }

    /// Flush every device with buffered readings.
    pub fn flush_all(&self) -> Vec<(String, FlushHandle)> {
        let handles: Vec<(String, FlushHandle)> = {
            let mut state = self.inner.state();
            state
                .buffers
                .pending_devices()
                .into_iter()
                .map(|device| {
                    let handle = Self::enqueue_flush(&mut state, &device);
                    (device, handle)
                })
                .collect()
        };
        self.kick();
        handles
    }

    fn enqueue_flush(state: &mut EngineState, device_id: &str) -> FlushHandle {
        state.stats.flushes_requested += 1;
        if state.buffers.is_empty(device_id) {
            debug!(device_id, "flush requested for empty buffer");
            return FlushHandle::resolved(FlushOutcome::Empty);
        }

        state.next_request_id += 1;
        let request_id = state.next_request_id;
        let (request, handle) = UploadRequest::new(request_id, device_id);
        state.queue.push_back(request);
        debug!(
            device_id,
            request_id,
            queue_len = state.queue.len(),
            "flush queued"
        );
        handle
    }

    // ── Worker ──────────────────────────────────────────────────────────

    /// Start the worker if there is work and the permit is free.
    fn kick(&self) {
        let start = self.inner.state().queue.try_start_worker();
        if start {
            let engine = self.clone();
            tokio::spawn(async move { engine.drain().await });
        }
    }

    /// Drain the queue while holding the worker permit.
    async fn drain(self) {
        let mut permit = WorkerRelease {
            engine: self.clone(),
            armed: true,
        };
        loop {
            let (request, snapshot) = {
                let mut state = self.inner.state();
                let Some(request) = state.queue.pop_front() else {
                    state.queue.release_worker();
                    permit.armed = false;
                    if state.is_idle() {
                        self.inner.idle.notify_waiters();
                    }
                    return;
                };

                let snapshot = state.buffers.snapshot(&request.device_id);
                if snapshot.is_empty() {
                    debug!(
                        device_id = %request.device_id,
                        request_id = request.id,
                        "buffer already drained by an earlier upload"
                    );
                    request.resolve(FlushOutcome::Empty);
                    continue;
                }
                state.in_flight = Some(request.device_id.clone());
                (request, snapshot)
            };

            self.attempt(request, snapshot).await;
            self.inner.state().in_flight = None;
        }
    }

    async fn attempt(&self, mut request: UploadRequest, snapshot: Vec<Reading>) {
        let count = snapshot.len();
        let device_id = request.device_id.clone();
        info!(
            device_id = %device_id,
            request_id = request.id,
            attempt = request.attempts + 1,
            readings = count,
            "uploading batch"
        );

        let result = match encode_batch(&snapshot) {
            Ok(bytes) => self.inner.store.upload(bytes, &self.inner.config.upload).await,
            Err(err) => Err(err),
        };
        drop(snapshot);

        match result {
            Ok(content_id) => {
                {
                    let mut state = self.inner.state();
                    state.buffers.trim_front(&device_id, count);
                    state.stats.uploads_succeeded += 1;
                    state.stats.readings_uploaded += count as u64;
                }
                let attempt = request.record_attempt(count, Ok(content_id.clone()));
                info!(
                    device_id = %device_id,
                    request_id = request.id,
                    attempt,
                    readings = count,
                    content_id = %content_id,
                    "batch uploaded"
                );

                self.notify_ledger(&device_id, &content_id).await;

                self.inner.emit(EngineEvent::Uploaded {
                    request_id: request.id,
                    device_id,
                    content_id: content_id.clone(),
                    readings: count,
                    attempt,
                });
                request.resolve(FlushOutcome::Uploaded {
                    content_id,
                    readings: count,
                    attempts: attempt,
                });
            }
            Err(err) => {
                let attempts = request.record_attempt(count, Err(err.clone()));
                match self.inner.retry.decide(attempts, &err) {
                    RetryDecision::Retry { delay } => {
                        warn!(
                            device_id = %device_id,
                            request_id = request.id,
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "upload failed; requeueing after backoff"
                        );
                        {
                            let mut state = self.inner.state();
                            state.stats.attempts_failed += 1;
                            state.backing_off += 1;
                        }
                        self.inner.emit(EngineEvent::AttemptFailed {
                            request_id: request.id,
                            device_id,
                            attempt: attempts,
                            error: err.to_string(),
                            retry_in_ms: delay.as_millis() as u64,
                        });
                        self.requeue_after(request, delay);
                    }
                    RetryDecision::GiveUp(reason) => {
                        let buffered = {
                            let mut state = self.inner.state();
                            state.stats.attempts_failed += 1;
                            state.stats.dead_lettered += 1;
                            let buffered = state.buffers.len(&device_id);
                            state.dead_letters.push_back(DeadLetter {
                                request_id: request.id,
                                device_id: device_id.clone(),
                                attempts,
                                error: err.clone(),
                                buffered,
                                at: Utc::now(),
                            });
                            let excess = state
                                .dead_letters
                                .len()
                                .saturating_sub(self.inner.config.dead_letter_capacity);
                            state.dead_letters.drain(..excess);
                            if self.inner.config.rearm_after_dead_letter
                                && !state.closed
                                && buffered > 0
                            {
                                self.arm_timer(&mut state, &device_id);
                            }
                            buffered
                        };
                        error!(
                            device_id = %device_id,
                            request_id = request.id,
                            attempts,
                            buffered,
                            reason = ?reason,
                            error = %err,
                            "upload dead-lettered; readings remain buffered"
                        );
                        self.inner.emit(EngineEvent::DeadLettered {
                            request_id: request.id,
                            device_id,
                            attempts,
                            error: err.to_string(),
                        });
                        request.resolve(FlushOutcome::DeadLettered {
                            attempts,
                            error: err,
                        });
                    }
                }
            }
        }
    }

    /// Put a failed request back at the queue tail once `delay` has passed.
    fn requeue_after(&self, request: UploadRequest, delay: Duration) {
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = engine.inner.state();
                state.backing_off -= 1;
                debug!(
                    device_id = %request.device_id,
                    request_id = request.id,
                    "requeueing after backoff"
                );
                state.queue.push_back(request);
            }
            engine.kick();
        });
    }

    async fn notify_ledger(&self, device_id: &str, content_id: &ContentId) {
        let Some(notifier) = &self.inner.notifier else {
            return;
        };
        match notifier.notify(device_id, content_id).await {
            Ok(true) => debug!(device_id, content_id = %content_id, "ledger anchored batch"),
            Ok(false) => {
                warn!(device_id, content_id = %content_id, "ledger declined anchor");
                self.inner.state().stats.notify_declined += 1;
            }
            Err(err) => {
                warn!(device_id, content_id = %content_id, error = %err, "ledger notification failed");
                self.inner.state().stats.notify_failures += 1;
            }
        }
    }

    // ── Retrieve ────────────────────────────────────────────────────────

    /// Download and decode a previously uploaded batch.
    pub async fn retrieve(&self, content_id: &ContentId) -> Result<Vec<Reading>> {
        let bytes = self.inner.store.download(content_id).await?;
        Ok(decode_batch(&bytes)?)
    }

    // ── Status ──────────────────────────────────────────────────────────

    #[must_use]
    pub fn device_status(&self, device_id: &str) -> DeviceStatus {
        let state = self.inner.state();
        DeviceStatus {
            device_id: device_id.to_string(),
            buffered: state.buffers.len(device_id),
            timer_armed: state.timers.is_armed(device_id),
            queued: state.queue.queued_for(device_id),
            in_flight: state.in_flight.as_deref() == Some(device_id),
        }
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        self.inner.state().stats
    }

    /// Retained dead letters, oldest first. `stats().dead_lettered` counts all of them.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.state().dead_letters.iter().cloned().collect()
    }

    /// Total readings buffered across devices.
    #[must_use]
    pub fn pending_readings(&self) -> usize {
        self.inner.state().buffers.total_len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    /// Subscribe to upload lifecycle events from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Wait until no request is queued, uploading, or backing off.
    ///
    /// Armed timers do not count; they may queue more work later.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.state().is_idle() {
                return;
            }
            notified.await;
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    /// Stop accepting readings, cancel timers, optionally flush everything,
    /// and wait (bounded by `shutdown_timeout_ms`) for the queue to drain.
    pub async fn shutdown(&self) -> ShutdownReport {
        let (timers_cancelled, flushes_requested) = {
            let mut state = self.inner.state();
            state.closed = true;
            let cancelled = state.timers.cancel_all();
            let mut flushes = 0;
            if self.inner.config.flush_on_shutdown {
                for device in state.buffers.pending_devices() {
                    drop(Self::enqueue_flush(&mut state, &device));
                    flushes += 1;
                }
            }
            (cancelled, flushes)
        };
        info!(timers_cancelled, flushes_requested, "engine shutting down");
        self.kick();

        let drained = tokio::time::timeout(self.inner.config.shutdown_timeout(), self.wait_idle())
            .await
            .is_ok();

        let state = self.inner.state();
        let report = ShutdownReport {
            timers_cancelled,
            flushes_requested,
            drained,
            unflushed_readings: state.buffers.total_len(),
            dead_letters: state.dead_letters.len(),
        };
        if report.unflushed_readings > 0 {
            warn!(
                unflushed_readings = report.unflushed_readings,
                drained, "engine stopped with buffered readings"
            );
        } else {
            info!(drained, "engine stopped");
        }
        report
    }
}
