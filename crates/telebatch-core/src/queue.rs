//! Upload queue, worker permit, and per-request completion handles.
//!
//! Every flush request owns one completion. Each attempt is reported on the
//! handle's attempt stream as it settles; the terminal [`FlushOutcome`] is
//! delivered exactly once, after retries end. A caller therefore sees a
//! failed attempt without losing track of the eventual result.
//!
//! ```text
//! Created → Queued → InFlight ─┬─► Uploaded / Empty
//!              ▲               ├─► BackingOff ─┐
//!              └───────────────┼───────────────┘
//!                              └─► DeadLettered
//! ```

use std::collections::VecDeque;

use tokio::sync::{mpsc, oneshot};

use crate::error::{EngineError, UploadError};
use crate::storage::ContentId;

/// Identifier assigned to each flush request by its engine.
pub type RequestId = u64;

/// Terminal result of a flush request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The snapshot was stored and trimmed from the buffer.
    Uploaded {
        content_id: ContentId,
        readings: usize,
        attempts: u32,
    },
    /// Nothing was buffered when the request ran (or when it was made).
    Empty,
    /// Retries ended without success. The readings are still buffered.
    DeadLettered { attempts: u32, error: UploadError },
}

impl FlushOutcome {
    #[must_use]
    pub fn content_id(&self) -> Option<&ContentId> {
        match self {
            Self::Uploaded { content_id, .. } => Some(content_id),
            Self::Empty | Self::DeadLettered { .. } => None,
        }
    }

    #[must_use]
    pub fn is_uploaded(&self) -> bool {
        matches!(self, Self::Uploaded { .. })
    }
}

/// Result of one upload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptReport {
    pub request_id: RequestId,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Size of the snapshot sent on this attempt.
    pub readings: usize,
    pub result: Result<ContentId, UploadError>,
}

#[derive(Debug)]
struct Completion {
    outcome: oneshot::Sender<FlushOutcome>,
    attempts: mpsc::UnboundedSender<AttemptReport>,
}

/// Caller side of a flush request.
#[derive(Debug)]
pub struct FlushHandle {
    request_id: Option<RequestId>,
    outcome: oneshot::Receiver<FlushOutcome>,
    attempts: mpsc::UnboundedReceiver<AttemptReport>,
}

impl FlushHandle {
    /// A handle that is already resolved; no request was queued.
    pub(crate) fn resolved(outcome: FlushOutcome) -> Self {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (_, attempts_rx) = mpsc::unbounded_channel();
        let _ = outcome_tx.send(outcome);
        Self {
            request_id: None,
            outcome: outcome_rx,
            attempts: attempts_rx,
        }
    }

    /// `None` when the flush resolved without queueing.
    #[must_use]
    pub fn request_id(&self) -> Option<RequestId> {
        self.request_id
    }

    /// Next attempt report, or `None` once the request reached its terminal outcome.
    pub async fn next_attempt(&mut self) -> Option<AttemptReport> {
        self.attempts.recv().await
    }

    /// Wait for the terminal outcome.
    pub async fn wait(self) -> Result<FlushOutcome, EngineError> {
        self.outcome.await.map_err(|_| EngineError::Dropped)
    }
}

/// A queued flush for one device.
#[derive(Debug)]
pub struct UploadRequest {
    pub id: RequestId,
    pub device_id: String,
    /// Attempts made so far.
    pub attempts: u32,
    completion: Completion,
}

impl UploadRequest {
    pub(crate) fn new(id: RequestId, device_id: impl Into<String>) -> (Self, FlushHandle) {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (attempts_tx, attempts_rx) = mpsc::unbounded_channel();
        let request = Self {
            id,
            device_id: device_id.into(),
            attempts: 0,
            completion: Completion {
                outcome: outcome_tx,
                attempts: attempts_tx,
            },
        };
        let handle = FlushHandle {
            request_id: Some(id),
            outcome: outcome_rx,
            attempts: attempts_rx,
        };
        (request, handle)
    }

    /// Count an attempt and report it to the caller. Returns the attempt number.
    pub(crate) fn record_attempt(
        &mut self,
        readings: usize,
        result: Result<ContentId, UploadError>,
    ) -> u32 {
        self.attempts += 1;
        // Callers may have stopped listening.
        let _ = self.completion.attempts.send(AttemptReport {
            request_id: self.id,
            attempt: self.attempts,
            readings,
            result,
        });
        self.attempts
    }

    /// Deliver the terminal outcome and close the attempt stream.
    pub(crate) fn resolve(self, outcome: FlushOutcome) {
        let _ = self.completion.outcome.send(outcome);
    }
}

/// The single token allowing one upload attempt at a time.
#[derive(Debug, Default)]
pub struct WorkerPermit {
    held: bool,
}

impl WorkerPermit {
    /// Take the permit if it is free.
    pub fn try_acquire(&mut self) -> bool {
        if self.held {
            return false;
        }
        self.held = true;
        true
    }

    pub fn release(&mut self) {
        self.held = false;
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held
    }
}

/// FIFO of pending flush requests plus the worker permit guarding it.
#[derive(Debug, Default)]
pub struct UploadQueue {
    requests: VecDeque<UploadRequest>,
    permit: WorkerPermit,
}

impl UploadQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, request: UploadRequest) {
        self.requests.push_back(request);
    }

    pub fn pop_front(&mut self) -> Option<UploadRequest> {
        self.requests.pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Requests currently queued for `device_id`.
    #[must_use]
    pub fn queued_for(&self, device_id: &str) -> usize {
        self.requests
            .iter()
            .filter(|request| request.device_id == device_id)
            .count()
    }

    /// Take the permit when there is work and no worker is running.
    pub fn try_start_worker(&mut self) -> bool {
        if self.requests.is_empty() {
            return false;
        }
        self.permit.try_acquire()
    }

    pub fn release_worker(&mut self) {
        self.permit.release();
    }

    #[must_use]
    pub fn worker_active(&self) -> bool {
        self.permit.is_held()
    }
}
