//! Test fixtures: scriptable store and recording ledger.
//!
//! Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, watch};

use telebatch_core::config::{EngineConfig, RetryConfig, UploadParams};
use telebatch_core::error::{NotifyError, UploadError};
use telebatch_core::ledger::LedgerNotifier;
use telebatch_core::reading::{Reading, decode_batch};
use telebatch_core::storage::{BatchStore, ContentId, MemoryStore};
use telebatch_core::{BatchEngine, EngineBuilder};

// ---------------------------------------------------------------------------
// ScriptedStore
// ---------------------------------------------------------------------------

/// One upload call as the store saw it.
#[derive(Debug, Clone)]
pub struct UploadCall {
    pub readings: Vec<Reading>,
    pub outcome: Result<ContentId, UploadError>,
}

impl UploadCall {
    pub fn device_id(&self) -> &str {
        &self.readings[0].device_id
    }

    /// Payloads as integers, for order checks.
    pub fn sequence(&self) -> Vec<i64> {
        self.readings
            .iter()
            .map(|r| r.payload.as_i64().expect("integer payload"))
            .collect()
    }
}

/// A store that fails on demand, can hold uploads at a gate, and records
/// how many uploads were ever in flight at once.
pub struct ScriptedStore {
    inner: MemoryStore,
    failures: Mutex<VecDeque<Option<UploadError>>>,
    panics: AtomicUsize,
    latency: Duration,
    gate: Option<Semaphore>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    started: watch::Sender<usize>,
    calls: Mutex<Vec<UploadCall>>,
}

impl Default for ScriptedStore {
    fn default() -> Self {
        Self {
            inner: MemoryStore::new(),
            failures: Mutex::default(),
            panics: AtomicUsize::new(0),
            latency: Duration::ZERO,
            gate: None,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            started: watch::Sender::new(0),
            calls: Mutex::default(),
        }
    }
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every upload sleeps `latency` before completing.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Every upload blocks until [`ScriptedStore::release`] lets it through.
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    /// Script the next calls: `Some(err)` fails that call, `None` lets it succeed.
    pub fn script(&self, outcomes: impl IntoIterator<Item = Option<UploadError>>) {
        self.failures.lock().unwrap().extend(outcomes);
    }

    /// Fail the next `n` calls with a network error.
    pub fn fail_next(&self, n: usize) {
        self.script((0..n).map(|_| Some(UploadError::Network("connection reset".to_string()))));
    }

    /// Let `n` gated uploads proceed.
    /// Make the next `n` uploads panic instead of returning.
    pub fn panic_next(&self, n: usize) {
        self.panics.fetch_add(n, Ordering::SeqCst);
    }

    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Wait until at least `n` uploads have started.
    pub async fn wait_started(&self, n: usize) {
        let mut rx = self.started.subscribe();
        rx.wait_for(|started| *started >= n)
            .await
            .expect("store dropped");
    }

    pub fn calls(&self) -> Vec<UploadCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchStore for ScriptedStore {
    async fn upload(&self, batch: Vec<u8>, params: &UploadParams) -> Result<ContentId, UploadError> {
        if self
            .panics
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            panic!("store crashed mid-upload");
        }
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.started.send_modify(|started| *started += 1);

        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let readings = decode_batch(&batch).expect("engine sends valid batches");
        let scripted = self.failures.lock().unwrap().pop_front().flatten();
        let outcome = match scripted {
            Some(err) => Err(err),
            None => self.inner.upload(batch, params).await,
        };
        self.calls.lock().unwrap().push(UploadCall {
            readings,
            outcome: outcome.clone(),
        });

        self.active.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    async fn download(&self, id: &ContentId) -> Result<Vec<u8>, UploadError> {
        self.inner.download(id).await
    }
}

// ---------------------------------------------------------------------------
// RecordingNotifier
// ---------------------------------------------------------------------------

/// Ledger that records anchors and answers with a fixed response.
pub struct RecordingNotifier {
    response: Result<bool, NotifyError>,
    calls: Mutex<Vec<(String, ContentId)>>,
}

impl RecordingNotifier {
    pub fn accepting() -> Self {
        Self::responding(Ok(true))
    }

    pub fn declining() -> Self {
        Self::responding(Ok(false))
    }

    pub fn failing() -> Self {
        Self::responding(Err(NotifyError::Transport("ledger unreachable".to_string())))
    }

    fn responding(response: Result<bool, NotifyError>) -> Self {
        Self {
            response,
            calls: Mutex::default(),
        }
    }

    pub fn calls(&self) -> Vec<(String, ContentId)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LedgerNotifier for RecordingNotifier {
    async fn notify(&self, device_id: &str, content_id: &ContentId) -> Result<bool, NotifyError> {
        self.calls
            .lock()
            .unwrap()
            .push((device_id.to_string(), content_id.clone()));
        self.response.clone()
    }
}

// ---------------------------------------------------------------------------
// Engine helpers
// ---------------------------------------------------------------------------

/// Engine config with short, jitter-free retries.
pub fn fast_retry_config(max_attempts: Option<u32>) -> EngineConfig {
    EngineConfig {
        retry: RetryConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_factor: 2.0,
            jitter_percent: 0.0,
            max_attempts,
        },
        ..EngineConfig::default()
    }
}

pub fn engine_on(store: &Arc<ScriptedStore>, config: EngineConfig) -> BatchEngine {
    EngineBuilder::new(store.clone())
        .config(config)
        .build()
        .expect("valid config")
}

pub fn reading(device_id: &str, seq: i64) -> Reading {
    Reading::new(device_id, serde_json::json!(seq))
}
