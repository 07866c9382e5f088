//! telebatch-core: Core library for telebatch
//!
//! This crate buffers telemetry readings per device, flushes each device's
//! buffer on a one-shot timer, and uploads the batches one at a time to a
//! content-addressed store, optionally anchoring each upload on a ledger.
//!
//! # Architecture
//!
//! ```text
//! Device post → Reading::from_json → BatchEngine
//!                                       │
//!                   DeviceBuffers ◄─────┤────► FlushTimers
//!                                       ▼
//!                      UploadQueue (single worker, FIFO)
//!                                       │
//!                     BatchStore ───────┴──────► LedgerNotifier
//! ```
//!
//! # Modules
//!
//! - `reading`: Reading model, validation, and batch wire format
//! - `buffer`: Per-device ordered buffers
//! - `scheduler`: One-shot per-device flush timers
//! - `queue`: Upload queue, worker permit, and flush handles
//! - `retry`: Bounded exponential backoff for failed uploads
//! - `engine`: The batching engine tying the above together
//! - `storage`: `BatchStore` trait and bundled stores
//! - `ledger`: `LedgerNotifier` trait
//! - `config`: TOML configuration
//! - `logging`: tracing subscriber setup
//! - `error`: Error types with remediation hints
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod queue;
pub mod reading;
pub mod retry;
pub mod scheduler;
pub mod storage;

pub use engine::{BatchEngine, EngineBuilder};
pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
