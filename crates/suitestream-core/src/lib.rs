//! Reconnecting run-event stream and state reconciliation for test-suite batches.
//!
//! A producer pushes `{type, payload}` envelopes describing batch, suite and
//! test progress. [`StreamConnection`] keeps one transport open per run and
//! reconnects with capped backoff; [`RunContext`] folds the events into a
//! [`StateStore`], a [`ProgressAggregator`] and an optional [`RunRecordCache`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use suitestream_core::{PushTransport, RunContext, StreamConnection};
//!
//! # async fn demo(transport: Arc<dyn PushTransport>) {
//! let context = RunContext::new("run-42");
//! context.store().subscribe(|change| println!("{change:?}"));
//!
//! let handle = context.connect(&StreamConnection::new(transport));
//! handle.join().await;
//! println!("{:?}", context.progress().snapshot().totals);
//! # }
//! ```

/// Reconnect delay policy and error surfacing gate.
pub mod backoff;
/// Stream connection settings.
pub mod config;
/// Transport abstraction, cancellation and the per-run connection task.
pub mod connection;
/// Per-run wiring of store, progress and records.
pub mod context;
/// Handler trait and failure-isolating dispatch.
pub mod dispatch;
/// Error taxonomy.
pub mod errors;
/// Run event model and envelope codec.
pub mod events;
/// Identifiers, statuses and test records.
pub mod model;
/// Tracing subscriber setup.
pub mod observability;
/// Batch, suite and stage counters.
pub mod progress;
/// Optional per-suite record persistence.
pub mod records;
/// Suite state with sticky badges.
pub mod store;

pub use backoff::BackoffPolicy;
pub use config::StreamConfig;
pub use connection::{
    CancellationToken, MessageStream, PushTransport, StreamConnection, StreamHandle,
    StreamOutcome, TransportHandle,
};
pub use context::RunContext;
pub use dispatch::{NoopHandler, RunEventHandler, dispatch};
pub use errors::{ConfigError, HandlerError, ProtocolError, StorageError, TransportError};
pub use events::{
    BatchStart, ErrorEvent, ErrorOrigin, EventKind, RunEvent, SuiteEnd, SuiteEndTest, SuiteStart,
    TestResult, TestStart, decode_envelope, encode_envelope,
};
pub use model::{RunId, Status, SuiteSummary, TestRecord, normalize_status};
pub use observability::{
    LogOutput, ObservabilitySettings, init_observability, init_observability_with,
};
pub use progress::{BatchTotals, Counter, ProgressAggregator, ProgressSnapshot, StageProgress};
pub use records::{FileRecordStorage, MemoryRecordStorage, RecordStorage, RunRecord, RunRecordCache};
pub use store::{StateStore, StoreChange, SubscriptionId, SuiteState, TestUpdate};
