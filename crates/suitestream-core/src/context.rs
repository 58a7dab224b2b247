//! Per-run wiring of store, progress and records behind one handler set.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::connection::{StreamConnection, StreamHandle};
use crate::dispatch::RunEventHandler;
use crate::errors::HandlerError;
use crate::events::{
    BatchStart, ErrorEvent, ErrorOrigin, SuiteEnd, SuiteStart, TestResult, TestStart, non_empty,
};
use crate::model::{RunId, Status};
use crate::progress::ProgressAggregator;
use crate::records::RunRecordCache;
use crate::store::{StateStore, TestUpdate};

/// Everything one run view owns. Several contexts can coexist in a process.
#[derive(Clone)]
pub struct RunContext {
    run_id: RunId,
    store: StateStore,
    progress: ProgressAggregator,
    records: Option<Arc<RunRecordCache>>,
}

impl RunContext {
    pub fn new(run_id: impl Into<RunId>) -> Self {
        Self {
            run_id: run_id.into(),
            store: StateStore::new(),
            progress: ProgressAggregator::new(),
            records: None,
        }
    }

    pub fn with_records(mut self, records: Arc<RunRecordCache>) -> Self {
        self.records = Some(records);
        self
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn progress(&self) -> &ProgressAggregator {
        &self.progress
    }

    pub fn records(&self) -> Option<&Arc<RunRecordCache>> {
        self.records.as_ref()
    }

    /// Handler set that reconciles run events into this context.
    pub fn handler(&self) -> Arc<dyn RunEventHandler> {
        Arc::new(Reconciler {
            store: self.store.clone(),
            progress: self.progress.clone(),
            records: self.records.clone(),
            active_suite: Mutex::new(None),
        })
    }

    /// Starts streaming this run through `connection`.
    pub fn connect(&self, connection: &StreamConnection) -> StreamHandle {
        connection.connect(self.run_id.clone(), self.handler())
    }
}

struct Reconciler {
    store: StateStore,
    progress: ProgressAggregator,
    records: Option<Arc<RunRecordCache>>,
    /// Suite between its `suiteStart` and `suiteEnd`.
    active_suite: Mutex<Option<String>>,
}

impl Reconciler {
    fn active_suite(&self) -> Option<String> {
        self.active_suite
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Suite an event belongs to: its own path, else the suite in progress.
    fn resolve_path(&self, path: Option<&str>) -> Option<String> {
        non_empty(path)
            .map(str::to_string)
            .or_else(|| self.active_suite())
            .or_else(|| self.progress.snapshot().current_suite)
    }

    /// Writes the suite's cached record off the async workers. The in-memory
    /// merge has already happened, so handler completion order does not matter.
    async fn flush(&self, path: String) {
        let Some(records) = self.records.clone().filter(|r| r.is_enabled()) else {
            return;
        };
        if let Err(err) = tokio::task::spawn_blocking(move || records.flush(&path)).await {
            warn!(error = %err, "run record write task failed");
        }
    }
}

#[async_trait::async_trait]
impl RunEventHandler for Reconciler {
    async fn on_batch_start(&self, event: BatchStart) -> Result<(), HandlerError> {
        debug!(total = event.total, "batch started");
        self.progress.batch_start(event.total);
        Ok(())
    }

    async fn on_suite_start(&self, event: SuiteStart) -> Result<(), HandlerError> {
        let Some(path) = event.suite_key().map(str::to_string) else {
            return Err(HandlerError::new("suiteStart without path or name"));
        };
        debug!(path = %path, total = event.total, "suite started");
        *self
            .active_suite
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(path.clone());
        self.store.reset_suite(&path, event.name.as_deref());
        self.progress.suite_start(&path, event.total, &event.stages);
        Ok(())
    }

    async fn on_test_start(&self, event: TestStart) -> Result<(), HandlerError> {
        if event.name.is_empty() {
            return Err(HandlerError::new("testStart without Name"));
        }
        self.progress
            .test_start(non_empty(event.path.as_deref()), &event.name, event.stage);
        Ok(())
    }

    async fn on_test(&self, event: TestResult) -> Result<(), HandlerError> {
        let Some(path) = self.resolve_path(event.path.as_deref()) else {
            return Err(HandlerError::new(format!(
                "test result {} has no suite",
                event.name
            )));
        };
        let update = TestUpdate {
            status: event.status,
            duration_ms: event.duration_ms,
            messages: event.messages,
        };
        let Some(record) = self.store.set_test(&path, &event.name, update) else {
            return Err(HandlerError::new("test result without Name"));
        };
        self.progress
            .test_result(non_empty(event.path.as_deref()), &event.name, event.stage);
        if let Some(records) = &self.records {
            records.merge_test(&path, record);
        }
        self.flush(path).await;
        Ok(())
    }

    async fn on_suite_end(&self, event: SuiteEnd) -> Result<(), HandlerError> {
        let Some(path) = self.resolve_path(event.suite_key()) else {
            return Err(HandlerError::new("suiteEnd without path"));
        };
        debug!(path = %path, failed = event.summary.failed, "suite ended");
        self.store.set_summary(&path, event.summary);

        let mut tests = Vec::new();
        for test in event.tests.unwrap_or_default() {
            let update = TestUpdate {
                status: test.status,
                duration_ms: test.duration_ms,
                messages: test.messages,
            };
            if let Some(record) = self.store.set_test(&path, &test.name, update) {
                tests.push(record);
            }
        }
        self.progress.suite_end(Some(path.as_str()), &event.summary);
        {
            let mut active = self
                .active_suite
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if active.as_deref() == Some(path.as_str()) {
                *active = None;
            }
        }

        if let Some(records) = &self.records {
            for record in tests {
                records.merge_test(&path, record);
            }
            records.merge_summary(&path, event.summary);
        }
        self.flush(path).await;
        Ok(())
    }

    async fn on_batch_end(&self) -> Result<(), HandlerError> {
        self.progress.batch_end();
        Ok(())
    }

    async fn on_error(&self, event: ErrorEvent) -> Result<(), HandlerError> {
        let path = non_empty(event.path.as_deref())
            .map(str::to_string)
            .or_else(|| self.active_suite());
        self.store.report_error(path.as_deref(), &event.error);
        if event.origin == ErrorOrigin::Producer
            && let Some(path) = path
        {
            self.store.set_badge(&path, Status::Failed);
        }
        Ok(())
    }

    async fn on_done(&self) -> Result<(), HandlerError> {
        debug!("run finished");
        Ok(())
    }
}
