use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use tracing::{debug, error, warn};

use crate::errors::HandlerError;
use crate::events::{
    BatchStart, ErrorEvent, EventKind, RunEvent, SuiteEnd, SuiteStart, TestResult, TestStart,
};

/// Per-event-kind callbacks for one run.
///
/// Every method defaults to a no-op, so implementors only override the kinds
/// they care about. Invocations may overlap: the dispatcher hands the next
/// message over as soon as a handler awaits.
#[async_trait::async_trait]
pub trait RunEventHandler: Send + Sync {
    async fn on_batch_start(&self, _event: BatchStart) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_suite_start(&self, _event: SuiteStart) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_test_start(&self, _event: TestStart) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_test(&self, _event: TestResult) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_suite_end(&self, _event: SuiteEnd) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_batch_end(&self) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_error(&self, _event: ErrorEvent) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_done(&self) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Handler that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl RunEventHandler for NoopHandler {}

/// Routes one event to its handler method.
///
/// The returned future never fails: handler errors are logged at `warn` and
/// panics at `error`, so one faulty handler cannot stall the stream.
pub fn dispatch(handler: Arc<dyn RunEventHandler>, event: RunEvent) -> BoxFuture<'static, ()> {
    let kind = event.kind();
    async move {
        debug!(event = %kind, "dispatching run event");
        let invocation = async {
            match event {
                RunEvent::BatchStart(payload) => handler.on_batch_start(payload).await,
                RunEvent::SuiteStart(payload) => handler.on_suite_start(payload).await,
                RunEvent::TestStart(payload) => handler.on_test_start(payload).await,
                RunEvent::Test(payload) => handler.on_test(payload).await,
                RunEvent::SuiteEnd(payload) => handler.on_suite_end(payload).await,
                RunEvent::BatchEnd => handler.on_batch_end().await,
                RunEvent::Error(payload) => handler.on_error(payload).await,
                RunEvent::Done => handler.on_done().await,
            }
        };
        match AssertUnwindSafe(invocation).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(event = %kind, error = %err, "run event handler failed"),
            Err(panic) => error!(
                event = %kind,
                panic = panic_message(panic.as_ref()),
                "run event handler panicked"
            ),
        }
    }
    .boxed()
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// `true` for the kind that ends a stream.
pub(crate) fn is_terminal(kind: EventKind) -> bool {
    kind == EventKind::Done
}
