//! One reconnecting push connection per run.
//!
//! A single task owns the transport, the reconnect timer and every in-flight
//! handler future. Messages are handed to the dispatcher in transport order
//! without waiting for earlier handlers to finish.

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt as _;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, FuturesUnordered};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument as _, debug, error, info, info_span, warn};

use crate::backoff::ErrorGate;
use crate::config::StreamConfig;
use crate::dispatch::{RunEventHandler, dispatch, is_terminal};
use crate::errors::{ConfigError, TransportError};
use crate::events::{ErrorEvent, RunEvent, decode_envelope};
use crate::model::RunId;

/// Inbound message bodies of one open transport. Dropping the stream closes it.
pub type MessageStream = BoxStream<'static, Result<String, TransportError>>;

pub struct TransportHandle {
    pub messages: MessageStream,
}

impl TransportHandle {
    pub fn new(messages: MessageStream) -> Self {
        Self { messages }
    }
}

/// Capability to open a server-push connection for a run.
#[async_trait::async_trait]
pub trait PushTransport: Send + Sync {
    async fn open(&self, run_id: &RunId) -> Result<TransportHandle, TransportError>;
}

/// Cancellation flag shared between a [`StreamHandle`] and its task.
///
/// Once cancelled it stays cancelled.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// How a connection task ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The producer sent `done`.
    Done,
    Cancelled,
}

/// Handle to a running connection task.
///
/// Dropping the handle cancels the connection. Keep it (or a
/// [`CancellationToken`] plus [`StreamHandle::join`]) alive for as long as
/// the run should stream.
pub struct StreamHandle {
    run_id: RunId,
    connection_id: uuid::Uuid,
    token: CancellationToken,
    task: Option<JoinHandle<StreamOutcome>>,
}

impl StreamHandle {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn connection_id(&self) -> uuid::Uuid {
        self.connection_id
    }

    /// Stops the connection: closes any open transport and prevents every
    /// future reconnect. Safe to call repeatedly.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancel_handle(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Waits for the task to end and for its in-flight handlers to complete.
    /// Dropping the returned future before it resolves cancels the connection.
    pub async fn join(mut self) -> StreamOutcome {
        let Some(task) = self.task.as_mut() else {
            return StreamOutcome::Cancelled;
        };
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(run_id = %self.run_id, error = %err, "run stream task failed");
                StreamOutcome::Cancelled
            }
        };
        self.task = None;
        outcome
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if self.task.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!(run_id = %self.run_id, "stream handle dropped; cancelling");
            self.token.cancel();
        }
    }
}

/// Opens reconnecting run streams over a [`PushTransport`].
#[derive(Clone)]
pub struct StreamConnection {
    transport: Arc<dyn PushTransport>,
    config: StreamConfig,
}

impl StreamConnection {
    pub fn new(transport: Arc<dyn PushTransport>) -> Self {
        Self {
            transport,
            config: StreamConfig::default(),
        }
    }

    pub fn with_config(mut self, config: StreamConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Spawns the connection task for `run_id` on the current tokio runtime.
    pub fn connect(
        &self,
        run_id: impl Into<RunId>,
        handler: Arc<dyn RunEventHandler>,
    ) -> StreamHandle {
        let run_id = run_id.into();
        let connection_id = uuid::Uuid::new_v4();
        let token = CancellationToken::new();
        let span = info_span!("run_stream", run_id = %run_id, connection_id = %connection_id);
        let task = tokio::spawn(
            run_connection(
                self.transport.clone(),
                handler,
                run_id.clone(),
                self.config.clone(),
                token.clone(),
            )
            .instrument(span),
        );
        StreamHandle {
            run_id,
            connection_id,
            token,
            task: Some(task),
        }
    }
}

type InFlight = FuturesUnordered<BoxFuture<'static, ()>>;

enum PumpEnd {
    Done,
    Cancelled,
    Failed(TransportError),
}

async fn run_connection(
    transport: Arc<dyn PushTransport>,
    handler: Arc<dyn RunEventHandler>,
    run_id: RunId,
    config: StreamConfig,
    token: CancellationToken,
) -> StreamOutcome {
    let backoff = config.backoff();
    let mut gate = ErrorGate::new(config.error_rate_limit(), config.quiet_startup_retries);
    let mut in_flight = InFlight::new();
    let mut retry_count = 0_u32;
    let mut received_any = false;

    let outcome = loop {
        if token.is_cancelled() {
            break StreamOutcome::Cancelled;
        }

        debug!(retry_count, "opening run stream");
        let Some(opened) = drive(transport.open(&run_id), &token, &mut in_flight).await else {
            break StreamOutcome::Cancelled;
        };
        let failure = match opened {
            Ok(handle) => {
                info!("run stream open");
                retry_count = 0;
                match pump(
                    handle.messages,
                    &handler,
                    &token,
                    &mut in_flight,
                    &mut received_any,
                )
                .await
                {
                    PumpEnd::Done => break StreamOutcome::Done,
                    PumpEnd::Cancelled => break StreamOutcome::Cancelled,
                    PumpEnd::Failed(err) => err,
                }
            }
            Err(err) => err,
        };

        if token.is_cancelled() {
            break StreamOutcome::Cancelled;
        }
        retry_count = retry_count.saturating_add(1);
        let delay = backoff.next_delay(retry_count);
        warn!(
            retry_count,
            delay_ms = delay.as_millis() as u64,
            error = %failure,
            "run stream failed; reconnecting"
        );
        if gate.admit(Instant::now(), retry_count, received_any) {
            let event = ErrorEvent::connection(format!("stream connection lost: {failure}"));
            in_flight.push(dispatch(handler.clone(), RunEvent::Error(event)));
        } else {
            debug!(retry_count, "connection error suppressed");
        }

        if drive(tokio::time::sleep(delay), &token, &mut in_flight)
            .await
            .is_none()
        {
            break StreamOutcome::Cancelled;
        }
    };

    while in_flight.next().await.is_some() {}
    info!(outcome = ?outcome, "run stream finished");
    outcome
}

/// Polls `future` to completion while keeping in-flight handlers moving.
/// Returns `None` if cancellation wins.
async fn drive<F: Future>(
    future: F,
    token: &CancellationToken,
    in_flight: &mut InFlight,
) -> Option<F::Output> {
    tokio::pin!(future);
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return None,
            Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
            output = &mut future => return Some(output),
        }
    }
}

async fn pump(
    mut messages: MessageStream,
    handler: &Arc<dyn RunEventHandler>,
    token: &CancellationToken,
    in_flight: &mut InFlight,
    received_any: &mut bool,
) -> PumpEnd {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return PumpEnd::Cancelled,
            Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
            next = messages.next() => match next {
                Some(Ok(text)) => {
                    *received_any = true;
                    let event = match decode_envelope(&text) {
                        Ok(event) => event,
                        Err(err) => {
                            warn!(error = %err, "dropping malformed run message");
                            continue;
                        }
                    };
                    let terminal = is_terminal(event.kind());
                    in_flight.push(dispatch(handler.clone(), event));
                    if terminal {
                        info!("done received; closing run stream");
                        return PumpEnd::Done;
                    }
                }
                Some(Err(err)) => return PumpEnd::Failed(err),
                None => return PumpEnd::Failed(TransportError::Closed),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::HandlerError;
    use crate::events::{ErrorOrigin, TestResult};
    use futures::stream;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    enum Step {
        Fail,
        /// Yields the messages, then ends the stream.
        Messages(Vec<String>),
        /// Yields the messages, then stays open.
        MessagesThenIdle(Vec<String>),
    }

    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<Step>>,
        opens: Mutex<Vec<Instant>>,
    }

    impl ScriptedTransport {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(steps.into()),
                opens: Mutex::new(Vec::new()),
            })
        }

        fn open_count(&self) -> usize {
            self.opens.lock().expect("lock").len()
        }

        fn open_gaps_ms(&self) -> Vec<u128> {
            let opens = self.opens.lock().expect("lock");
            opens
                .windows(2)
                .map(|pair| (pair[1] - pair[0]).as_millis())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl PushTransport for ScriptedTransport {
        async fn open(&self, _run_id: &RunId) -> Result<TransportHandle, TransportError> {
            self.opens.lock().expect("lock").push(Instant::now());
            let step = self.script.lock().expect("lock").pop_front();
            let messages: MessageStream = match step {
                Some(Step::Fail) => return Err(TransportError::connect("refused")),
                Some(Step::Messages(items)) => stream::iter(items.into_iter().map(Ok)).boxed(),
                Some(Step::MessagesThenIdle(items)) => stream::iter(items.into_iter().map(Ok))
                    .chain(stream::pending())
                    .boxed(),
                None => stream::pending().boxed(),
            };
            Ok(TransportHandle::new(messages))
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        errors: Mutex<Vec<ErrorEvent>>,
    }

    impl Recorder {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().expect("lock").clone()
        }

        fn errors(&self) -> Vec<ErrorEvent> {
            self.errors.lock().expect("lock").clone()
        }
    }

    #[async_trait::async_trait]
    impl RunEventHandler for Recorder {
        async fn on_batch_start(&self, _event: crate::BatchStart) -> Result<(), HandlerError> {
            self.seen.lock().expect("lock").push("batchStart".into());
            Ok(())
        }

        async fn on_test(&self, event: TestResult) -> Result<(), HandlerError> {
            match event.name.as_str() {
                "slow" => tokio::time::sleep(Duration::from_millis(100)).await,
                "boom" => panic!("handler exploded"),
                "bad" => return Err(HandlerError::new("rejected")),
                _ => {}
            }
            self.seen.lock().expect("lock").push(event.name);
            Ok(())
        }

        async fn on_error(&self, event: ErrorEvent) -> Result<(), HandlerError> {
            self.errors.lock().expect("lock").push(event);
            Ok(())
        }

        async fn on_done(&self) -> Result<(), HandlerError> {
            self.seen.lock().expect("lock").push("done".into());
            Ok(())
        }
    }

    fn envelope(kind: &str, payload: serde_json::Value) -> String {
        json!({"type": kind, "payload": payload}).to_string()
    }

    fn test_message(name: &str) -> String {
        envelope(
            "test",
            json!({"Name": name, "Status": "passed", "Stage": 0, "path": "p"}),
        )
    }

    fn start(transport: Arc<ScriptedTransport>, recorder: Arc<Recorder>) -> StreamHandle {
        StreamConnection::new(transport).connect("run-1", recorder)
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_delays_follow_backoff_policy() {
        let transport = ScriptedTransport::new((0..7).map(|_| Step::Fail).collect());
        let recorder = Arc::new(Recorder::default());
        let handle = start(transport.clone(), recorder);

        tokio::time::sleep(Duration::from_secs(60)).await;
        handle.cancel();
        assert_eq!(handle.join().await, StreamOutcome::Cancelled);

        assert_eq!(transport.open_count(), 8);
        assert_eq!(
            transport.open_gaps_ms(),
            vec![500, 1000, 2000, 4000, 5000, 5000, 5000]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_prevents_reconnect() {
        let transport = ScriptedTransport::new(vec![Step::Fail]);
        let recorder = Arc::new(Recorder::default());
        let handle = start(transport.clone(), recorder);

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(transport.open_count(), 1);
        assert!(handle.is_finished());
        assert_eq!(handle.join().await, StreamOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_cancels_the_connection() {
        let transport = ScriptedTransport::new((0..5).map(|_| Step::Fail).collect());
        let recorder = Arc::new(Recorder::default());
        let handle = start(transport.clone(), recorder);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let token = handle.cancel_handle();
        drop(handle);
        assert!(token.is_cancelled());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_handle_drop_leaves_token_untouched() {
        let transport =
            ScriptedTransport::new(vec![Step::Messages(vec![envelope("done", json!({}))])]);
        let recorder = Arc::new(Recorder::default());
        let handle = start(transport, recorder);
        let token = handle.cancel_handle();
        assert_eq!(handle.join().await, StreamOutcome::Done);
        assert!(!token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent_and_closes_open_stream() {
        let transport = ScriptedTransport::new(vec![Step::MessagesThenIdle(vec![envelope(
            "batchStart",
            json!({"total": 1}),
        )])]);
        let recorder = Arc::new(Recorder::default());
        let handle = start(transport.clone(), recorder.clone());

        tokio::time::sleep(Duration::from_millis(10)).await;
        let token = handle.cancel_handle();
        handle.cancel();
        token.cancel();
        handle.cancel();
        assert!(token.is_cancelled());
        assert_eq!(handle.join().await, StreamOutcome::Cancelled);
        assert_eq!(transport.open_count(), 1);
        assert_eq!(recorder.seen(), vec!["batchStart"]);
    }

    #[tokio::test(start_paused = true)]
    async fn done_closes_without_reconnecting() {
        let transport = ScriptedTransport::new(vec![Step::MessagesThenIdle(vec![
            envelope("batchStart", json!({"total": 1})),
            envelope("done", json!(null)),
            test_message("after-done"),
        ])]);
        let recorder = Arc::new(Recorder::default());
        let handle = start(transport.clone(), recorder.clone());

        assert_eq!(handle.join().await, StreamOutcome::Done);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.open_count(), 1);
        assert_eq!(recorder.seen(), vec!["batchStart", "done"]);
        assert!(recorder.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_messages_and_faulty_handlers_do_not_stop_the_stream() {
        let transport = ScriptedTransport::new(vec![Step::MessagesThenIdle(vec![
            "{not json".to_string(),
            envelope("heartbeat", json!({})),
            test_message("bad"),
            test_message("boom"),
            test_message("t1"),
            envelope("done", json!({})),
        ])]);
        let recorder = Arc::new(Recorder::default());
        let handle = start(transport.clone(), recorder.clone());

        assert_eq!(handle.join().await, StreamOutcome::Done);
        assert_eq!(transport.open_count(), 1);
        assert_eq!(recorder.seen(), vec!["t1", "done"]);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_invocations_interleave() {
        let transport = ScriptedTransport::new(vec![Step::MessagesThenIdle(vec![
            test_message("slow"),
            test_message("fast"),
            envelope("done", json!({})),
        ])]);
        let recorder = Arc::new(Recorder::default());
        let handle = start(transport, recorder.clone());

        assert_eq!(handle.join().await, StreamOutcome::Done);
        assert_eq!(recorder.seen(), vec!["fast", "done", "slow"]);
    }

    #[tokio::test(start_paused = true)]
    async fn startup_failures_stay_quiet_until_third_retry() {
        let transport = ScriptedTransport::new((0..4).map(|_| Step::Fail).collect());
        let recorder = Arc::new(Recorder::default());
        let handle = start(transport.clone(), recorder.clone());

        tokio::time::sleep(Duration::from_secs(30)).await;
        handle.cancel();
        handle.join().await;

        // Failures 1 and 2 are quiet; 3 and 4 are two seconds apart and both surface.
        let errors = recorder.errors();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.origin == ErrorOrigin::Transport));
        assert!(errors.iter().all(|e| e.path.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn errors_after_data_are_rate_limited_and_open_resets_retries() {
        let batch = envelope("batchStart", json!({"total": 1}));
        let transport = ScriptedTransport::new(vec![
            Step::Messages(vec![batch.clone()]),
            Step::Messages(vec![batch]),
        ]);
        let recorder = Arc::new(Recorder::default());
        let handle = start(transport.clone(), recorder.clone());

        tokio::time::sleep(Duration::from_secs(10)).await;
        handle.cancel();
        handle.join().await;

        assert_eq!(transport.open_count(), 3);
        assert_eq!(transport.open_gaps_ms(), vec![500, 500]);
        assert_eq!(recorder.errors().len(), 1);
        assert_eq!(recorder.seen(), vec!["batchStart", "batchStart"]);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let transport = ScriptedTransport::new(Vec::new());
        let config = StreamConfig {
            initial_backoff_ms: 0,
            ..StreamConfig::default()
        };
        assert!(StreamConnection::new(transport).with_config(config).is_err());
    }

    #[tokio::test]
    async fn token_wakes_waiters() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        token.cancel();
        task.await.expect("join");
        assert!(token.is_cancelled());
    }
}
