//! Queue-consuming worker.
//!
//! A [`Worker`] long-polls the queue, runs each received message through the
//! pipeline and the router, and acknowledges it once the pipeline succeeded.
//!
//! ## States
//!
//! ```text
//!        receive                 batch done
//! Idle ──────────► Processing ──────────────► Idle
//!  │                    │
//!  │ terminate          │ terminate (deferred)
//!  ▼                    ▼
//! Stopped ◄──────── next loop top
//! ```
//!
//! A termination request while idle stops the worker at once, abandoning an
//! in-flight long-poll. While processing, the request is recorded and the
//! worker stops after the current batch.

use crate::dlq::DeadLetters;
use crate::hooks::{panic_message, Hooks, ProcessingContext};
use crate::message::{MessageError, ReceivedMessage};
use crate::pipeline::{Pipeline, PipelineError};
use crate::queue::{Queue, ReceiveOptions};
use crate::router::{Delivery, Router};
use crate::shutdown::ShutdownSignal;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Where a worker sits in the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    /// The only worker of the process
    Standalone,
    /// Group worker running on the coordinating task
    GroupLead,
    /// Group worker running on a spawned task
    GroupMember,
}

/// Identity of a worker, as seen by logs and hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub index: usize,
    /// `<base>-<index>`
    pub name: String,
    pub role: WorkerRole,
}

impl WorkerInfo {
    pub fn new(index: usize, base: &str, role: WorkerRole) -> Self {
        Self {
            index,
            name: format!("{base}-{index}"),
            role,
        }
    }
}

/// Result of processing one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Payload reached the device's route; message acknowledged
    Delivered { route: String },

    /// No client connected; message acknowledged
    NoRoute,

    /// Route was registered but the send failed; message acknowledged
    DeliveryFailed { route: String, reason: String },

    /// Processing failed; message left for redelivery
    Failed { reason: String },

    /// Processing failed on the last allowed receive; message moved to the
    /// dead letters and acknowledged
    DeadLettered { reason: String },
}

impl ProcessOutcome {
    /// Returns true if the message was removed from the queue
    pub fn is_acknowledged(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

/// Why a worker loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Termination requested while waiting for work
    Idle,
    /// Termination requested mid-batch; the batch was completed first
    AfterBatch,
    /// Terminated without waiting for in-flight work (group shutdown)
    Immediate,
}

/// How a worker reacts to a termination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationDecision {
    Immediate,
    Deferred,
}

/// Failures that leave a message un-acknowledged.
#[derive(Error, Debug)]
enum ProcessError {
    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Polling parameters of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Long-poll wait; zero polls without blocking
    pub wait_time: Duration,

    /// Upper bound on messages per receive
    pub batch_size: usize,

    /// How long received messages stay hidden from other consumers
    pub visibility_timeout: Duration,

    /// Dead-letter failing messages once they were received this many times
    pub max_receives: Option<u32>,

    /// Sleep after an empty batch when `wait_time` is zero
    pub idle_backoff: Duration,

    /// Sleep after a queue error
    pub error_backoff: Duration,
}

impl PollSettings {
    fn receive_options(&self) -> ReceiveOptions {
        ReceiveOptions {
            max_messages: self.batch_size,
            wait_time: self.wait_time,
            visibility_timeout: self.visibility_timeout,
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            wait_time: Duration::from_secs(20),
            batch_size: 10,
            visibility_timeout: Duration::from_secs(30),
            max_receives: None,
            idle_backoff: Duration::from_millis(10),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Everything a worker needs, shared by every worker of a process.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Arc<dyn Queue>,
    pub pipeline: Arc<Pipeline>,
    pub router: Arc<Router>,
    pub hooks: Arc<Hooks>,
    pub dead_letters: Option<Arc<dyn DeadLetters>>,
    pub settings: PollSettings,
}

impl WorkerContext {
    pub fn new(queue: Arc<dyn Queue>, pipeline: Arc<Pipeline>, router: Arc<Router>) -> Self {
        Self {
            queue,
            pipeline,
            router,
            hooks: Arc::new(Hooks::new()),
            dead_letters: None,
            settings: PollSettings::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<Hooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_dead_letters(mut self, dead_letters: Arc<dyn DeadLetters>) -> Self {
        self.dead_letters = Some(dead_letters);
        self
    }

    pub fn with_settings(mut self, settings: PollSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// Something that can be readied and then run until shut down.
#[async_trait]
pub trait Runnable: Send + Sync {
    /// Fire readiness hooks
    fn ready(&self);

    /// Run until `shutdown` ends the loop
    async fn run(&self, shutdown: &ShutdownSignal) -> WorkerExit;
}

#[derive(Default)]
struct WorkerState {
    termination_requested: AtomicBool,
    /// Set when the request arrived mid-batch
    deferred: AtomicBool,
    processing: AtomicBool,
    /// Wakes an idle loop out of its poll or backoff
    terminate: ShutdownSignal,
}

/// A single queue consumer.
pub struct Worker {
    info: WorkerInfo,
    ctx: WorkerContext,
    state: WorkerState,
}

impl Worker {
    pub fn new(index: usize, base_name: &str, role: WorkerRole, ctx: WorkerContext) -> Self {
        Self {
            info: WorkerInfo::new(index, base_name, role),
            ctx,
            state: WorkerState::default(),
        }
    }

    pub fn info(&self) -> &WorkerInfo {
        &self.info
    }

    pub fn is_processing(&self) -> bool {
        self.state.processing.load(Ordering::SeqCst)
    }

    /// Record a termination request and report whether it takes effect now.
    pub fn request_termination(&self) -> TerminationDecision {
        self.state
            .termination_requested
            .store(true, Ordering::SeqCst);

        let decision = if self.is_processing() {
            self.state.deferred.store(true, Ordering::SeqCst);
            info!(
                worker = %self.info.name,
                "Termination requested: busy, waiting for the current batch"
            );
            TerminationDecision::Deferred
        } else {
            info!(
                worker = %self.info.name,
                "Termination requested: idle, terminating immediately"
            );
            TerminationDecision::Immediate
        };

        self.state.terminate.trigger();
        decision
    }

    fn stop(&self, exit: WorkerExit) -> WorkerExit {
        info!(worker = %self.info.name, exit = ?exit, "Worker stopped");
        exit
    }

    /// Sleep, cut short by shutdown or a termination request.
    async fn pause(&self, duration: Duration, shutdown: &ShutdownSignal) {
        tokio::select! {
            _ = shutdown.triggered() => {}
            _ = self.state.terminate.triggered() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    async fn process_batch(&self, batch: Vec<ReceivedMessage>, shutdown: &ShutdownSignal) {
        self.state.processing.store(true, Ordering::SeqCst);
        debug!(worker = %self.info.name, count = batch.len(), "Processing batch");

        let work = async {
            for message in batch {
                self.process(message).await;
            }
        };
        tokio::pin!(work);

        // The batch is never preempted; a signal only records the request.
        let mut watching = true;
        loop {
            tokio::select! {
                _ = &mut work => break,
                _ = shutdown.triggered(), if watching => {
                    watching = false;
                    self.request_termination();
                }
            }
        }
        if watching && shutdown.is_triggered() {
            self.request_termination();
        }

        self.state.processing.store(false, Ordering::SeqCst);
    }

    async fn process(&self, message: ReceivedMessage) {
        let ctx = ProcessingContext {
            worker: &self.info,
            queue: self.ctx.queue.name(),
            message_id: &message.id,
            receive_count: message.receive_count,
        };
        self.ctx.hooks.processing_started(&ctx);

        let outcome = match AssertUnwindSafe(self.handle(&message)).catch_unwind().await {
            Ok(Ok(delivery)) => self.acknowledge(&message, delivery).await,
            Ok(Err(e)) => self.fail(&message, e.to_string()).await,
            Err(panic) => {
                let reason = format!("processing panicked: {}", panic_message(panic.as_ref()));
                self.fail(&message, reason).await
            }
        };

        self.ctx.hooks.processing_finished(&ctx, &outcome);
    }

    async fn handle(&self, message: &ReceivedMessage) -> Result<Delivery, ProcessError> {
        let decoded = message.decode()?;
        let transformed = self.ctx.pipeline.run(decoded).await?;
        let (device_id, payload) = transformed.into_delivery()?;
        Ok(self.ctx.router.deliver(&device_id, &payload).await)
    }

    async fn acknowledge(&self, message: &ReceivedMessage, delivery: Delivery) -> ProcessOutcome {
        if let Err(e) = self.ctx.queue.delete(&message.ack_token).await {
            error!(
                worker = %self.info.name,
                queue = %self.ctx.queue.name(),
                message_id = %message.id,
                error = %e,
                "Failed to acknowledge message"
            );
            return ProcessOutcome::Failed {
                reason: e.to_string(),
            };
        }

        debug!(
            worker = %self.info.name,
            message_id = %message.id,
            "Message acknowledged"
        );

        match delivery {
            Delivery::Delivered { route } => ProcessOutcome::Delivered { route },
            Delivery::NoRoute => ProcessOutcome::NoRoute,
            Delivery::Failed { route, reason } => ProcessOutcome::DeliveryFailed { route, reason },
        }
    }

    async fn fail(&self, message: &ReceivedMessage, reason: String) -> ProcessOutcome {
        let queue = self.ctx.queue.name();
        error!(
            worker = %self.info.name,
            queue = %queue,
            message_id = %message.id,
            receive_count = message.receive_count,
            error = %reason,
            "Message processing failed"
        );

        let (Some(max_receives), Some(dead_letters)) =
            (self.ctx.settings.max_receives, &self.ctx.dead_letters)
        else {
            return ProcessOutcome::Failed { reason };
        };
        if message.receive_count < max_receives {
            return ProcessOutcome::Failed { reason };
        }

        warn!(
            message_id = %message.id,
            receive_count = message.receive_count,
            max_receives = max_receives,
            "Max receives reached, moving message to dead letters"
        );

        if let Err(e) = dead_letters.bury(message, queue, &reason).await {
            error!(
                queue = %queue,
                message_id = %message.id,
                error = %e,
                "Failed to dead-letter message, leaving it for redelivery"
            );
            return ProcessOutcome::Failed { reason };
        }

        match self.ctx.queue.delete(&message.ack_token).await {
            Ok(()) => ProcessOutcome::DeadLettered { reason },
            Err(e) => {
                error!(
                    queue = %queue,
                    message_id = %message.id,
                    error = %e,
                    "Failed to acknowledge dead-lettered message"
                );
                ProcessOutcome::Failed { reason }
            }
        }
    }
}

#[async_trait]
impl Runnable for Worker {
    fn ready(&self) {
        match self.info.role {
            WorkerRole::GroupMember => self.ctx.hooks.group_member_ready(&self.info),
            WorkerRole::Standalone | WorkerRole::GroupLead => {
                self.ctx.hooks.worker_ready(&self.info)
            }
        }
    }

    async fn run(&self, shutdown: &ShutdownSignal) -> WorkerExit {
        let settings = self.ctx.settings;
        info!(
            worker = %self.info.name,
            queue = %self.ctx.queue.name(),
            batch_size = settings.batch_size,
            wait_time_secs = settings.wait_time.as_secs(),
            "Worker listening"
        );

        loop {
            if self.state.termination_requested.load(Ordering::SeqCst) {
                let exit = if self.state.deferred.load(Ordering::SeqCst) {
                    WorkerExit::AfterBatch
                } else {
                    WorkerExit::Idle
                };
                return self.stop(exit);
            }
            if shutdown.is_triggered() {
                self.request_termination();
                return self.stop(WorkerExit::Idle);
            }

            let received = tokio::select! {
                biased;
                _ = shutdown.triggered() => {
                    self.request_termination();
                    return self.stop(WorkerExit::Idle);
                }
                _ = self.state.terminate.triggered() => {
                    return self.stop(WorkerExit::Idle);
                }
                result = self.ctx.queue.receive(settings.receive_options()) => result,
            };

            let batch = match received {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(
                        worker = %self.info.name,
                        queue = %self.ctx.queue.name(),
                        error = %e,
                        "Queue receive failed"
                    );
                    self.pause(settings.error_backoff, shutdown).await;
                    continue;
                }
            };

            if batch.is_empty() {
                if settings.wait_time.is_zero() {
                    self.pause(settings.idle_backoff, shutdown).await;
                }
                continue;
            }

            self.process_batch(batch, shutdown).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Directory, MemoryDirectory};
    use crate::dlq::MemoryDeadLetters;
    use crate::hooks::LifecycleHook;
    use crate::message::Message;
    use crate::pipeline::{Transform, TransformError};
    use crate::queue::MemoryQueue;
    use crate::transport::MemoryTransport;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        outcomes: Mutex<Vec<(String, ProcessOutcome)>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn outcomes(&self) -> Vec<(String, ProcessOutcome)> {
            self.outcomes.lock().unwrap().clone()
        }
    }

    impl LifecycleHook for Recorder {
        fn worker_ready(&self, worker: &WorkerInfo) {
            self.events
                .lock()
                .unwrap()
                .push(format!("worker_ready:{}", worker.name));
        }

        fn group_member_ready(&self, worker: &WorkerInfo) {
            self.events
                .lock()
                .unwrap()
                .push(format!("member_ready:{}", worker.name));
        }

        fn processing_started(&self, ctx: &ProcessingContext<'_>) {
            self.events
                .lock()
                .unwrap()
                .push(format!("started:{}", ctx.message_id));
        }

        fn processing_finished(&self, ctx: &ProcessingContext<'_>, outcome: &ProcessOutcome) {
            self.events
                .lock()
                .unwrap()
                .push(format!("finished:{}", ctx.message_id));
            self.outcomes
                .lock()
                .unwrap()
                .push((ctx.message_id.to_string(), outcome.clone()));
        }
    }

    struct PanickingHook;

    impl LifecycleHook for PanickingHook {
        fn processing_started(&self, _ctx: &ProcessingContext<'_>) {
            panic!("hook exploded");
        }
    }

    /// Counts calls, optionally rejecting or panicking.
    struct Stage {
        calls: AtomicUsize,
        behavior: &'static str,
    }

    impl Stage {
        fn new(behavior: &'static str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                behavior,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transform for Stage {
        fn name(&self) -> &str {
            "stage"
        }

        async fn transform(&self, message: Message) -> Result<Message, TransformError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                "reject" => Err(TransformError::rejected("stage rejected")),
                "panic" if message.body.get("explode").is_some() => panic!("stage exploded"),
                _ => Ok(message),
            }
        }
    }

    /// Triggers shutdown the first time it runs.
    struct TriggerShutdown(ShutdownSignal);

    #[async_trait]
    impl Transform for TriggerShutdown {
        fn name(&self) -> &str {
            "trigger_shutdown"
        }

        async fn transform(&self, message: Message) -> Result<Message, TransformError> {
            self.0.trigger();
            Ok(message)
        }
    }

    struct Harness {
        queue: Arc<MemoryQueue>,
        directory: Arc<MemoryDirectory>,
        transport: Arc<MemoryTransport>,
        recorder: Arc<Recorder>,
        ctx: WorkerContext,
    }

    fn harness(pipeline: Pipeline) -> Harness {
        let queue = Arc::new(MemoryQueue::new("test-queue"));
        let directory = Arc::new(MemoryDirectory::new());
        let transport = Arc::new(MemoryTransport::new());
        let recorder = Arc::new(Recorder::default());
        let router = Arc::new(Router::new(directory.clone(), transport.clone()));

        let ctx = WorkerContext::new(queue.clone(), Arc::new(pipeline), router)
            .with_hooks(Arc::new(Hooks::new().with(recorder.clone())))
            .with_settings(PollSettings {
                wait_time: Duration::from_millis(50),
                error_backoff: Duration::from_millis(20),
                ..PollSettings::default()
            });

        Harness {
            queue,
            directory,
            transport,
            recorder,
            ctx,
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Run a worker until `expected` messages finished, then shut it down.
    async fn run_until_finished(worker: Worker, recorder: &Recorder, expected: usize) -> WorkerExit {
        let worker = Arc::new(worker);
        let shutdown = ShutdownSignal::new();
        let handle = {
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(&shutdown).await })
        };

        wait_until(|| recorder.outcomes().len() >= expected).await;
        shutdown.trigger();
        handle.await.unwrap()
    }

    #[tokio::test]
    async fn test_delivers_to_connected_device() {
        let h = harness(Pipeline::new());
        h.directory.set("D1", "conn-7").await.unwrap();
        let id = h.queue.send(r#"{"deviceId":"D1","value":42}"#).await;

        let worker = Worker::new(0, "w", WorkerRole::Standalone, h.ctx.clone());
        let exit = run_until_finished(worker, &h.recorder, 1).await;

        assert_eq!(exit, WorkerExit::Idle);
        assert_eq!(
            h.transport.sent(),
            vec![("conn-7".to_string(), json!({"value": 42}))]
        );
        assert_eq!(h.queue.deleted().await, vec![id.clone()]);
        assert_eq!(h.queue.in_flight().await, 0);
        assert_eq!(
            h.recorder.outcomes(),
            vec![(
                id,
                ProcessOutcome::Delivered {
                    route: "conn-7".into()
                }
            )]
        );
    }

    #[tokio::test]
    async fn test_no_route_is_acknowledged() {
        let h = harness(Pipeline::new());
        let id = h.queue.send(r#"{"deviceId":"D1","value":42}"#).await;

        let worker = Worker::new(0, "w", WorkerRole::Standalone, h.ctx.clone());
        run_until_finished(worker, &h.recorder, 1).await;

        assert!(h.transport.sent().is_empty());
        assert_eq!(h.queue.deleted().await, vec![id.clone()]);
        assert_eq!(h.recorder.outcomes(), vec![(id, ProcessOutcome::NoRoute)]);
    }

    #[tokio::test]
    async fn test_stale_route_is_acknowledged() {
        let h = harness(Pipeline::new());
        h.directory.set("D1", "conn-7").await.unwrap();
        h.transport.break_route("conn-7");
        let id = h.queue.send(r#"{"deviceId":"D1"}"#).await;

        let worker = Worker::new(0, "w", WorkerRole::Standalone, h.ctx.clone());
        run_until_finished(worker, &h.recorder, 1).await;

        assert_eq!(h.queue.deleted().await, vec![id]);
        let (_, outcome) = &h.recorder.outcomes()[0];
        assert!(matches!(outcome, ProcessOutcome::DeliveryFailed { route, .. } if route == "conn-7"));
        assert!(outcome.is_acknowledged());
    }

    #[tokio::test]
    async fn test_malformed_message_left_unacknowledged() {
        let h = harness(Pipeline::new());
        let id = h.queue.send("not json").await;

        let worker = Worker::new(0, "w", WorkerRole::Standalone, h.ctx.clone());
        run_until_finished(worker, &h.recorder, 1).await;

        assert!(h.queue.deleted().await.is_empty());
        assert_eq!(h.queue.in_flight().await, 1);
        assert_eq!(
            h.recorder.events(),
            vec![format!("started:{id}"), format!("finished:{id}")]
        );
        let (_, outcome) = &h.recorder.outcomes()[0];
        assert!(matches!(outcome, ProcessOutcome::Failed { .. }));
        assert!(!outcome.is_acknowledged());
    }

    #[tokio::test]
    async fn test_missing_device_id_left_unacknowledged() {
        let h = harness(Pipeline::new());
        h.queue.send(r#"{"value":42}"#).await;

        let worker = Worker::new(0, "w", WorkerRole::Standalone, h.ctx.clone());
        run_until_finished(worker, &h.recorder, 1).await;

        assert!(h.queue.deleted().await.is_empty());
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_pipeline_failure_stops_later_steps() {
        let first = Stage::new("pass");
        let failing = Stage::new("reject");
        let last = Stage::new("pass");
        let pipeline = Pipeline::new()
            .then("first", first.clone())
            .then("failing", failing.clone())
            .then("last", last.clone());

        let h = harness(pipeline);
        h.directory.set("D1", "conn-7").await.unwrap();
        h.queue.send(r#"{"deviceId":"D1"}"#).await;

        let worker = Worker::new(0, "w", WorkerRole::Standalone, h.ctx.clone());
        run_until_finished(worker, &h.recorder, 1).await;

        assert_eq!(first.calls(), 1);
        assert_eq!(failing.calls(), 1);
        assert_eq!(last.calls(), 0);
        assert!(h.queue.deleted().await.is_empty());
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_step_does_not_end_loop() {
        let h = harness(Pipeline::new().then("maybe_panic", Stage::new("panic")));
        h.directory.set("D1", "conn-7").await.unwrap();
        let bad = h.queue.send(r#"{"deviceId":"D1","explode":true}"#).await;
        let good = h.queue.send(r#"{"deviceId":"D1","value":1}"#).await;

        let worker = Worker::new(0, "w", WorkerRole::Standalone, h.ctx.clone());
        run_until_finished(worker, &h.recorder, 2).await;

        let outcomes = h.recorder.outcomes();
        assert_eq!(outcomes[0].0, bad);
        assert!(matches!(&outcomes[0].1, ProcessOutcome::Failed { reason } if reason.contains("stage exploded")));
        assert_eq!(outcomes[1].0, good.clone());
        assert_eq!(h.queue.deleted().await, vec![good]);
    }

    #[tokio::test]
    async fn test_panicking_hook_does_not_stop_processing() {
        let mut h = harness(Pipeline::new());
        h.ctx = h.ctx.with_hooks(Arc::new(
            Hooks::new()
                .with(Arc::new(PanickingHook))
                .with(h.recorder.clone()),
        ));
        h.directory.set("D1", "conn-7").await.unwrap();
        let id = h.queue.send(r#"{"deviceId":"D1"}"#).await;

        let worker = Worker::new(0, "w", WorkerRole::Standalone, h.ctx.clone());
        run_until_finished(worker, &h.recorder, 1).await;

        assert_eq!(h.queue.deleted().await, vec![id]);
        assert_eq!(h.transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_mid_batch_finishes_batch() {
        let shutdown = ShutdownSignal::new();
        let pipeline =
            Pipeline::new().then("trigger", Arc::new(TriggerShutdown(shutdown.clone())));
        let h = harness(pipeline);
        for value in 0..3 {
            h.queue
                .send(json!({"deviceId": "D1", "value": value}).to_string())
                .await;
        }

        let worker = Worker::new(0, "w", WorkerRole::Standalone, h.ctx.clone());
        let exit = worker.run(&shutdown).await;

        assert_eq!(exit, WorkerExit::AfterBatch);
        assert_eq!(h.queue.deleted().await.len(), 3);
        assert_eq!(h.queue.receive_calls(), 1);
        assert!(!worker.is_processing());
    }

    #[tokio::test]
    async fn test_shutdown_before_polling() {
        let h = harness(Pipeline::new());
        h.queue.send(r#"{"deviceId":"D1"}"#).await;
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();

        let worker = Worker::new(0, "w", WorkerRole::Standalone, h.ctx.clone());
        let exit = worker.run(&shutdown).await;

        assert_eq!(exit, WorkerExit::Idle);
        assert_eq!(h.queue.receive_calls(), 0);
        assert_eq!(h.queue.visible().await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_abandons_long_poll() {
        let mut h = harness(Pipeline::new());
        h.ctx.settings.wait_time = Duration::from_secs(30);
        let worker = Arc::new(Worker::new(0, "w", WorkerRole::Standalone, h.ctx.clone()));
        let shutdown = ShutdownSignal::new();

        let handle = {
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(&shutdown).await })
        };
        wait_until(|| h.queue.receive_calls() == 1).await;
        shutdown.trigger();

        let exit = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker should stop without waiting for the poll")
            .unwrap();
        assert_eq!(exit, WorkerExit::Idle);
    }

    #[tokio::test]
    async fn test_request_termination_interrupts_idle_poll() {
        let mut h = harness(Pipeline::new());
        h.ctx.settings.wait_time = Duration::from_secs(30);
        let worker = Arc::new(Worker::new(0, "w", WorkerRole::Standalone, h.ctx.clone()));
        let shutdown = ShutdownSignal::new();

        let handle = {
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(&shutdown).await })
        };
        wait_until(|| h.queue.receive_calls() == 1).await;

        assert_eq!(worker.request_termination(), TerminationDecision::Immediate);

        let exit = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("idle worker should stop without waiting for the poll")
            .unwrap();
        assert_eq!(exit, WorkerExit::Idle);
        assert!(!shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_request_termination_during_error_backoff() {
        let mut h = harness(Pipeline::new());
        h.ctx.settings.error_backoff = Duration::from_secs(30);
        h.queue.set_unavailable(true);
        let worker = Arc::new(Worker::new(0, "w", WorkerRole::Standalone, h.ctx.clone()));
        let shutdown = ShutdownSignal::new();

        let handle = {
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(&shutdown).await })
        };
        wait_until(|| h.queue.receive_calls() == 1).await;
        worker.request_termination();

        let exit = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("backoff should be cut short")
            .unwrap();
        assert_eq!(exit, WorkerExit::Idle);
    }

    #[tokio::test]
    async fn test_queue_errors_do_not_end_loop() {
        let h = harness(Pipeline::new());
        h.queue.set_unavailable(true);
        let worker = Arc::new(Worker::new(0, "w", WorkerRole::Standalone, h.ctx.clone()));
        let shutdown = ShutdownSignal::new();

        let handle = {
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(&shutdown).await })
        };
        wait_until(|| h.queue.receive_calls() >= 3).await;

        h.queue.set_unavailable(false);
        h.queue.send(r#"{"deviceId":"D1"}"#).await;
        wait_until(|| h.recorder.outcomes().len() == 1).await;

        shutdown.trigger();
        assert_eq!(handle.await.unwrap(), WorkerExit::Idle);
        assert_eq!(h.recorder.outcomes()[0].1, ProcessOutcome::NoRoute);
    }

    #[tokio::test]
    async fn test_zero_wait_polls_repeatedly() {
        let mut h = harness(Pipeline::new());
        h.ctx.settings.wait_time = Duration::ZERO;
        let worker = Arc::new(Worker::new(0, "w", WorkerRole::Standalone, h.ctx.clone()));
        let shutdown = ShutdownSignal::new();

        let handle = {
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(&shutdown).await })
        };
        wait_until(|| h.queue.receive_calls() >= 3).await;
        shutdown.trigger();

        assert_eq!(handle.await.unwrap(), WorkerExit::Idle);
    }

    #[tokio::test]
    async fn test_dead_letters_at_max_receives() {
        let mut h = harness(Pipeline::new());
        let dead_letters = Arc::new(MemoryDeadLetters::new());
        h.ctx = h.ctx.with_dead_letters(dead_letters.clone());
        h.ctx.settings.max_receives = Some(1);
        let id = h.queue.send("not json").await;

        let worker = Worker::new(0, "w", WorkerRole::Standalone, h.ctx.clone());
        run_until_finished(worker, &h.recorder, 1).await;

        assert_eq!(h.queue.deleted().await, vec![id.clone()]);
        let letters = dead_letters.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].original_id, id);
        assert_eq!(letters[0].queue, "test-queue");
        assert!(matches!(
            &h.recorder.outcomes()[0].1,
            ProcessOutcome::DeadLettered { .. }
        ));
    }

    #[tokio::test]
    async fn test_below_max_receives_left_for_redelivery() {
        let mut h = harness(Pipeline::new());
        let dead_letters = Arc::new(MemoryDeadLetters::new());
        h.ctx = h.ctx.with_dead_letters(dead_letters.clone());
        h.ctx.settings.max_receives = Some(3);
        h.queue.send("not json").await;

        let worker = Worker::new(0, "w", WorkerRole::Standalone, h.ctx.clone());
        run_until_finished(worker, &h.recorder, 1).await;

        assert!(h.queue.deleted().await.is_empty());
        assert!(dead_letters.letters().is_empty());
    }

    #[tokio::test]
    async fn test_ready_hooks_follow_role() {
        let h = harness(Pipeline::new());

        Worker::new(0, "w", WorkerRole::Standalone, h.ctx.clone()).ready();
        Worker::new(1, "w", WorkerRole::GroupMember, h.ctx.clone()).ready();

        assert_eq!(
            h.recorder.events(),
            vec!["worker_ready:w-0", "member_ready:w-1"]
        );
    }

    #[test]
    fn test_termination_decision_depends_on_processing() {
        let h = harness(Pipeline::new());
        let worker = Worker::new(0, "w", WorkerRole::Standalone, h.ctx.clone());

        assert_eq!(worker.request_termination(), TerminationDecision::Immediate);

        worker.state.processing.store(true, Ordering::SeqCst);
        assert_eq!(worker.request_termination(), TerminationDecision::Deferred);
    }

    #[test]
    fn test_worker_name_includes_index() {
        let info = WorkerInfo::new(3, "worker-host", WorkerRole::GroupMember);
        assert_eq!(info.name, "worker-host-3");
        assert_eq!(info.index, 3);
    }
}
