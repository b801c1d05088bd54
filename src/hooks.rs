//! Lifecycle hooks.
//!
//! External code observes the worker through [`LifecycleHook`]. Every method
//! has an empty default, so a hook implements only what it cares about:
//!
//! | Hook                   | Fired                                            |
//! |------------------------|--------------------------------------------------|
//! | `process_ready`        | once per process, before any worker is ready     |
//! | `worker_ready`         | standalone worker or group lead is ready         |
//! | `group_member_ready`   | each spawned group member is ready               |
//! | `processing_started`   | before a message enters the pipeline             |
//! | `processing_finished`  | after every message, success or failure          |
//!
//! `processing_finished` always fires, which makes it the place to release
//! per-message resources such as database connections.
//!
//! A panicking hook is logged and skipped; it never takes the worker down.

use crate::worker::{ProcessOutcome, WorkerInfo};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Identifies the message a processing hook fires for.
#[derive(Debug, Clone, Copy)]
pub struct ProcessingContext<'a> {
    pub worker: &'a WorkerInfo,
    pub queue: &'a str,
    pub message_id: &'a str,
    pub receive_count: u32,
}

/// Receiver of worker lifecycle notifications.
pub trait LifecycleHook: Send + Sync {
    fn process_ready(&self) {}

    fn worker_ready(&self, _worker: &WorkerInfo) {}

    fn group_member_ready(&self, _worker: &WorkerInfo) {}

    fn processing_started(&self, _ctx: &ProcessingContext<'_>) {}

    fn processing_finished(&self, _ctx: &ProcessingContext<'_>, _outcome: &ProcessOutcome) {}
}

/// The set of hooks connected to a process.
#[derive(Clone, Default)]
pub struct Hooks {
    receivers: Vec<Arc<dyn LifecycleHook>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a hook
    pub fn connect(&mut self, hook: Arc<dyn LifecycleHook>) {
        self.receivers.push(hook);
    }

    /// Connect a hook, builder style
    pub fn with(mut self, hook: Arc<dyn LifecycleHook>) -> Self {
        self.connect(hook);
        self
    }

    pub fn len(&self) -> usize {
        self.receivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }

    pub fn process_ready(&self) {
        self.emit("process_ready", |hook| hook.process_ready());
    }

    pub fn worker_ready(&self, worker: &WorkerInfo) {
        self.emit("worker_ready", |hook| hook.worker_ready(worker));
    }

    pub fn group_member_ready(&self, worker: &WorkerInfo) {
        self.emit("group_member_ready", |hook| hook.group_member_ready(worker));
    }

    pub fn processing_started(&self, ctx: &ProcessingContext<'_>) {
        self.emit("processing_started", |hook| hook.processing_started(ctx));
    }

    pub fn processing_finished(&self, ctx: &ProcessingContext<'_>, outcome: &ProcessOutcome) {
        self.emit("processing_finished", |hook| {
            hook.processing_finished(ctx, outcome)
        });
    }

    fn emit(&self, name: &str, call: impl Fn(&dyn LifecycleHook)) {
        for receiver in &self.receivers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| call(receiver.as_ref()))) {
                error!(
                    hook = %name,
                    panic = %panic_message(panic.as_ref()),
                    "Lifecycle hook panicked"
                );
            }
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Counts processed messages and logs running totals.
#[derive(Debug, Default)]
pub struct WorkerStats {
    processed: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    total: AtomicU64,
}

/// Log totals every this many messages
const STATS_INTERVAL: u64 = 100;

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Messages finished, acknowledged or not
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Count one outcome, returning the running total it brought us to.
    fn record(&self, outcome: &ProcessOutcome) -> u64 {
        if outcome.is_acknowledged() {
            self.processed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        if matches!(outcome, ProcessOutcome::Delivered { .. }) {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
        self.total.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl LifecycleHook for WorkerStats {
    fn processing_finished(&self, _ctx: &ProcessingContext<'_>, outcome: &ProcessOutcome) {
        let total = self.record(outcome);
        if total % STATS_INTERVAL == 0 {
            info!(
                messages_total = total,
                messages_processed = self.processed(),
                messages_delivered = self.delivered(),
                messages_failed = self.failed(),
                "Worker statistics"
            );
        }
    }
}
