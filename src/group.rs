//! Worker group: several workers in one process.
//!
//! The group runs one lead [`Worker`] on the calling task and `threads - 1`
//! member workers on spawned tasks. Members never watch for shutdown
//! themselves; when the group's signal fires the group returns at once and
//! every member task is aborted, mid-batch or not. Messages a member held are
//! redelivered after their visibility timeout.

use crate::shutdown::ShutdownSignal;
use crate::worker::{Runnable, Worker, WorkerContext, WorkerExit, WorkerRole};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::info;

/// A lead worker plus spawned members sharing one [`WorkerContext`].
pub struct WorkerGroup {
    lead: Worker,
    members: Vec<Arc<Worker>>,
}

impl WorkerGroup {
    /// Build a group of `threads` workers named `<base_name>-<index>`.
    ///
    /// `threads` below one is treated as one.
    pub fn new(ctx: WorkerContext, threads: usize, base_name: &str) -> Self {
        let threads = threads.max(1);
        let lead = Worker::new(0, base_name, WorkerRole::GroupLead, ctx.clone());
        let members = (1..threads)
            .map(|index| {
                Arc::new(Worker::new(
                    index,
                    base_name,
                    WorkerRole::GroupMember,
                    ctx.clone(),
                ))
            })
            .collect();

        Self { lead, members }
    }

    /// Number of execution contexts, lead included
    pub fn size(&self) -> usize {
        self.members.len() + 1
    }
}

#[async_trait]
impl Runnable for WorkerGroup {
    fn ready(&self) {
        self.lead.ready();
        for member in &self.members {
            member.ready();
        }
    }

    async fn run(&self, shutdown: &ShutdownSignal) -> WorkerExit {
        info!(
            lead = %self.lead.info().name,
            threads = self.size(),
            "Worker group starting"
        );

        // Members and lead poll against a signal nobody triggers; the group
        // alone decides when they stop.
        let detached = ShutdownSignal::new();

        let mut members = JoinSet::new();
        for member in &self.members {
            let member = Arc::clone(member);
            let signal = detached.clone();
            members.spawn(async move { member.run(&signal).await });
        }

        let exit = tokio::select! {
            _ = shutdown.triggered() => WorkerExit::Immediate,
            exit = self.lead.run(&detached) => exit,
        };

        members.abort_all();
        info!(
            members = self.members.len(),
            exit = ?exit,
            "Worker group stopped"
        );
        exit
    }
}
