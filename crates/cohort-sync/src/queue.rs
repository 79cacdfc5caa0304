//! Explicit work queue between policy saves and sync runs.
//!
//! Saves enqueue a [`SyncTrigger`]; a [`SyncWorker`] drains the queue and
//! starts one run per request. A `PolicySaved` request for a policy that is
//! still waiting in the queue is coalesced into the pending one, since the
//! pending run will read the latest revision anyway.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use cohort_types::PolicyId;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::history::{SyncRun, SyncTrigger};
use crate::runner::SyncRunner;

type Pending = Arc<Mutex<HashSet<PolicyId>>>;

/// Sending half of the sync queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SyncQueue {
    sender: mpsc::Sender<SyncTrigger>,
    pending: Pending,
}

/// Receiving half; owns the runner.
pub struct SyncWorker {
    receiver: mpsc::Receiver<SyncTrigger>,
    pending: Pending,
    runner: SyncRunner,
}

/// Creates a bounded queue feeding `runner`.
pub fn sync_queue(capacity: usize, runner: SyncRunner) -> (SyncQueue, SyncWorker) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let pending: Pending = Arc::default();

    (
        SyncQueue {
            sender,
            pending: Arc::clone(&pending),
        },
        SyncWorker {
            receiver,
            pending,
            runner,
        },
    )
}

impl SyncQueue {
    /// Enqueues a request, waiting for room if the queue is full.
    ///
    /// Returns `false` if the request was coalesced into a pending one.
    pub async fn enqueue(&self, trigger: SyncTrigger) -> Result<bool, QueueError> {
        if let SyncTrigger::PolicySaved(policy_id) = &trigger {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| QueueError::Internal("pending set lock poisoned".to_string()))?;
            if !pending.insert(policy_id.clone()) {
                debug!(policy_id = %policy_id, "Sync already pending, request coalesced");
                return Ok(false);
            }
        }

        if self.sender.send(trigger.clone()).await.is_err() {
            if let SyncTrigger::PolicySaved(policy_id) = &trigger {
                if let Ok(mut pending) = self.pending.lock() {
                    pending.remove(policy_id);
                }
            }
            return Err(QueueError::Closed);
        }

        debug!(trigger = %trigger, "Sync request enqueued");
        Ok(true)
    }
}

impl SyncWorker {
    /// Processes requests until every [`SyncQueue`] handle is dropped, then
    /// waits for in-flight runs and returns them in completion order.
    pub async fn run(mut self) -> Vec<SyncRun> {
        let mut join_set = JoinSet::new();
        let mut finished = Vec::new();

        loop {
            tokio::select! {
                request = self.receiver.recv() => {
                    let Some(trigger) = request else {
                        break;
                    };

                    // Once dequeued, a later save must start a fresh run.
                    if let SyncTrigger::PolicySaved(policy_id) = &trigger {
                        if let Ok(mut pending) = self.pending.lock() {
                            pending.remove(policy_id);
                        }
                    }

                    let runner = self.runner.clone();
                    join_set.spawn(async move { runner.run_sync(trigger).await });
                }

                Some(joined) = join_set.join_next(), if !join_set.is_empty() => {
                    collect(&mut finished, joined);
                }
            }
        }

        while let Some(joined) = join_set.join_next().await {
            collect(&mut finished, joined);
        }

        info!(runs = finished.len(), "Sync worker stopped");
        finished
    }
}

fn collect(
    finished: &mut Vec<SyncRun>,
    joined: Result<crate::Result<SyncRun>, tokio::task::JoinError>,
) {
    match joined {
        Ok(Ok(run)) => finished.push(run),
        Ok(Err(e)) => warn!(error = %e, "Sync run could not be recorded"),
        Err(e) => warn!(error = %e, "Sync run task failed"),
    }
}
