//! The process-wide scheduler loop.
//!
//! Idle -> Polling -> Dispatching -> Idle: wake on deadline, on a registry
//! nudge, or on shutdown; poll the store for due jobs; dispatch them with
//! bounded concurrency; sleep until the earliest `next_fire_at` or the
//! poll-interval cap, whichever is sooner. The cap keeps the loop
//! responsive to newly registered jobs even when the store is empty.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use topicbot_config::SchedulerSettings;
use topicbot_store::{JobStore, StoreError};

use crate::clock::Clock;
use crate::dispatch::{DispatchStatus, Dispatcher};
use crate::registry::JobRegistry;
use crate::sender::MessageSender;

/// Consecutive poll failures tolerated before the loop gives up on the
/// store and exits cleanly.
const MAX_STORE_FAILURES: u32 = 5;

/// Long-running scheduling service. One per process.
pub struct Scheduler {
    store: Arc<JobStore>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    notify: Arc<Notify>,
    settings: SchedulerSettings,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<JobStore>,
        sender: Arc<dyn MessageSender>,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), sender, &settings));
        Self {
            store,
            dispatcher,
            clock,
            notify: Arc::new(Notify::new()),
            settings,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Registration surface sharing this scheduler's store, clock, and
    /// wake channel.
    pub fn registry(&self) -> JobRegistry {
        JobRegistry::new(self.store.clone(), self.clock.clone(), self.notify.clone())
    }

    /// Start the loop. Idempotent; called once at process startup.
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }
        let this = self.clone();
        *handle = Some(tokio::spawn(async move { this.run_loop().await }));
    }

    /// Stop accepting new poll cycles and wait for in-flight dispatches,
    /// bounded by the configured grace timeout.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.notify.notify_one();

        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            let grace = Duration::from_secs(self.settings.shutdown_grace_secs);
            let abort = handle.abort_handle();
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("grace timeout elapsed with dispatches in flight, aborting");
                abort.abort();
            }
        }
        info!("scheduler shut down");
    }

    /// Dispatch everything currently due. Returns the batch size.
    ///
    /// Public so a manual trigger (or a test) can drive the loop one poll
    /// at a time with a controlled clock.
    pub async fn poll_once(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let due = self.store.due_jobs(now).await?;
        if due.is_empty() {
            return Ok(0);
        }

        debug!(count = due.len(), "dispatching due batch");
        let count = due.len();
        let concurrency = self.settings.dispatch_concurrency.max(1);
        futures::stream::iter(due)
            .for_each_concurrent(concurrency, |job| {
                let dispatcher = self.dispatcher.clone();
                async move {
                    // A failed job never aborts the batch; bookkeeping
                    // errors are logged and the job retries next poll.
                    if let Err(e) = dispatcher.dispatch(&job, now).await {
                        warn!(job_id = %job.id, "dispatch bookkeeping failed: {e}");
                    }
                }
            })
            .await;
        Ok(count)
    }

    /// Send a job's message immediately, regardless of its deadline. The
    /// schedule is untouched: the next regular occurrence still fires.
    pub async fn fire_now(&self, id: &str) -> Result<DispatchStatus, StoreError> {
        let job = self.store.get(id).await?;
        self.dispatcher.send_once(&job, self.clock.now()).await
    }

    async fn run_loop(self: Arc<Self>) {
        let max_poll = Duration::from_secs(self.settings.max_poll_interval_secs.max(1));
        info!(max_poll_secs = max_poll.as_secs(), "scheduler loop started");

        let mut store_failures: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.poll_once().await {
                Ok(_) => store_failures = 0,
                Err(e) => {
                    store_failures += 1;
                    error!(consecutive = store_failures, "poll cycle failed: {e}");
                    if store_failures >= MAX_STORE_FAILURES {
                        error!("job store unavailable, stopping scheduler loop");
                        break;
                    }
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(store_failures as u64)) => {}
                    }
                    continue;
                }
            }

            // Sleep until the earliest deadline, a wake nudge, or shutdown.
            let now = self.clock.now();
            let sleep_for = match self.store.min_next_fire().await {
                Ok(Some(next)) if next > now => {
                    (next - now).to_std().unwrap_or(Duration::ZERO).min(max_poll)
                }
                // Something is already due again (e.g. replaying a missed
                // backlog): re-poll almost immediately. The small floor
                // keeps a job stuck in the past from spinning the loop.
                Ok(Some(_)) => Duration::from_millis(50),
                Ok(None) => max_poll,
                Err(e) => {
                    warn!("failed to read next deadline: {e}");
                    max_poll
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.notify.notified() => debug!("woken by registry"),
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }

        info!("scheduler loop stopped");
    }
}
