//! Dispatcher: drives one delivery attempt and records its outcome.
//!
//! The sender's tri-state result feeds a state transition applied to the job
//! record as a single compare-and-set mutation. Recomputing the next
//! occurrence happens strictly after the attempt completes, so a slow send
//! can never double-fire one occurrence.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use topicbot_config::SchedulerSettings;
use topicbot_store::{JobStore, StoreError};
use topicbot_types::{Job, JobState, MissedPolicy};

use crate::backoff::backoff_delay;
use crate::sender::{MessageSender, SendError};
use crate::trigger;

/// What happened to the job after one dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// Delivered; job re-armed (recurring) or exhausted (one-shot).
    Delivered,
    /// Failed, retry scheduled.
    Retrying,
    /// Failed permanently or retry budget spent; job exhausted.
    Failed,
}

/// Mutation derived from a completed attempt, applied under CAS. The
/// closure re-checks state on the fresh record, so a job cancelled while
/// its dispatch was in flight gets its outcome recorded but is never
/// re-armed.
#[derive(Clone)]
enum Transition {
    Success {
        now: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    },
    Failure {
        now: DateTime<Utc>,
        error: String,
        /// `None` marks a permanent failure.
        delay: Option<Duration>,
        max_retries: u32,
    },
}

impl Transition {
    fn apply(&self, job: &mut Job) {
        match self {
            Transition::Success { now, next } => {
                job.retry_count = 0;
                job.last_error = None;
                job.last_dispatched_at = Some(*now);
                if job.state != JobState::Active {
                    job.next_fire_at = None;
                    return;
                }
                match next {
                    Some(n) => job.next_fire_at = Some(*n),
                    None => {
                        job.state = JobState::Exhausted;
                        job.next_fire_at = None;
                    }
                }
            }
            Transition::Failure {
                now,
                error,
                delay,
                max_retries,
            } => {
                job.last_dispatched_at = Some(*now);
                job.last_error = Some(error.clone());
                if job.state != JobState::Active {
                    job.next_fire_at = None;
                    return;
                }
                match delay {
                    None => {
                        job.state = JobState::Exhausted;
                        job.next_fire_at = None;
                    }
                    Some(d) => {
                        if job.retry_count >= *max_retries {
                            job.state = JobState::Exhausted;
                            job.next_fire_at = None;
                        } else {
                            job.retry_count += 1;
                            job.next_fire_at =
                                Some(*now + chrono::Duration::milliseconds(d.as_millis() as i64));
                        }
                    }
                }
            }
        }
    }
}

/// Takes a due job, invokes the sender, and updates job state.
pub struct Dispatcher {
    store: Arc<JobStore>,
    sender: Arc<dyn MessageSender>,
    send_timeout: Duration,
    max_retries: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    missed_policy: MissedPolicy,
}

impl Dispatcher {
    pub fn new(
        store: Arc<JobStore>,
        sender: Arc<dyn MessageSender>,
        settings: &SchedulerSettings,
    ) -> Self {
        Self {
            store,
            sender,
            send_timeout: Duration::from_secs(settings.send_timeout_secs),
            max_retries: settings.max_retries,
            backoff_base: Duration::from_secs(settings.backoff_base_secs),
            backoff_max: Duration::from_secs(settings.backoff_max_secs),
            missed_policy: settings.missed_policy,
        }
    }

    /// Run one delivery attempt for `job` and persist the outcome.
    ///
    /// `job` is the snapshot read at poll time; its version guards the CAS,
    /// which serializes against concurrent registry edits of the same id.
    pub async fn dispatch(&self, job: &Job, now: DateTime<Utc>) -> Result<DispatchStatus, StoreError> {
        match self.attempt(job).await {
            Ok(()) => {
                // The occurrence that just fired anchors the recurrence.
                let fired = job.next_fire_at.unwrap_or(now);
                let next = trigger::compute_next(&job.schedule, fired, &self.missed_policy, now);
                let updated = self
                    .commit(
                        job,
                        Transition::Success { now, next },
                    )
                    .await?;
                info!(
                    job_id = %job.id,
                    chat_id = job.target.chat_id,
                    next = ?updated.next_fire_at,
                    "dispatched"
                );
                Ok(DispatchStatus::Delivered)
            }
            Err(err) => {
                let delay = match &err {
                    SendError::Transient(_) => Some(backoff_delay(
                        job.retry_count + 1,
                        self.backoff_base,
                        self.backoff_max,
                    )),
                    SendError::RateLimited { retry_after } => Some(*retry_after),
                    SendError::Permanent(_) => None,
                };
                let updated = self
                    .commit(
                        job,
                        Transition::Failure {
                            now,
                            error: err.to_string(),
                            delay,
                            max_retries: self.max_retries,
                        },
                    )
                    .await?;
                if updated.state == JobState::Exhausted {
                    warn!(job_id = %job.id, error = %err, "dispatch failed, job exhausted");
                    Ok(DispatchStatus::Failed)
                } else {
                    debug!(
                        job_id = %job.id,
                        retry = updated.retry_count,
                        next = ?updated.next_fire_at,
                        "dispatch failed, retry scheduled: {err}"
                    );
                    Ok(DispatchStatus::Retrying)
                }
            }
        }
    }

    /// One immediate delivery attempt outside the schedule. Audit fields
    /// are recorded, but the job is never re-armed, retried, or exhausted:
    /// a manual send must not consume or shift a scheduled occurrence.
    pub async fn send_once(&self, job: &Job, now: DateTime<Utc>) -> Result<DispatchStatus, StoreError> {
        let outcome = self.attempt(job).await;
        let (status, error) = match &outcome {
            Ok(()) => (DispatchStatus::Delivered, None),
            Err(e) => (DispatchStatus::Failed, Some(e.to_string())),
        };

        let id = job.id.clone();
        let err = error.clone();
        let record = move |j: &mut Job| {
            j.last_dispatched_at = Some(now);
            if let Some(e) = err.clone() {
                j.last_error = Some(e);
            }
        };
        match self.store.update(&id, job.version, record.clone()).await {
            Err(StoreError::Conflict(_)) => {
                let fresh = self.store.get(&id).await?;
                self.store.update(&id, fresh.version, record).await?;
            }
            other => {
                other?;
            }
        }

        match outcome {
            Ok(()) => info!(job_id = %job.id, "manual send delivered"),
            Err(e) => warn!(job_id = %job.id, "manual send failed: {e}"),
        }
        Ok(status)
    }

    async fn attempt(&self, job: &Job) -> Result<(), SendError> {
        match tokio::time::timeout(
            self.send_timeout,
            self.sender.send(&job.target, &job.payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SendError::Transient(format!(
                "send timed out after {:?}",
                self.send_timeout
            ))),
        }
    }

    /// Apply a transition via CAS against the dispatched snapshot's version.
    /// A conflict (registry edit racing the dispatch) is retried once with
    /// fresh state before surfacing.
    async fn commit(&self, job: &Job, transition: Transition) -> Result<Job, StoreError> {
        let t = transition.clone();
        match self
            .store
            .update(&job.id, job.version, move |j| t.apply(j))
            .await
        {
            Err(StoreError::Conflict(_)) => {
                debug!(job_id = %job.id, "concurrent edit during dispatch, retrying update");
                let fresh = self.store.get(&job.id).await?;
                self.store
                    .update(&fresh.id, fresh.version, move |j| transition.apply(j))
                    .await
            }
            other => other,
        }
    }
}
