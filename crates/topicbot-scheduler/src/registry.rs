//! Job registration surface: create, pause, resume, cancel, edit,
//! reschedule, delete.
//!
//! Every request is validated before it reaches the store, and every
//! mutation nudges the scheduler loop's wake channel so a job registered
//! with an earlier deadline than anything pending is picked up immediately
//! instead of waiting out a long sleep.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Notify;
use tracing::info;
use uuid::Uuid;

use topicbot_store::{JobStore, StoreError};
use topicbot_types::{Job, JobState, Payload, Schedule, Target, ValidationError};

use crate::clock::Clock;
use crate::trigger;

/// How far out a spaced-repetition series extends.
const SERIES_HORIZON_DAYS: i64 = 365 * 30;

/// Parameters for registering a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Caller-supplied id; generated if absent.
    pub id: Option<String>,
    pub target: Target,
    pub payload: Payload,
    pub schedule: Schedule,
}

/// Parameters for registering a spaced-repetition series: a batch of
/// one-shot reminders for the same topic whose gaps grow geometrically.
#[derive(Debug, Clone)]
pub struct NewSeries {
    /// Prefix for the generated job ids; generated if absent.
    pub id_prefix: Option<String>,
    pub target: Target,
    pub payload: Payload,
    /// First reminder instant; defaults to now.
    pub start: Option<DateTime<Utc>>,
    /// Growth factor for the gap between consecutive reminders.
    pub base: f64,
}

/// Offsets of a spaced-repetition series from its start. The first
/// reminder lands on the start itself, the next one a day later, and each
/// following gap is the previous one multiplied by `base`, out to the
/// horizon. Fractional bases give fractional-day gaps.
fn series_offsets(base: f64, horizon: Duration) -> Vec<Duration> {
    let horizon_secs = horizon.num_seconds() as f64;
    let mut offsets = Vec::new();
    let mut offset_days = 0.0_f64;
    let mut gap_days = 1.0_f64;
    while offset_days * 86_400.0 <= horizon_secs {
        offsets.push(Duration::seconds((offset_days * 86_400.0) as i64));
        offset_days += gap_days;
        gap_days *= base;
    }
    offsets
}

/// Validated command surface over the job store.
#[derive(Clone)]
pub struct JobRegistry {
    store: Arc<JobStore>,
    clock: Arc<dyn Clock>,
    notify: Arc<Notify>,
}

impl JobRegistry {
    pub fn new(store: Arc<JobStore>, clock: Arc<dyn Clock>, notify: Arc<Notify>) -> Self {
        Self {
            store,
            clock,
            notify,
        }
    }

    /// Register a new job. Fails with `Conflict` if the id is taken.
    pub async fn create(&self, req: NewJob) -> Result<Job, StoreError> {
        let now = self.clock.now();
        let job = Job {
            id: req.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            target: req.target,
            payload: req.payload,
            schedule: req.schedule.clone(),
            next_fire_at: trigger::initial_next(&req.schedule, now),
            state: JobState::Active,
            retry_count: 0,
            last_error: None,
            last_dispatched_at: None,
            created_at: now,
            version: 0,
        };
        job.validate()?;

        self.store.insert(&job).await?;
        self.notify.notify_one();
        info!(job_id = %job.id, next = ?job.next_fire_at, "job registered");
        Ok(job)
    }

    /// Register a topic as a spaced-repetition series: one-shot reminders
    /// whose gaps grow from one day by the factor `base` (between 1 and 5),
    /// out to a 30-year horizon. Ids are `<prefix>-1`, `<prefix>-2`, ...
    /// in firing order.
    pub async fn create_series(&self, req: NewSeries) -> Result<Vec<Job>, StoreError> {
        if !req.base.is_finite() || !(1.0..=5.0).contains(&req.base) {
            return Err(StoreError::Validation(ValidationError::BadSeriesBase(
                req.base,
            )));
        }
        let start = req.start.unwrap_or_else(|| self.clock.now());
        let prefix = req.id_prefix.unwrap_or_else(|| Uuid::new_v4().to_string());
        let offsets = series_offsets(req.base, Duration::days(SERIES_HORIZON_DAYS));

        let mut jobs = Vec::with_capacity(offsets.len());
        for (k, offset) in offsets.into_iter().enumerate() {
            let job = self
                .create(NewJob {
                    id: Some(format!("{prefix}-{}", k + 1)),
                    target: req.target,
                    payload: req.payload.clone(),
                    schedule: Schedule::OneShot {
                        fire_at: start + offset,
                    },
                })
                .await?;
            jobs.push(job);
        }
        info!(prefix = %prefix, count = jobs.len(), "series registered");
        Ok(jobs)
    }

    /// Pause an Active job. Takes effect on the next evaluation; an
    /// in-flight dispatch still completes and records its result.
    pub async fn pause(&self, id: &str) -> Result<Job, StoreError> {
        let job = self
            .mutate(id, |j| {
                if j.state == JobState::Active {
                    j.state = JobState::Paused;
                }
            })
            .await?;
        info!(job_id = %id, "job paused");
        Ok(job)
    }

    /// Resume a Paused job. The next occurrence is recomputed from now;
    /// occurrences missed while paused are not replayed.
    pub async fn resume(&self, id: &str) -> Result<Job, StoreError> {
        let now = self.clock.now();
        let job = self
            .mutate(id, move |j| {
                if j.state == JobState::Paused {
                    j.state = JobState::Active;
                    j.next_fire_at = trigger::initial_next(&j.schedule, now);
                }
            })
            .await?;
        self.notify.notify_one();
        info!(job_id = %id, next = ?job.next_fire_at, "job resumed");
        Ok(job)
    }

    /// Cancel a job. The record is kept for audit until explicitly deleted.
    pub async fn cancel(&self, id: &str) -> Result<Job, StoreError> {
        let job = self
            .mutate(id, |j| {
                if matches!(j.state, JobState::Active | JobState::Paused) {
                    j.state = JobState::Cancelled;
                    j.next_fire_at = None;
                }
            })
            .await?;
        info!(job_id = %id, "job cancelled");
        Ok(job)
    }

    /// Replace a job's payload. The old payload is swapped out whole, so a
    /// dispatch already in flight still sends a consistent message.
    pub async fn edit_payload(&self, id: &str, payload: Payload) -> Result<Job, StoreError> {
        payload.validate()?;
        let job = self.mutate(id, move |j| j.payload = payload.clone()).await?;
        info!(job_id = %id, "payload edited");
        Ok(job)
    }

    /// Replace a job's schedule and reactivate it. Retry bookkeeping is
    /// reset; the next occurrence is recomputed from now.
    pub async fn reschedule(&self, id: &str, schedule: Schedule) -> Result<Job, StoreError> {
        schedule.validate()?;
        let now = self.clock.now();
        let job = self
            .mutate(id, move |j| {
                j.schedule = schedule.clone();
                j.state = JobState::Active;
                j.next_fire_at = trigger::initial_next(&j.schedule, now);
                j.retry_count = 0;
                j.last_error = None;
            })
            .await?;
        self.notify.notify_one();
        info!(job_id = %id, next = ?job.next_fire_at, "job rescheduled");
        Ok(job)
    }

    /// Physically delete a job record.
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let removed = self.store.delete(id).await?;
        if removed {
            info!(job_id = %id, "job deleted");
        }
        Ok(removed)
    }

    pub async fn get(&self, id: &str) -> Result<Job, StoreError> {
        self.store.get(id).await
    }

    pub async fn list(&self, filter: Option<JobState>) -> Result<Vec<Job>, StoreError> {
        self.store.list(filter).await
    }

    /// CAS mutation with one internal retry on conflict.
    async fn mutate<F>(&self, id: &str, f: F) -> Result<Job, StoreError>
    where
        F: Fn(&mut Job) + Clone + Send + 'static,
    {
        let current = self.store.get(id).await?;
        match self.store.update(id, current.version, f.clone()).await {
            Err(StoreError::Conflict(_)) => {
                let fresh = self.store.get(id).await?;
                self.store.update(id, fresh.version, f).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{t0, ManualClock};
    use chrono::Duration;
    use topicbot_types::ValidationError;

    fn registry() -> (Arc<JobStore>, Arc<ManualClock>, JobRegistry) {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(t0()));
        let registry = JobRegistry::new(store.clone(), clock.clone(), Arc::new(Notify::new()));
        (store, clock, registry)
    }

    fn new_job(id: &str, schedule: Schedule) -> NewJob {
        NewJob {
            id: Some(id.into()),
            target: Target {
                chat_id: -100123,
                topic_id: Some(9),
            },
            payload: Payload {
                text: "standup in 5".into(),
                parse_mode: None,
            },
            schedule,
        }
    }

    #[tokio::test]
    async fn test_create_computes_initial_next() {
        let (_store, _clock, registry) = registry();
        let job = registry
            .create(new_job("j1", Schedule::Every { interval_secs: 120 }))
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.next_fire_at, Some(t0() + Duration::seconds(120)));
    }

    #[tokio::test]
    async fn test_create_generates_id_when_missing() {
        let (_store, _clock, registry) = registry();
        let mut req = new_job("x", Schedule::Every { interval_secs: 60 });
        req.id = None;
        let job = registry.create(req).await.unwrap();
        assert!(!job.id.is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_id() {
        let (_store, _clock, registry) = registry();
        registry
            .create(new_job("dup", Schedule::Every { interval_secs: 60 }))
            .await
            .unwrap();
        let err = registry
            .create(new_job("dup", Schedule::Every { interval_secs: 60 }))
            .await;
        assert!(matches!(err, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid() {
        let (_store, _clock, registry) = registry();
        let mut req = new_job("bad", Schedule::Every { interval_secs: 0 });
        req.schedule = Schedule::Every { interval_secs: 0 };
        let err = registry.create(req).await;
        assert!(matches!(
            err,
            Err(StoreError::Validation(ValidationError::ZeroInterval))
        ));
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let (_store, clock, registry) = registry();
        registry
            .create(new_job("j1", Schedule::Every { interval_secs: 60 }))
            .await
            .unwrap();

        let paused = registry.pause("j1").await.unwrap();
        assert_eq!(paused.state, JobState::Paused);

        // Time passes while paused; resume recomputes from now, no backlog
        clock.advance(Duration::hours(2));
        let resumed = registry.resume("j1").await.unwrap();
        assert_eq!(resumed.state, JobState::Active);
        assert_eq!(
            resumed.next_fire_at,
            Some(t0() + Duration::hours(2) + Duration::seconds(60))
        );
    }

    #[tokio::test]
    async fn test_pause_is_idempotent_on_exhausted() {
        let (store, _clock, registry) = registry();
        registry
            .create(new_job("j1", Schedule::OneShot { fire_at: t0() }))
            .await
            .unwrap();
        store
            .update("j1", 0, |j| {
                j.state = JobState::Exhausted;
                j.next_fire_at = None;
            })
            .await
            .unwrap();

        let job = registry.pause("j1").await.unwrap();
        assert_eq!(job.state, JobState::Exhausted);
    }

    #[tokio::test]
    async fn test_cancel_keeps_record() {
        let (_store, _clock, registry) = registry();
        registry
            .create(new_job("j1", Schedule::Every { interval_secs: 60 }))
            .await
            .unwrap();

        let cancelled = registry.cancel("j1").await.unwrap();
        assert_eq!(cancelled.state, JobState::Cancelled);
        assert_eq!(cancelled.next_fire_at, None);

        // Still listed until deleted
        assert_eq!(registry.list(None).await.unwrap().len(), 1);
        assert!(registry.delete("j1").await.unwrap());
        assert!(registry.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_edit_payload_validates() {
        let (_store, _clock, registry) = registry();
        registry
            .create(new_job("j1", Schedule::Every { interval_secs: 60 }))
            .await
            .unwrap();

        let err = registry
            .edit_payload(
                "j1",
                Payload {
                    text: "  ".into(),
                    parse_mode: None,
                },
            )
            .await;
        assert!(matches!(err, Err(StoreError::Validation(_))));

        let job = registry
            .edit_payload(
                "j1",
                Payload {
                    text: "updated".into(),
                    parse_mode: Some("Markdown".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(job.payload.text, "updated");
    }

    #[tokio::test]
    async fn test_reschedule_resets_retry_state() {
        let (store, _clock, registry) = registry();
        registry
            .create(new_job("j1", Schedule::Every { interval_secs: 60 }))
            .await
            .unwrap();
        store
            .update("j1", 0, |j| {
                j.retry_count = 4;
                j.last_error = Some("flaky".into());
            })
            .await
            .unwrap();

        let job = registry
            .reschedule("j1", Schedule::Every { interval_secs: 600 })
            .await
            .unwrap();
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.last_error, None);
        assert_eq!(job.next_fire_at, Some(t0() + Duration::seconds(600)));
    }

    #[test]
    fn test_series_offsets_doubling_grid() {
        let offsets = series_offsets(2.0, Duration::days(365 * 30));
        let days: Vec<i64> = offsets.iter().map(|d| d.num_days()).collect();
        // Gaps 1, 2, 4, 8, ... put reminder k at 2^k - 1 days
        assert_eq!(&days[..6], &[0, 1, 3, 7, 15, 31]);
        assert_eq!(days.len(), 14);
        assert_eq!(*days.last().unwrap(), 8191);
    }

    #[test]
    fn test_series_offsets_fractional_base() {
        let offsets = series_offsets(1.5, Duration::days(30));
        assert_eq!(offsets[0], Duration::zero());
        assert_eq!(offsets[1], Duration::days(1));
        // 1 + 1.5 days
        assert_eq!(offsets[2], Duration::hours(60));
        assert!(offsets.iter().all(|d| *d <= Duration::days(30)));
    }

    #[tokio::test]
    async fn test_create_series_exponential_grid() {
        let (_store, _clock, registry) = registry();
        let jobs = registry
            .create_series(NewSeries {
                id_prefix: Some("rust-borrowck".into()),
                target: Target {
                    chat_id: -100123,
                    topic_id: Some(9),
                },
                payload: Payload {
                    text: "review: borrow checker".into(),
                    parse_mode: None,
                },
                start: Some(t0()),
                base: 3.0,
            })
            .await
            .unwrap();

        // Gaps 1, 3, 9, ... days within the 30-year horizon
        assert_eq!(jobs.len(), 10);
        assert_eq!(jobs[0].id, "rust-borrowck-1");
        assert_eq!(jobs[0].next_fire_at, Some(t0()));
        assert_eq!(jobs[1].next_fire_at, Some(t0() + Duration::days(1)));
        assert_eq!(jobs[2].next_fire_at, Some(t0() + Duration::days(4)));
        assert_eq!(jobs[3].next_fire_at, Some(t0() + Duration::days(13)));
        assert!(jobs.iter().all(|j| j.state == JobState::Active));
        assert!(jobs
            .iter()
            .all(|j| matches!(j.schedule, Schedule::OneShot { .. })));

        // All of them are persisted individually
        assert_eq!(registry.list(None).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_create_series_rejects_bad_base() {
        let (_store, _clock, registry) = registry();
        for base in [0.5, 5.1, f64::NAN] {
            let err = registry
                .create_series(NewSeries {
                    id_prefix: None,
                    target: Target {
                        chat_id: -100123,
                        topic_id: None,
                    },
                    payload: Payload {
                        text: "topic".into(),
                        parse_mode: None,
                    },
                    start: None,
                    base,
                })
                .await;
            assert!(matches!(
                err,
                Err(StoreError::Validation(ValidationError::BadSeriesBase(_)))
            ));
        }
        assert!(registry.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mutations_on_unknown_id() {
        let (_store, _clock, registry) = registry();
        assert!(matches!(
            registry.pause("ghost").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            registry.get("ghost").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(!registry.delete("ghost").await.unwrap());
    }
}
