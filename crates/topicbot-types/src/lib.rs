//! topicbot-types: shared data model for the topic scheduler.
//!
//! The central entity is [`Job`]: a one-off or recurring message delivery
//! into a Telegram forum topic. Jobs are persisted by `topicbot-store` and
//! driven by `topicbot-scheduler`.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation failures for job input, rejected before persistence.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("message text must not be empty")]
    EmptyText,
    #[error("chat id must be non-zero")]
    EmptyTarget,
    #[error("recurrence interval must be at least 1 second")]
    ZeroInterval,
    #[error("invalid cron expression '{expr}': {reason}")]
    BadCron { expr: String, reason: String },
    #[error("unknown timezone '{0}'")]
    BadTimezone(String),
    #[error("series gap base must be between 1 and 5, got {0}")]
    BadSeriesBase(f64),
}

/// Delivery destination: a chat and, optionally, a forum topic within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Telegram chat id (group or supergroup).
    pub chat_id: i64,
    /// Forum topic (message thread) id. `None` posts to the general thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<i64>,
}

impl Target {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.chat_id == 0 {
            return Err(ValidationError::EmptyTarget);
        }
        Ok(())
    }
}

/// Message content to deliver. Replaced wholesale on edit, never mutated
/// in place, so an in-flight dispatch always sees a consistent payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub text: String,
    /// Telegram parse mode (e.g. "Markdown"). Plain text if `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_mode: Option<String>,
}

impl Payload {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.text.trim().is_empty() {
            return Err(ValidationError::EmptyText);
        }
        Ok(())
    }
}

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Fire exactly once at the given instant.
    OneShot { fire_at: DateTime<Utc> },
    /// Fire repeatedly at a fixed interval, anchored to the first occurrence.
    Every { interval_secs: u64 },
    /// Fire per a cron expression, evaluated in the given IANA timezone.
    ///
    /// Evaluating in-zone (rather than at a fixed UTC offset) keeps "daily
    /// at 02:30 local" correct across daylight-savings transitions.
    Cron { expr: String, tz: String },
}

impl Schedule {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Schedule::OneShot { .. } => Ok(()),
            Schedule::Every { interval_secs } => {
                if *interval_secs == 0 {
                    return Err(ValidationError::ZeroInterval);
                }
                Ok(())
            }
            Schedule::Cron { expr, tz } => {
                cron::Schedule::from_str(expr).map_err(|e| ValidationError::BadCron {
                    expr: expr.clone(),
                    reason: e.to_string(),
                })?;
                tz.parse::<chrono_tz::Tz>()
                    .map_err(|_| ValidationError::BadTimezone(tz.clone()))?;
                Ok(())
            }
        }
    }

    /// Whether this schedule can produce more than one occurrence.
    pub fn is_recurring(&self) -> bool {
        !matches!(self, Schedule::OneShot { .. })
    }
}

/// Job lifecycle tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Eligible for dispatch when `next_fire_at` passes.
    Active,
    /// Kept but never due; resume recomputes the next occurrence.
    Paused,
    /// Completed (one-shot delivered, or retry budget spent). Kept for audit.
    Exhausted,
    /// Cancelled by an operator. Kept until explicitly deleted.
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Active => "active",
            JobState::Paused => "paused",
            JobState::Exhausted => "exhausted",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(JobState::Active),
            "paused" => Ok(JobState::Paused),
            "exhausted" => Ok(JobState::Exhausted),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(format!("unknown job state '{other}'")),
        }
    }
}

/// Policy for occurrences missed while the process was down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum MissedPolicy {
    /// Collapse missed occurrences into the single nearest future one.
    SkipMissed,
    /// Replay missed occurrences one by one, at most `cap` behind now.
    ReplayAll { cap: u32 },
}

impl Default for MissedPolicy {
    fn default() -> Self {
        MissedPolicy::SkipMissed
    }
}

/// A scheduled delivery job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job id, assigned at creation, immutable.
    pub id: String,
    /// Destination chat/topic. Immutable after creation.
    pub target: Target,
    /// Message content.
    pub payload: Payload,
    /// Recurrence rule.
    pub schedule: Schedule,
    /// The single source of truth for "when is this job next due".
    /// `None` once the job leaves the schedulable states.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_fire_at: Option<DateTime<Utc>>,
    /// Lifecycle state.
    pub state: JobState,
    /// Consecutive failed attempts since the last success.
    #[serde(default)]
    pub retry_count: u32,
    /// Last dispatch error, kept for observability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the last dispatch attempt completed. Audit only, never used
    /// for scheduling decisions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_dispatched_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Monotonic version counter for optimistic concurrency control.
    #[serde(default)]
    pub version: i64,
}

impl Job {
    /// Validate the user-supplied parts of a job record.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.target.validate()?;
        self.payload.validate()?;
        self.schedule.validate()?;
        Ok(())
    }
}
