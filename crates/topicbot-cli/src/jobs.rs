//! Job management subcommands.
//!
//! Each command opens the shared store directly; the running service picks
//! up changes made from another process within its poll interval.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use tokio::sync::Notify;

use topicbot_config::{load_config, TopicBotConfig};
use topicbot_scheduler::{JobRegistry, NewJob, NewSeries, Scheduler, SystemClock};
use topicbot_store::JobStore;
use topicbot_telegram::TelegramSender;
use topicbot_types::{Job, JobState, Payload, Schedule, Target};

/// Exactly one of `--at`, `--every`, `--cron`.
#[derive(Debug, Args)]
pub struct ScheduleArgs {
    /// Fire once at an RFC 3339 instant (e.g. "2026-09-01T09:00:00+02:00")
    #[arg(long)]
    pub at: Option<String>,

    /// Fire every N seconds
    #[arg(long)]
    pub every: Option<u64>,

    /// Fire on a cron expression (e.g. "0 0 9 * * Mon-Fri *")
    #[arg(long)]
    pub cron: Option<String>,

    /// IANA timezone for --cron (defaults to config)
    #[arg(long)]
    pub tz: Option<String>,
}

impl ScheduleArgs {
    pub fn into_schedule(self, default_tz: &str) -> Result<Schedule> {
        let given =
            self.at.is_some() as u8 + self.every.is_some() as u8 + self.cron.is_some() as u8;
        if given != 1 {
            bail!("specify exactly one of --at, --every, --cron");
        }

        if let Some(at) = self.at {
            return Ok(Schedule::OneShot {
                fire_at: parse_at(&at)?,
            });
        }
        if let Some(interval_secs) = self.every {
            return Ok(Schedule::Every { interval_secs });
        }
        let expr = self.cron.unwrap_or_default();
        Ok(Schedule::Cron {
            expr,
            tz: self.tz.unwrap_or_else(|| default_tz.to_string()),
        })
    }
}

fn parse_at(at: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(at)
        .with_context(|| format!("--at is not a valid RFC 3339 timestamp: {at}"))?
        .with_timezone(&Utc))
}

fn load() -> Result<TopicBotConfig> {
    load_config().context("failed to load configuration")
}

async fn open_registry(config: &TopicBotConfig) -> Result<JobRegistry> {
    let db_path = config.resolve_db_path()?;
    let store = Arc::new(JobStore::open(&db_path)?);
    Ok(JobRegistry::new(
        store,
        Arc::new(SystemClock),
        Arc::new(Notify::new()),
    ))
}

fn print_job_row(job: &Job) {
    let next = job
        .next_fire_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".into());
    println!(
        "{:<38} {:<9} {:<26} chat {} {}",
        job.id,
        job.state.as_str(),
        next,
        job.target.chat_id,
        job.target
            .topic_id
            .map(|t| format!("topic {t}"))
            .unwrap_or_default()
    );
}

fn print_job_full(job: &Job) {
    println!("id:         {}", job.id);
    println!("state:      {}", job.state.as_str());
    println!("chat:       {}", job.target.chat_id);
    if let Some(topic) = job.target.topic_id {
        println!("topic:      {topic}");
    }
    match &job.schedule {
        Schedule::OneShot { fire_at } => println!("schedule:   once at {}", fire_at.to_rfc3339()),
        Schedule::Every { interval_secs } => println!("schedule:   every {interval_secs}s"),
        Schedule::Cron { expr, tz } => println!("schedule:   cron \"{expr}\" in {tz}"),
    }
    if let Some(next) = job.next_fire_at {
        println!("next fire:  {}", next.to_rfc3339());
    }
    if let Some(last) = job.last_dispatched_at {
        println!("last sent:  {}", last.to_rfc3339());
    }
    if job.retry_count > 0 {
        println!("retries:    {}", job.retry_count);
    }
    if let Some(err) = &job.last_error {
        println!("last error: {err}");
    }
    println!("text:       {}", job.payload.text);
}

#[allow(clippy::too_many_arguments)]
pub async fn run_add(
    chat: Option<i64>,
    topic: Option<i64>,
    text: String,
    parse_mode: Option<String>,
    id: Option<String>,
    spaced: bool,
    base: f64,
    schedule: ScheduleArgs,
) -> Result<()> {
    let config = load()?;
    let chat_id = chat
        .or(config.defaults.chat_id)
        .context("no --chat given and no defaults.chat_id in config")?;
    let target = Target {
        chat_id,
        topic_id: topic.or(config.defaults.topic_id),
    };
    let registry = open_registry(&config).await?;

    if spaced {
        // A series is a batch of one-shots; --at (optional) sets the start.
        if schedule.every.is_some() || schedule.cron.is_some() {
            bail!("--spaced takes at most --at for its start, not --every or --cron");
        }
        let start = schedule.at.as_deref().map(parse_at).transpose()?;
        let jobs = registry
            .create_series(NewSeries {
                id_prefix: id,
                target,
                payload: Payload { text, parse_mode },
                start,
                base,
            })
            .await?;
        println!("registered {} reminders", jobs.len());
        for job in jobs.iter().take(4) {
            print_job_row(job);
        }
        if jobs.len() > 4 {
            println!("...");
        }
        return Ok(());
    }

    let schedule = schedule.into_schedule(&config.defaults.timezone)?;
    let job = registry
        .create(NewJob {
            id,
            target,
            payload: Payload { text, parse_mode },
            schedule,
        })
        .await?;

    println!("registered {}", job.id);
    if let Some(next) = job.next_fire_at {
        println!("next fire: {}", next.to_rfc3339());
    }
    Ok(())
}

pub async fn run_list(state: Option<String>) -> Result<()> {
    let filter = state
        .map(|s| s.parse::<JobState>())
        .transpose()
        .map_err(|e| anyhow::anyhow!(e))?;

    let config = load()?;
    let registry = open_registry(&config).await?;
    let jobs = registry.list(filter).await?;
    if jobs.is_empty() {
        println!("no jobs");
        return Ok(());
    }
    for job in &jobs {
        print_job_row(job);
    }
    Ok(())
}

pub async fn run_show(id: String) -> Result<()> {
    let config = load()?;
    let registry = open_registry(&config).await?;
    print_job_full(&registry.get(&id).await?);
    Ok(())
}

pub async fn run_pause(id: String) -> Result<()> {
    let config = load()?;
    let registry = open_registry(&config).await?;
    let job = registry.pause(&id).await?;
    println!("{} is now {}", job.id, job.state.as_str());
    Ok(())
}

pub async fn run_resume(id: String) -> Result<()> {
    let config = load()?;
    let registry = open_registry(&config).await?;
    let job = registry.resume(&id).await?;
    println!("{} is now {}", job.id, job.state.as_str());
    if let Some(next) = job.next_fire_at {
        println!("next fire: {}", next.to_rfc3339());
    }
    Ok(())
}

pub async fn run_cancel(id: String) -> Result<()> {
    let config = load()?;
    let registry = open_registry(&config).await?;
    let job = registry.cancel(&id).await?;
    println!("{} is now {}", job.id, job.state.as_str());
    Ok(())
}

pub async fn run_delete(id: String) -> Result<()> {
    let config = load()?;
    let registry = open_registry(&config).await?;
    if registry.delete(&id).await? {
        println!("deleted {id}");
    } else {
        println!("no such job: {id}");
    }
    Ok(())
}

pub async fn run_edit(id: String, text: String, parse_mode: Option<String>) -> Result<()> {
    let config = load()?;
    let registry = open_registry(&config).await?;
    let job = registry.edit_payload(&id, Payload { text, parse_mode }).await?;
    println!("updated {}", job.id);
    Ok(())
}

pub async fn run_reschedule(id: String, schedule: ScheduleArgs) -> Result<()> {
    let config = load()?;
    let schedule = schedule.into_schedule(&config.defaults.timezone)?;
    let registry = open_registry(&config).await?;
    let job = registry.reschedule(&id, schedule).await?;
    println!("rescheduled {}", job.id);
    if let Some(next) = job.next_fire_at {
        println!("next fire: {}", next.to_rfc3339());
    }
    Ok(())
}

/// Send a job's message right now, off-schedule. Recurring jobs keep their
/// normal cadence afterwards.
pub async fn run_fire(id: String) -> Result<()> {
    let config = load()?;
    let bot_token = config
        .resolve_bot_token()
        .context("no bot token in config or TOPICBOT_BOT_TOKEN")?;
    let db_path = config.resolve_db_path()?;
    let store = Arc::new(JobStore::open(&db_path)?);

    let sender = TelegramSender::new(&bot_token);
    sender.verify().await?;

    let scheduler = Scheduler::new(
        store,
        Arc::new(sender),
        Arc::new(SystemClock),
        config.scheduler.clone(),
    );
    let status = scheduler.fire_now(&id).await?;
    println!("{id}: {status:?}");
    Ok(())
}

pub async fn run_chat_id(timeout: i64) -> Result<()> {
    let config = load()?;
    let bot_token = config
        .resolve_bot_token()
        .context("no bot token in config or TOPICBOT_BOT_TOKEN")?;

    let sender = TelegramSender::new(&bot_token);
    sender.verify().await?;

    println!("send a message to the bot (or into a topic) within {timeout}s...");
    let seen = sender.discover_chats(timeout).await?;
    if seen.is_empty() {
        println!("no messages seen");
        return Ok(());
    }
    for chat in seen {
        let title = chat.title.unwrap_or_else(|| "private".into());
        match chat.topic_id {
            Some(topic) => println!("chat {} topic {topic}  ({title})", chat.chat_id),
            None => println!("chat {}  ({title})", chat.chat_id),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(
        at: Option<&str>,
        every: Option<u64>,
        cron: Option<&str>,
        tz: Option<&str>,
    ) -> ScheduleArgs {
        ScheduleArgs {
            at: at.map(Into::into),
            every,
            cron: cron.map(Into::into),
            tz: tz.map(Into::into),
        }
    }

    #[test]
    fn test_schedule_args_one_shot() {
        let s = args(Some("2026-09-01T09:00:00+02:00"), None, None, None)
            .into_schedule("UTC")
            .unwrap();
        match s {
            Schedule::OneShot { fire_at } => {
                assert_eq!(fire_at.to_rfc3339(), "2026-09-01T07:00:00+00:00");
            }
            other => panic!("expected OneShot, got {other:?}"),
        }
    }

    #[test]
    fn test_schedule_args_every() {
        let s = args(None, Some(300), None, None).into_schedule("UTC").unwrap();
        assert!(matches!(s, Schedule::Every { interval_secs: 300 }));
    }

    #[test]
    fn test_schedule_args_cron_uses_default_tz() {
        let s = args(None, None, Some("0 0 9 * * * *"), None)
            .into_schedule("Europe/Berlin")
            .unwrap();
        match s {
            Schedule::Cron { expr, tz } => {
                assert_eq!(expr, "0 0 9 * * * *");
                assert_eq!(tz, "Europe/Berlin");
            }
            other => panic!("expected Cron, got {other:?}"),
        }
    }

    #[test]
    fn test_schedule_args_explicit_tz_wins() {
        let s = args(None, None, Some("0 0 9 * * * *"), Some("America/New_York"))
            .into_schedule("UTC")
            .unwrap();
        assert!(matches!(s, Schedule::Cron { tz, .. } if tz == "America/New_York"));
    }

    #[test]
    fn test_schedule_args_require_exactly_one() {
        assert!(args(None, None, None, None).into_schedule("UTC").is_err());
        assert!(args(Some("2026-09-01T09:00:00Z"), Some(60), None, None)
            .into_schedule("UTC")
            .is_err());
    }

    #[test]
    fn test_schedule_args_bad_timestamp() {
        assert!(args(Some("tomorrow"), None, None, None)
            .into_schedule("UTC")
            .is_err());
    }
}
