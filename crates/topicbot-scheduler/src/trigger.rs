//! Trigger evaluation: pure functions deciding dueness and next occurrence.
//!
//! No side effects, no clock access; `now` is always an explicit argument.

use std::str::FromStr;

use chrono::offset::LocalResult;
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use topicbot_types::{Job, JobState, MissedPolicy, Schedule};

/// Upper bound on occurrences scanned when replaying a missed backlog, so a
/// pathological schedule (every second, weeks of downtime) stays bounded.
const MAX_REPLAY_SCAN: usize = 10_000;

/// A job is due iff it is Active and its `next_fire_at` has passed.
/// `next_fire_at` is the single source of truth; nothing else is consulted.
pub fn is_due(job: &Job, now: DateTime<Utc>) -> bool {
    job.state == JobState::Active && job.next_fire_at.is_some_and(|t| t <= now)
}

/// Next occurrence of `schedule` strictly after `from` (the occurrence that
/// just fired). `None` means the schedule is spent (one-shot).
///
/// When the naive next occurrence is already in the past (the process was
/// down for one or more periods), `policy` decides: skip to the nearest
/// future occurrence, or replay the backlog one occurrence at a time, at
/// most `cap` behind `now`.
pub fn compute_next(
    schedule: &Schedule,
    from: DateTime<Utc>,
    policy: &MissedPolicy,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::OneShot { .. } => None,
        Schedule::Every { interval_secs } => {
            let interval = Duration::seconds(*interval_secs as i64);
            let naive = from + interval;
            if naive > now {
                return Some(naive);
            }
            match effective_policy(policy) {
                MissedPolicy::SkipMissed => {
                    // Nearest future occurrence on the anchor grid.
                    let periods = (now - from).num_seconds() / interval.num_seconds() + 1;
                    Some(from + Duration::seconds(periods * interval.num_seconds()))
                }
                MissedPolicy::ReplayAll { cap } => {
                    // Occurrences o_k = from + k*interval; M of them are <= now.
                    let missed = (now - from).num_seconds() / interval.num_seconds();
                    if missed <= cap as i64 {
                        Some(naive)
                    } else {
                        let skip = missed - cap as i64;
                        Some(from + Duration::seconds((skip + 1) * interval.num_seconds()))
                    }
                }
            }
        }
        Schedule::Cron { expr, tz } => cron_next(expr, tz, from, policy, now),
    }
}

/// First occurrence of `schedule` after `now`, used when a job is created,
/// resumed, or rescheduled.
pub fn initial_next(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule {
        // A past fire_at is allowed and fires immediately.
        Schedule::OneShot { fire_at } => Some(*fire_at),
        Schedule::Every { interval_secs } => Some(now + Duration::seconds(*interval_secs as i64)),
        Schedule::Cron { expr, tz } => {
            let tz: Tz = tz.parse().ok()?;
            let schedule = cron::Schedule::from_str(expr).ok()?;
            cron_resolved(&schedule, tz, now, MissedPolicy::SkipMissed).next()
        }
    }
}

fn cron_next(
    expr: &str,
    tz: &str,
    from: DateTime<Utc>,
    policy: &MissedPolicy,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    // Both were validated at registration; a parse failure here means a
    // corrupt record, which simply stops producing occurrences.
    let tz: Tz = tz.parse().ok()?;
    let schedule = cron::Schedule::from_str(expr).ok()?;

    let next = cron_resolved(&schedule, tz, from, *policy).next()?;
    if next > now {
        return Some(next);
    }

    match effective_policy(policy) {
        MissedPolicy::SkipMissed => {
            cron_resolved(&schedule, tz, now, MissedPolicy::SkipMissed).next()
        }
        MissedPolicy::ReplayAll { cap } => {
            let missed: Vec<DateTime<Utc>> = cron_resolved(&schedule, tz, from, *policy)
                .take_while(|t| *t <= now)
                .collect();
            if missed.len() <= cap as usize {
                missed.first().copied()
            } else {
                missed.get(missed.len() - cap as usize).copied()
            }
        }
    }
}

/// UTC instants of the rule's occurrences strictly after `after`.
///
/// The expression is iterated over the rule's local wall-clock timeline and
/// each wall time is then resolved in the zone, which is what keeps "daily
/// at 02:30 local" tracking DST shifts rather than a fixed offset.
fn cron_resolved<'a>(
    schedule: &'a cron::Schedule,
    tz: Tz,
    after: DateTime<Utc>,
    policy: MissedPolicy,
) -> impl Iterator<Item = DateTime<Utc>> + 'a {
    let local = after.with_timezone(&tz).naive_local();
    let anchor: DateTime<Utc> = DateTime::from_naive_utc_and_offset(local, Utc);
    schedule
        .after(&anchor)
        .take(MAX_REPLAY_SCAN)
        .filter_map(move |t| resolve_local(tz, t.naive_utc(), policy))
        .filter(move |t| *t > after)
}

/// Map a local wall-clock occurrence onto a UTC instant.
///
/// Spring-forward can make a wall time nonexistent: under SkipMissed that
/// day simply has no occurrence; under ReplayAll the occurrence fires at the
/// first valid instant after the gap. Fall-back ambiguity resolves to the
/// earlier of the two instants.
fn resolve_local(tz: Tz, wall: NaiveDateTime, policy: MissedPolicy) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&wall) {
        LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
        LocalResult::Ambiguous(first, _) => Some(first.with_timezone(&Utc)),
        LocalResult::None => match effective_policy(&policy) {
            MissedPolicy::SkipMissed => None,
            MissedPolicy::ReplayAll { .. } => {
                // DST gaps are whole minutes and at most a few hours wide.
                let mut probe = wall;
                for _ in 0..(6 * 60) {
                    probe += Duration::minutes(1);
                    match tz.from_local_datetime(&probe) {
                        LocalResult::Single(t) => return Some(t.with_timezone(&Utc)),
                        LocalResult::Ambiguous(first, _) => {
                            return Some(first.with_timezone(&Utc))
                        }
                        LocalResult::None => {}
                    }
                }
                None
            }
        },
    }
}

/// `ReplayAll { cap: 0 }` degenerates to skipping everything missed.
fn effective_policy(policy: &MissedPolicy) -> MissedPolicy {
    match policy {
        MissedPolicy::ReplayAll { cap: 0 } => MissedPolicy::SkipMissed,
        p => *p,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use topicbot_types::{Payload, Target};

    fn ts(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, d, h, m, 0).unwrap()
    }

    fn active_job(next: Option<DateTime<Utc>>, state: JobState) -> Job {
        Job {
            id: "j".into(),
            target: Target {
                chat_id: 1,
                topic_id: None,
            },
            payload: Payload {
                text: "x".into(),
                parse_mode: None,
            },
            schedule: Schedule::Every { interval_secs: 60 },
            next_fire_at: next,
            state,
            retry_count: 0,
            last_error: None,
            last_dispatched_at: None,
            created_at: ts(1, 0, 0),
            version: 0,
        }
    }

    #[test]
    fn test_is_due() {
        let now = ts(1, 12, 0);
        assert!(is_due(&active_job(Some(now), JobState::Active), now));
        assert!(is_due(
            &active_job(Some(now - Duration::seconds(1)), JobState::Active),
            now
        ));
        assert!(!is_due(
            &active_job(Some(now + Duration::seconds(1)), JobState::Active),
            now
        ));
        assert!(!is_due(&active_job(None, JobState::Active), now));
        assert!(!is_due(&active_job(Some(now), JobState::Paused), now));
        assert!(!is_due(&active_job(Some(now), JobState::Cancelled), now));
    }

    #[test]
    fn test_one_shot_has_no_next() {
        let s = Schedule::OneShot { fire_at: ts(1, 9, 0) };
        assert_eq!(
            compute_next(&s, ts(1, 9, 0), &MissedPolicy::SkipMissed, ts(1, 9, 0)),
            None
        );
    }

    #[test]
    fn test_every_next_in_future() {
        let s = Schedule::Every { interval_secs: 60 };
        let from = ts(1, 9, 0);
        let next = compute_next(&s, from, &MissedPolicy::SkipMissed, from).unwrap();
        assert_eq!(next, from + Duration::seconds(60));
    }

    #[test]
    fn test_every_strictly_after_from() {
        for interval in [1u64, 60, 3600] {
            let s = Schedule::Every { interval_secs: interval };
            let from = ts(1, 9, 0);
            for now in [from, from + Duration::hours(5)] {
                let next = compute_next(&s, from, &MissedPolicy::SkipMissed, now).unwrap();
                assert!(next > from);
                assert!(next > now);
            }
        }
    }

    #[test]
    fn test_every_skip_missed_collapses_downtime() {
        let s = Schedule::Every { interval_secs: 60 };
        let from = ts(1, 9, 0);
        // 10 minutes of downtime: exactly one future occurrence, on the grid
        let now = ts(1, 9, 10);
        let next = compute_next(&s, from, &MissedPolicy::SkipMissed, now).unwrap();
        assert_eq!(next, ts(1, 9, 11));
    }

    #[test]
    fn test_every_replay_within_cap() {
        let s = Schedule::Every { interval_secs: 60 };
        let from = ts(1, 9, 0);
        let now = ts(1, 9, 3);
        // 3 missed, cap 5: replay from the first missed occurrence
        let next = compute_next(&s, from, &MissedPolicy::ReplayAll { cap: 5 }, now).unwrap();
        assert_eq!(next, ts(1, 9, 1));
    }

    #[test]
    fn test_every_replay_clamps_to_cap() {
        let s = Schedule::Every { interval_secs: 60 };
        let from = ts(1, 9, 0);
        let now = ts(1, 9, 10);
        // 10 missed, cap 3: skip the oldest 7, replay the last 3
        let next = compute_next(&s, from, &MissedPolicy::ReplayAll { cap: 3 }, now).unwrap();
        assert_eq!(next, ts(1, 9, 8));
    }

    #[test]
    fn test_replay_cap_zero_is_skip() {
        let s = Schedule::Every { interval_secs: 60 };
        let from = ts(1, 9, 0);
        let now = ts(1, 9, 10);
        let next = compute_next(&s, from, &MissedPolicy::ReplayAll { cap: 0 }, now).unwrap();
        assert_eq!(next, ts(1, 9, 11));
    }

    #[test]
    fn test_cron_daily_in_zone() {
        // 09:00 every day, Rome time (CEST in June: UTC+2)
        let s = Schedule::Cron {
            expr: "0 0 9 * * *".into(),
            tz: "Europe/Rome".into(),
        };
        let from = ts(1, 7, 0); // 2025-06-01 09:00 Rome
        let next = compute_next(&s, from, &MissedPolicy::SkipMissed, from).unwrap();
        assert_eq!(next, ts(2, 7, 0));
    }

    #[test]
    fn test_cron_skip_missed_after_downtime() {
        let s = Schedule::Cron {
            expr: "0 0 9 * * *".into(),
            tz: "UTC".into(),
        };
        let from = ts(1, 9, 0);
        let now = ts(5, 10, 0); // four occurrences missed
        let next = compute_next(&s, from, &MissedPolicy::SkipMissed, now).unwrap();
        assert_eq!(next, ts(6, 9, 0));
    }

    #[test]
    fn test_cron_replay_after_downtime() {
        let s = Schedule::Cron {
            expr: "0 0 9 * * *".into(),
            tz: "UTC".into(),
        };
        let from = ts(1, 9, 0);
        let now = ts(5, 10, 0);
        // 4 missed (days 2..5), cap 10: replay from the first missed
        let next = compute_next(&s, from, &MissedPolicy::ReplayAll { cap: 10 }, now).unwrap();
        assert_eq!(next, ts(2, 9, 0));
        // cap 2: skip days 2 and 3, resume at day 4
        let next = compute_next(&s, from, &MissedPolicy::ReplayAll { cap: 2 }, now).unwrap();
        assert_eq!(next, ts(4, 9, 0));
    }

    #[test]
    fn test_cron_dst_spring_forward_skips_nonexistent_time() {
        // 02:30 daily in America/New_York. On 2025-03-09 the clock jumps
        // 02:00 -> 03:00, so 02:30 does not exist that day.
        let s = Schedule::Cron {
            expr: "0 30 2 * * *".into(),
            tz: "America/New_York".into(),
        };
        // 2025-03-08 02:30 EST == 07:30 UTC
        let from = Utc.with_ymd_and_hms(2025, 3, 8, 7, 30, 0).unwrap();
        let next = compute_next(&s, from, &MissedPolicy::SkipMissed, from).unwrap();
        // 2025-03-10 02:30 EDT == 06:30 UTC: no occurrence on the 9th
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 10, 6, 30, 0).unwrap());
    }

    #[test]
    fn test_cron_dst_spring_forward_adjusted_under_replay() {
        // Same 02:30 rule, but the replay policy fires the nonexistent
        // occurrence at the first valid instant after the gap: 03:00 EDT.
        let s = Schedule::Cron {
            expr: "0 30 2 * * *".into(),
            tz: "America/New_York".into(),
        };
        let from = Utc.with_ymd_and_hms(2025, 3, 8, 7, 30, 0).unwrap();
        let next = compute_next(&s, from, &MissedPolicy::ReplayAll { cap: 10 }, from).unwrap();
        // 2025-03-09 03:00 EDT == 07:00 UTC
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 9, 7, 0, 0).unwrap());
    }

    #[test]
    fn test_cron_dst_offset_shift_tracks_local_time() {
        // 09:00 daily in New York across the spring-forward weekend:
        // EST (UTC-5) before, EDT (UTC-4) after.
        let s = Schedule::Cron {
            expr: "0 0 9 * * *".into(),
            tz: "America/New_York".into(),
        };
        let from = Utc.with_ymd_and_hms(2025, 3, 8, 14, 0, 0).unwrap(); // 09:00 EST
        let next = compute_next(&s, from, &MissedPolicy::SkipMissed, from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 9, 13, 0, 0).unwrap()); // 09:00 EDT
    }

    #[test]
    fn test_initial_next() {
        let now = ts(1, 12, 0);
        assert_eq!(
            initial_next(&Schedule::OneShot { fire_at: ts(2, 0, 0) }, now),
            Some(ts(2, 0, 0))
        );
        assert_eq!(
            initial_next(&Schedule::Every { interval_secs: 300 }, now),
            Some(ts(1, 12, 5))
        );
        let cron_next = initial_next(
            &Schedule::Cron {
                expr: "0 0 9 * * *".into(),
                tz: "UTC".into(),
            },
            now,
        )
        .unwrap();
        assert_eq!(cron_next, ts(2, 9, 0));
    }
}
