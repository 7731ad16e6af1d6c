//! topicbot-scheduler: the scheduling and delivery engine.
//!
//! Tracks pending and recurring jobs, decides when each is due, dispatches
//! due jobs through an outbound [`MessageSender`], and applies retry/backoff.
//! Survives restarts via the durable job store and tolerates a flaky remote
//! API: one job's failure never affects the loop or other jobs.
//!
//! Timing decisions are pure functions taking an explicit `now`; the single
//! injected [`Clock`] is consulted only at the loop's top level, which keeps
//! everything below it deterministic under test.

pub mod backoff;
pub mod clock;
pub mod dispatch;
pub mod registry;
pub mod scheduler;
pub mod sender;
pub mod trigger;

pub use clock::{Clock, SystemClock};
pub use dispatch::{DispatchStatus, Dispatcher};
pub use registry::{JobRegistry, NewJob, NewSeries};
pub use scheduler::Scheduler;
pub use sender::{MessageSender, SendError};
