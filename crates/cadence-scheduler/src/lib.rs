//! `cadence-scheduler`: recurrence rules, job lifecycle, and the polling
//! runner that claims and executes due jobs.
//!
//! # Overview
//!
//! Jobs live in a [`repository::ScheduleRepository`]. Each
//! [`runner::SchedulerRunner`] tick asks it for due jobs, claims each one
//! with a versioned save (Pending → Running), then either runs a matching
//! [`handler::JobHandler`] under a timeout or hands the job to a
//! [`queue::JobQueue`]. Success schedules the next occurrence or completes
//! the job; failure backs off exponentially until the retry budget runs out.
//!
//! # Recurrence kinds
//!
//! | Kind          | Next fire                                       |
//! |---------------|-------------------------------------------------|
//! | `OneTime`     | none after the first run                        |
//! | `EveryMinute` | + n minutes                                     |
//! | `EveryHour`   | + n hours                                       |
//! | `EveryDay`    | + n days                                        |
//! | `EveryWeek`   | + n weeks                                       |
//! | `EveryMonth`  | + n months, clamped to the last day of month    |
//! | `EveryYear`   | + n years, Feb 29 clamps to Feb 28              |
//! | `Cron`        | next match of a five-field expression (UTC)     |

pub mod clock;
pub mod db;
pub mod error;
pub mod handle;
pub mod handler;
pub mod queue;
pub mod recurrence;
pub mod repository;
pub mod retry;
pub mod runner;
pub mod schedule;
pub mod status;
pub mod store_memory;
pub mod store_sqlite;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, SchedulerError};
pub use handle::SchedulerHandle;
pub use handler::{FailureNotifier, JobHandler, JobResult};
pub use queue::{ChannelQueue, JobQueue};
pub use recurrence::{Recurrence, RecurrenceDescriptor, RecurrenceKind};
pub use repository::ScheduleRepository;
pub use retry::RetryPolicy;
pub use runner::{RunnerConfig, SchedulerRunner, TickReport};
pub use schedule::CronSchedule;
pub use status::JobStatus;
pub use store_memory::InMemoryRepository;
pub use store_sqlite::SqliteRepository;
pub use types::{NewJob, ScheduledJob};
