use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::JobError;

/// Injectable time source. Production code uses [`SystemClock`]; tests can
/// substitute a fixed or stepped clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A parsed job schedule, either a fixed interval or a cron expression.
#[derive(Debug, Clone)]
pub enum JobSchedule {
    Every(Duration),
    // Boxed to avoid large enum size and clippy::large_enum_variants warnings
    Cron(Box<Schedule>),
}

const EVERY_PREFIX: &str = "@every ";
const CRON_PREFIX: &str = "@cron ";

impl JobSchedule {
    /// Parse a schedule string. Accepted grammars: `@every <duration>`,
    /// `@cron <expr>`, a raw 6/7-field cron expression, a classic 5-field
    /// cron expression (seconds implied `0`), and the `@hourly`-style
    /// shortcuts. Fails synchronously so a bad schedule never registers.
    pub fn parse(s: &str) -> Result<JobSchedule, JobError> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix(EVERY_PREFIX) {
            let dur = humantime::parse_duration(rest)
                .map_err(|e| JobError::ConfigInvalid(format!("bad @every duration: {e}")))?;
            if dur.is_zero() {
                return Err(JobError::ConfigInvalid("@every duration must be non-zero".into()));
            }
            return Ok(JobSchedule::Every(dur));
        }
        if let Some(expr) = s.strip_prefix(CRON_PREFIX) {
            return parse_cron(expr).map(|sched| JobSchedule::Cron(Box::new(sched)));
        }

        let dur = match s {
            "@hourly" => Duration::from_secs(3600),
            "@daily" | "@every 24h" => Duration::from_secs(24 * 3600),
            "@weekly" => Duration::from_secs(7 * 24 * 3600),
            "@monthly" => Duration::from_secs(30 * 24 * 3600),
            _ => {
                // Raw cron expression without the @cron prefix, the common
                // spelling in config files and labels.
                return parse_cron(s).map(|sched| JobSchedule::Cron(Box::new(sched)));
            }
        };
        Ok(JobSchedule::Every(dur))
    }

    /// Next fire instant strictly after `from`. `None` only for cron
    /// expressions that have no future occurrence.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            JobSchedule::Every(d) => {
                let step = chrono::Duration::from_std(*d).ok()?;
                from.checked_add_signed(step)
            }
            JobSchedule::Cron(sched) => sched.after(&from).next(),
        }
    }
}

fn parse_cron(expr: &str) -> Result<Schedule, JobError> {
    match Schedule::from_str(expr) {
        Ok(sched) => Ok(sched),
        Err(e) => {
            // The cron crate wants an explicit seconds field; classic
            // five-field crontab lines get one prepended.
            if expr.split_whitespace().count() == 5 {
                if let Ok(sched) = Schedule::from_str(&format!("0 {expr}")) {
                    return Ok(sched);
                }
            }
            Err(JobError::ConfigInvalid(format!("bad cron expression {expr:?}: {e}")))
        }
    }
}

impl Display for JobSchedule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            JobSchedule::Every(d) => f.write_fmt(format_args!(
                "{}{}",
                EVERY_PREFIX,
                humantime::format_duration(*d)
            )),
            JobSchedule::Cron(s) => f.write_fmt(format_args!("{}{}", CRON_PREFIX, s)),
        }
    }
}

impl FromStr for JobSchedule {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobSchedule::parse(s)
    }
}
