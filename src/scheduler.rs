//! Scheduler server: turns cron schedules into periodic enqueue actions
//!
//! The scheduler never runs tasks itself. A [`QueueServer`](crate::worker::QueueServer)
//! consuming the same queues must be running, or scheduled tasks pile up.

use chrono::{DateTime, TimeZone, Utc};
use cron::Schedule;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn, Level, Subscriber};
use uuid::Uuid;

use crate::broker::Broker;
use crate::error::{TaskError, TaskResult};
use crate::handler::{ScheduleEntry, ScheduledTaskHandler};
use crate::logging::LogLevel;
use crate::options::{OptionSet, TaskOption};
use crate::task::{TaskInfo, TaskMessage};

/// Parsed cron spec
#[derive(Debug, Clone)]
pub enum CronSchedule {
    /// Calendar expression (seconds field first)
    Cron(Box<Schedule>),
    /// Fixed interval from `@every <duration>`
    Every(Duration),
}

impl CronSchedule {
    /// Parse a 5/6/7-field expression, an `@daily`-style descriptor or
    /// `@every <duration>`
    pub fn parse(spec: &str) -> TaskResult<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(TaskError::EmptyCronSpec);
        }
        let invalid = |reason: String| TaskError::InvalidCronSpec {
            spec: spec.to_string(),
            reason,
        };

        if let Some(every) = spec.strip_prefix("@every") {
            let interval = parse_go_duration(every)
                .ok_or_else(|| invalid(format!("invalid duration {:?}", every.trim())))?;
            // whole seconds, at least one
            let secs = interval.as_secs().max(1);
            return Ok(CronSchedule::Every(Duration::from_secs(secs)));
        }

        let expression = match spec {
            "@yearly" | "@annually" => "0 0 0 1 1 *".to_string(),
            "@monthly" => "0 0 0 1 * *".to_string(),
            "@weekly" => "0 0 0 * * Sun".to_string(),
            "@daily" | "@midnight" => "0 0 0 * * *".to_string(),
            "@hourly" => "0 0 * * * *".to_string(),
            _ => {
                let fields: Vec<&str> = spec.split_whitespace().collect();
                match fields.len() {
                    5 => format!(
                        "0 {} {} {} {} {}",
                        fields[0],
                        fields[1],
                        fields[2],
                        fields[3],
                        weekday_field(fields[4])
                    ),
                    // seconds first, optional trailing year
                    6 | 7 => {
                        let mut fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
                        fields[5] = weekday_field(&fields[5]);
                        fields.join(" ")
                    }
                    _ => spec.to_string(),
                }
            }
        };

        Schedule::from_str(&expression)
            .map(|schedule| CronSchedule::Cron(Box::new(schedule)))
            .map_err(|e| invalid(e.to_string()))
    }

    /// First fire time strictly after `after`, evaluated in `location`
    pub fn next_after(&self, after: DateTime<Utc>, location: &Location) -> Option<DateTime<Utc>> {
        match self {
            CronSchedule::Every(interval) => {
                let interval = chrono::Duration::from_std(*interval).ok()?;
                Some(after + interval)
            }
            CronSchedule::Cron(schedule) => match location {
                Location::Utc => schedule.after(&after).next(),
                Location::Local => next_in_zone(schedule, after, &chrono::Local),
                Location::Tz(tz) => next_in_zone(schedule, after, tz),
            },
        }
    }
}

fn next_in_zone<Z: TimeZone>(schedule: &Schedule, after: DateTime<Utc>, zone: &Z) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(zone))
        .next()
        .map(|t| t.with_timezone(&Utc))
}

/// Convert a standard day-of-week field (0 or 7 = Sunday) to the 1-7
/// numbering the `cron` crate uses (1 = Sunday).
///
/// Numeric values, ranges and steps are expanded into an explicit list so
/// ranges ending on 7 keep their Sunday. Names and `*` pass through.
fn weekday_field(field: &str) -> String {
    field.split(',').map(weekday_part).collect::<Vec<_>>().join(",")
}

fn weekday_part(part: &str) -> String {
    let (base, step) = match part.split_once('/') {
        Some((base, step)) => match step.parse::<usize>() {
            Ok(step) if step > 0 => (base, Some(step)),
            _ => return part.to_string(),
        },
        None => (part, None),
    };
    let bounds = match base.split_once('-') {
        Some((start, end)) => start.parse::<u32>().ok().zip(end.parse::<u32>().ok()),
        // `N/step` runs to the end of the week
        None if step.is_some() => base.parse::<u32>().ok().map(|start| (start, 6)),
        None => base.parse::<u32>().ok().map(|day| (day, day)),
    };
    // leave anything malformed for the cron parser to reject
    let Some((start, end)) = bounds.filter(|(start, end)| start <= end && *end <= 7) else {
        return part.to_string();
    };

    let mut days: Vec<u32> = (start..=end)
        .step_by(step.unwrap_or(1))
        .map(|day| day % 7 + 1)
        .collect();
    days.sort_unstable();
    days.dedup();
    days.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
}

/// Parse durations such as `1h30m`, `90s`, `1.5h` or `500ms`
fn parse_go_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if s == "0" {
        return Some(Duration::ZERO);
    }

    let mut nanos = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_end == 0 {
            return None;
        }
        let value: f64 = rest[..num_end].parse().ok()?;
        rest = &rest[num_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3_600e9,
            _ => return None,
        };
        nanos += value * scale;
        rest = &rest[unit_end..];
    }
    Some(Duration::from_nanos(nanos as u64))
}

/// Time zone cron expressions are evaluated in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Location {
    #[default]
    Utc,
    /// Host local time
    Local,
    Tz(chrono_tz::Tz),
}

impl Location {
    /// "" and "UTC" give UTC, "Local" the host zone, anything else is looked
    /// up as an IANA name; unknown names fall back to UTC.
    pub fn parse(name: &str) -> Self {
        match name.trim() {
            "" | "UTC" => Location::Utc,
            "Local" => Location::Local,
            other => match other.parse::<chrono_tz::Tz>() {
                Ok(tz) => Location::Tz(tz),
                Err(_) => {
                    warn!("Unknown time zone {:?}, using UTC", other);
                    Location::Utc
                }
            },
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Utc => f.write_str("UTC"),
            Location::Local => f.write_str("Local"),
            Location::Tz(tz) => f.write_str(tz.name()),
        }
    }
}

/// Called with the message right before it is handed to the broker
pub type PreEnqueueHook = Arc<dyn Fn(&TaskMessage) + Send + Sync>;

/// Called with the task name and the broker's answer after each attempt
pub type PostEnqueueHook = Arc<dyn Fn(&str, &TaskResult<TaskInfo>) + Send + Sync>;

/// Scheduler server configuration
#[derive(Clone)]
pub struct SchedulerConfig {
    pub location: Location,
    pub log_level: LogLevel,
    /// How long shutdown waits for an in-progress tick
    pub drain_timeout: Duration,
    pub pre_enqueue: Option<PreEnqueueHook>,
    pub post_enqueue: Option<PostEnqueueHook>,
    /// Subscriber receiving the scheduler's events instead of the global one
    pub logger: Option<tracing::Dispatch>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            location: Location::Utc,
            log_level: LogLevel::Error,
            drain_timeout: Duration::from_secs(5),
            pre_enqueue: None,
            post_enqueue: None,
            logger: None,
        }
    }
}

impl fmt::Debug for SchedulerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerConfig")
            .field("location", &self.location)
            .field("log_level", &self.log_level)
            .field("drain_timeout", &self.drain_timeout)
            .field("pre_enqueue", &self.pre_enqueue.is_some())
            .field("post_enqueue", &self.post_enqueue.is_some())
            .field("logger", &self.logger.is_some())
            .finish()
    }
}

impl SchedulerConfig {
    /// Time zone by name, see [`Location::parse`]
    pub fn with_location(mut self, name: &str) -> Self {
        self.location = Location::parse(name);
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_pre_enqueue<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TaskMessage) + Send + Sync + 'static,
    {
        self.pre_enqueue = Some(Arc::new(hook));
        self
    }

    pub fn with_post_enqueue<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &TaskResult<TaskInfo>) + Send + Sync + 'static,
    {
        self.post_enqueue = Some(Arc::new(hook));
        self
    }

    pub fn with_logger<S>(mut self, subscriber: S) -> Self
    where
        S: Subscriber + Send + Sync + 'static,
    {
        self.logger = Some(tracing::Dispatch::new(subscriber));
        self
    }
}

/// A schedule accepted by the server
#[derive(Debug, Clone)]
pub struct RegisteredEntry {
    pub id: String,
    pub entry: ScheduleEntry,
    pub schedule: CronSchedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    Stopped,
}

/// Enqueues registered tasks whenever their schedule fires
pub struct SchedulerServer {
    broker: Arc<dyn Broker>,
    config: SchedulerConfig,
    entries: Vec<RegisteredEntry>,
    intake: CancellationToken,
    state: watch::Sender<RunState>,
}

impl fmt::Debug for SchedulerServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerServer")
            .field("config", &self.config)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl SchedulerServer {
    pub fn new(broker: Arc<dyn Broker>, config: SchedulerConfig) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            broker,
            config,
            entries: Vec::new(),
            intake: CancellationToken::new(),
            state,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn entries(&self) -> &[RegisteredEntry] {
        &self.entries
    }

    /// Register a periodic enqueue of `task_name` with an empty payload.
    ///
    /// The cron spec is validated here, so a bad expression fails registration
    /// rather than the first tick. Returns the generated entry id.
    pub fn schedule_task<I>(&mut self, cron_spec: &str, task_name: &str, options: I) -> TaskResult<String>
    where
        I: IntoIterator<Item = TaskOption>,
    {
        if cron_spec.trim().is_empty() {
            return Err(TaskError::EmptyCronSpec);
        }
        if task_name.trim().is_empty() {
            return Err(TaskError::EmptyTaskName);
        }
        let schedule = CronSchedule::parse(cron_spec)?;

        let id = Uuid::new_v4().to_string();
        info!(entry_id = %id, task = %task_name, spec = %cron_spec, "Registered schedule");
        self.entries.push(RegisteredEntry {
            id: id.clone(),
            entry: ScheduleEntry {
                cron_spec: cron_spec.to_string(),
                task_name: task_name.to_string(),
                options: options.into_iter().collect(),
            },
            schedule,
        });
        Ok(id)
    }

    pub fn register_entry(&mut self, entry: ScheduleEntry) -> TaskResult<String> {
        self.schedule_task(&entry.cron_spec, &entry.task_name, entry.options)
    }

    /// Register a handler that declares its own schedule
    pub fn register(&mut self, handler: &dyn ScheduledTaskHandler) -> TaskResult<String> {
        self.register_entry(handler.schedule_entry())
    }

    /// Tick until shut down. Enqueue failures are logged and never stop the
    /// loop.
    pub async fn run(&self) -> TaskResult<()> {
        let started = self.state.send_if_modified(|state| {
            if *state == RunState::Idle {
                *state = RunState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return match *self.state.borrow() {
                RunState::Stopped => Ok(()),
                _ => Err(TaskError::config("scheduler server is already running")),
            };
        }

        match self.config.logger.clone() {
            Some(logger) => self.tick_loop().with_subscriber(logger).await,
            None => self.tick_loop().await,
        }
        Ok(())
    }

    async fn tick_loop(&self) {
        info!(
            entries = self.entries.len(),
            location = %self.config.location,
            "Starting scheduler server"
        );

        let start = Utc::now();
        let mut next_runs: Vec<Option<DateTime<Utc>>> = self
            .entries
            .iter()
            .map(|e| e.schedule.next_after(start, &self.config.location))
            .collect();

        loop {
            let wait = match next_runs.iter().flatten().min() {
                Some(next) => (*next - Utc::now()).to_std().unwrap_or(Duration::ZERO),
                None => Duration::MAX,
            };

            tokio::select! {
                _ = self.intake.cancelled() => break,
                _ = sleep_for(wait) => {}
            }

            let now = Utc::now();
            for (entry, next_run) in self.entries.iter().zip(next_runs.iter_mut()) {
                if matches!(next_run, Some(at) if *at <= now) {
                    self.fire(entry).await;
                    *next_run = entry.schedule.next_after(now, &self.config.location);
                }
            }
        }

        self.state.send_replace(RunState::Stopped);
        info!("Scheduler server stopped");
    }

    async fn fire(&self, registered: &RegisteredEntry) {
        let entry = &registered.entry;
        let options = OptionSet::from_options(entry.options.iter().cloned());
        let msg = match TaskMessage::new(&entry.task_name, Vec::new(), options) {
            Ok(msg) => msg,
            Err(e) => {
                error!(entry_id = %registered.id, "Failed to build scheduled task: {}", e);
                return;
            }
        };

        if let Some(hook) = &self.config.pre_enqueue {
            if catch_unwind(AssertUnwindSafe(|| hook(&msg))).is_err() {
                error!(entry_id = %registered.id, "Pre-enqueue hook panicked");
            }
        }

        let result = self
            .broker
            .enqueue(msg)
            .await
            .map_err(|e| TaskError::enqueue_failed(entry.task_name.as_str(), e));

        match &result {
            Ok(info) => {
                if self.config.log_level.allows(Level::DEBUG) {
                    debug!(entry_id = %registered.id, task_id = %info.id, task = %entry.task_name, "Enqueued scheduled task");
                }
            }
            Err(e) => {
                if self.config.log_level.allows(Level::ERROR) {
                    error!(entry_id = %registered.id, task = %entry.task_name, "Failed to enqueue scheduled task: {}", e);
                }
            }
        }

        if let Some(hook) = &self.config.post_enqueue {
            if catch_unwind(AssertUnwindSafe(|| hook(&entry.task_name, &result))).is_err() {
                error!(entry_id = %registered.id, "Post-enqueue hook panicked");
            }
        }
    }

    /// Stop ticking; waits up to the drain timeout for a tick in progress
    pub async fn shutdown(&self) {
        info!("Shutting down scheduler server");
        self.intake.cancel();
        self.state.send_if_modified(|state| {
            if *state == RunState::Idle {
                *state = RunState::Stopped;
                true
            } else {
                false
            }
        });

        let mut state = self.state.subscribe();
        let stopped = tokio::time::timeout(self.config.drain_timeout, state.wait_for(|s| *s == RunState::Stopped)).await;
        if stopped.is_err() {
            warn!("Scheduler did not stop within {:?}", self.config.drain_timeout);
        }
    }
}

async fn sleep_for(wait: Duration) {
    if wait == Duration::MAX {
        std::future::pending::<()>().await
    } else {
        tokio::time::sleep(wait).await
    }
}

/// Register `entries`, run until `cancel` fires, then shut down
pub async fn run_scheduler_server<I>(
    broker: Arc<dyn Broker>,
    config: SchedulerConfig,
    cancel: CancellationToken,
    entries: I,
) -> TaskResult<()>
where
    I: IntoIterator<Item = ScheduleEntry>,
{
    let mut server = SchedulerServer::new(broker, config);
    for entry in entries {
        server.register_entry(entry)?;
    }

    let run = server.run();
    tokio::pin!(run);
    tokio::select! {
        result = &mut run => result,
        _ = cancel.cancelled() => {
            server.intake.cancel();
            run.await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::scheduled_handler_fn;
    use crate::memory::MemoryBroker;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::assert_ok;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn five_field_spec_gets_seconds_prepended() {
        let schedule = CronSchedule::parse("*/15 * * * *").unwrap();
        let next = schedule.next_after(at(2024, 1, 1, 10, 7), &Location::Utc).unwrap();
        assert_eq!(next, at(2024, 1, 1, 10, 15));
    }

    #[test]
    fn five_field_weekdays_use_sunday_zero() {
        // 2024-01-06 is a Saturday
        let weekdays = CronSchedule::parse("0 9 * * 1-5").unwrap();
        assert_eq!(
            weekdays.next_after(at(2024, 1, 6, 12, 0), &Location::Utc),
            Some(at(2024, 1, 8, 9, 0))
        );

        let sundays = CronSchedule::parse("0 0 * * 0").unwrap();
        assert_eq!(
            sundays.next_after(at(2024, 1, 6, 12, 0), &Location::Utc),
            Some(at(2024, 1, 7, 0, 0))
        );
    }

    #[test]
    fn six_field_weekdays_match_five_field_ones() {
        let five = CronSchedule::parse("0 9 * * 1").unwrap();
        let six = CronSchedule::parse("0 0 9 * * 1").unwrap();
        let seven = CronSchedule::parse("0 0 9 * * 1 *").unwrap();
        let saturday = at(2024, 1, 6, 12, 0);
        for schedule in [five, six, seven] {
            assert_eq!(
                schedule.next_after(saturday, &Location::Utc),
                Some(at(2024, 1, 8, 9, 0))
            );
        }
    }

    #[test]
    fn weekday_ranges_ending_on_seven_include_sunday() {
        assert_eq!(weekday_field("0-7"), "1,2,3,4,5,6,7");
        assert_eq!(weekday_field("5-7"), "1,6,7");
        assert_eq!(weekday_field("1-5"), "2,3,4,5,6");
        assert_eq!(weekday_field("0-6/2"), "1,3,5,7");
        assert_eq!(weekday_field("1/3"), "2,5");
        assert_eq!(weekday_field("*/2"), "*/2");
        assert_eq!(weekday_field("MON-FRI"), "MON-FRI");

        let every_day = CronSchedule::parse("0 9 * * 0-7").unwrap();
        let mut after = at(2024, 1, 6, 12, 0);
        let mut fired = Vec::new();
        for _ in 0..3 {
            after = every_day.next_after(after, &Location::Utc).unwrap();
            fired.push(after);
        }
        assert_eq!(
            fired,
            [at(2024, 1, 7, 9, 0), at(2024, 1, 8, 9, 0), at(2024, 1, 9, 9, 0)]
        );
    }

    #[test]
    fn descriptors_are_supported() {
        let daily = CronSchedule::parse("@daily").unwrap();
        assert_eq!(
            daily.next_after(at(2024, 1, 1, 10, 0), &Location::Utc),
            Some(at(2024, 1, 2, 0, 0))
        );
        let hourly = CronSchedule::parse("@hourly").unwrap();
        assert_eq!(
            hourly.next_after(at(2024, 1, 1, 10, 30), &Location::Utc),
            Some(at(2024, 1, 1, 11, 0))
        );
    }

    #[test]
    fn every_is_truncated_to_whole_seconds() {
        assert!(matches!(
            CronSchedule::parse("@every 1h30m").unwrap(),
            CronSchedule::Every(d) if d == Duration::from_secs(5400)
        ));
        assert!(matches!(
            CronSchedule::parse("@every 2.5s").unwrap(),
            CronSchedule::Every(d) if d == Duration::from_secs(2)
        ));
        assert!(matches!(
            CronSchedule::parse("@every 500ms").unwrap(),
            CronSchedule::Every(d) if d == Duration::from_secs(1)
        ));
    }

    #[test]
    fn invalid_specs_fail_at_parse() {
        assert!(matches!(CronSchedule::parse("  "), Err(TaskError::EmptyCronSpec)));
        assert!(matches!(
            CronSchedule::parse("@every soon"),
            Err(TaskError::InvalidCronSpec { .. })
        ));
        assert!(matches!(
            CronSchedule::parse("every minute please"),
            Err(TaskError::InvalidCronSpec { .. })
        ));
    }

    #[test]
    fn go_durations() {
        assert_eq!(parse_go_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_go_duration("1.5h"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_go_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_go_duration("10"), None);
        assert_eq!(parse_go_duration("3d"), None);
    }

    #[test]
    fn locations_fall_back_to_utc() {
        assert_eq!(Location::parse(""), Location::Utc);
        assert_eq!(Location::parse("UTC"), Location::Utc);
        assert_eq!(Location::parse("Local"), Location::Local);
        assert_eq!(
            Location::parse("America/New_York"),
            Location::Tz(chrono_tz::America::New_York)
        );
        assert_eq!(Location::parse("Mars/Olympus_Mons"), Location::Utc);
    }

    #[test]
    fn cron_is_evaluated_in_location() {
        let schedule = CronSchedule::parse("0 9 * * *").unwrap();
        let ny = Location::parse("America/New_York");
        // 09:00 EST is 14:00 UTC
        assert_eq!(
            schedule.next_after(at(2024, 1, 15, 12, 0), &ny),
            Some(at(2024, 1, 15, 14, 0))
        );
    }

    #[test]
    fn registration_validates_inputs() {
        let mut server = SchedulerServer::new(Arc::new(MemoryBroker::default()), SchedulerConfig::default());
        assert!(matches!(
            server.schedule_task("", "ping", []),
            Err(TaskError::EmptyCronSpec)
        ));
        assert!(matches!(
            server.schedule_task("@every 1s", " ", []),
            Err(TaskError::EmptyTaskName)
        ));
        assert!(matches!(
            server.schedule_task("61 * * * *", "ping", []),
            Err(TaskError::InvalidCronSpec { .. })
        ));

        let id = server.schedule_task("@every 1s", "ping", []).unwrap();
        assert!(Uuid::parse_str(&id).is_ok());

        let handler = scheduled_handler_fn("@hourly", "cleanup", |_ctx| async { Ok(()) });
        assert_ok!(server.register(&handler));
        assert_eq!(server.entries().len(), 2);
        assert_eq!(server.entries()[1].entry.task_name, "cleanup");
    }

    #[test]
    fn config_builders() {
        let config = SchedulerConfig::default()
            .with_location("Europe/Berlin")
            .with_location("nowhere")
            .with_log_level(LogLevel::Debug);
        assert_eq!(config.location, Location::Utc);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.drain_timeout, Duration::from_secs(5));
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn logger_receives_scheduler_events() {
        let captured = Captured::default();
        let subscriber = {
            let captured = captured.clone();
            tracing_subscriber::fmt()
                .with_ansi(false)
                .with_max_level(Level::DEBUG)
                .with_writer(move || captured.clone())
                .finish()
        };
        let config = SchedulerConfig::default()
            .with_log_level(LogLevel::Debug)
            .with_logger(subscriber);

        let mut server = SchedulerServer::new(Arc::new(MemoryBroker::default()), config);
        server.schedule_task("@every 1s", "ping", []).unwrap();
        let server = Arc::new(server);
        let runner = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };
        tokio::time::sleep(Duration::from_millis(1300)).await;
        server.shutdown().await;
        assert_ok!(runner.await.unwrap());

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Starting scheduler server"), "{}", output);
        assert!(output.contains("Enqueued scheduled task"), "{}", output);
    }

    #[tokio::test]
    async fn ticks_enqueue_and_call_hooks() {
        let broker = Arc::new(MemoryBroker::default());
        let pre = Arc::new(AtomicUsize::new(0));
        let post_ok = Arc::new(AtomicUsize::new(0));

        let config = {
            let pre = pre.clone();
            let post_ok = post_ok.clone();
            SchedulerConfig::default()
                .with_pre_enqueue(move |_msg| {
                    pre.fetch_add(1, Ordering::SeqCst);
                    panic!("hook failures must not stop the scheduler");
                })
                .with_post_enqueue(move |_name, result| {
                    if result.is_ok() {
                        post_ok.fetch_add(1, Ordering::SeqCst);
                    }
                })
        };

        let mut server = SchedulerServer::new(broker.clone(), config);
        server.schedule_task("@every 1s", "ping", []).unwrap();
        let server = Arc::new(server);

        let runner = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };
        tokio::time::sleep(Duration::from_millis(2300)).await;
        server.shutdown().await;
        assert_ok!(runner.await.unwrap());

        assert_eq!(pre.load(Ordering::SeqCst), 2);
        assert_eq!(post_ok.load(Ordering::SeqCst), 2);
        assert_eq!(broker.stats("default").await.pending_tasks, 2);
    }
}
