//! Per-task processing options and how they compose

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest timeout, TTL or delay an option may carry
pub const MIN_DURATION: Duration = Duration::from_secs(1);

/// Queue used when no queue option is given
pub const DEFAULT_QUEUE: &str = "default";

/// Retry limit for tasks enqueued without any max-retry option
pub const DEFAULT_MAX_RETRY: u32 = 25;

/// A single processing option attached to an enqueue call.
///
/// Prefer the lowercase constructors: they clamp invalid input to a safe
/// value instead of failing. Variants built directly are normalized the same
/// way when an [`OptionSet`] is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOption {
    /// Queue the task is placed in
    Queue(String),
    /// How many times a failing task is retried before it is dead-lettered
    MaxRetry(u32),
    /// Per-attempt execution limit
    Timeout(Duration),
    /// Absolute time after which the task must not run
    Deadline(DateTime<Utc>),
    /// Window during which identical (queue, name, payload) enqueues are refused
    Unique(Duration),
    /// Explicit task identifier
    TaskId(String),
    /// Aggregation group
    Group(String),
    /// Earliest processing time
    ProcessAt(DateTime<Utc>),
    /// Processing delay relative to the enqueue call
    ProcessIn(Duration),
}

impl TaskOption {
    /// Target queue. An empty name contributes nothing.
    pub fn queue<S: Into<String>>(name: S) -> Option<Self> {
        non_empty(name.into()).map(Self::Queue)
    }

    /// Retry limit; negative values clamp to zero.
    pub fn max_retry(n: i64) -> Self {
        Self::MaxRetry(n.clamp(0, i64::from(u32::MAX)) as u32)
    }

    /// Execution timeout; zero or negative clamps to [`MIN_DURATION`].
    pub fn timeout(d: chrono::Duration) -> Self {
        Self::Timeout(positive_or_min(d))
    }

    /// Deadline; a time already in the past becomes one second from now.
    pub fn deadline(t: DateTime<Utc>) -> Self {
        Self::Deadline(future_or_soon(t))
    }

    /// Uniqueness TTL; zero or negative clamps to [`MIN_DURATION`].
    pub fn unique(ttl: chrono::Duration) -> Self {
        Self::Unique(positive_or_min(ttl))
    }

    /// Explicit task ID. An empty ID contributes nothing.
    pub fn task_id<S: Into<String>>(id: S) -> Option<Self> {
        non_empty(id.into()).map(Self::TaskId)
    }

    /// Aggregation group. An empty group contributes nothing.
    pub fn group<S: Into<String>>(group: S) -> Option<Self> {
        non_empty(group.into()).map(Self::Group)
    }

    /// Process at a given time; a time in the past becomes one second from now.
    pub fn process_at(t: DateTime<Utc>) -> Self {
        Self::ProcessAt(future_or_soon(t))
    }

    /// Process after a delay; zero or negative clamps to [`MIN_DURATION`].
    pub fn process_in(d: chrono::Duration) -> Self {
        Self::ProcessIn(positive_or_min(d))
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

fn positive_or_min(d: chrono::Duration) -> Duration {
    d.to_std()
        .ok()
        .filter(|d| !d.is_zero())
        .unwrap_or(MIN_DURATION)
}

fn nonzero_or_min(d: Duration) -> Duration {
    if d.is_zero() {
        MIN_DURATION
    } else {
        d
    }
}

fn future_or_soon(t: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if t <= now {
        now + chrono::Duration::seconds(1)
    } else {
        t
    }
}

/// Effective options of one task after defaults and overrides are applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionSet {
    pub queue: String,
    pub max_retry: u32,
    pub timeout: Option<Duration>,
    pub deadline: Option<DateTime<Utc>>,
    pub unique_ttl: Option<Duration>,
    pub task_id: Option<String>,
    pub group: Option<String>,
    pub process_at: Option<DateTime<Utc>>,
}

impl Default for OptionSet {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            max_retry: DEFAULT_MAX_RETRY,
            timeout: None,
            deadline: None,
            unique_ttl: None,
            task_id: None,
            group: None,
            process_at: None,
        }
    }
}

impl OptionSet {
    /// Fold options in order over the built-in defaults; later options win.
    pub fn from_options<I>(options: I) -> Self
    where
        I: IntoIterator<Item = TaskOption>,
    {
        let mut set = Self::default();
        for option in options {
            set.apply(option);
        }
        set
    }

    /// Apply a single option, replacing whatever the same kind set before.
    pub fn apply(&mut self, option: TaskOption) {
        match option {
            TaskOption::Queue(name) => {
                if let Some(name) = non_empty(name) {
                    self.queue = name;
                }
            }
            TaskOption::MaxRetry(n) => self.max_retry = n,
            TaskOption::Timeout(d) => self.timeout = Some(nonzero_or_min(d)),
            TaskOption::Deadline(t) => self.deadline = Some(t),
            TaskOption::Unique(ttl) => self.unique_ttl = Some(nonzero_or_min(ttl)),
            TaskOption::TaskId(id) => {
                if let Some(id) = non_empty(id) {
                    self.task_id = Some(id);
                }
            }
            TaskOption::Group(group) => {
                if let Some(group) = non_empty(group) {
                    self.group = Some(group);
                }
            }
            TaskOption::ProcessAt(t) => self.process_at = Some(t),
            TaskOption::ProcessIn(d) => {
                let delay = chrono::Duration::from_std(nonzero_or_min(d))
                    .unwrap_or_else(|_| chrono::Duration::seconds(1));
                self.process_at = Some(Utc::now() + delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_retry_behaves_like_zero() {
        assert_eq!(TaskOption::max_retry(-1), TaskOption::max_retry(0));
        assert_eq!(TaskOption::max_retry(-1), TaskOption::MaxRetry(0));
        assert_eq!(TaskOption::max_retry(7), TaskOption::MaxRetry(7));
    }

    #[test]
    fn non_positive_durations_clamp_to_minimum() {
        let zero = TaskOption::timeout(chrono::Duration::zero());
        let negative = TaskOption::timeout(chrono::Duration::seconds(-5));
        assert_eq!(zero, TaskOption::Timeout(MIN_DURATION));
        assert_eq!(negative, TaskOption::Timeout(MIN_DURATION));

        assert_eq!(
            TaskOption::unique(chrono::Duration::milliseconds(-1)),
            TaskOption::Unique(MIN_DURATION)
        );
        assert_eq!(
            TaskOption::process_in(chrono::Duration::zero()),
            TaskOption::ProcessIn(MIN_DURATION)
        );
    }

    #[test]
    fn past_deadline_moves_into_the_future() {
        let before = Utc::now();
        let TaskOption::Deadline(t) = TaskOption::deadline(before - chrono::Duration::hours(1))
        else {
            panic!("expected deadline option");
        };
        assert!(t > before);
        assert!(t <= Utc::now() + chrono::Duration::seconds(2));
    }

    #[test]
    fn empty_identifiers_contribute_nothing() {
        assert!(TaskOption::task_id("").is_none());
        assert!(TaskOption::group("  ").is_none());
        assert!(TaskOption::queue("").is_none());
        assert_eq!(
            TaskOption::task_id("fixed-1"),
            Some(TaskOption::TaskId("fixed-1".into()))
        );
    }

    #[test]
    fn later_options_override_earlier_ones() {
        let set = OptionSet::from_options([
            TaskOption::Queue("default".into()),
            TaskOption::max_retry(3),
            TaskOption::Queue("critical".into()),
            TaskOption::max_retry(1),
        ]);
        assert_eq!(set.queue, "critical");
        assert_eq!(set.max_retry, 1);
    }

    #[test]
    fn defaults_apply_when_nothing_overrides() {
        let set = OptionSet::from_options(TaskOption::group(""));
        assert_eq!(set, OptionSet::default());
        assert_eq!(set.max_retry, DEFAULT_MAX_RETRY);
        assert_eq!(set.queue, DEFAULT_QUEUE);
    }

    #[test]
    fn raw_zero_variants_are_normalized() {
        let set = OptionSet::from_options([
            TaskOption::Timeout(Duration::ZERO),
            TaskOption::Unique(Duration::ZERO),
        ]);
        assert_eq!(set.timeout, Some(MIN_DURATION));
        assert_eq!(set.unique_ttl, Some(MIN_DURATION));
    }

    #[test]
    fn process_in_and_process_at_last_one_wins() {
        let at = Utc::now() + chrono::Duration::hours(2);
        let set = OptionSet::from_options([
            TaskOption::process_in(chrono::Duration::seconds(30)),
            TaskOption::process_at(at),
        ]);
        assert_eq!(set.process_at, Some(at));

        let set = OptionSet::from_options([
            TaskOption::process_at(at),
            TaskOption::process_in(chrono::Duration::seconds(30)),
        ]);
        assert!(set.process_at.unwrap() < at);
    }
}
