//! Task records exchanged with the broker and the context handed to handlers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{TaskError, TaskResult};
use crate::options::OptionSet;

/// Unique identifier for tasks
pub type TaskId = String;

/// Lifecycle state of a task inside a broker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting in its queue to be delivered
    Pending,
    /// Waiting for its `process_at` time
    Scheduled,
    /// Delivered to a worker and not yet acknowledged
    Active,
    /// Failed and waiting for its next attempt
    Retry,
    /// Out of retries or failed with a non-recoverable error
    Dead,
}

/// Backoff applied by brokers between attempts of a failing task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay before the first retry
    pub retry_delay: Duration,
    /// Whether to use exponential backoff
    pub exponential_backoff: bool,
    /// Upper bound for a single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(5),
            exponential_backoff: true,
            max_delay: Duration::from_secs(300), // 5 minutes
        }
    }
}

impl RetryPolicy {
    /// Retry immediately; useful for tests and in-process brokers
    pub fn immediate() -> Self {
        Self {
            retry_delay: Duration::ZERO,
            exponential_backoff: false,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before the given retry attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = if self.exponential_backoff {
            let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
            self.retry_delay.saturating_mul(factor)
        } else {
            self.retry_delay
        };
        delay.min(self.max_delay)
    }
}

/// Stable fingerprint of a task for uniqueness locks
pub fn fingerprint(queue: &str, name: &str, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(queue.as_bytes());
    hasher.update([0u8]);
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(payload);
    format!("{:x}", hasher.finalize())
}

/// A task as stored and delivered by a broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskMessage {
    /// Unique task identifier
    pub id: TaskId,
    /// Dispatch key
    pub name: String,
    /// Serialized payload
    pub payload: Vec<u8>,
    /// Queue name
    pub queue: String,
    /// Current state
    pub state: TaskState,
    /// Retry limit
    pub max_retry: u32,
    /// Attempts already retried
    pub retried: u32,
    /// Per-attempt execution limit
    pub timeout: Option<Duration>,
    /// Absolute cut-off time
    pub deadline: Option<DateTime<Utc>>,
    /// Uniqueness lock key, when a TTL was requested
    pub unique_key: Option<String>,
    /// Uniqueness TTL
    pub unique_ttl: Option<Duration>,
    /// Aggregation group
    pub group: Option<String>,
    /// Earliest delivery time
    pub process_at: Option<DateTime<Utc>>,
    /// When the task was enqueued
    pub enqueued_at: DateTime<Utc>,
    /// Message of the last failure
    pub last_error: Option<String>,
    /// When the last failure happened
    pub last_failed_at: Option<DateTime<Utc>>,
}

impl TaskMessage {
    /// Build a task message from its name, encoded payload and resolved options
    pub fn new(name: &str, payload: Vec<u8>, options: OptionSet) -> TaskResult<Self> {
        if name.trim().is_empty() {
            return Err(TaskError::EmptyTaskName);
        }

        let now = Utc::now();
        let unique_key = options
            .unique_ttl
            .map(|_| fingerprint(&options.queue, name, &payload));
        let state = match options.process_at {
            Some(at) if at > now => TaskState::Scheduled,
            _ => TaskState::Pending,
        };

        Ok(Self {
            id: options
                .task_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: name.to_string(),
            payload,
            queue: options.queue,
            state,
            max_retry: options.max_retry,
            retried: 0,
            timeout: options.timeout,
            deadline: options.deadline,
            unique_key,
            unique_ttl: options.unique_ttl,
            group: options.group,
            process_at: options.process_at,
            enqueued_at: now,
            last_error: None,
            last_failed_at: None,
        })
    }

    /// Check if task is ready to be delivered
    pub fn is_ready(&self) -> bool {
        match self.process_at {
            Some(process_at) => Utc::now() >= process_at,
            None => true,
        }
    }

    /// Record a failed attempt and decide what happens next.
    ///
    /// Recoverable errors with retries left move the task to `Retry` with a
    /// backoff; anything else moves it to `Dead`.
    pub fn record_failure(&mut self, policy: &RetryPolicy, error: &TaskError) -> TaskState {
        let now = Utc::now();
        self.last_error = Some(error.to_string());
        self.last_failed_at = Some(now);

        if error.is_recoverable() && self.retried < self.max_retry {
            self.retried += 1;
            let delay = chrono::Duration::from_std(policy.delay_for(self.retried))
                .unwrap_or_else(|_| chrono::Duration::zero());
            self.process_at = Some(now + delay);
            self.state = TaskState::Retry;
        } else {
            self.state = TaskState::Dead;
        }
        self.state
    }
}

/// Receipt returned by a successful enqueue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: String,
    pub queue: String,
    pub state: TaskState,
    pub max_retry: u32,
    pub process_at: Option<DateTime<Utc>>,
}

impl From<&TaskMessage> for TaskInfo {
    fn from(msg: &TaskMessage) -> Self {
        Self {
            id: msg.id.clone(),
            name: msg.name.clone(),
            queue: msg.queue.clone(),
            state: msg.state,
            max_retry: msg.max_retry,
            process_at: msg.process_at,
        }
    }
}

/// Per-invocation context passed to handlers
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub task_name: String,
    pub queue: String,
    /// Attempts already retried before this one
    pub retry_count: u32,
    pub max_retry: u32,
    pub deadline: Option<DateTime<Utc>>,
    /// Fires when the worker gives up waiting for this invocation
    pub cancellation: CancellationToken,
}

impl TaskContext {
    /// Context for a delivered message
    pub fn for_message(msg: &TaskMessage, cancellation: CancellationToken) -> Self {
        Self {
            task_id: msg.id.clone(),
            task_name: msg.name.clone(),
            queue: msg.queue.clone(),
            retry_count: msg.retried,
            max_retry: msg.max_retry,
            deadline: msg.deadline,
            cancellation,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the invocation is cancelled
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}
