//! Boundary to the durable queue store

use async_trait::async_trait;

use crate::error::{TaskError, TaskResult};
use crate::task::{TaskInfo, TaskMessage, TaskState};

/// Operations the dispatch layer needs from a queue broker.
///
/// Brokers own persistence, uniqueness locks, task-id replacement and retry
/// scheduling. Implementations must be safe for concurrent use.
#[async_trait]
pub trait Broker: Send + Sync + std::fmt::Debug {
    /// Store a task for later delivery.
    ///
    /// Fails with [`TaskError::DuplicateTask`] while a uniqueness lock for the
    /// same fingerprint is held, and with [`TaskError::TaskIdConflict`] when a
    /// task with the same explicit ID is active. A pending or scheduled task
    /// with the same ID is replaced.
    async fn enqueue(&self, msg: TaskMessage) -> TaskResult<TaskInfo>;

    /// Take the next ready task, trying `queues` in the given order
    async fn dequeue(&self, queues: &[String]) -> TaskResult<Option<TaskMessage>>;

    /// Acknowledge successful processing
    async fn ack(&self, msg: &TaskMessage) -> TaskResult<()>;

    /// Report a failed attempt; returns where the task went
    async fn fail(&self, msg: &TaskMessage, error: &TaskError) -> TaskResult<TaskState>;

    /// Hand an undelivered in-flight task back without consuming a retry
    async fn requeue(&self, msg: &TaskMessage) -> TaskResult<()>;

    /// Release resources; further enqueues fail with [`TaskError::Closed`]
    async fn close(&self) -> TaskResult<()>;
}

/// Task counts for one queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending_tasks: u64,
    pub active_tasks: u64,
    pub scheduled_tasks: u64,
    pub retry_tasks: u64,
    pub dead_tasks: u64,
}
