//! Error types for task dispatch, brokers and servers

use thiserror::Error;

/// Result type alias for task operations
pub type TaskResult<T> = Result<T, TaskError>;

/// Comprehensive error types for the task dispatch layer
#[derive(Error, Debug)]
pub enum TaskError {
    /// Redis connection or operation errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Broker-side (de)serialization of task records
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The producer's payload could not be serialized
    #[error("Failed to encode payload: {0}")]
    PayloadEncode(#[source] serde_json::Error),

    /// A delivered payload could not be decoded into the handler's type
    #[error("Failed to decode payload for task {task_name}: {source}")]
    PayloadDecode {
        task_name: String,
        #[source]
        source: serde_json::Error,
    },

    /// The broker refused or failed the enqueue call
    #[error("Failed to enqueue task {task_name}: {source}")]
    EnqueueFailed {
        task_name: String,
        #[source]
        source: Box<TaskError>,
    },

    /// A task with the same fingerprint is held by an active uniqueness lock
    #[error("Duplicate task: {task_name} is locked by a uniqueness constraint")]
    DuplicateTask { task_name: String },

    /// Task not found in the broker
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    /// A task with the same explicit ID is currently being processed
    #[error("Task ID conflict: {task_id} is already active")]
    TaskIdConflict { task_id: String },

    /// No handler registered for a delivered task's name
    #[error("No handler registered for task: {task_name}")]
    HandlerNotFound { task_name: String },

    /// Two handlers registered under the same name
    #[error("Handler already registered for task: {task_name}")]
    DuplicateHandler { task_name: String },

    /// Scheduler registration with a blank cron spec
    #[error("Failed to schedule task: cron spec is empty")]
    EmptyCronSpec,

    /// Scheduler registration or enqueue with a blank task name
    #[error("Task name is empty")]
    EmptyTaskName,

    /// Cron spec that does not parse
    #[error("Invalid cron spec {spec:?}: {reason}")]
    InvalidCronSpec { spec: String, reason: String },

    /// Operation on a closed enqueuer or broker
    #[error("Enqueuer is closed")]
    Closed,

    /// Handler asked for the task not to be retried
    #[error("Task failed without retry: {message}")]
    SkipRetry { message: String },

    /// Task was picked up after its deadline
    #[error("Task deadline exceeded: {task_id}")]
    DeadlineExceeded { task_id: String },

    /// Task execution errors
    #[error("Task execution failed: {message}")]
    TaskExecution { message: String },

    /// Queue operation errors
    #[error("Queue operation failed: {operation}: {reason}")]
    QueueOperation { operation: String, reason: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Generic errors for wrapping other error types
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl TaskError {
    /// Create a task execution error
    pub fn task_execution<S: Into<String>>(message: S) -> Self {
        Self::TaskExecution {
            message: message.into(),
        }
    }

    /// Create an error that dead-letters the task without further retries
    pub fn skip_retry<S: Into<String>>(message: S) -> Self {
        Self::SkipRetry {
            message: message.into(),
        }
    }

    /// Create a queue operation error
    pub fn queue_operation<S: Into<String>, R: Into<String>>(operation: S, reason: R) -> Self {
        Self::QueueOperation {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Wrap a broker failure for the task being enqueued
    pub fn enqueue_failed<S: Into<String>>(task_name: S, source: TaskError) -> Self {
        Self::EnqueueFailed {
            task_name: task_name.into(),
            source: Box::new(source),
        }
    }

    /// Check if the error is recoverable (the broker may retry the task)
    pub fn is_recoverable(&self) -> bool {
        match self {
            TaskError::Redis(_) => true,
            TaskError::Timeout { .. } => true,
            TaskError::QueueOperation { .. } => true,
            TaskError::TaskExecution { .. } => true,
            TaskError::HandlerNotFound { .. } => true,
            TaskError::Internal(_) => true,
            TaskError::EnqueueFailed { source, .. } => source.is_recoverable(),
            TaskError::TaskIdConflict { .. } => true,
            TaskError::Serialization(_) => false,
            TaskError::TaskNotFound { .. } => false,
            TaskError::PayloadEncode(_) => false,
            TaskError::PayloadDecode { .. } => false,
            TaskError::DuplicateTask { .. } => false,
            TaskError::DuplicateHandler { .. } => false,
            TaskError::EmptyCronSpec => false,
            TaskError::EmptyTaskName => false,
            TaskError::InvalidCronSpec { .. } => false,
            TaskError::Closed => false,
            TaskError::SkipRetry { .. } => false,
            TaskError::DeadlineExceeded { .. } => false,
            TaskError::Config { .. } => false,
        }
    }
}
