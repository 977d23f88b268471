//! # taskq
//!
//! Typed task dispatch on top of a durable queue broker.
//!
//! ## Features
//!
//! - Named tasks with JSON payloads decoded into the handler's own type
//! - Per-task retry limit, timeout, deadline, uniqueness TTL and delayed delivery
//! - Weighted multi-queue servers with bounded concurrency and graceful shutdown
//! - Cron and `@every` schedules that enqueue tasks periodically
//! - Redis-backed broker, plus an in-memory broker for tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde::{Deserialize, Serialize};
//! use taskq::{handler_fn, Enqueuer, EnqueuerConfig, QueueServer, QueueServerConfig, RedisBroker, TaskHandler};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Welcome {
//!     user_id: u64,
//! }
//!
//! # async fn demo() -> taskq::TaskResult<()> {
//! let broker = Arc::new(RedisBroker::from_url("redis://127.0.0.1:6379").await?);
//!
//! let enqueuer = Enqueuer::new(broker.clone(), EnqueuerConfig::default());
//! enqueuer.enqueue_task("email:welcome", &Welcome { user_id: 42 }, []).await?;
//!
//! let server = QueueServer::new(broker, QueueServerConfig::default().with_concurrency(4));
//! let welcome: Arc<dyn TaskHandler> = Arc::new(handler_fn("email:welcome", |_ctx, task: Welcome| async move {
//!     println!("welcoming user {}", task.user_id);
//!     Ok(())
//! }));
//! server.run(vec![welcome]).await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod client;
pub mod error;
pub mod handler;
pub mod logging;
pub mod memory;
pub mod options;
pub mod queue;
pub mod scheduler;
pub mod task;
pub mod worker;

// Re-export commonly used types
pub use broker::{Broker, QueueStats};
pub use client::{Enqueuer, EnqueuerConfig};
pub use error::{TaskError, TaskResult};
pub use handler::{
    decode_payload, handler_fn, scheduled_handler_fn, task_scheduler, HandlerFn, ScheduleEntry,
    ScheduledHandlerFn, ScheduledTaskHandler, TaskHandler,
};
pub use logging::{init_tracing, LogLevel};
pub use memory::{MemoryBroker, MemoryBrokerConfig};
pub use options::{OptionSet, TaskOption};
pub use queue::{RedisBroker, RedisBrokerConfig};
pub use scheduler::{run_scheduler_server, CronSchedule, Location, SchedulerConfig, SchedulerServer};
pub use task::{RetryPolicy, TaskContext, TaskId, TaskInfo, TaskMessage, TaskState};
pub use worker::{run_queue_server, ErrorHandler, QueueServer, QueueServerConfig};

/// Version of the taskq library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
