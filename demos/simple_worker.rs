//! Simple worker example
//!
//! This example demonstrates how to:
//! 1. Implement a handler by hand and with `handler_fn`
//! 2. Serve two weighted queues
//! 3. Shut down gracefully on Ctrl-C
//!
//! To run this example:
//! 1. Make sure Redis is running on localhost:6379
//! 2. Run: cargo run --example simple_worker
//! 3. Enqueue work with: cargo run --example task_client

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use taskq::{
    decode_payload, handler_fn, init_tracing, LogLevel, QueueServer, QueueServerConfig, RedisBroker,
    TaskContext, TaskError, TaskHandler, TaskResult,
};
use tracing::info;

/// Adds two numbers
#[derive(Debug, Serialize, Deserialize)]
struct AddTask {
    a: i32,
    b: i32,
}

/// Changes the case of a message
#[derive(Debug, Serialize, Deserialize)]
struct MessageTask {
    message: String,
    uppercase: bool,
}

/// Handler written against the trait directly
struct AddTaskHandler;

#[async_trait]
impl TaskHandler for AddTaskHandler {
    fn task_name(&self) -> &str {
        "math:add"
    }

    async fn handle(&self, ctx: TaskContext, payload: &[u8]) -> TaskResult<()> {
        let task: AddTask = decode_payload(self.task_name(), payload)?;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let sum = task.a.checked_add(task.b).ok_or_else(|| TaskError::skip_retry("sum overflows i32"))?;
        info!(task_id = %ctx.task_id, "Adding {} + {} = {}", task.a, task.b, sum);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(LogLevel::Info);

    info!("Starting simple worker example");

    let broker = Arc::new(RedisBroker::from_url("redis://127.0.0.1:6379").await?);

    let config = QueueServerConfig::default()
        .with_concurrency(2)
        .with_queues([("math", 3), ("messages", 1)])
        .with_shutdown_timeout(Duration::from_secs(5));
    let server = Arc::new(QueueServer::new(broker, config));

    let message_handler = handler_fn("message:case", |ctx, task: MessageTask| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let result = if task.uppercase {
            task.message.to_uppercase()
        } else {
            task.message.to_lowercase()
        };
        info!(task_id = %ctx.task_id, "Processed message: '{}' -> '{}'", task.message, result);
        Ok(())
    });

    let handlers: Vec<Arc<dyn TaskHandler>> = vec![Arc::new(AddTaskHandler), Arc::new(message_handler)];

    let runner = {
        let server = server.clone();
        tokio::spawn(async move { server.run(handlers).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down");
    server.shutdown().await;
    runner.await??;

    Ok(())
}
