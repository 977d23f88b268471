//! Task client example
//!
//! Enqueues tasks for the `simple_worker` example with different options.
//!
//! To run this example:
//! 1. Make sure Redis is running on localhost:6379
//! 2. Run: cargo run --example task_client

use chrono::{Duration, Utc};
use serde::Serialize;
use taskq::{init_tracing, Enqueuer, EnqueuerConfig, LogLevel, TaskOption};
use tracing::{info, warn};

#[derive(Debug, Serialize)]
struct AddTask {
    a: i32,
    b: i32,
}

#[derive(Debug, Serialize)]
struct MessageTask {
    message: String,
    uppercase: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(LogLevel::Info);

    let enqueuer = Enqueuer::connect(
        "redis://127.0.0.1:6379",
        EnqueuerConfig::default().with_queue_name("math").with_max_retry(5),
    )
    .await?;

    for i in 0..5 {
        let info = enqueuer
            .enqueue_task("math:add", &AddTask { a: i, b: i * 10 }, [])
            .await?;
        info!("Submitted add task {} to {}", info.id, info.queue);
    }

    // same payload inside the uniqueness window is refused
    if let Err(e) = enqueuer.enqueue_task("math:add", &AddTask { a: 0, b: 0 }, []).await {
        warn!("Duplicate refused: {}", e);
    }

    let message = MessageTask {
        message: "Hello, World".to_string(),
        uppercase: true,
    };
    let options = TaskOption::queue("messages")
        .into_iter()
        .chain([
            TaskOption::process_in(Duration::seconds(10)),
            TaskOption::timeout(Duration::seconds(30)),
            TaskOption::deadline(Utc::now() + Duration::minutes(5)),
        ]);
    let info = enqueuer.enqueue_task("message:case", &message, options).await?;
    info!("Scheduled message task {} for {:?}", info.id, info.process_at);

    // a fixed id replaces the pending task instead of adding another
    for uppercase in [false, true] {
        let message = MessageTask {
            message: "Replace Me".to_string(),
            uppercase,
        };
        let options = TaskOption::queue("messages")
            .into_iter()
            .chain(TaskOption::task_id("greeting-of-the-day"));
        enqueuer.enqueue_task("message:case", &message, options).await?;
    }

    enqueuer.close().await?;
    Ok(())
}
