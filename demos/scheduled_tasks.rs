//! Scheduled tasks example
//!
//! Runs a scheduler server and a queue server side by side: the scheduler
//! only enqueues, the queue server executes.
//!
//! To run this example:
//! 1. Make sure Redis is running on localhost:6379
//! 2. Run: cargo run --example scheduled_tasks

use std::sync::Arc;
use taskq::{
    init_tracing, run_queue_server, run_scheduler_server, scheduled_handler_fn, task_scheduler,
    Broker, LogLevel, QueueServerConfig, RedisBroker, ScheduledTaskHandler, SchedulerConfig,
    TaskHandler, TaskOption,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(LogLevel::Info);

    let broker: Arc<dyn Broker> = Arc::new(RedisBroker::from_url("redis://127.0.0.1:6379").await?);

    let heartbeat = Arc::new(scheduled_handler_fn("@every 10s", "heartbeat", |ctx| async move {
        info!(task_id = %ctx.task_id, "Heartbeat");
        Ok(())
    }));
    let cleanup = Arc::new(
        scheduled_handler_fn("*/5 * * * *", "cleanup:sessions", |_ctx| async move {
            info!("Cleaning up expired sessions");
            Ok(())
        })
        .with_options([TaskOption::max_retry(1)]),
    );

    let entries = vec![
        heartbeat.schedule_entry(),
        cleanup.schedule_entry(),
        // enqueued here, handled by another deployment
        task_scheduler("0 3 * * *", "report:nightly", TaskOption::queue("reports")),
    ];
    let handlers: Vec<Arc<dyn TaskHandler>> = vec![heartbeat, cleanup];

    let scheduler_config = SchedulerConfig::default()
        .with_location("Europe/Berlin")
        .with_log_level(LogLevel::Info)
        .with_post_enqueue(|task_name, result| {
            if let Ok(info) = result {
                info!("Enqueued {} as {}", task_name, info.id);
            }
        });

    let cancel = CancellationToken::new();
    let scheduler = tokio::spawn(run_scheduler_server(
        broker.clone(),
        scheduler_config,
        cancel.clone(),
        entries,
    ));
    let server = tokio::spawn(run_queue_server(
        broker,
        QueueServerConfig::default().with_concurrency(2),
        cancel.clone(),
        handlers,
    ));

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down");
    cancel.cancel();
    scheduler.await??;
    server.await??;

    Ok(())
}
