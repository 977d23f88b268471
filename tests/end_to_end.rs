use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskq::{
    handler_fn, run_queue_server, run_scheduler_server, scheduled_handler_fn, task_scheduler,
    Enqueuer, EnqueuerConfig, MemoryBroker, QueueServer, QueueServerConfig, ScheduledTaskHandler,
    SchedulerConfig, TaskError, TaskHandler, TaskOption, TaskResult, TaskState,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

fn fast_config() -> QueueServerConfig {
    QueueServerConfig::default()
        .with_concurrency(4)
        .with_poll_interval(Duration::from_millis(20))
}

fn spawn_server(server: &Arc<QueueServer>, handlers: Vec<Arc<dyn TaskHandler>>) -> JoinHandle<TaskResult<()>> {
    let server = server.clone();
    tokio::spawn(async move { server.run(handlers).await })
}

fn counting_handler(name: &str, counter: &Arc<AtomicUsize>) -> Arc<dyn TaskHandler> {
    let counter = counter.clone();
    Arc::new(handler_fn(name, move |_ctx, _payload: serde_json::Value| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Invoice {
    id: u64,
    customer: String,
    lines: Vec<(String, u32)>,
    discount: Option<f64>,
    tags: BTreeMap<String, String>,
}

#[tokio::test]
async fn payload_reaches_handler_unchanged() {
    let broker = Arc::new(MemoryBroker::default());
    let enqueuer = Enqueuer::new(broker.clone(), EnqueuerConfig::default());

    let sent = Invoice {
        id: 7,
        customer: "Zoë".to_string(),
        lines: vec![("widget".to_string(), 3), ("gadget".to_string(), 1)],
        discount: Some(0.15),
        tags: BTreeMap::from([("region".to_string(), "eu".to_string())]),
    };
    assert_ok!(enqueuer.enqueue_task("invoice:send", &sent, []).await);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler: Arc<dyn TaskHandler> = Arc::new(handler_fn("invoice:send", move |_ctx, invoice: Invoice| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(invoice);
            Ok(())
        }
    }));

    let server = Arc::new(QueueServer::new(broker.clone(), fast_config()));
    let runner = spawn_server(&server, vec![handler]);

    let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, sent);

    server.shutdown().await;
    assert_ok!(runner.await.unwrap());
    assert_eq!(broker.processed().await, 1);
}

#[tokio::test]
async fn unique_tasks_are_delivered_once_per_window() {
    let broker = Arc::new(MemoryBroker::default());
    let enqueuer = Enqueuer::new(broker.clone(), EnqueuerConfig::default());
    let unique = || [TaskOption::unique(chrono::Duration::seconds(1))];

    let first_enqueue = Instant::now();
    assert_ok!(enqueuer.enqueue_task("report", &"daily", unique()).await);
    let err = assert_err!(enqueuer.enqueue_task("report", &"daily", unique()).await);
    assert!(matches!(err, TaskError::EnqueueFailed { .. }));

    let counter = Arc::new(AtomicUsize::new(0));
    let server = Arc::new(QueueServer::new(broker.clone(), fast_config()));
    let runner = spawn_server(&server, vec![counting_handler("report", &counter)]);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    // the lock outlives the task until its TTL runs out
    let err = assert_err!(enqueuer.enqueue_task("report", &"daily", unique()).await);
    assert!(matches!(err, TaskError::EnqueueFailed { .. }));

    tokio::time::sleep(Duration::from_millis(1100).saturating_sub(first_enqueue.elapsed())).await;
    assert_ok!(enqueuer.enqueue_task("report", &"daily", unique()).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    server.shutdown().await;
    assert_ok!(runner.await.unwrap());
}

#[tokio::test]
async fn shutdown_waits_for_short_tasks_and_abandons_long_ones() {
    let broker = Arc::new(MemoryBroker::default());
    let enqueuer = Enqueuer::new(broker.clone(), EnqueuerConfig::default());
    let quick_done = Arc::new(AtomicBool::new(false));
    let slow_done = Arc::new(AtomicBool::new(false));

    let quick: Arc<dyn TaskHandler> = {
        let done = quick_done.clone();
        Arc::new(handler_fn("quick", move |_ctx, _p: ()| {
            let done = done.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(250)).await;
                done.store(true, Ordering::SeqCst);
                Ok(())
            }
        }))
    };
    let slow: Arc<dyn TaskHandler> = {
        let done = slow_done.clone();
        Arc::new(handler_fn("slow", move |_ctx, _p: ()| {
            let done = done.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(1000)).await;
                done.store(true, Ordering::SeqCst);
                Ok(())
            }
        }))
    };

    assert_ok!(enqueuer.enqueue_task("quick", &(), []).await);
    let slow_info = enqueuer.enqueue_task("slow", &(), []).await.unwrap();

    let server = Arc::new(QueueServer::new(
        broker.clone(),
        fast_config().with_shutdown_timeout(Duration::from_millis(500)),
    ));
    let runner = spawn_server(&server, vec![quick, slow]);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    server.shutdown().await;
    let elapsed = started.elapsed();
    assert_ok!(runner.await.unwrap());

    assert!(elapsed >= Duration::from_millis(450), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(900), "returned after {:?}", elapsed);
    assert!(quick_done.load(Ordering::SeqCst));
    assert_eq!(broker.processed().await, 1);

    let slow_task = broker.task(&slow_info.id).await.unwrap();
    assert_eq!(slow_task.state, TaskState::Pending);
    assert_eq!(slow_task.retried, 0);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!slow_done.load(Ordering::SeqCst));
}

#[tokio::test]
async fn same_task_id_delivers_last_payload_once() {
    let broker = Arc::new(MemoryBroker::default());
    let enqueuer = Enqueuer::new(broker.clone(), EnqueuerConfig::default());
    let fixed = || TaskOption::task_id("fixed-1");

    assert_ok!(enqueuer.enqueue_task("sync", &1, fixed()).await);
    assert_ok!(enqueuer.enqueue_task("sync", &2, fixed()).await);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler: Arc<dyn TaskHandler> = Arc::new(handler_fn("sync", move |ctx, n: u32| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((ctx.task_id, n));
            Ok(())
        }
    }));
    let server = Arc::new(QueueServer::new(broker.clone(), fast_config()));
    let runner = spawn_server(&server, vec![handler]);

    tokio::time::sleep(Duration::from_millis(300)).await;
    server.shutdown().await;
    assert_ok!(runner.await.unwrap());

    let mut delivered = Vec::new();
    while let Ok(item) = rx.try_recv() {
        delivered.push(item);
    }
    assert_eq!(delivered, vec![("fixed-1".to_string(), 2)]);
}

#[tokio::test]
async fn unknown_task_names_do_not_stop_the_server() {
    let broker = Arc::new(MemoryBroker::default());
    let enqueuer = Enqueuer::new(broker.clone(), EnqueuerConfig::default());
    let counter = Arc::new(AtomicUsize::new(0));

    assert_ok!(enqueuer.enqueue_task("orphan", &(), [TaskOption::max_retry(0)]).await);
    assert_ok!(enqueuer.enqueue_task("known", &(), []).await);

    let server = Arc::new(QueueServer::new(broker.clone(), fast_config()));
    let runner = spawn_server(&server, vec![counting_handler("known", &counter)]);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!runner.is_finished());
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    let dead = broker.dead_tasks().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].name, "orphan");
    assert!(dead[0].last_error.as_deref().unwrap_or_default().contains("No handler"));

    // later tasks are still served
    assert_ok!(enqueuer.enqueue_task("known", &1, []).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    server.shutdown().await;
    assert_ok!(runner.await.unwrap());
}

#[derive(Debug, Deserialize)]
struct Resize {
    #[allow(dead_code)]
    width: u32,
}

#[tokio::test]
async fn non_retryable_failures_go_straight_to_dead_store() {
    let broker = Arc::new(MemoryBroker::default());
    let enqueuer = Enqueuer::new(broker.clone(), EnqueuerConfig::default().with_max_retry(5));
    let calls = Arc::new(AtomicUsize::new(0));

    let resize: Arc<dyn TaskHandler> = {
        let calls = calls.clone();
        Arc::new(handler_fn("image:resize", move |_ctx, _p: Resize| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }))
    };
    let refuse: Arc<dyn TaskHandler> = Arc::new(handler_fn("account:close", |_ctx, _p: ()| async {
        Err(TaskError::skip_retry("account already closed"))
    }));

    assert_ok!(enqueuer.enqueue_raw("image:resize", b"not json".to_vec(), []).await);
    assert_ok!(enqueuer.enqueue_task("account:close", &(), []).await);

    let server = Arc::new(QueueServer::new(broker.clone(), fast_config()));
    let runner = spawn_server(&server, vec![resize, refuse]);
    tokio::time::sleep(Duration::from_millis(300)).await;
    server.shutdown().await;
    assert_ok!(runner.await.unwrap());

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let dead = broker.dead_tasks().await;
    assert_eq!(dead.len(), 2);
    assert!(dead.iter().all(|t| t.retried == 0 && t.max_retry == 5));
}

#[tokio::test]
async fn handlers_past_their_timeout_are_failed() {
    let broker = Arc::new(MemoryBroker::default());
    let enqueuer = Enqueuer::new(broker.clone(), EnqueuerConfig::default());
    let cancelled = Arc::new(AtomicBool::new(false));

    let stuck: Arc<dyn TaskHandler> = Arc::new(handler_fn("stuck", |_ctx, _p: ()| async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(())
    }));
    let polite: Arc<dyn TaskHandler> = {
        let cancelled = cancelled.clone();
        Arc::new(handler_fn("polite", move |ctx, _p: ()| {
            let cancelled = cancelled.clone();
            async move {
                ctx.cancelled().await;
                cancelled.store(true, Ordering::SeqCst);
                Ok(())
            }
        }))
    };

    let opts = || [TaskOption::timeout(chrono::Duration::seconds(1)), TaskOption::max_retry(0)];
    assert_ok!(enqueuer.enqueue_task("stuck", &(), opts()).await);

    let server = Arc::new(QueueServer::new(
        broker.clone(),
        fast_config().with_shutdown_timeout(Duration::from_millis(200)),
    ));
    let runner = spawn_server(&server, vec![stuck, polite]);
    tokio::time::sleep(Duration::from_millis(1400)).await;

    let dead = broker.dead_tasks().await;
    assert_eq!(dead.len(), 1);
    assert!(dead[0].last_error.as_deref().unwrap_or_default().contains("timed out"));

    // a handler waiting on its context sees the drain window expire
    assert_ok!(enqueuer.enqueue_task("polite", &(), []).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.shutdown().await;
    assert_ok!(runner.await.unwrap());
    assert!(cancelled.load(Ordering::SeqCst));
}

#[tokio::test]
async fn strict_priority_drains_heavier_queue_first() {
    let broker = Arc::new(MemoryBroker::default());
    let low = Enqueuer::new(broker.clone(), EnqueuerConfig::default().with_queue_name("low"));
    let critical = Enqueuer::new(broker.clone(), EnqueuerConfig::default().with_queue_name("critical"));

    for i in 0..3 {
        assert_ok!(low.enqueue_task("job", &i, []).await);
    }
    for i in 10..13 {
        assert_ok!(critical.enqueue_task("job", &i, []).await);
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler: Arc<dyn TaskHandler> = Arc::new(handler_fn("job", move |ctx, n: u32| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((ctx.queue, n));
            Ok(())
        }
    }));

    let config = fast_config()
        .with_concurrency(1)
        .with_queues([("critical", 6), ("low", 1)])
        .with_strict_priority(true);
    let server = Arc::new(QueueServer::new(broker.clone(), config));
    let runner = spawn_server(&server, vec![handler]);
    tokio::time::sleep(Duration::from_millis(400)).await;
    server.shutdown().await;
    assert_ok!(runner.await.unwrap());

    let mut order = Vec::new();
    while let Ok((queue, n)) = rx.try_recv() {
        order.push((queue, n));
    }
    let queues: Vec<&str> = order.iter().map(|(q, _)| q.as_str()).collect();
    assert_eq!(queues, ["critical", "critical", "critical", "low", "low", "low"]);
}

#[tokio::test]
async fn blank_schedules_are_rejected() {
    let broker = Arc::new(MemoryBroker::default());
    let result = run_scheduler_server(
        broker.clone(),
        SchedulerConfig::default(),
        CancellationToken::new(),
        [task_scheduler("", "cleanup", [])],
    )
    .await;
    assert!(matches!(result, Err(TaskError::EmptyCronSpec)));

    let result = run_scheduler_server(
        broker,
        SchedulerConfig::default(),
        CancellationToken::new(),
        [task_scheduler("@every 1s", "", [])],
    )
    .await;
    assert!(matches!(result, Err(TaskError::EmptyTaskName)));
}

#[tokio::test]
async fn every_second_schedule_runs_three_or_four_times() {
    let broker = Arc::new(MemoryBroker::default());
    let pings = Arc::new(AtomicUsize::new(0));

    let ping = {
        let pings = pings.clone();
        Arc::new(scheduled_handler_fn("@every 1s", "ping", move |_ctx| {
            let pings = pings.clone();
            async move {
                pings.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }))
    };

    let cancel = CancellationToken::new();
    let scheduler = tokio::spawn(run_scheduler_server(
        broker.clone(),
        SchedulerConfig::default(),
        cancel.clone(),
        [ping.schedule_entry()],
    ));
    let queue_server = tokio::spawn(run_queue_server(
        broker.clone(),
        fast_config(),
        cancel.clone(),
        vec![ping as Arc<dyn TaskHandler>],
    ));

    tokio::time::sleep(Duration::from_millis(3500)).await;
    cancel.cancel();
    assert_ok!(scheduler.await.unwrap());
    assert_ok!(queue_server.await.unwrap());

    let count = pings.load(Ordering::SeqCst);
    assert!((3..=4).contains(&count), "ping ran {} times", count);
}
