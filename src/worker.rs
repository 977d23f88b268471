//! Queue server: pulls tasks from the broker and dispatches them to handlers

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn, Level, Subscriber};

use crate::broker::Broker;
use crate::error::{TaskError, TaskResult};
use crate::handler::TaskHandler;
use crate::logging::LogLevel;
use crate::options::DEFAULT_QUEUE;
use crate::queue::RedisBroker;
use crate::task::{TaskContext, TaskId, TaskMessage, TaskState};

/// Called with the delivered message and the error whenever a task fails
pub type ErrorHandler = Arc<dyn Fn(&TaskMessage, &TaskError) + Send + Sync>;

/// Queue server configuration
#[derive(Clone)]
pub struct QueueServerConfig {
    /// Maximum number of tasks processed at once
    pub concurrency: usize,
    /// Queue name to relative weight
    pub queues: BTreeMap<String, u32>,
    /// Always poll queues in descending weight order
    pub strict_priority: bool,
    /// How long shutdown waits for in-flight tasks
    pub shutdown_timeout: Duration,
    /// Threshold for the server's per-task log events
    pub log_level: LogLevel,
    /// Pause between polls when every queue is empty
    pub poll_interval: Duration,
    /// Execution limit for tasks without timeout or deadline
    pub default_timeout: Duration,
    /// Per-task failure callback
    pub error_handler: Option<ErrorHandler>,
    /// Subscriber receiving this server's events instead of the global one
    pub logger: Option<tracing::Dispatch>,
}

impl Default for QueueServerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            queues: BTreeMap::from([(DEFAULT_QUEUE.to_string(), 1)]),
            strict_priority: false,
            shutdown_timeout: Duration::from_secs(10),
            log_level: LogLevel::Info,
            poll_interval: Duration::from_secs(1),
            default_timeout: Duration::from_secs(1800), // 30 minutes
            error_handler: None,
            logger: None,
        }
    }
}

impl fmt::Debug for QueueServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueServerConfig")
            .field("concurrency", &self.concurrency)
            .field("queues", &self.queues)
            .field("strict_priority", &self.strict_priority)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("log_level", &self.log_level)
            .field("poll_interval", &self.poll_interval)
            .field("default_timeout", &self.default_timeout)
            .field("error_handler", &self.error_handler.is_some())
            .field("logger", &self.logger.is_some())
            .finish()
    }
}

/// Half of the available CPUs, at least one
fn default_concurrency() -> usize {
    let cpus = num_cpus::get();
    if cpus > 1 {
        cpus / 2
    } else {
        1
    }
}

impl QueueServerConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Replace the queue set with a single queue
    pub fn with_queue<S: Into<String>>(mut self, name: S, weight: u32) -> Self {
        self.queues = BTreeMap::from([(name.into(), weight.max(1))]);
        self
    }

    /// Replace the queue set; an empty map leaves it unchanged
    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let queues: BTreeMap<String, u32> = queues
            .into_iter()
            .map(|(name, weight)| (name.into(), weight.max(1)))
            .collect();
        if !queues.is_empty() {
            self.queues = queues;
        }
        self
    }

    pub fn with_strict_priority(mut self, strict: bool) -> Self {
        self.strict_priority = strict;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Called for every failed attempt, before the broker records it
    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&TaskMessage, &TaskError) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Route the server's events, including those of its handlers, to `subscriber`
    pub fn with_logger<S>(mut self, subscriber: S) -> Self
    where
        S: Subscriber + Send + Sync + 'static,
    {
        self.logger = Some(tracing::Dispatch::new(subscriber));
        self
    }
}

/// Decides which queue is tried first on each poll.
///
/// Weights are relative hints: over a full rotation a queue of weight `w`
/// leads `w` times. The remaining queues follow in descending weight order,
/// so an empty preferred queue never blocks the others.
#[derive(Debug, Clone)]
pub struct QueueSelector {
    by_weight: Vec<String>,
    /// Cumulative weights; slot `i` leads for ticks below `bounds[i]`
    bounds: Vec<u64>,
    strict: bool,
}

impl QueueSelector {
    pub fn new(queues: &BTreeMap<String, u32>, strict: bool) -> Self {
        let mut weighted: Vec<(&String, u32)> = queues.iter().map(|(q, w)| (q, *w)).collect();
        weighted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let mut end = 0u64;
        let bounds = weighted
            .iter()
            .map(|(_, weight)| {
                end += u64::from((*weight).max(1));
                end
            })
            .collect();

        Self {
            by_weight: weighted.into_iter().map(|(q, _)| q.clone()).collect(),
            bounds,
            strict,
        }
    }

    /// Queue polling order for the given tick
    pub fn order(&self, tick: usize) -> Vec<String> {
        let total = match self.bounds.last() {
            Some(&total) if !self.strict => total,
            _ => return self.by_weight.clone(),
        };
        let slot = tick as u64 % total;
        let first = self.bounds.partition_point(|end| *end <= slot);
        let mut order = Vec::with_capacity(self.by_weight.len());
        order.push(self.by_weight[first].clone());
        order.extend(
            self.by_weight
                .iter()
                .enumerate()
                .filter(|(idx, _)| *idx != first)
                .map(|(_, q)| q.clone()),
        );
        order
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    Stopped,
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Time handlers get to react to cancellation before they are aborted
const CANCEL_GRACE: Duration = Duration::from_millis(100);

type ActiveTasks = Arc<Mutex<HashMap<TaskId, TaskMessage>>>;

/// Everything a spawned task execution needs
#[derive(Clone)]
struct Dispatch {
    broker: Arc<dyn Broker>,
    active: ActiveTasks,
    cancellation: CancellationToken,
    default_timeout: Duration,
    log_level: LogLevel,
    error_handler: Option<ErrorHandler>,
}

impl Dispatch {
    async fn process(self, msg: TaskMessage, handler: Option<Arc<dyn TaskHandler>>) {
        let start_time = std::time::Instant::now();
        let outcome = match handler {
            Some(handler) => self.execute(handler, &msg).await,
            None => Err(TaskError::HandlerNotFound {
                task_name: msg.name.clone(),
            }),
        };

        match outcome {
            Ok(()) => {
                if let Err(e) = self.broker.ack(&msg).await {
                    error!(task_id = %msg.id, "Failed to mark task as completed: {}", e);
                }
                if self.log_level.allows(Level::DEBUG) {
                    debug!(task_id = %msg.id, task = %msg.name, "Task completed in {:?}", start_time.elapsed());
                }
            }
            Err(e) => {
                if self.log_level.allows(Level::WARN) {
                    warn!(task_id = %msg.id, task = %msg.name, retried = msg.retried, "Task failed: {}", e);
                }
                if let Some(on_error) = &self.error_handler {
                    if catch_unwind(AssertUnwindSafe(|| on_error(&msg, &e))).is_err() {
                        error!(task_id = %msg.id, "Error handler panicked");
                    }
                }
                match self.broker.fail(&msg, &e).await {
                    Ok(TaskState::Dead) => {
                        if self.log_level.allows(Level::ERROR) {
                            error!(task_id = %msg.id, task = %msg.name, "Task moved to dead store: {}", e);
                        }
                    }
                    Ok(_) => {}
                    Err(report_err) => {
                        error!(task_id = %msg.id, "Failed to mark task as failed: {}", report_err);
                    }
                }
            }
        }

        lock_active(&self.active).remove(&msg.id);
    }

    async fn execute(&self, handler: Arc<dyn TaskHandler>, msg: &TaskMessage) -> TaskResult<()> {
        let now = Utc::now();
        let mut limit = msg.timeout.unwrap_or(self.default_timeout);
        if let Some(deadline) = msg.deadline {
            let remaining = (deadline - now)
                .to_std()
                .map_err(|_| TaskError::DeadlineExceeded {
                    task_id: msg.id.clone(),
                })?;
            if remaining.is_zero() {
                return Err(TaskError::DeadlineExceeded {
                    task_id: msg.id.clone(),
                });
            }
            limit = limit.min(remaining);
        }

        let ctx = TaskContext::for_message(msg, self.cancellation.child_token());
        let payload = msg.payload.clone();
        // run on its own task so a panicking handler only fails this task
        let mut invocation = AbortOnDrop(tokio::spawn(
            async move { handler.handle(ctx, &payload).await }.with_current_subscriber(),
        ));

        match tokio::time::timeout(limit, &mut invocation.0).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => {
                Err(TaskError::task_execution(format!("handler for {} panicked", msg.name)))
            }
            Ok(Err(join_err)) => Err(TaskError::task_execution(join_err.to_string())),
            Err(_) => match msg.deadline {
                Some(deadline) if deadline <= Utc::now() => Err(TaskError::DeadlineExceeded {
                    task_id: msg.id.clone(),
                }),
                _ => Err(TaskError::timeout(format!("task {} after {:?}", msg.id, limit))),
            },
        }
    }
}

fn lock_active(active: &ActiveTasks) -> std::sync::MutexGuard<'_, HashMap<TaskId, TaskMessage>> {
    // a poisoned map still holds valid entries
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Consumes one or more weighted queues with bounded concurrency
pub struct QueueServer {
    broker: Arc<dyn Broker>,
    config: QueueServerConfig,
    intake: CancellationToken,
    state: watch::Sender<RunState>,
}

impl fmt::Debug for QueueServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueServer")
            .field("broker", &self.broker)
            .field("config", &self.config)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl QueueServer {
    /// Create a queue server on the given broker
    pub fn new(broker: Arc<dyn Broker>, config: QueueServerConfig) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            broker,
            config,
            intake: CancellationToken::new(),
            state,
        }
    }

    /// Create a queue server with its own Redis connection
    pub async fn connect(redis_url: &str, config: QueueServerConfig) -> TaskResult<Self> {
        let broker = RedisBroker::from_url(redis_url).await?;
        Ok(Self::new(Arc::new(broker), config))
    }

    pub fn config(&self) -> &QueueServerConfig {
        &self.config
    }

    /// Register handlers and consume until the server is stopped.
    ///
    /// Returns after in-flight tasks have drained (or been abandoned once the
    /// shutdown timeout elapsed). Fails before consuming anything when two
    /// handlers share a name.
    pub async fn run<I>(&self, handlers: I) -> TaskResult<()>
    where
        I: IntoIterator<Item = Arc<dyn TaskHandler>>,
    {
        let router = build_router(handlers)?;

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
                _ => Err(TaskError::config("queue server is already running")),
            };
        }

        match self.config.logger.clone() {
            Some(logger) => self.serve(router).with_subscriber(logger).await,
            None => self.serve(router).await,
        }
        Ok(())
    }

    async fn serve(&self, router: HashMap<String, Arc<dyn TaskHandler>>) {
        info!(
            concurrency = self.config.concurrency,
            queues = ?self.config.queues,
            handlers = router.len(),
            "Starting queue server"
        );

        self.consume(router).await;

        self.state.send_replace(RunState::Stopped);
        info!("Queue server shut down complete");
    }

    async fn consume(&self, router: HashMap<String, Arc<dyn TaskHandler>>) {
        let selector = QueueSelector::new(&self.config.queues, self.config.strict_priority);
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let dispatch = Dispatch {
            broker: self.broker.clone(),
            active: Arc::new(Mutex::new(HashMap::new())),
            cancellation: CancellationToken::new(),
            default_timeout: self.config.default_timeout,
            log_level: self.config.log_level,
            error_handler: self.config.error_handler.clone(),
        };
        let mut in_flight = JoinSet::new();
        let mut tick: usize = 0;

        loop {
            let permit = tokio::select! {
                _ = self.intake.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!("Task execution aborted: {}", e);
                }
            }

            let queues = selector.order(tick);
            tick = tick.wrapping_add(1);

            match self.broker.dequeue(&queues).await {
                Ok(Some(msg)) => {
                    if self.intake.is_cancelled() {
                        if let Err(e) = self.broker.requeue(&msg).await {
                            error!(task_id = %msg.id, "Failed to requeue task: {}", e);
                        }
                        break;
                    }
                    if self.config.log_level.allows(Level::DEBUG) {
                        debug!(task_id = %msg.id, task = %msg.name, queue = %msg.queue, "Got task");
                    }

                    let handler = router.get(&msg.name).cloned();
                    if handler.is_none() && self.config.log_level.allows(Level::ERROR) {
                        error!(task = %msg.name, "No handler found for task type");
                    }
                    lock_active(&dispatch.active).insert(msg.id.clone(), msg.clone());

                    let dispatch = dispatch.clone();
                    in_flight.spawn(
                        async move {
                            dispatch.process(msg, handler).await;
                            drop(permit);
                        }
                        .with_current_subscriber(),
                    );
                }
                Ok(None) => {
                    drop(permit);
                    self.idle().await;
                }
                Err(e) => {
                    drop(permit);
                    error!("Failed to fetch task: {}", e);
                    self.idle().await;
                }
            }
        }

        self.drain(in_flight, dispatch).await;
    }

    async fn idle(&self) {
        tokio::select! {
            _ = self.intake.cancelled() => {}
            _ = tokio::time::sleep(self.config.poll_interval) => {}
        }
    }

    /// Wait for in-flight tasks, then abort and hand back whatever is left
    async fn drain(&self, mut in_flight: JoinSet<()>, dispatch: Dispatch) {
        let pending = in_flight.len();
        if pending > 0 {
            info!("Waiting for {} active tasks to complete", pending);
        }

        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if drained {
            return;
        }

        dispatch.cancellation.cancel();
        let _ = tokio::time::timeout(CANCEL_GRACE, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        in_flight.abort_all();
        while in_flight.join_next().await.is_some() {}

        let abandoned: Vec<TaskMessage> = lock_active(&dispatch.active)
            .drain()
            .map(|(_, msg)| msg)
            .collect();
        for msg in abandoned {
            warn!(task_id = %msg.id, task = %msg.name, "Force stopping task");
            if let Err(e) = self.broker.requeue(&msg).await {
                error!(task_id = %msg.id, "Failed to requeue abandoned task: {}", e);
            }
        }
    }

    /// Stop taking new tasks without waiting for in-flight ones
    pub fn stop(&self) {
        self.intake.cancel();
    }

    /// Stop taking new tasks and wait until `run` has drained.
    ///
    /// In-flight tasks get up to the configured shutdown timeout to finish;
    /// tasks still running after that are cancelled, aborted and requeued.
    pub async fn shutdown(&self) {
        info!("Shutting down queue server");
        self.stop();
        self.state.send_if_modified(|state| {
            if *state == RunState::Idle {
                *state = RunState::Stopped;
                true
            } else {
                false
            }
        });

        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == RunState::Stopped).await;
    }
}

fn build_router<I>(handlers: I) -> TaskResult<HashMap<String, Arc<dyn TaskHandler>>>
where
    I: IntoIterator<Item = Arc<dyn TaskHandler>>,
{
    let mut router = HashMap::new();
    for handler in handlers {
        let name = handler.task_name().to_string();
        if name.trim().is_empty() {
            return Err(TaskError::EmptyTaskName);
        }
        if router.insert(name.clone(), handler).is_some() {
            return Err(TaskError::DuplicateHandler { task_name: name });
        }
    }
    Ok(router)
}

/// Run a queue server until `cancel` fires, then shut it down gracefully
pub async fn run_queue_server<I>(
    broker: Arc<dyn Broker>,
    config: QueueServerConfig,
    cancel: CancellationToken,
    handlers: I,
) -> TaskResult<()>
where
    I: IntoIterator<Item = Arc<dyn TaskHandler>>,
{
    let server = QueueServer::new(broker, config);
    let run = server.run(handlers);
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => result,
        _ = cancel.cancelled() => {
            server.stop();
            run.await
        }
    }
}
