//! Client interface for submitting tasks to the broker

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::broker::Broker;
use crate::error::{TaskError, TaskResult};
use crate::options::{OptionSet, TaskOption, DEFAULT_QUEUE};
use crate::queue::RedisBroker;
use crate::task::{TaskInfo, TaskMessage};

/// Defaults applied to every enqueue call unless overridden per call
#[derive(Debug, Clone)]
pub struct EnqueuerConfig {
    /// Queue tasks go to
    pub queue_name: String,
    /// Deadline offset; also used as the uniqueness TTL
    pub task_deadline: Duration,
    /// Retry limit
    pub max_retry: u32,
}

impl Default for EnqueuerConfig {
    fn default() -> Self {
        Self {
            queue_name: DEFAULT_QUEUE.to_string(),
            task_deadline: Duration::from_secs(60),
            max_retry: 3,
        }
    }
}

impl EnqueuerConfig {
    pub fn with_queue_name<S: Into<String>>(mut self, name: S) -> Self {
        self.queue_name = name.into();
        self
    }

    pub fn with_task_deadline(mut self, deadline: Duration) -> Self {
        self.task_deadline = deadline;
        self
    }

    pub fn with_max_retry(mut self, n: i64) -> Self {
        self.max_retry = n.clamp(0, i64::from(u32::MAX)) as u32;
        self
    }
}

/// Submits tasks to a broker with merged default and per-call options
#[derive(Debug)]
pub struct Enqueuer {
    broker: Arc<dyn Broker>,
    config: EnqueuerConfig,
    owns_broker: bool,
    closed: AtomicBool,
}

impl Enqueuer {
    /// Create an enqueuer on a broker shared with other components
    pub fn new(broker: Arc<dyn Broker>, config: EnqueuerConfig) -> Self {
        Self {
            broker,
            config,
            owns_broker: false,
            closed: AtomicBool::new(false),
        }
    }

    /// Connect to Redis and own the resulting broker
    pub async fn connect(redis_url: &str, config: EnqueuerConfig) -> TaskResult<Self> {
        let broker = RedisBroker::from_url(redis_url).await?;
        Ok(Self {
            broker: Arc::new(broker),
            config,
            owns_broker: true,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EnqueuerConfig {
        &self.config
    }

    /// Get access to the underlying broker
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    fn default_options(&self) -> [TaskOption; 4] {
        let deadline = chrono::Duration::from_std(self.config.task_deadline)
            .unwrap_or_else(|_| chrono::Duration::minutes(1));
        [
            TaskOption::Queue(self.config.queue_name.clone()),
            TaskOption::deadline(chrono::Utc::now() + deadline),
            TaskOption::MaxRetry(self.config.max_retry),
            TaskOption::Unique(self.config.task_deadline),
        ]
    }

    /// Serialize `payload` as JSON and enqueue it under `task_name`
    pub async fn enqueue_task<P, I>(&self, task_name: &str, payload: &P, options: I) -> TaskResult<TaskInfo>
    where
        P: Serialize + ?Sized,
        I: IntoIterator<Item = TaskOption>,
    {
        let payload = serde_json::to_vec(payload).map_err(TaskError::PayloadEncode)?;
        self.enqueue_raw(task_name, payload, options).await
    }

    /// Enqueue an already encoded payload
    pub async fn enqueue_raw<I>(&self, task_name: &str, payload: Vec<u8>, options: I) -> TaskResult<TaskInfo>
    where
        I: IntoIterator<Item = TaskOption>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(TaskError::Closed);
        }

        let options = OptionSet::from_options(self.default_options().into_iter().chain(options));
        let msg = TaskMessage::new(task_name, payload, options)?;

        let info = self
            .broker
            .enqueue(msg)
            .await
            .map_err(|e| TaskError::enqueue_failed(task_name, e))?;

        debug!(task_id = %info.id, task = %task_name, queue = %info.queue, "enqueued task");
        Ok(info)
    }

    /// Stop accepting tasks and release an owned broker connection
    pub async fn close(&self) -> TaskResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.owns_broker {
            self.broker.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use crate::task::TaskState;
    use serde::Serialize;
    use std::collections::HashMap;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Serialize)]
    struct Email<'a> {
        to: &'a str,
    }

    fn setup() -> (Arc<MemoryBroker>, Enqueuer) {
        let broker = Arc::new(MemoryBroker::default());
        let enqueuer = Enqueuer::new(broker.clone(), EnqueuerConfig::default());
        (broker, enqueuer)
    }

    #[tokio::test]
    async fn applies_configured_defaults() {
        let (broker, enqueuer) = setup();
        let info = enqueuer
            .enqueue_task("email:send", &Email { to: "a@b.c" }, [])
            .await
            .unwrap();

        let msg = broker.task(&info.id).await.unwrap();
        assert_eq!(msg.queue, "default");
        assert_eq!(msg.max_retry, 3);
        assert_eq!(msg.unique_ttl, Some(Duration::from_secs(60)));
        assert_eq!(msg.payload, br#"{"to":"a@b.c"}"#.to_vec());
        let deadline = msg.deadline.unwrap();
        assert!(deadline > chrono::Utc::now() + chrono::Duration::seconds(50));
    }

    #[tokio::test]
    async fn per_call_options_override_defaults() {
        let (broker, enqueuer) = setup();
        let options: Vec<TaskOption> = TaskOption::queue("critical")
            .into_iter()
            .chain([TaskOption::max_retry(-4), TaskOption::unique(chrono::Duration::seconds(5))])
            .collect();
        let info = enqueuer.enqueue_task("email:send", &1, options).await.unwrap();

        let msg = broker.task(&info.id).await.unwrap();
        assert_eq!(msg.queue, "critical");
        assert_eq!(msg.max_retry, 0);
        assert_eq!(msg.unique_ttl, Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn config_builders_change_defaults() {
        let broker = Arc::new(MemoryBroker::default());
        let enqueuer = Enqueuer::new(
            broker.clone(),
            EnqueuerConfig::default()
                .with_queue_name("low")
                .with_max_retry(10)
                .with_max_retry(1),
        );
        let info = enqueuer.enqueue_task("sync", &(), []).await.unwrap();
        assert_eq!(info.queue, "low");
        assert_eq!(info.max_retry, 1);
        assert_eq!(info.state, TaskState::Pending);
    }

    #[tokio::test]
    async fn unserializable_payload_is_an_encode_error() {
        let (_, enqueuer) = setup();
        let mut bad = HashMap::new();
        bad.insert((1u8, 2u8), 3u8);
        let err = assert_err!(enqueuer.enqueue_task("bad", &bad, []).await);
        assert!(matches!(err, TaskError::PayloadEncode(_)));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn duplicate_within_default_window_is_refused() {
        let (broker, enqueuer) = setup();
        assert_ok!(enqueuer.enqueue_task("report", &42, []).await);
        let err = assert_err!(enqueuer.enqueue_task("report", &42, []).await);
        assert!(matches!(
            err,
            TaskError::EnqueueFailed { ref source, .. } if matches!(**source, TaskError::DuplicateTask { .. })
        ));
        assert_eq!(broker.stats("default").await.pending_tasks, 1);
    }

    #[tokio::test]
    async fn empty_task_name_is_rejected() {
        let (_, enqueuer) = setup();
        let err = assert_err!(enqueuer.enqueue_task("", &1, []).await);
        assert!(matches!(err, TaskError::EmptyTaskName));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_keeps_shared_broker_open() {
        let (broker, enqueuer) = setup();
        assert_ok!(enqueuer.close().await);
        assert_ok!(enqueuer.close().await);
        let err = assert_err!(enqueuer.enqueue_task("late", &1, []).await);
        assert!(matches!(err, TaskError::Closed));

        let other = Enqueuer::new(broker, EnqueuerConfig::default());
        assert_ok!(other.enqueue_task("late", &1, []).await);
    }
}
