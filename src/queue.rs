//! Broker implementation with Redis backend

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::broker::{Broker, QueueStats};
use crate::error::{TaskError, TaskResult};
use crate::task::{RetryPolicy, TaskId, TaskInfo, TaskMessage, TaskState};

/// Configuration for the Redis broker
#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    /// Redis connection URL
    pub redis_url: String,
    /// Prefix for every key the broker writes
    pub key_prefix: String,
    /// Backoff between attempts of failing tasks
    pub retry_policy: RetryPolicy,
    /// How long dead tasks are kept
    pub dead_retention: Duration,
    /// How long a delivered task may stay unacknowledged before another
    /// worker may take it over; tasks with a longer timeout get a longer lease
    pub active_lease: Duration,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "taskq".to_string(),
            retry_policy: RetryPolicy::default(),
            dead_retention: Duration::from_secs(604800), // 7 days
            active_lease: Duration::from_secs(1800) + LEASE_SLACK,
        }
    }
}

impl RedisBrokerConfig {
    pub fn with_url<S: Into<String>>(mut self, url: S) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_key_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_dead_retention(mut self, retention: Duration) -> Self {
        self.dead_retention = retention;
        self
    }

    pub fn with_active_lease(mut self, lease: Duration) -> Self {
        self.active_lease = lease;
        self
    }
}

/// Extra lease time on top of a task's own timeout
const LEASE_SLACK: Duration = Duration::from_secs(60);

/// Pops the next live id into the active list, marks it active and leases it.
///
/// KEYS: pending, active, lease. ARGV: task key prefix, lease deadline (ms).
const DEQUEUE_SCRIPT: &str = r#"
while true do
  local id = redis.call('RPOPLPUSH', KEYS[1], KEYS[2])
  if not id then
    return nil
  end
  local key = ARGV[1] .. id
  local data = redis.call('HGET', key, 'data')
  if data then
    redis.call('HSET', key, 'state', 'active')
    redis.call('ZADD', KEYS[3], ARGV[2], id)
    return {id, data}
  end
  redis.call('LREM', KEYS[2], 0, id)
end
"#;

/// Hands tasks whose lease ran out back to the consuming end of the pending list.
///
/// KEYS: lease, active, pending. ARGV: task key prefix, now (ms).
const RECOVER_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[2])
local recovered = 0
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[1], id)
  if redis.call('LREM', KEYS[2], 0, id) > 0 then
    redis.call('HSET', ARGV[1] .. id, 'state', 'pending')
    redis.call('RPUSH', KEYS[3], id)
    recovered = recovered + 1
  end
end
return recovered
"#;

/// Value of the record's `state` field, which wins over the serialized one
fn state_name(state: TaskState) -> &'static str {
    match state {
        TaskState::Pending => "pending",
        TaskState::Scheduled => "scheduled",
        TaskState::Active => "active",
        TaskState::Retry => "retry",
        TaskState::Dead => "dead",
    }
}

fn parse_state(name: &str) -> Option<TaskState> {
    match name {
        "pending" => Some(TaskState::Pending),
        "scheduled" => Some(TaskState::Scheduled),
        "active" => Some(TaskState::Active),
        "retry" => Some(TaskState::Retry),
        "dead" => Some(TaskState::Dead),
        _ => None,
    }
}

/// Lease for a delivered task: at least `floor`, longer when its timeout needs it
fn lease_for(msg: &TaskMessage, floor: Duration) -> Duration {
    msg.timeout.map_or(floor, |timeout| floor.max(timeout + LEASE_SLACK))
}

/// Key layout under the configured prefix
#[derive(Debug, Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn task(&self, id: &str) -> String {
        format!("{}{}", self.task_prefix(), id)
    }

    fn task_prefix(&self) -> String {
        format!("{}:task:", self.prefix)
    }

    fn unique(&self, fingerprint: &str) -> String {
        format!("{}:unique:{}", self.prefix, fingerprint)
    }

    fn queues(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    fn pending(&self, queue: &str) -> String {
        format!("{}:{}:pending", self.prefix, queue)
    }

    fn active(&self, queue: &str) -> String {
        format!("{}:{}:active", self.prefix, queue)
    }

    fn lease(&self, queue: &str) -> String {
        format!("{}:{}:lease", self.prefix, queue)
    }

    fn scheduled(&self, queue: &str) -> String {
        format!("{}:{}:scheduled", self.prefix, queue)
    }

    fn retry(&self, queue: &str) -> String {
        format!("{}:{}:retry", self.prefix, queue)
    }

    fn dead(&self, queue: &str) -> String {
        format!("{}:{}:dead", self.prefix, queue)
    }

    fn processed(&self, queue: &str) -> String {
        format!("{}:{}:processed", self.prefix, queue)
    }

    /// Sorted set holding a task in the given waiting state
    fn waiting(&self, queue: &str, state: TaskState) -> Option<String> {
        match state {
            TaskState::Scheduled => Some(self.scheduled(queue)),
            TaskState::Retry => Some(self.retry(queue)),
            TaskState::Dead => Some(self.dead(queue)),
            TaskState::Pending | TaskState::Active => None,
        }
    }
}

fn score(msg: &TaskMessage) -> i64 {
    msg.process_at.unwrap_or_else(Utc::now).timestamp_millis()
}

/// Distributed broker backed by Redis lists, sorted sets and hashes
pub struct RedisBroker {
    client: Client,
    conn: MultiplexedConnection,
    config: RedisBrokerConfig,
    keys: Keys,
    dequeue_script: Script,
    recover_script: Script,
    closed: AtomicBool,
}

impl fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBroker")
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl RedisBroker {
    /// Connect to Redis with the given configuration
    pub async fn new(config: RedisBrokerConfig) -> TaskResult<Self> {
        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| TaskError::config(format!("invalid redis url: {}", e)))?;

        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TaskError::queue_operation("connect", e.to_string()))?;

        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| TaskError::queue_operation("ping", e.to_string()))?;

        info!("Connected to Redis at {}", config.redis_url);

        Ok(Self {
            client,
            conn,
            keys: Keys {
                prefix: config.key_prefix.clone(),
            },
            config,
            dequeue_script: Script::new(DEQUEUE_SCRIPT),
            recover_script: Script::new(RECOVER_SCRIPT),
            closed: AtomicBool::new(false),
        })
    }

    /// Connect using a connection string and default settings
    pub async fn from_url(url: &str) -> TaskResult<Self> {
        Self::new(RedisBrokerConfig::default().with_url(url)).await
    }

    /// Underlying client, for callers that need their own connections
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    async fn load(&self, conn: &mut MultiplexedConnection, id: &str) -> TaskResult<Option<TaskMessage>> {
        let (data, state): (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(self.keys.task(id))
            .arg("data")
            .arg("state")
            .query_async(conn)
            .await
            .map_err(|e| TaskError::queue_operation("get_task", e.to_string()))?;

        let Some(json) = data else {
            return Ok(None);
        };
        let mut msg: TaskMessage = serde_json::from_str(&json)?;
        if let Some(state) = state.as_deref().and_then(parse_state) {
            msg.state = state;
        }
        Ok(Some(msg))
    }

    /// Get task by ID
    pub async fn task(&self, id: &str) -> TaskResult<Option<TaskMessage>> {
        let mut conn = self.connection();
        self.load(&mut conn, id).await
    }

    /// Move due scheduled and retry tasks into the pending list
    async fn forward_ready(&self, conn: &mut MultiplexedConnection, queue: &str) -> TaskResult<u64> {
        let now = Utc::now().timestamp_millis();
        let mut forwarded = 0;

        for set in [self.keys.scheduled(queue), self.keys.retry(queue)] {
            let due: Vec<TaskId> = redis::cmd("ZRANGEBYSCORE")
                .arg(&set)
                .arg("-inf")
                .arg(now)
                .query_async(conn)
                .await
                .map_err(|e| TaskError::queue_operation("get_scheduled", e.to_string()))?;

            for id in due {
                let removed: u64 = redis::cmd("ZREM")
                    .arg(&set)
                    .arg(&id)
                    .query_async(conn)
                    .await
                    .map_err(|e| TaskError::queue_operation("move_scheduled", e.to_string()))?;
                // another worker won the race for this id
                if removed == 0 {
                    continue;
                }

                let Some(mut msg) = self.load(conn, &id).await? else {
                    continue;
                };
                msg.state = TaskState::Pending;
                let json = serde_json::to_string(&msg)?;

                redis::pipe()
                    .atomic()
                    .hset(self.keys.task(&id), "data", &json)
                    .ignore()
                    .hset(self.keys.task(&id), "state", state_name(TaskState::Pending))
                    .ignore()
                    .lpush(self.keys.pending(queue), &id)
                    .ignore()
                    .query_async::<_, ()>(conn)
                    .await
                    .map_err(|e| TaskError::queue_operation("move_scheduled", e.to_string()))?;

                forwarded += 1;
                debug!(task_id = %id, queue = %queue, "moved scheduled task to pending");
            }
        }

        Ok(forwarded)
    }

    /// Return tasks whose worker stopped renewing their lease to pending
    async fn recover_expired(&self, conn: &mut MultiplexedConnection, queue: &str) -> TaskResult<u64> {
        let recovered: u64 = self
            .recover_script
            .key(self.keys.lease(queue))
            .key(self.keys.active(queue))
            .key(self.keys.pending(queue))
            .arg(self.keys.task_prefix())
            .arg(Utc::now().timestamp_millis())
            .invoke_async(conn)
            .await
            .map_err(|e| TaskError::queue_operation("recover", e.to_string()))?;

        if recovered > 0 {
            warn!(queue = %queue, "Recovered {} tasks with expired leases", recovered);
        }
        Ok(recovered)
    }

    /// Drop dead tasks older than the retention window
    async fn trim_dead(&self, conn: &mut MultiplexedConnection, queue: &str) -> TaskResult<u64> {
        let retention = chrono::Duration::from_std(self.config.dead_retention)
            .unwrap_or_else(|_| chrono::Duration::days(7));
        let cutoff = (Utc::now() - retention).timestamp_millis();

        let removed: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(self.keys.dead(queue))
            .arg("-inf")
            .arg(cutoff)
            .query_async(conn)
            .await
            .map_err(|e| TaskError::queue_operation("cleanup", e.to_string()))?;

        if removed > 0 {
            warn!(queue = %queue, "Cleaned up {} expired dead tasks", removed);
        }
        Ok(removed)
    }

    /// Get queue statistics
    pub async fn stats(&self, queue: &str) -> TaskResult<QueueStats> {
        let mut conn = self.connection();
        let (pending_tasks, active_tasks, scheduled_tasks, retry_tasks, dead_tasks): (
            u64,
            u64,
            u64,
            u64,
            u64,
        ) = redis::pipe()
            .llen(self.keys.pending(queue))
            .llen(self.keys.active(queue))
            .zcard(self.keys.scheduled(queue))
            .zcard(self.keys.retry(queue))
            .zcard(self.keys.dead(queue))
            .query_async(&mut conn)
            .await
            .map_err(|e| TaskError::queue_operation("get_stats", e.to_string()))?;

        Ok(QueueStats {
            pending_tasks,
            active_tasks,
            scheduled_tasks,
            retry_tasks,
            dead_tasks,
        })
    }

    /// List all queues that ever received a task
    pub async fn list_queues(&self) -> TaskResult<Vec<String>> {
        let mut conn = self.connection();
        let mut queues: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.queues())
            .query_async(&mut conn)
            .await
            .map_err(|e| TaskError::queue_operation("list_queues", e.to_string()))?;
        queues.sort();
        Ok(queues)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, mut msg: TaskMessage) -> TaskResult<TaskInfo> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TaskError::Closed);
        }
        let mut conn = self.connection();

        let existing = self.load(&mut conn, &msg.id).await?;
        if matches!(&existing, Some(prev) if prev.state == TaskState::Active) {
            return Err(TaskError::TaskIdConflict { task_id: msg.id });
        }

        let lock_key = msg.unique_key.as_deref().map(|k| self.keys.unique(k));
        if let (Some(key), Some(ttl)) = (&lock_key, msg.unique_ttl) {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(&msg.id)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await
                .map_err(|e| TaskError::queue_operation("unique_lock", e.to_string()))?;
            if acquired.is_none() {
                return Err(TaskError::DuplicateTask { task_name: msg.name });
            }
        }

        msg.state = if msg.is_ready() {
            TaskState::Pending
        } else {
            TaskState::Scheduled
        };
        let task_json = serde_json::to_string(&msg)?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(prev) = &existing {
            match self.keys.waiting(&prev.queue, prev.state) {
                Some(set) => pipe.zrem(set, &msg.id).ignore(),
                None => pipe.lrem(self.keys.pending(&prev.queue), 0, &msg.id).ignore(),
            };
        }
        pipe.hset(self.keys.task(&msg.id), "data", &task_json)
            .ignore()
            .hset(self.keys.task(&msg.id), "state", state_name(msg.state))
            .ignore()
            .persist(self.keys.task(&msg.id))
            .ignore()
            .sadd(self.keys.queues(), &msg.queue)
            .ignore();
        match msg.state {
            TaskState::Pending => pipe.lpush(self.keys.pending(&msg.queue), &msg.id).ignore(),
            _ => pipe
                .zadd(self.keys.scheduled(&msg.queue), &msg.id, score(&msg))
                .ignore(),
        };

        if let Err(e) = pipe.query_async::<_, ()>(&mut conn).await {
            if let Some(key) = &lock_key {
                let _: Result<(), _> = redis::cmd("DEL").arg(key).query_async(&mut conn).await;
            }
            return Err(TaskError::queue_operation("submit", e.to_string()));
        }

        debug!(task_id = %msg.id, queue = %msg.queue, "Submitted task");
        Ok(TaskInfo::from(&msg))
    }

    async fn dequeue(&self, queues: &[String]) -> TaskResult<Option<TaskMessage>> {
        let mut conn = self.connection();

        for queue in queues {
            self.recover_expired(&mut conn, queue).await?;
            self.forward_ready(&mut conn, queue).await?;

            let lease_until = Utc::now().timestamp_millis() + self.config.active_lease.as_millis() as i64;
            let popped: Option<(TaskId, String)> = self
                .dequeue_script
                .key(self.keys.pending(queue))
                .key(self.keys.active(queue))
                .key(self.keys.lease(queue))
                .arg(self.keys.task_prefix())
                .arg(lease_until)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| TaskError::queue_operation("get_next", e.to_string()))?;
            let Some((id, json)) = popped else {
                continue;
            };

            let mut msg: TaskMessage = serde_json::from_str(&json)?;
            msg.state = TaskState::Active;

            let lease = lease_for(&msg, self.config.active_lease);
            if lease > self.config.active_lease {
                let lease_until = Utc::now().timestamp_millis() + lease.as_millis() as i64;
                redis::cmd("ZADD")
                    .arg(self.keys.lease(queue))
                    .arg(lease_until)
                    .arg(&id)
                    .query_async::<_, ()>(&mut conn)
                    .await
                    .map_err(|e| TaskError::queue_operation("extend_lease", e.to_string()))?;
            }

            debug!(task_id = %id, queue = %queue, "Retrieved task");
            return Ok(Some(msg));
        }

        Ok(None)
    }

    async fn ack(&self, msg: &TaskMessage) -> TaskResult<()> {
        let mut conn = self.connection();
        redis::pipe()
            .atomic()
            .lrem(self.keys.active(&msg.queue), 0, &msg.id)
            .ignore()
            .zrem(self.keys.lease(&msg.queue), &msg.id)
            .ignore()
            .del(self.keys.task(&msg.id))
            .ignore()
            .incr(self.keys.processed(&msg.queue), 1)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| TaskError::queue_operation("mark_completed", e.to_string()))?;

        debug!(task_id = %msg.id, "Marked task as completed");
        Ok(())
    }

    async fn fail(&self, msg: &TaskMessage, error: &TaskError) -> TaskResult<TaskState> {
        let mut conn = self.connection();
        let mut task = msg.clone();
        let state = task.record_failure(&self.config.retry_policy, error);
        let task_json = serde_json::to_string(&task)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(self.keys.active(&task.queue), 0, &task.id)
            .ignore()
            .zrem(self.keys.lease(&task.queue), &task.id)
            .ignore()
            .hset(self.keys.task(&task.id), "data", &task_json)
            .ignore()
            .hset(self.keys.task(&task.id), "state", state_name(state))
            .ignore();
        match state {
            TaskState::Retry => pipe
                .zadd(self.keys.retry(&task.queue), &task.id, score(&task))
                .ignore(),
            _ => pipe
                .zadd(
                    self.keys.dead(&task.queue),
                    &task.id,
                    Utc::now().timestamp_millis(),
                )
                .ignore()
                .cmd("EXPIRE")
                .arg(self.keys.task(&task.id))
                .arg(self.config.dead_retention.as_secs())
                .ignore(),
        };
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| TaskError::queue_operation("mark_failed", e.to_string()))?;

        if state == TaskState::Dead {
            self.trim_dead(&mut conn, &task.queue).await?;
        }

        debug!(task_id = %task.id, state = ?state, "Marked task as failed");
        Ok(state)
    }

    async fn requeue(&self, msg: &TaskMessage) -> TaskResult<()> {
        let mut conn = self.connection();
        let mut task = msg.clone();
        task.state = TaskState::Pending;
        let task_json = serde_json::to_string(&task)?;

        // RPUSH puts the task on the consuming end of the list
        redis::pipe()
            .atomic()
            .lrem(self.keys.active(&task.queue), 0, &task.id)
            .ignore()
            .zrem(self.keys.lease(&task.queue), &task.id)
            .ignore()
            .hset(self.keys.task(&task.id), "data", &task_json)
            .ignore()
            .hset(self.keys.task(&task.id), "state", state_name(TaskState::Pending))
            .ignore()
            .rpush(self.keys.pending(&task.queue), &task.id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| TaskError::queue_operation("requeue", e.to_string()))?;

        debug!(task_id = %task.id, "Requeued task");
        Ok(())
    }

    async fn close(&self) -> TaskResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Closed Redis broker at {}", self.config.redis_url);
        }
        Ok(())
    }
}
