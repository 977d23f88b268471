//! In-process broker with uniqueness locks, delayed delivery and retries

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use crate::broker::{Broker, QueueStats};
use crate::error::{TaskError, TaskResult};
use crate::task::{RetryPolicy, TaskId, TaskInfo, TaskMessage, TaskState};

/// Configuration for the in-memory broker
#[derive(Debug, Clone)]
pub struct MemoryBrokerConfig {
    pub retry_policy: RetryPolicy,
    /// How long dead tasks are kept
    pub dead_retention: Duration,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            dead_retention: Duration::from_secs(604800), // 7 days
        }
    }
}

impl MemoryBrokerConfig {
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_dead_retention(mut self, retention: Duration) -> Self {
        self.dead_retention = retention;
        self
    }
}

#[derive(Debug, Default)]
struct State {
    tasks: HashMap<TaskId, TaskMessage>,
    pending: HashMap<String, VecDeque<TaskId>>,
    unique_locks: HashMap<String, Instant>,
    processed: u64,
    closed: bool,
}

impl State {
    fn promote_ready(&mut self) {
        let mut ready: Vec<(Option<chrono::DateTime<chrono::Utc>>, TaskId)> = self
            .tasks
            .values()
            .filter(|t| matches!(t.state, TaskState::Scheduled | TaskState::Retry) && t.is_ready())
            .map(|t| (t.process_at, t.id.clone()))
            .collect();
        ready.sort();

        for (_, id) in ready {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.state = TaskState::Pending;
                self.pending
                    .entry(task.queue.clone())
                    .or_default()
                    .push_back(id);
            }
        }
    }

    /// Drop expired uniqueness locks and dead tasks past their retention
    fn purge(&mut self, dead_retention: Duration) {
        let now = Instant::now();
        self.unique_locks.retain(|_, expires| *expires > now);

        let retention = chrono::Duration::from_std(dead_retention).unwrap_or_else(|_| chrono::Duration::days(7));
        let cutoff = Utc::now() - retention;
        let before = self.tasks.len();
        self.tasks.retain(|_, task| {
            task.state != TaskState::Dead || matches!(task.last_failed_at, Some(at) if at > cutoff)
        });
        let removed = before - self.tasks.len();
        if removed > 0 {
            debug!("Cleaned up {} expired dead tasks", removed);
        }
    }

    fn remove_pending(&mut self, queue: &str, id: &str) {
        if let Some(ids) = self.pending.get_mut(queue) {
            ids.retain(|pending| pending != id);
        }
    }
}

/// Broker keeping every task in process memory.
///
/// Nothing survives a restart; use it for tests and single-process setups.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    config: MemoryBrokerConfig,
    state: Mutex<State>,
}

impl MemoryBroker {
    pub fn new(config: MemoryBrokerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
        }
    }

    /// Look up a task that has not been acknowledged yet
    pub async fn task(&self, id: &str) -> Option<TaskMessage> {
        self.state.lock().await.tasks.get(id).cloned()
    }

    /// Tasks that ran out of retries or failed without retry
    pub async fn dead_tasks(&self) -> Vec<TaskMessage> {
        let state = self.state.lock().await;
        let mut dead: Vec<TaskMessage> = state
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Dead)
            .cloned()
            .collect();
        dead.sort_by_key(|t| t.last_failed_at);
        dead
    }

    /// Number of acknowledged tasks
    pub async fn processed(&self) -> u64 {
        self.state.lock().await.processed
    }

    /// Get queue statistics
    pub async fn stats(&self, queue: &str) -> QueueStats {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for task in state.tasks.values().filter(|t| t.queue == queue) {
            match task.state {
                TaskState::Pending => stats.pending_tasks += 1,
                TaskState::Active => stats.active_tasks += 1,
                TaskState::Scheduled => stats.scheduled_tasks += 1,
                TaskState::Retry => stats.retry_tasks += 1,
                TaskState::Dead => stats.dead_tasks += 1,
            }
        }
        stats
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, mut msg: TaskMessage) -> TaskResult<TaskInfo> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(TaskError::Closed);
        }
        state.purge(self.config.dead_retention);

        let replaced = match state.tasks.get(&msg.id) {
            Some(existing) if existing.state == TaskState::Active => {
                return Err(TaskError::TaskIdConflict {
                    task_id: msg.id.clone(),
                });
            }
            Some(existing) => Some((existing.queue.clone(), existing.state)),
            None => None,
        };

        if let (Some(key), Some(ttl)) = (&msg.unique_key, msg.unique_ttl) {
            let now = Instant::now();
            if matches!(state.unique_locks.get(key), Some(expires) if *expires > now) {
                return Err(TaskError::DuplicateTask {
                    task_name: msg.name.clone(),
                });
            }
            state.unique_locks.insert(key.clone(), now + ttl);
        }

        if let Some((queue, TaskState::Pending)) = &replaced {
            state.remove_pending(queue, &msg.id);
        }
        if replaced.is_some() {
            debug!(task_id = %msg.id, "replacing task with the same id");
        }

        msg.state = if msg.is_ready() {
            TaskState::Pending
        } else {
            TaskState::Scheduled
        };
        if msg.state == TaskState::Pending {
            state
                .pending
                .entry(msg.queue.clone())
                .or_default()
                .push_back(msg.id.clone());
        }

        let info = TaskInfo::from(&msg);
        state.tasks.insert(msg.id.clone(), msg);
        Ok(info)
    }

    async fn dequeue(&self, queues: &[String]) -> TaskResult<Option<TaskMessage>> {
        let mut state = self.state.lock().await;
        state.purge(self.config.dead_retention);
        state.promote_ready();

        for queue in queues {
            let next = state.pending.get_mut(queue).and_then(VecDeque::pop_front);
            if let Some(id) = next {
                if let Some(task) = state.tasks.get_mut(&id) {
                    task.state = TaskState::Active;
                    return Ok(Some(task.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn ack(&self, msg: &TaskMessage) -> TaskResult<()> {
        let mut state = self.state.lock().await;
        let active = matches!(state.tasks.get(&msg.id), Some(task) if task.state == TaskState::Active);
        if !active {
            return Err(TaskError::TaskNotFound {
                task_id: msg.id.clone(),
            });
        }
        state.tasks.remove(&msg.id);
        state.processed += 1;
        Ok(())
    }

    async fn fail(&self, msg: &TaskMessage, error: &TaskError) -> TaskResult<TaskState> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&msg.id)
            .filter(|t| t.state == TaskState::Active)
            .ok_or_else(|| TaskError::TaskNotFound {
                task_id: msg.id.clone(),
            })?;
        Ok(task.record_failure(&self.config.retry_policy, error))
    }

    async fn requeue(&self, msg: &TaskMessage) -> TaskResult<()> {
        let mut state = self.state.lock().await;
        let queue = match state.tasks.get_mut(&msg.id) {
            Some(task) if task.state == TaskState::Active => {
                task.state = TaskState::Pending;
                task.queue.clone()
            }
            _ => {
                return Err(TaskError::TaskNotFound {
                    task_id: msg.id.clone(),
                })
            }
        };
        state
            .pending
            .entry(queue)
            .or_default()
            .push_front(msg.id.clone());
        Ok(())
    }

    async fn close(&self) -> TaskResult<()> {
        self.state.lock().await.closed = true;
        Ok(())
    }
}
