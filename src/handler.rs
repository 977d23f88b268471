//! Type-erased task handlers and schedule declarations
//!
//! A queue server keeps every handler behind the same [`TaskHandler`] trait
//! object. The concrete payload type is captured when the handler is built
//! with [`handler_fn`], so decoding happens inside the handler and the
//! dispatcher never needs to know it.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;

use crate::error::{TaskError, TaskResult};
use crate::options::TaskOption;
use crate::task::TaskContext;

/// Handler bound to a single task name
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Routing key; must match the name used when enqueuing
    fn task_name(&self) -> &str;

    /// Decode the payload and run the business logic
    async fn handle(&self, ctx: TaskContext, payload: &[u8]) -> TaskResult<()>;

    /// Default options for tasks this handler declares
    fn options(&self) -> &[TaskOption] {
        &[]
    }
}

/// A handler that also declares when it should be triggered
pub trait ScheduledTaskHandler: TaskHandler {
    /// Cron spec (or `@every <duration>`) for the scheduler server
    fn schedule(&self) -> &str;

    /// Declarative schedule entry for this handler
    fn schedule_entry(&self) -> ScheduleEntry {
        ScheduleEntry {
            cron_spec: self.schedule().to_string(),
            task_name: self.task_name().to_string(),
            options: self.options().to_vec(),
        }
    }
}

/// Binding of a cron spec to a task name and its options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub cron_spec: String,
    pub task_name: String,
    pub options: Vec<TaskOption>,
}

/// Declare a schedule for a task handled elsewhere
pub fn task_scheduler<C, N, I>(cron_spec: C, task_name: N, options: I) -> ScheduleEntry
where
    C: Into<String>,
    N: Into<String>,
    I: IntoIterator<Item = TaskOption>,
{
    ScheduleEntry {
        cron_spec: cron_spec.into(),
        task_name: task_name.into(),
        options: options.into_iter().collect(),
    }
}

/// Decode a JSON payload into `P`.
///
/// An empty payload carries no parameters: it decodes as JSON `null` for
/// unit-like and `Option` types, and as `{}` for structs whose fields all
/// have defaults. Only types that need actual fields report a decode error.
pub fn decode_payload<P: DeserializeOwned>(task_name: &str, payload: &[u8]) -> TaskResult<P> {
    let decoded = if payload.is_empty() {
        serde_json::from_slice(b"null").or_else(|_| serde_json::from_slice(b"{}"))
    } else {
        serde_json::from_slice(payload)
    };
    decoded.map_err(|source| TaskError::PayloadDecode {
        task_name: task_name.to_string(),
        source,
    })
}

/// Handler built from an async function over a typed payload
pub struct HandlerFn<P, F> {
    name: String,
    func: F,
    options: Vec<TaskOption>,
    _payload: PhantomData<fn() -> P>,
}

/// Wrap an async function taking a typed payload into a [`TaskHandler`]
pub fn handler_fn<P, F, Fut, S>(name: S, func: F) -> HandlerFn<P, F>
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(TaskContext, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult<()>> + Send + 'static,
    S: Into<String>,
{
    HandlerFn {
        name: name.into(),
        func,
        options: Vec::new(),
        _payload: PhantomData,
    }
}

impl<P, F> HandlerFn<P, F> {
    /// Attach default options to the handler declaration
    pub fn with_options<I: IntoIterator<Item = TaskOption>>(mut self, options: I) -> Self {
        self.options = options.into_iter().collect();
        self
    }
}

impl<P, F> fmt::Debug for HandlerFn<P, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerFn")
            .field("name", &self.name)
            .field("payload", &std::any::type_name::<P>())
            .field("options", &self.options)
            .finish()
    }
}

#[async_trait]
impl<P, F, Fut> TaskHandler for HandlerFn<P, F>
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(TaskContext, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult<()>> + Send + 'static,
{
    fn task_name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, ctx: TaskContext, payload: &[u8]) -> TaskResult<()> {
        let payload: P = decode_payload(&self.name, payload)?;
        (self.func)(ctx, payload).await
    }

    fn options(&self) -> &[TaskOption] {
        &self.options
    }
}

/// Parameterless handler that is both runnable and periodically triggered
pub struct ScheduledHandlerFn<F> {
    cron_spec: String,
    name: String,
    func: F,
    options: Vec<TaskOption>,
}

/// Wrap an async function into a self-scheduling handler
pub fn scheduled_handler_fn<F, Fut, C, S>(cron_spec: C, name: S, func: F) -> ScheduledHandlerFn<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult<()>> + Send + 'static,
    C: Into<String>,
    S: Into<String>,
{
    ScheduledHandlerFn {
        cron_spec: cron_spec.into(),
        name: name.into(),
        func,
        options: Vec::new(),
    }
}

impl<F> ScheduledHandlerFn<F> {
    /// Options used for every scheduled enqueue
    pub fn with_options<I: IntoIterator<Item = TaskOption>>(mut self, options: I) -> Self {
        self.options = options.into_iter().collect();
        self
    }
}

impl<F> fmt::Debug for ScheduledHandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledHandlerFn")
            .field("cron_spec", &self.cron_spec)
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for ScheduledHandlerFn<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult<()>> + Send + 'static,
{
    fn task_name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, ctx: TaskContext, _payload: &[u8]) -> TaskResult<()> {
        (self.func)(ctx).await
    }

    fn options(&self) -> &[TaskOption] {
        &self.options
    }
}

impl<F, Fut> ScheduledTaskHandler for ScheduledHandlerFn<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult<()>> + Send + 'static,
{
    fn schedule(&self) -> &str {
        &self.cron_spec
    }
}
