//! Job handlers and the registry that maps job kinds to them.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::debug;
use uuid::Uuid;

use courier_core::{Job, Result};

use crate::enqueue::Enqueuer;

/// Context provided to job handlers.
pub struct JobContext {
    /// The claimed job (post-claim state: `RUNNING`, attempts already counted).
    pub job: Job,
    enqueuer: Option<Enqueuer>,
}

impl JobContext {
    /// Create a new job context.
    pub fn new(job: Job) -> Self {
        Self {
            job,
            enqueuer: None,
        }
    }

    /// Attach an enqueuer so the handler can schedule follow-on work.
    pub fn with_enqueuer(mut self, enqueuer: Enqueuer) -> Self {
        self.enqueuer = Some(enqueuer);
        self
    }

    pub fn job_id(&self) -> Uuid {
        self.job.id
    }

    pub fn kind(&self) -> &str {
        &self.job.kind
    }

    /// Get the job payload.
    pub fn payload(&self) -> &JsonValue {
        &self.job.payload
    }

    /// 1-based number of the current attempt.
    pub fn attempt(&self) -> i32 {
        self.job.attempts
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.job.correlation_id.as_deref()
    }

    /// Deserialize the payload into the handler's own type.
    ///
    /// The queue never validates payloads; this is where a handler does.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.job.payload.clone())?)
    }

    /// Enqueuer for follow-on jobs, when the worker provides one.
    pub fn enqueuer(&self) -> Option<&Enqueuer> {
        self.enqueuer.as_ref()
    }
}

/// Result of job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Job completed successfully.
    Success,
    /// Job failed with an error message. Retried while attempts remain.
    Failed(String),
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Success)
    }
}

impl<E: fmt::Display> From<std::result::Result<(), E>> for JobResult {
    fn from(result: std::result::Result<(), E>) -> Self {
        match result {
            Ok(()) => JobResult::Success,
            Err(e) => JobResult::Failed(format!("{e:#}")),
        }
    }
}

/// Trait for job handlers.
///
/// Delivery is at-least-once: a handler may run again for the same job after
/// a crash or an expired lease, so its side effects must be idempotent.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job kind this handler processes.
    fn kind(&self) -> &str;

    /// Execute the job.
    async fn execute(&self, ctx: JobContext) -> JobResult;

    /// Check if this handler can process the given job kind.
    fn can_handle(&self, kind: &str) -> bool {
        self.kind() == kind
    }
}

/// Handler built from an async closure over the payload.
pub struct FnHandler<F> {
    kind: String,
    func: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    pub fn new(kind: impl Into<String>, func: F) -> Self {
        Self {
            kind: kind.into(),
            func,
        }
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        (self.func)(ctx.job.payload).await.into()
    }
}

/// No-op handler that always succeeds.
pub struct NoOpHandler {
    kind: String,
}

impl NoOpHandler {
    /// Create a new no-op handler for the given job kind.
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into() }
    }
}

#[async_trait]
impl JobHandler for NoOpHandler {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn execute(&self, _ctx: JobContext) -> JobResult {
        JobResult::Success
    }
}

/// Explicit kind → handler map, built at startup and shared read-only.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own kind, replacing any previous one.
    pub fn register<H: JobHandler + 'static>(&mut self, handler: H) -> &mut Self {
        let kind = handler.kind().to_string();
        if self.handlers.insert(kind.clone(), Arc::new(handler)).is_some() {
            debug!(job_kind = %kind, "Replaced job handler");
        } else {
            debug!(job_kind = %kind, "Registered job handler");
        }
        self
    }

    /// Register an async closure as the handler for `kind`.
    pub fn register_fn<F, Fut>(&mut self, kind: impl Into<String>, func: F) -> &mut Self
    where
        F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(FnHandler::new(kind, func))
    }

    /// Builder-style [`HandlerRegistry::register`].
    pub fn with_handler<H: JobHandler + 'static>(mut self, handler: H) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
