//! Job handler trait and registry.
//!
//! The registry doubles as the payload whitelist: only functions registered
//! here can be called from a stored job.

use queue_core::{Job, JobError, JobPayload, ROOT_CHANNEL, Whitelist};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Result type for job handlers: an optional result message.
pub type HandlerResult = Result<Option<String>, JobError>;

/// Future type for async job handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// What a handler gets to work with.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: Job,
    pub payload: JobPayload,
}

/// Trait for job handlers.
///
/// Implement this trait to define how jobs calling a given function are processed.
pub trait JobHandler: Send + Sync + 'static {
    /// The function name jobs refer to.
    fn name(&self) -> &str;

    /// Channel used for jobs created without an explicit one.
    fn default_channel(&self) -> &str {
        ROOT_CHANNEL
    }

    /// Process a job and return the result.
    fn handle(&self, ctx: JobContext) -> HandlerFuture;
}

/// Registry for job handlers.
#[derive(Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler under its function name.
    pub fn register<H: JobHandler>(&mut self, handler: H) {
        let name = handler.name().to_string();
        self.handlers.insert(name, Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Functions a payload is allowed to reference.
    pub fn whitelist(&self) -> Whitelist {
        self.handlers.keys().cloned().collect()
    }

    /// Build a job calling `name`, placed in the handler's default channel.
    ///
    /// Returns `None` for unregistered functions.
    pub fn new_job(&self, name: &str, args: serde_json::Value) -> Option<Job> {
        let handler = self.handlers.get(name)?;
        Some(Job::new(name, args).with_channel(handler.default_channel()))
    }
}

/// A simple function-based job handler.
pub struct FnHandler<F>
where
    F: Fn(JobContext) -> HandlerFuture + Send + Sync + 'static,
{
    name: String,
    channel: String,
    handler: F,
}

impl<F> FnHandler<F>
where
    F: Fn(JobContext) -> HandlerFuture + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            channel: ROOT_CHANNEL.to_string(),
            handler,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }
}

impl<F> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> HandlerFuture + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn default_channel(&self) -> &str {
        &self.channel
    }

    fn handle(&self, ctx: JobContext) -> HandlerFuture {
        (self.handler)(ctx)
    }
}

/// Helper macro for creating job handlers from async closures.
#[macro_export]
macro_rules! job_handler {
    ($name:expr, |$ctx:ident| $body:expr) => {
        $crate::FnHandler::new($name, |$ctx: $crate::JobContext| Box::pin(async move { $body }))
    };
}
