//! Handler traits and the handler registry.
//!
//! A handler is the domain algorithm a resource's workers run. It receives a
//! typed request and the per-worker resources built from a [`WorkerContext`],
//! and returns a typed response. Sync handlers run on the worker's blocking
//! pool one message at a time; async handlers run many messages concurrently
//! up to the context's task limit.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use flowpool_core::{Status, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::worker::{AsyncDispatch, Dispatch, SyncDispatch, WorkerError, WorkerIo};

/// Everything a worker knows about the resource it serves.
///
/// Built explicitly from the resource's settings and sent to the worker in
/// the init frame. Holds only plain values, never live handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerContext {
    pub resource: String,
    pub handler: String,
    pub worker_index: usize,
    pub async_task_limit: usize,
    /// Handler-specific settings, passed through verbatim.
    #[serde(default)]
    pub settings: Value,
}

/// Errors a handler can return for a single request.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The request payload was well-formed JSON but not a valid request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The handler declined the request with a specific status.
    #[error("Request rejected: {0}")]
    Rejected(Status),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl HandlerError {
    /// Status reported back to the caller for this error.
    pub fn status(&self) -> Status {
        match self {
            Self::InvalidRequest(message) => Status::new(StatusCode::InvalidInput, message.clone()),
            Self::Rejected(status) => status.clone(),
            Self::Internal(_) => Status::internal_error("Error while processing task"),
        }
    }
}

/// Synchronous, CPU-bound handler.
pub trait Handler: Send + Sync + 'static {
    type Request: DeserializeOwned + Send + 'static;
    type Response: Serialize + Send + 'static;
    type Resources: Send + Sync + 'static;

    /// Build the per-worker resources. Runs once per worker start.
    fn init_resources(&self, context: &WorkerContext) -> anyhow::Result<Self::Resources>;

    fn handle(
        &self,
        resources: &Self::Resources,
        request: Self::Request,
    ) -> Result<Self::Response, HandlerError>;

    /// Called once when the worker receives STOP.
    fn on_stop(&self, _resources: &Self::Resources) {}
}

/// Asynchronous handler; one worker runs many requests concurrently.
pub trait AsyncHandler: Send + Sync + 'static {
    type Request: DeserializeOwned + Send + 'static;
    type Response: Serialize + Send + 'static;
    type Resources: Send + Sync + 'static;

    fn init_resources(&self, context: &WorkerContext) -> anyhow::Result<Self::Resources>;

    fn handle(
        &self,
        resources: Arc<Self::Resources>,
        request: Self::Request,
    ) -> impl Future<Output = Result<Self::Response, HandlerError>> + Send;

    /// Called once after every in-flight request has finished following STOP.
    fn on_stop(&self, _resources: &Self::Resources) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Maps handler names to dispatch loops.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Dispatch>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the handlers shipped in the `flowpool` binary.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        crate::builtin::register(&mut registry);
        registry
    }

    pub fn register_sync<H: Handler>(&mut self, name: impl Into<String>, handler: H) -> &mut Self {
        self.handlers
            .insert(name.into(), Arc::new(SyncDispatch::new(handler)));
        self
    }

    pub fn register_async<H: AsyncHandler>(
        &mut self,
        name: impl Into<String>,
        handler: H,
    ) -> &mut Self {
        self.handlers
            .insert(name.into(), Arc::new(AsyncDispatch::new(handler)));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run the dispatch loop of `context.handler` until it receives STOP or
    /// the host goes away.
    pub async fn run(&self, context: WorkerContext, io: WorkerIo) -> Result<(), WorkerError> {
        let dispatch = self
            .handlers
            .get(&context.handler)
            .cloned()
            .ok_or_else(|| WorkerError::UnknownHandler {
                name: context.handler.clone(),
            })?;
        dispatch.run(context, io).await
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}
