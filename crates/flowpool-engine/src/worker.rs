//! Worker dispatch loops.
//!
//! A worker pulls one [`TaskMessage`] at a time from its host. On STOP it
//! runs the handler's stop hook and exits. On PROCESS it invokes the handler
//! and replies with a [`ResultMessage`]. Every handler failure, including a
//! panic, becomes a status on the result; it never takes the worker down.

use std::sync::Arc;

use flowpool_core::{Status, StatusCode};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::BoxFuture;
use crate::handler::{AsyncHandler, Handler, HandlerError, HandlerRegistry, WorkerContext};
use crate::protocol::{HostFrame, WorkerFrame, spawn_frame_reader, spawn_frame_writer};
use crate::queue::{ResultMessage, TaskMessage};

/// Errors that end a worker's dispatch loop.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Unknown handler: {name}")]
    UnknownHandler { name: String },

    #[error("Handler resources failed to initialise: {0}")]
    Init(#[source] anyhow::Error),

    #[error("Expected an init frame, got {got}")]
    Handshake { got: String },

    #[error("Host closed the frame channel")]
    HostClosed,
}

/// A worker's two frame channels.
pub struct WorkerIo {
    frames: mpsc::Receiver<HostFrame>,
    replies: mpsc::Sender<WorkerFrame>,
}

impl WorkerIo {
    pub const fn new(frames: mpsc::Receiver<HostFrame>, replies: mpsc::Sender<WorkerFrame>) -> Self {
        Self { frames, replies }
    }

    async fn send(&self, frame: WorkerFrame) -> Result<(), WorkerError> {
        self.replies
            .send(frame)
            .await
            .map_err(|_| WorkerError::HostClosed)
    }

    async fn reply(&self, message: ResultMessage) -> Result<(), WorkerError> {
        self.send(WorkerFrame::Result { message }).await
    }

    /// Next task from the host. `None` when the host is gone.
    async fn next_task(&mut self) -> Option<TaskMessage> {
        loop {
            match self.frames.recv().await? {
                HostFrame::Task { message } => return Some(message),
                HostFrame::Init { .. } => warn!("Ignoring repeated init frame"),
            }
        }
    }
}

/// Type-erased dispatch loop for one handler.
pub(crate) trait Dispatch: Send + Sync {
    fn run(&self, context: WorkerContext, io: WorkerIo) -> BoxFuture<'static, Result<(), WorkerError>>;
}

const INTERNAL_ERROR_MESSAGE: &str = "Error while processing task";

fn missing_payload(uuid: Uuid) -> ResultMessage {
    ResultMessage::failed(
        uuid,
        Status::new(StatusCode::InvalidInput, "PROCESS task without payload"),
    )
}

fn finish<R: Serialize>(
    uuid: Uuid,
    context: &WorkerContext,
    outcome: Result<R, HandlerError>,
) -> ResultMessage {
    match outcome.and_then(|response| {
        serde_json::to_value(response).map_err(|e| HandlerError::Internal(e.into()))
    }) {
        Ok(payload) => ResultMessage::ok(uuid, payload),
        Err(HandlerError::Internal(e)) => {
            error!(
                resource = %context.resource,
                worker = context.worker_index,
                %uuid,
                error = %e,
                "Handler failed"
            );
            ResultMessage::failed(uuid, Status::internal_error(INTERNAL_ERROR_MESSAGE))
        }
        Err(e) => {
            debug!(%uuid, error = %e, "Handler rejected request");
            ResultMessage::failed(uuid, e.status())
        }
    }
}

fn panicked(uuid: Uuid, context: &WorkerContext, err: &tokio::task::JoinError) -> ResultMessage {
    error!(
        resource = %context.resource,
        worker = context.worker_index,
        %uuid,
        error = %err,
        "Handler panicked"
    );
    ResultMessage::failed(uuid, Status::internal_error(INTERNAL_ERROR_MESSAGE))
}

fn decode<T: serde::de::DeserializeOwned>(
    uuid: Uuid,
    payload: Option<serde_json::Value>,
) -> Result<T, ResultMessage> {
    let payload = payload.ok_or_else(|| missing_payload(uuid))?;
    serde_json::from_value(payload).map_err(|e| {
        ResultMessage::failed(
            uuid,
            Status::new(StatusCode::InvalidInput, format!("Malformed request: {e}")),
        )
    })
}

// ===== Sync handlers =====

pub(crate) struct SyncDispatch<H> {
    handler: Arc<H>,
}

impl<H: Handler> SyncDispatch<H> {
    pub(crate) fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

impl<H: Handler> Dispatch for SyncDispatch<H> {
    fn run(&self, context: WorkerContext, io: WorkerIo) -> BoxFuture<'static, Result<(), WorkerError>> {
        Box::pin(run_sync(Arc::clone(&self.handler), context, io))
    }
}

async fn run_sync<H: Handler>(
    handler: Arc<H>,
    context: WorkerContext,
    mut io: WorkerIo,
) -> Result<(), WorkerError> {
    let resources = {
        let handler = Arc::clone(&handler);
        let ctx = context.clone();
        tokio::task::spawn_blocking(move || handler.init_resources(&ctx))
            .await
            .map_err(|e| WorkerError::Init(e.into()))?
            .map_err(WorkerError::Init)?
    };
    let resources = Arc::new(resources);
    info!(resource = %context.resource, worker = context.worker_index, "Worker ready");

    loop {
        io.send(WorkerFrame::Pull).await?;
        let message = io.next_task().await.ok_or(WorkerError::HostClosed)?;

        if message.is_stop() {
            let handler = Arc::clone(&handler);
            let res = Arc::clone(&resources);
            if let Err(e) = tokio::task::spawn_blocking(move || handler.on_stop(&res)).await {
                warn!(resource = %context.resource, error = %e, "Stop hook panicked");
            }
            info!(resource = %context.resource, worker = context.worker_index, "Worker stopped");
            return Ok(());
        }

        let uuid = message.uuid;
        debug!(resource = %context.resource, %uuid, "Processing task");
        let result = match decode::<H::Request>(uuid, message.payload) {
            Err(rejected) => rejected,
            Ok(request) => {
                let handler = Arc::clone(&handler);
                let res = Arc::clone(&resources);
                match tokio::task::spawn_blocking(move || handler.handle(&res, request)).await {
                    Ok(outcome) => finish(uuid, &context, outcome),
                    Err(e) => panicked(uuid, &context, &e),
                }
            }
        };
        io.reply(result).await?;
    }
}

// ===== Async handlers =====

pub(crate) struct AsyncDispatch<H> {
    handler: Arc<H>,
}

impl<H: AsyncHandler> AsyncDispatch<H> {
    pub(crate) fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

impl<H: AsyncHandler> Dispatch for AsyncDispatch<H> {
    fn run(&self, context: WorkerContext, io: WorkerIo) -> BoxFuture<'static, Result<(), WorkerError>> {
        Box::pin(run_async(Arc::clone(&self.handler), context, io))
    }
}

async fn run_async<H: AsyncHandler>(
    handler: Arc<H>,
    context: WorkerContext,
    mut io: WorkerIo,
) -> Result<(), WorkerError> {
    let resources = Arc::new(
        handler
            .init_resources(&context)
            .map_err(WorkerError::Init)?,
    );
    let limit = context.async_task_limit.max(1);
    info!(
        resource = %context.resource,
        worker = context.worker_index,
        limit,
        "Async worker ready"
    );

    let mut tasks: JoinSet<ResultMessage> = JoinSet::new();
    let mut pull_outstanding = false;

    loop {
        // Only ask for more work while under the in-flight limit.
        if !pull_outstanding && tasks.len() < limit {
            io.send(WorkerFrame::Pull).await?;
            pull_outstanding = true;
        }

        tokio::select! {
            frame = io.next_task(), if pull_outstanding => {
                let Some(message) = frame else {
                    tasks.abort_all();
                    return Err(WorkerError::HostClosed);
                };
                pull_outstanding = false;
                if message.is_stop() {
                    break;
                }
                let uuid = message.uuid;
                match decode::<H::Request>(uuid, message.payload) {
                    Err(rejected) => io.reply(rejected).await?,
                    Ok(request) => {
                        let handler = Arc::clone(&handler);
                        let res = Arc::clone(&resources);
                        let ctx = context.clone();
                        tasks.spawn(async move {
                            // A panic surfaces as a JoinError on the inner task, where the uuid is still known.
                            let inner = tokio::spawn(async move { handler.handle(res, request).await });
                            match inner.await {
                                Ok(outcome) => finish(uuid, &ctx, outcome),
                                Err(e) => panicked(uuid, &ctx, &e),
                            }
                        });
                        debug!(resource = %context.resource, %uuid, in_flight = tasks.len(), "Task started");
                    }
                }
            }
            Some(joined) = tasks.join_next() => {
                if let Some(result) = settle(&context, joined) {
                    io.reply(result).await?;
                }
            }
        }
    }

    debug!(resource = %context.resource, remaining = tasks.len(), "Draining in-flight tasks before stop");
    while let Some(joined) = tasks.join_next().await {
        if let Some(result) = settle(&context, joined) {
            io.reply(result).await?;
        }
    }
    handler.on_stop(&resources).await;
    info!(resource = %context.resource, worker = context.worker_index, "Worker stopped");
    Ok(())
}

fn settle(
    context: &WorkerContext,
    joined: Result<ResultMessage, tokio::task::JoinError>,
) -> Option<ResultMessage> {
    match joined {
        Ok(result) => Some(result),
        Err(e) => {
            warn!(resource = %context.resource, error = %e, "Task wrapper ended without a result");
            None
        }
    }
}

// ===== Process entry =====

/// Worker-process entry point: read the init frame from stdin, then run the
/// named handler's dispatch loop over stdin/stdout.
pub async fn serve_stdio(registry: &HandlerRegistry) -> Result<(), WorkerError> {
    let (mut frames, _reader) =
        spawn_frame_reader::<_, HostFrame>(tokio::io::stdin(), "stdin".into());
    let (replies, writer) =
        spawn_frame_writer::<_, WorkerFrame>(tokio::io::stdout(), "stdout".into());

    let context = match frames.recv().await {
        Some(HostFrame::Init { context }) => context,
        Some(HostFrame::Task { message }) => {
            return Err(WorkerError::Handshake {
                got: format!("task {}", message.uuid),
            });
        }
        None => return Err(WorkerError::HostClosed),
    };
    info!(
        resource = %context.resource,
        handler = %context.handler,
        worker = context.worker_index,
        "Worker process starting"
    );

    let result = registry.run(context, WorkerIo::new(frames, replies)).await;
    // The io (and with it the last reply sender) is gone; let the writer flush.
    if let Err(e) = writer.await {
        warn!(error = %e, "Frame writer task failed");
    }
    result
}
