//! Typed client handles for resources.
//!
//! A [`Proxy`] wraps a request in a PROCESS task with a fresh uuid, enqueues
//! it, and waits for the matching result. Results are routed by one
//! [`ReplyRouter`] per resource: a single reader task drains the outbound
//! queue and completes the waiting request registered under each uuid, so
//! concurrent callers never see each other's replies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use flowpool_core::Status;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::queue::{ResultMessage, TaskMessage, TaskQueue};

/// Errors returned by [`Proxy`] requests.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The worker answered with a non-OK status.
    #[error("Resource '{resource}' failed to handle the request: {status}")]
    Handling { resource: String, status: Status },

    #[error("Failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode response: {0}")]
    Decode(#[source] serde_json::Error),

    /// The resource's reply reader went away before answering.
    #[error("Resource '{resource}' closed before replying")]
    Closed { resource: String },
}

impl ProxyError {
    /// Status to attach to the work item this request was made for.
    pub fn status(&self) -> Status {
        match self {
            Self::Handling { status, .. } => status.clone(),
            other => Status::internal_error(other.to_string()),
        }
    }
}

type PendingMap = HashMap<Uuid, oneshot::Sender<ResultMessage>>;

fn lock(pending: &Mutex<PendingMap>) -> MutexGuard<'_, PendingMap> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes a resource's results to the requests waiting for them.
pub struct ReplyRouter {
    resource: String,
    outbound: TaskQueue<ResultMessage>,
    pending: Arc<Mutex<PendingMap>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ReplyRouter {
    pub fn new(resource: String, outbound: TaskQueue<ResultMessage>) -> Self {
        Self {
            resource,
            outbound,
            pending: Arc::new(Mutex::new(HashMap::new())),
            reader: Mutex::new(None),
        }
    }

    /// Start the reader task unless it is already running. Needs a runtime.
    pub fn ensure_reader(&self) {
        let mut reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        if reader.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let resource = self.resource.clone();
        let outbound = self.outbound.clone();
        let pending = Arc::clone(&self.pending);
        *reader = Some(tokio::spawn(async move {
            loop {
                let message = outbound.get().await;
                let waiter = lock(&pending).remove(&message.uuid);
                match waiter {
                    Some(tx) => {
                        if tx.send(message).is_err() {
                            debug!(resource = %resource, "Requester gone before its reply arrived");
                        }
                    }
                    None => warn!(
                        resource = %resource,
                        uuid = %message.uuid,
                        "Dropping result with no waiting request"
                    ),
                }
            }
        }));
    }

    /// Register interest in the result for `uuid`. The registration is
    /// removed when the returned guard is dropped.
    fn register(&self, uuid: Uuid) -> (oneshot::Receiver<ResultMessage>, Registration) {
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(uuid, tx);
        (
            rx,
            Registration {
                uuid,
                pending: Arc::clone(&self.pending),
            },
        )
    }

    /// Number of requests currently waiting for a reply.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}

impl Drop for ReplyRouter {
    fn drop(&mut self) {
        if let Some(handle) = self
            .reader
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

struct Registration {
    uuid: Uuid,
    pending: Arc<Mutex<PendingMap>>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.uuid);
    }
}

/// Client handle bound to one resource.
#[derive(Clone)]
pub struct Proxy {
    resource: String,
    inbound: TaskQueue<TaskMessage>,
    router: Arc<ReplyRouter>,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

impl Proxy {
    pub(crate) const fn new(
        resource: String,
        inbound: TaskQueue<TaskMessage>,
        router: Arc<ReplyRouter>,
    ) -> Self {
        Self {
            resource,
            inbound,
            router,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Send a typed request and wait for the typed response.
    pub async fn request<Req, Resp>(&self, request: &Req) -> Result<Resp, ProxyError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_value(request).map_err(ProxyError::Encode)?;
        let response = self.request_value(payload).await?;
        serde_json::from_value(response).map_err(ProxyError::Decode)
    }

    /// Send a raw JSON payload and wait for the raw response payload.
    pub async fn request_value(&self, payload: Value) -> Result<Value, ProxyError> {
        let message = TaskMessage::process(payload);
        let uuid = message.uuid;

        self.router.ensure_reader();
        let (reply, _registration) = self.router.register(uuid);
        debug!(resource = %self.resource, %uuid, "Submitting task");
        self.inbound.put(message).await;

        let result = reply.await.map_err(|_| ProxyError::Closed {
            resource: self.resource.clone(),
        })?;
        if !result.status.is_ok() {
            return Err(ProxyError::Handling {
                resource: self.resource.clone(),
                status: result.status,
            });
        }
        Ok(result.payload.unwrap_or(Value::Null))
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use flowpool_core::StatusCode;
    use serde_json::json;
    use std::time::Duration;

    fn setup() -> (Proxy, TaskQueue<TaskMessage>, TaskQueue<ResultMessage>) {
        let inbound = TaskQueue::new(16, Duration::from_millis(10));
        let outbound = TaskQueue::new(16, Duration::from_millis(10));
        let router = Arc::new(ReplyRouter::new("fake".into(), outbound.clone()));
        (
            Proxy::new("fake".into(), inbound.clone(), router),
            inbound,
            outbound,
        )
    }

    #[tokio::test]
    async fn concurrent_callers_get_their_own_replies() {
        let (proxy, inbound, outbound) = setup();

        let a = tokio::spawn({
            let proxy = proxy.clone();
            async move { proxy.request_value(json!({"who": "a"})).await }
        });
        let b = tokio::spawn({
            let proxy = proxy.clone();
            async move { proxy.request_value(json!({"who": "b"})).await }
        });

        let first = inbound.get().await;
        let second = inbound.get().await;
        // Answer in reverse order of arrival.
        for task in [second, first] {
            let who = task.payload.as_ref().unwrap()["who"].clone();
            outbound
                .put(ResultMessage::ok(task.uuid, json!({"answer": who})))
                .await;
        }

        assert_eq!(a.await.unwrap().unwrap(), json!({"answer": "a"}));
        assert_eq!(b.await.unwrap().unwrap(), json!({"answer": "b"}));
        assert_eq!(proxy.router.pending_count(), 0);
    }

    #[tokio::test]
    async fn non_ok_status_is_a_handling_error() {
        let (proxy, inbound, outbound) = setup();
        let call = tokio::spawn(async move { proxy.request_value(json!(1)).await });

        let task = inbound.get().await;
        outbound
            .put(ResultMessage::failed(
                task.uuid,
                Status::new(StatusCode::ContentNotFound, "missing"),
            ))
            .await;

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.status().code, StatusCode::ContentNotFound);
        assert!(matches!(err, ProxyError::Handling { .. }));
    }

    #[tokio::test]
    async fn typed_request_decodes_response() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Out {
            n: u32,
        }

        let (proxy, inbound, outbound) = setup();
        let call = tokio::spawn(async move { proxy.request::<_, Out>(&json!({"n": 1})).await });
        let task = inbound.get().await;
        outbound
            .put(ResultMessage::ok(task.uuid, json!({"n": 2})))
            .await;
        assert_eq!(call.await.unwrap().unwrap(), Out { n: 2 });
    }

    #[tokio::test]
    async fn cancelled_request_removes_its_registration() {
        let (proxy, inbound, outbound) = setup();
        let call = tokio::spawn({
            let proxy = proxy.clone();
            async move { proxy.request_value(json!("x")).await }
        });
        let task = inbound.get().await;
        assert_eq!(proxy.router.pending_count(), 1);

        call.abort();
        let _ = call.await;
        assert_eq!(proxy.router.pending_count(), 0);

        // A late reply is dropped without disturbing later callers.
        outbound
            .put(ResultMessage::ok(task.uuid, json!("late")))
            .await;
        let next = tokio::spawn({
            let proxy = proxy.clone();
            async move { proxy.request_value(json!("y")).await }
        });
        let task = inbound.get().await;
        outbound.put(ResultMessage::ok(task.uuid, json!("ok"))).await;
        assert_eq!(next.await.unwrap().unwrap(), json!("ok"));
    }
}
