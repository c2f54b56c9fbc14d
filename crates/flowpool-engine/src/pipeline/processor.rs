//! Processors: the functions a step wraps.
//!
//! A processor may be a plain function, a future, or a stream. Whatever it
//! returns (one item, several, or a stream) is coerced into an
//! [`ItemStream`] so that the step engine only deals with one shape.

use std::future::Future;
use std::sync::Arc;

use flowpool_core::WorkItem;
use tokio_stream::{Stream, StreamExt};

use super::meta::Meta;
use super::params::Args;
use super::{ItemStream, StepError};
use crate::BoxFuture;

/// What a processor returns.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    One(WorkItem),
    Many(Vec<WorkItem>),
}

impl Output {
    pub fn into_items(self) -> Vec<WorkItem> {
        match self {
            Self::One(item) => vec![item],
            Self::Many(items) => items,
        }
    }
}

impl From<WorkItem> for Output {
    fn from(item: WorkItem) -> Self {
        Self::One(item)
    }
}

impl From<Vec<WorkItem>> for Output {
    fn from(items: Vec<WorkItem>) -> Self {
        Self::Many(items)
    }
}

/// Everything a processor receives for one call.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Key of the current item for per-item calls.
    pub key: Option<String>,
    /// The current item, the whole input, or one batch.
    pub items: Vec<WorkItem>,
    pub args: Args,
    pub meta: Meta,
}

impl Invocation {
    pub fn key(&self) -> Result<&str, StepError> {
        self.key
            .as_deref()
            .ok_or_else(|| StepError::Failed("processor needs a per-item call".into()))
    }

    /// The current item of a per-item call.
    pub fn item(&self) -> Result<&WorkItem, StepError> {
        let key = self.key()?;
        self.items
            .iter()
            .find(|item| item.key() == key)
            .ok_or_else(|| StepError::Failed(format!("item '{key}' missing from its own call")))
    }
}

type SyncFn = dyn Fn(Invocation) -> Result<Output, StepError> + Send + Sync;
type FutureFn = dyn Fn(Invocation) -> BoxFuture<'static, Result<Output, StepError>> + Send + Sync;
type StreamFn = dyn Fn(Invocation) -> ItemStream + Send + Sync;

#[derive(Clone)]
enum Kind {
    Sync(Arc<SyncFn>),
    Future(Arc<FutureFn>),
    Stream(Arc<StreamFn>),
}

/// A step's processing function.
#[derive(Clone)]
pub struct Processor {
    kind: Kind,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            Kind::Sync(_) => "sync",
            Kind::Future(_) => "future",
            Kind::Stream(_) => "stream",
        };
        f.debug_struct("Processor").field("kind", &kind).finish()
    }
}

impl Processor {
    pub fn sync<F, O>(f: F) -> Self
    where
        F: Fn(Invocation) -> Result<O, StepError> + Send + Sync + 'static,
        O: Into<Output>,
    {
        Self {
            kind: Kind::Sync(Arc::new(move |inv| f(inv).map(Into::into))),
        }
    }

    pub fn future<F, Fut, O>(f: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, StepError>> + Send + 'static,
        O: Into<Output>,
    {
        Self {
            kind: Kind::Future(Arc::new(move |inv| {
                let fut = f(inv);
                Box::pin(async move { fut.await.map(Into::into) })
            })),
        }
    }

    pub fn stream<F, S>(f: F) -> Self
    where
        F: Fn(Invocation) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<WorkItem, StepError>> + Send + 'static,
    {
        Self {
            kind: Kind::Stream(Arc::new(move |inv| Box::pin(f(inv)))),
        }
    }

    /// Run the processor and expose its output as a stream.
    pub fn invoke(&self, invocation: Invocation) -> ItemStream {
        match &self.kind {
            Kind::Sync(f) => {
                let outcome = f(invocation).map(Output::into_items);
                Box::pin(one_shot(outcome))
            }
            Kind::Future(f) => {
                let fut = f(invocation);
                Box::pin(async_stream::stream! {
                    match fut.await {
                        Ok(output) => {
                            for item in output.into_items() {
                                yield Ok(item);
                            }
                        }
                        Err(e) => yield Err(e),
                    }
                })
            }
            Kind::Stream(f) => f(invocation),
        }
    }

    /// Run the processor and collect everything it yields.
    pub async fn collect(&self, invocation: Invocation) -> Result<Vec<WorkItem>, StepError> {
        let mut stream = self.invoke(invocation);
        let mut items = Vec::new();
        while let Some(next) = stream.next().await {
            items.push(next?);
        }
        Ok(items)
    }
}

fn one_shot(
    outcome: Result<Vec<WorkItem>, StepError>,
) -> impl Stream<Item = Result<WorkItem, StepError>> + Send {
    let items: Vec<Result<WorkItem, StepError>> = match outcome {
        Ok(items) => items.into_iter().map(Ok).collect(),
        Err(e) => vec![Err(e)],
    };
    tokio_stream::iter(items)
}
