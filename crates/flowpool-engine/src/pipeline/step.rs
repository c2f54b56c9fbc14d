//! Pipeline steps: DAG nodes wrapping a processor.
//!
//! A streaming step runs its processor once per call and fans every OK item
//! it yields out to its child steps, one concurrent task per (item, child).
//! A batched step instead consumes the whole upstream of its parent in
//! fixed-size batches; such steps are attached as "pre-collected" children
//! and receive a copy of the parent's output stream.
//!
//! After the parent's stream is exhausted the branch results are merged back
//! per item key. A failing branch marks only its own item INTERNAL_ERROR; a
//! failing pre-collected child marks every collected item, since its failure
//! cannot be pinned on a single item.

use std::collections::HashMap;
use std::sync::Arc;

use flowpool_core::{Status, WorkItem};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, warn};

use super::meta::Meta;
use super::params::{Param, resolve};
use super::processor::{Invocation, Processor};
use super::transform::DataTransformer;
use super::{ItemStream, StepError};
use crate::BoxFuture;

type StepResult = Result<Vec<WorkItem>, StepError>;

/// Input handed to a step.
pub enum StepInput {
    /// Per-item call from a parent step.
    Item(WorkItem),
    /// Root call over the whole pipeline input.
    Items(Vec<WorkItem>),
    /// A parent's full output, consumed by a batched step.
    Upstream(ItemStream),
}

/// Shared state of one pipeline run.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub meta: Meta,
    pub transformer: Arc<DataTransformer>,
}

#[derive(Debug, Clone)]
struct Batching {
    /// Items per batch; 0 means the whole upstream in one batch.
    size: usize,
    /// Shape each batch is coerced into before the processor sees it.
    in_shape: Option<String>,
}

/// One node of the pipeline DAG.
#[derive(Debug, Clone)]
pub struct PipelineStep {
    name: String,
    processor: Processor,
    params: Vec<Param>,
    renames: HashMap<String, String>,
    batching: Option<Batching>,
    children: Vec<Arc<PipelineStep>>,
    pre_collected: Vec<Arc<PipelineStep>>,
}

impl PipelineStep {
    /// Streaming step.
    pub fn new(processor: Processor) -> Self {
        Self {
            name: "step".to_string(),
            processor,
            params: Vec::new(),
            renames: HashMap::new(),
            batching: None,
            children: Vec::new(),
            pre_collected: Vec::new(),
        }
    }

    /// Batch-consuming step. `batch_size == 0` takes the whole upstream as
    /// one batch.
    pub fn batched(processor: Processor, batch_size: usize, in_shape: Option<&str>) -> Self {
        Self {
            batching: Some(Batching {
                size: batch_size,
                in_shape: in_shape.map(str::to_string),
            }),
            ..Self::new(processor)
        }
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    /// Read parameter `param` from item field `field`.
    #[must_use]
    pub fn rename(mut self, param: impl Into<String>, field: impl Into<String>) -> Self {
        self.renames.insert(param.into(), field.into());
        self
    }

    pub fn step_name(&self) -> &str {
        &self.name
    }

    pub const fn is_batched(&self) -> bool {
        self.batching.is_some()
    }

    /// Attach a child. Batched children consume this step's whole output;
    /// streaming children run once per output item.
    pub fn add_next_step(&mut self, step: Self) -> &mut Self {
        if step.is_batched() {
            self.pre_collected.push(Arc::new(step));
        } else {
            self.children.push(Arc::new(step));
        }
        self
    }

    /// Attach a chain of steps, each feeding the next, as one child.
    pub fn add_branch(&mut self, steps: Vec<Self>) -> &mut Self {
        let chained = steps.into_iter().rev().reduce(|next, mut step| {
            step.add_next_step(next);
            step
        });
        if let Some(first) = chained {
            self.add_next_step(first);
        }
        self
    }

    /// Run this step and everything below it.
    pub fn process(self: Arc<Self>, input: StepInput, ctx: StepContext) -> BoxFuture<'static, StepResult> {
        Box::pin(async move {
            let stream = self.invoke(input, &ctx).await?;
            self.run_dependents(stream, ctx).await
        })
    }

    async fn invoke(&self, input: StepInput, ctx: &StepContext) -> Result<ItemStream, StepError> {
        if let Some(batching) = &self.batching {
            let upstream: ItemStream = match input {
                StepInput::Upstream(stream) => stream,
                StepInput::Item(item) => Box::pin(tokio_stream::iter(vec![Ok(item)])),
                StepInput::Items(items) => Box::pin(tokio_stream::iter(
                    items.into_iter().map(Ok).collect::<Vec<_>>(),
                )),
            };
            return Ok(self.run_batches(upstream, batching.clone(), ctx.clone()));
        }

        let invocation = match input {
            StepInput::Item(item) => {
                let args = resolve(&self.params, &self.renames, Some(&item), &ctx.meta)?;
                Invocation {
                    key: Some(item.key().to_string()),
                    items: vec![item],
                    args,
                    meta: ctx.meta.clone(),
                }
            }
            StepInput::Items(items) => Invocation {
                key: None,
                items,
                args: resolve(&self.params, &self.renames, None, &ctx.meta)?,
                meta: ctx.meta.clone(),
            },
            StepInput::Upstream(mut stream) => {
                let mut items = Vec::new();
                while let Some(next) = stream.next().await {
                    items.push(next?);
                }
                Invocation {
                    key: None,
                    items,
                    args: resolve(&self.params, &self.renames, None, &ctx.meta)?,
                    meta: ctx.meta.clone(),
                }
            }
        };
        debug!(step = %self.name, key = ?invocation.key, "Invoking processor");
        Ok(self.processor.invoke(invocation))
    }

    /// Group the upstream into batches, run the processor on each batch
    /// concurrently, and yield results as batches complete.
    fn run_batches(&self, upstream: ItemStream, batching: Batching, ctx: StepContext) -> ItemStream {
        enum Event {
            Upstream(Option<Result<WorkItem, StepError>>),
            Batch(Result<StepResult, tokio::task::JoinError>),
        }

        let step = self.name.clone();
        let processor = self.processor.clone();
        let params = self.params.clone();
        let renames = self.renames.clone();
        let Batching { size, in_shape } = batching;

        let run_batch = move |batch: Vec<WorkItem>| {
            let processor = processor.clone();
            let ctx = ctx.clone();
            let in_shape = in_shape.clone();
            let args = resolve(&params, &renames, None, &ctx.meta);
            async move {
                let items = match &in_shape {
                    Some(shape) => ctx.transformer.transform_list(&batch, shape)?,
                    None => batch,
                };
                let invocation = Invocation {
                    key: None,
                    items,
                    args: args?,
                    meta: ctx.meta.clone(),
                };
                processor.collect(invocation).await
            }
        };

        Box::pin(async_stream::stream! {
            let mut upstream = upstream;
            let mut tasks: JoinSet<StepResult> = JoinSet::new();
            let mut batch: Vec<WorkItem> = Vec::new();
            let mut upstream_done = false;
            let mut submitted = 0usize;

            loop {
                let event = tokio::select! {
                    next = upstream.next(), if !upstream_done => Event::Upstream(next),
                    Some(done) = tasks.join_next() => Event::Batch(done),
                    else => break,
                };
                match event {
                    Event::Upstream(Some(Ok(item))) => {
                        batch.push(item);
                        if size > 0 && batch.len() >= size {
                            submitted += 1;
                            debug!(step = %step, batch = submitted, len = batch.len(), "Submitting batch");
                            tasks.spawn(run_batch(std::mem::take(&mut batch)));
                        }
                    }
                    Event::Upstream(Some(Err(e))) => {
                        tasks.abort_all();
                        yield Err(e);
                        return;
                    }
                    Event::Upstream(None) => {
                        upstream_done = true;
                        if !batch.is_empty() {
                            submitted += 1;
                            debug!(step = %step, batch = submitted, len = batch.len(), "Submitting final batch");
                            tasks.spawn(run_batch(std::mem::take(&mut batch)));
                        }
                    }
                    Event::Batch(Ok(Ok(items))) => {
                        for item in items {
                            yield Ok(item);
                        }
                    }
                    Event::Batch(Ok(Err(e))) => {
                        tasks.abort_all();
                        yield Err(e);
                        return;
                    }
                    Event::Batch(Err(e)) => {
                        tasks.abort_all();
                        yield Err(StepError::Join(e.to_string()));
                        return;
                    }
                }
            }
        })
    }

    /// Fan this step's output out to its children and merge the results.
    async fn run_dependents(&self, mut stream: ItemStream, ctx: StepContext) -> StepResult {
        let mut broken: Vec<WorkItem> = Vec::new();
        let mut order: Vec<String> = Vec::new();
        let mut collected: HashMap<String, WorkItem> = HashMap::new();
        let mut branches: HashMap<String, Vec<JoinHandle<StepResult>>> = HashMap::new();

        let mut tees = Vec::with_capacity(self.pre_collected.len());
        let mut pre_tasks = Vec::with_capacity(self.pre_collected.len());
        for child in &self.pre_collected {
            let (tx, rx) = mpsc::unbounded_channel::<Result<WorkItem, StepError>>();
            let upstream: ItemStream = Box::pin(UnboundedReceiverStream::new(rx));
            pre_tasks.push(tokio::spawn(
                Arc::clone(child).process(StepInput::Upstream(upstream), ctx.clone()),
            ));
            tees.push(tx);
        }

        while let Some(next) = stream.next().await {
            let item = match next {
                Ok(item) => ctx.meta.enrich(item),
                Err(e) => {
                    abort_all(branches.into_values().flatten().chain(pre_tasks));
                    return Err(e);
                }
            };
            ctx.meta.update_item(&item);

            if !item.is_ok() {
                debug!(step = %self.name, key = %item.key(), "Setting aside non-OK item");
                broken.push(item);
                continue;
            }

            for tee in &tees {
                let _ = tee.send(Ok(item.clone()));
            }

            let key = item.key().to_string();
            let tasks: Vec<_> = self
                .children
                .iter()
                .map(|child| {
                    tokio::spawn(
                        Arc::clone(child).process(StepInput::Item(item.clone()), ctx.clone()),
                    )
                })
                .collect();
            if let Some(previous) = branches.insert(key.clone(), tasks) {
                // Last write wins for a repeated key.
                abort_all(previous);
            }
            if collected.insert(key.clone(), item).is_none() {
                order.push(key);
            }
        }
        drop(tees);

        let mut merged: Vec<WorkItem> = Vec::with_capacity(order.len());
        for key in &order {
            let Some(base) = collected.remove(key) else { continue };
            let tasks = branches.remove(key).unwrap_or_default();
            merged.push(self.merge_branches(base, tasks).await);
        }

        if !pre_tasks.is_empty() {
            self.merge_pre_collected(&mut merged, pre_tasks).await;
        }

        merged.extend(broken);
        Ok(merged)
    }

    /// Merge one item's branch results in child order. The first non-OK
    /// part short-circuits; a branch that failed outright resets the item to
    /// its pre-branch fields with INTERNAL_ERROR.
    async fn merge_branches(&self, base: WorkItem, tasks: Vec<JoinHandle<StepResult>>) -> WorkItem {
        let mut item = base.clone();
        let mut tasks = tasks.into_iter();
        while let Some(task) = tasks.next() {
            let failure = match task.await {
                Ok(Ok(parts)) => {
                    let part = parts
                        .iter()
                        .find(|part| part.key() == base.key())
                        .or_else(|| parts.first());
                    match part {
                        Some(part) => {
                            item = item.merge(part);
                            if item.is_ok() {
                                continue;
                            }
                            debug!(step = %self.name, key = %item.key(), status = %item.status(), "Branch flagged item");
                            None
                        }
                        None => Some("branch produced no item".to_string()),
                    }
                }
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) => Some(e.to_string()),
            };
            abort_all(tasks);
            if let Some(reason) = failure {
                error!(step = %self.name, key = %base.key(), %reason, "Branch failed");
                item = base.with_status(Status::internal_error(reason));
            }
            break;
        }
        item
    }

    async fn merge_pre_collected(&self, merged: &mut [WorkItem], tasks: Vec<JoinHandle<StepResult>>) {
        let mut parts = Vec::new();
        let mut failure = None;
        for task in tasks {
            match task.await {
                Ok(Ok(items)) => parts.extend(items),
                Ok(Err(e)) => failure = Some(e.to_string()),
                Err(e) => failure = Some(e.to_string()),
            }
        }

        if let Some(reason) = failure {
            error!(step = %self.name, %reason, "Batch branch failed, flagging every collected item");
            for item in merged.iter_mut().filter(|item| item.is_ok()) {
                item.set_status(Status::internal_error(reason.clone()));
            }
            return;
        }

        let index: HashMap<String, usize> = merged
            .iter()
            .enumerate()
            .filter(|(_, item)| item.is_ok())
            .map(|(pos, item)| (item.key().to_string(), pos))
            .collect();
        for part in parts {
            match index.get(part.key()) {
                Some(&pos) => merged[pos] = merged[pos].merge(&part),
                None => warn!(step = %self.name, key = %part.key(), "Batch result for unknown or broken item skipped"),
            }
        }
    }
}

fn abort_all(tasks: impl IntoIterator<Item = JoinHandle<StepResult>>) {
    for task in tasks {
        task.abort();
    }
}
