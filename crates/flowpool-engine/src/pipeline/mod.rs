//! Pipeline engine: a DAG of steps over keyed work items.
//!
//! [`Pipeline::start`] never fails as a whole. Every failure ends up in the
//! status of the item it concerns, and the returned list holds exactly one
//! item per input key.

pub mod meta;
pub mod params;
pub mod processor;
pub mod step;
pub mod transform;

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;

use flowpool_core::{Status, StatusCode, WorkItem};
use tokio_stream::Stream;
use tracing::{debug, error, warn};

use crate::content::ContentError;
use crate::proxy::ProxyError;

pub use meta::Meta;
pub use params::{Args, Param};
pub use processor::{Invocation, Output, Processor};
pub use step::{PipelineStep, StepContext, StepInput};
pub use transform::{DataTransformer, Shape, Source, TransformError};

/// Uniform item stream every processor output is coerced into.
pub type ItemStream = Pin<Box<dyn Stream<Item = Result<WorkItem, StepError>> + Send>>;

/// Errors raised inside a step. They never reach the caller of
/// [`Pipeline::start`]; they become INTERNAL_ERROR statuses.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("Missing required parameter '{param}'{}", for_item(.key.as_deref()))]
    MissingParam { param: String, key: Option<String> },

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Content(#[from] ContentError),

    #[error("Step task failed: {0}")]
    Join(String),
}

impl StepError {
    pub fn status(&self) -> Status {
        Status::internal_error(self.to_string())
    }
}

fn for_item(key: Option<&str>) -> String {
    key.map(|key| format!(" for item '{key}'")).unwrap_or_default()
}

/// A root step plus optional entry and exit coercions.
#[derive(Debug, Clone)]
pub struct Pipeline {
    root: Arc<PipelineStep>,
    input_shape: Option<String>,
    output_shape: Option<String>,
    transformer: Arc<DataTransformer>,
}

impl Pipeline {
    pub fn new(root: PipelineStep) -> Self {
        Self {
            root: Arc::new(root),
            input_shape: None,
            output_shape: None,
            transformer: Arc::new(DataTransformer::new()),
        }
    }

    #[must_use]
    pub fn with_input_shape(mut self, shape: impl Into<String>) -> Self {
        self.input_shape = Some(shape.into());
        self
    }

    #[must_use]
    pub fn with_output_shape(mut self, shape: impl Into<String>) -> Self {
        self.output_shape = Some(shape.into());
        self
    }

    #[must_use]
    pub fn with_transformer(mut self, transformer: Arc<DataTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn add_next_step(&mut self, step: PipelineStep) -> &mut Self {
        Arc::make_mut(&mut self.root).add_next_step(step);
        self
    }

    pub fn add_branch(&mut self, steps: Vec<PipelineStep>) -> &mut Self {
        Arc::make_mut(&mut self.root).add_branch(steps);
        self
    }

    /// Run the pipeline over `items`. `meta` lets the caller supply globals
    /// or share snapshots with another run; a fresh one is used otherwise.
    pub async fn start(&self, items: Vec<WorkItem>, meta: Option<Meta>) -> Vec<WorkItem> {
        let inputs: Vec<WorkItem> = items.clone();
        let mut accepted = Vec::with_capacity(items.len());
        let mut set_aside = Vec::new();

        for item in items {
            if !item.is_ok() {
                set_aside.push(item);
                continue;
            }
            match &self.input_shape {
                Some(shape) => match self.transformer.transform(&item, shape) {
                    Ok(coerced) => accepted.push(coerced),
                    Err(e) => {
                        warn!(key = %item.key(), error = %e, "Rejecting input item");
                        set_aside.push(item.with_status(Status::new(StatusCode::InvalidInput, e.to_string())));
                    }
                },
                None => accepted.push(item),
            }
        }

        let meta = meta.unwrap_or_default();
        meta.seed(&accepted);
        let ctx = StepContext {
            meta,
            transformer: Arc::clone(&self.transformer),
        };

        debug!(items = accepted.len(), set_aside = set_aside.len(), "Starting pipeline");
        let root = tokio::spawn(
            Arc::clone(&self.root).process(StepInput::Items(accepted.clone()), ctx),
        );
        let outcome = match root.await {
            Ok(outcome) => outcome,
            Err(e) => Err(StepError::Join(e.to_string())),
        };
        let mut results = match outcome {
            Ok(results) => results,
            Err(e) => {
                error!(error = %e, "Root step failed, flagging every input item");
                let status = e.status();
                accepted
                    .into_iter()
                    .map(|item| item.with_status(status.clone()))
                    .collect()
            }
        };

        if let Some(shape) = &self.output_shape {
            results = results
                .into_iter()
                .map(|item| {
                    if !item.is_ok() {
                        return item;
                    }
                    match self.transformer.transform(&item, shape) {
                        Ok(coerced) => coerced,
                        Err(e) => {
                            error!(key = %item.key(), error = %e, "Output coercion failed");
                            item.with_status(Status::internal_error(e.to_string()))
                        }
                    }
                })
                .collect();
        }

        results.extend(set_aside);
        reconcile(inputs, results)
    }
}

/// One output item per key: the first one produced wins, and any input key
/// that never came back is returned flagged.
fn reconcile(inputs: Vec<WorkItem>, results: Vec<WorkItem>) -> Vec<WorkItem> {
    let mut seen = HashSet::with_capacity(results.len());
    let mut out: Vec<WorkItem> = results
        .into_iter()
        .filter(|item| seen.insert(item.key().to_string()))
        .collect();
    for input in inputs {
        if seen.insert(input.key().to_string()) {
            error!(key = %input.key(), "Item lost in pipeline");
            out.push(input.with_status(Status::internal_error("item lost in pipeline")));
        }
    }
    out
}
