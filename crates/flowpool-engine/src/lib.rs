//! `Flowpool` Engine Library
//!
//! Core functionality for running work through worker pools:
//! - Bounded task queues and the NDJSON worker protocol
//! - Handlers and their per-worker dispatch loops
//! - Runnable resources: lazily started, self-pausing worker pools
//! - Proxies routing typed requests to a resource and back
//! - The pipeline engine executing step DAGs over keyed work items
//! - The content collaborator loading and storing objects

use std::future::Future;
use std::pin::Pin;

pub mod builtin;
pub mod content;
pub mod handler;
pub mod launcher;
pub mod manager;
pub mod pipeline;
pub mod pool;
pub mod protocol;
pub mod proxy;
pub mod queue;
pub mod resource;
pub mod worker;

/// Boxed `Send` future, used where trait objects need async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
