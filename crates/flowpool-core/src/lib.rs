//! `Flowpool` Core Library
//!
//! Shared functionality for `Flowpool` components:
//! - Work item and status model flowing through pipelines and worker pools
//! - Configuration resolution and hierarchy
//! - Tracing initialisation for the service and for worker processes
//! - Common error types

pub mod config;
pub mod error;
pub mod item;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use item::{Fields, Status, StatusCode, WorkItem};
