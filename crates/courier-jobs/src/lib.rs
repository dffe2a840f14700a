//! # courier-jobs
//!
//! Background job processing for courier.
//!
//! This crate provides:
//! - Enqueueing and dead-letter replay
//! - Lease-based claiming with stuck-job recovery
//! - Concurrent execution with bounded exponential retry
//! - A polling worker loop with graceful shutdown and an event stream
//!
//! ## Example
//!
//! ```ignore
//! use courier_jobs::{EnqueueOptions, NoOpHandler, WorkerBuilder, WorkerConfig};
//! use courier_db::Database;
//!
//! let db = Database::connect("postgres://...").await?;
//!
//! let worker = WorkerBuilder::new(db.job_store())
//!     .with_config(WorkerConfig::default().with_poll_interval(1000))
//!     .with_handler(NoOpHandler::new("noop"))
//!     .build();
//!
//! worker
//!     .enqueuer()
//!     .enqueue("noop", serde_json::json!({}), EnqueueOptions::default())
//!     .await?;
//!
//! // Start worker and get handle
//! let handle = worker.start();
//!
//! // Listen for events
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//!
//! // Graceful shutdown
//! handle.shutdown().await?;
//! ```

pub mod backoff;
pub mod claimer;
pub mod enqueue;
pub mod executor;
pub mod handler;
pub mod worker;

// Re-export core types
pub use courier_core::*;

pub use backoff::BackoffPolicy;
pub use claimer::{Claimer, LEASE_EXPIRED_ERROR};
pub use enqueue::Enqueuer;
pub use executor::{ExecutionOutcome, Executor};
pub use handler::{FnHandler, HandlerRegistry, JobContext, JobHandler, JobResult, NoOpHandler};
pub use worker::{recv_event, JobWorker, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle};

/// Default attempt budget for new jobs.
pub const DEFAULT_MAX_ATTEMPTS: i32 = courier_core::defaults::JOB_MAX_ATTEMPTS;

/// Default polling interval for job processing (milliseconds).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = courier_core::defaults::JOB_POLL_INTERVAL_MS;
