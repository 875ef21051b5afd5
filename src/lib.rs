//! Queue-driven image processing pipeline
//!
//! An HTTP gateway accepts uploads and publishes job descriptors to a task
//! queue. Workers consume them one at a time, run the requested transforms,
//! and publish completion events that a notification sink applies to the job
//! status store. Tasks that fail are routed to a dead-letter queue.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
pub mod telemetry;
