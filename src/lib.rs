//! Batch orchestrator for streaming table-extraction agents.
//!
//! Jobs live in a SQLite store. A small pool of workers claims them, hands
//! each document to its own agent session, decides when the streamed answer
//! is finished, and records success or a bounded retry. A reconciler recovers
//! claims left behind by processes that died mid-job.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
