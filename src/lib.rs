//! Distributed cache consistency engine over a Redis-compatible key-value store.

pub mod cache;
pub mod config;
pub mod infra;
pub mod store;
