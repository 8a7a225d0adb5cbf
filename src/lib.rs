#![forbid(unsafe_code)]

//! Download orchestration for a media-fetching web service: metadata cache,
//! task registry, bounded worker pool, per-client progress push, and a
//! retention sweeper, fronted by an axum router.

pub mod cache;
pub mod config;
pub mod error;
pub mod extractor;
pub mod format;
pub mod progress;
pub mod registry;
pub mod scheduler;
pub mod security;
pub mod server;
pub mod service;
pub mod sweeper;

#[cfg(test)]
mod testing;
