//! Batchwork — batch task scheduling engine.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod job;
pub mod queue;
pub mod registry;
pub mod stats;
pub mod task;
