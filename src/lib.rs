//! Instance orchestrator - lifecycle management for named, containerized
//! application instances

pub mod core;
pub mod engine;
pub mod persistence;
