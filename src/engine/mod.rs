//! Container engine backends

pub mod docker;

pub use docker::DockerEngine;
