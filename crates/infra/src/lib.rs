//! Infrastructure layer: job storage, claiming, execution and configuration.

pub mod config;
pub mod jobs;
