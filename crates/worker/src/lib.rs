//! `relister-worker`: process wiring for the marketplace job dispatcher.

pub mod cli;
pub mod http_executor;
pub mod runtime;

pub use http_executor::HttpActionExecutor;
pub use runtime::Worker;
