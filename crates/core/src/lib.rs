//! `relister-core`: primitives shared by the dispatcher crates.
//!
//! This crate contains **pure** building blocks (no infrastructure concerns).

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::DomainError;
pub use id::{BatchId, JobId, TenantId};
