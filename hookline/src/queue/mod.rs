//! Dispatch queue module.
//!
//! This module provides:
//! - The lease/ack/nack work queue between ingestion and the worker pool
//! - The retry policy used to space out failed attempts
//!
//! ## Flow
//!
//! ```text
//! enqueue → Ready ─lease→ Leased ─ack→ (removed, event Succeeded)
//!             ↑             │
//!             └──nack───────┤
//!                           └─dead_letter / attempts used up→ DeadLettered
//! ```

pub mod dispatch;
pub mod retry;

pub use dispatch::{DispatchQueue, NackOutcome};
pub use retry::RetryPolicy;
