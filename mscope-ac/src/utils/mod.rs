//! Utility modules for mscope-ac

pub mod retry;

pub use retry::{retry_blocking, RetryPolicy};
