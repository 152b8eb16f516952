//! Threads that claim jobs from the queue and run them.

pub mod pool;

pub use pool::{JobOutcome, JobReport, WorkerPool, WorkerPoolConfig};
