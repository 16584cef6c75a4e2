//! Processing side: a fixed pool of workers draining the durable work queue.

pub mod pool;
pub mod processor;

pub use pool::{
    DecodeFailurePolicy, PoolConfig, PoolReport, StopReason, WorkerPool, WorkerReport,
};
pub use processor::{EchoProcessor, Processor};
