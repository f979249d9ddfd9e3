//! Bounded worker queues gating upstream execution (§4.F). A
//! `ConcurrencyManager` owns one optional default queue plus zero or more
//! named per-route queues, each an independent [`WorkerQueue`].

pub mod queue;
pub mod manager;

pub use manager::ConcurrencyManager;
pub use queue::{QueueStats, WorkerQueue};
