//! # dtest-rs
//!
//! A distributed, sandboxed test-execution engine: test bodies run inside a
//! forked, signal-guarded sandbox with heap/network accounting, and a test
//! may additionally spread itself across a pool of worker processes that
//! rendezvous with the driver over a small framed wire protocol.

pub mod alloc;
pub mod callstack;
pub mod codec;
pub mod config;
pub mod distributed;
pub mod logging;
pub mod perf_test;
pub mod report;
pub mod sandbox;
pub mod tracker;
pub mod transport;
pub mod utils;

pub use config::{Args, EngineConfig};
pub use report::{ResultsManager, TestReport};
pub use test::{PerformanceMargin, Registry, RunSummary, Scheduler, Status, TestBuilder, TestDescriptor};

/// The current version of the engine.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Installed once for the whole binary so every allocation anywhere in the
/// process is visible to the resource tracker (C4/C5) without `LD_PRELOAD`.
#[global_allocator]
static GLOBAL_ALLOCATOR: alloc::TrackingAllocator = alloc::TrackingAllocator;
