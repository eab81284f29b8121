#![doc = include_str!("../README.md")]

pub mod batch;
pub mod broker;
pub mod config;
pub mod context;
pub mod correlator;
pub mod dispatch;
pub mod store;
pub mod telemetry;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod testing;

pub use batch::BatchResult;
pub use context::CallContext;
pub use correlator::{AsyncCorrelator, Completion, Submission};
pub use dispatch::{AnalyzeOptions, DispatchLimits, Dispatcher};
