#![doc = include_str!("../README.md")]

mod common;
pub use common::*;

/// Generated `sentiment.v1` messages plus the `SentimentAnalyzer` client and
/// server bindings.
pub mod proto {
    tonic::include_proto!("sentiment.v1");
}
