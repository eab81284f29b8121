//! Error types for the sentiment dispatch service.
//!
//! This module defines the central `Error` enum, which captures every
//! reportable failure of the synchronous, asynchronous, and batch dispatch
//! paths. It converts in both directions with `tonic::Status` so engine
//! failures map onto the taxonomy and gRPC-facing code can surface it.
//!
//! ## Error Cases
//! - `InvalidArgument`: The caller supplied empty or oversized input.
//! - `DispatchFailed`: A task could not be published or a request sent.
//! - `TransportUnavailable`: The engine connection or stream could not be
//!   established or broke mid-flight.
//! - `Timeout`: No result arrived within the allowed bound.
//! - `Cancelled`: The caller's context ended before completion.
//! - `Internal`: An envelope or response could not be (de)serialized.

use tonic::{Code, Status};

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the sentiment dispatch service.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The caller's input was rejected before any remote call was made.
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// Publishing a task or sending a request failed.
    #[error("Dispatch failed: {context}")]
    DispatchFailed { context: String },

    /// The engine connection or stream could not be established or broke.
    #[error("Transport unavailable: {context}")]
    TransportUnavailable { context: String },

    /// No result arrived within the allowed bound.
    #[error("Timed out waiting for a result")]
    Timeout,

    /// The caller's context ended before the work completed.
    #[error("Request cancelled")]
    Cancelled,

    /// Unexpected serialization or parse failure.
    #[error("Internal error: {context}")]
    Internal { context: String },
}

impl Error {
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub fn dispatch_failed(context: impl Into<String>) -> Self {
        Self::DispatchFailed {
            context: context.into(),
        }
    }

    pub fn transport_unavailable(context: impl Into<String>) -> Self {
        Self::TransportUnavailable {
            context: context.into(),
        }
    }

    pub fn internal(context: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidArgument { reason } => Status::invalid_argument(reason),
            Error::DispatchFailed { context } => {
                Status::internal(format!("Dispatch failed: {context}"))
            }
            Error::TransportUnavailable { context } => Status::unavailable(context),
            Error::Timeout => Status::deadline_exceeded("Timed out waiting for a result"),
            Error::Cancelled => Status::cancelled("Request was cancelled"),
            Error::Internal { context } => Status::internal(context),
        }
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        match status.code() {
            Code::Unavailable => Self::transport_unavailable(status.message()),
            Code::DeadlineExceeded => Self::Timeout,
            Code::Cancelled => Self::Cancelled,
            Code::InvalidArgument => Self::invalid_argument(status.message()),
            code => Self::dispatch_failed(format!("{code}: {}", status.message())),
        }
    }
}
