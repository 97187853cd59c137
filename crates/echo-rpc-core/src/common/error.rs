//! Error types for the echo service.
//!
//! This module defines the central `Error` enum, which captures all recoverable
//! and reportable error cases within the service. It implements
//! `From<Error>` for `tonic::Status` so handlers can use `?` and the failure
//! reaches the caller with an appropriate status code.
//!
//! ## Error Cases
//! - `ChannelError`: An internal communication failure between tasks.
//! - `RequestCancelled`: The client went away mid-call.
//! - `InvalidRequest`: The request value cannot be served (e.g. a non-finite
//!   range bound).
//! - `InvalidConfig`: A configuration value is unusable.
//! - `MetadataAlreadySet`: Trailing metadata was set twice on one call.
//! - `ServiceShutdown`: A request arrived while the service was shutting down.

use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the echo service.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Internal channel send/receive failure (e.g., closed or full channel).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The client aborted the request.
    #[error("Request cancelled by client")]
    RequestCancelled,

    /// The client request was invalid.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// A configuration value could not be used.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Trailing metadata may only be attached once per call.
    #[error("Trailing metadata already set for this call")]
    MetadataAlreadySet,

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::ChannelError { context } => {
                Status::internal(format!("Channel error: {}", context))
            }
            Error::RequestCancelled => Status::cancelled("Request was cancelled"),
            Error::InvalidRequest { reason } => Status::invalid_argument(reason),
            Error::InvalidConfig { reason } => Status::invalid_argument(reason),
            Error::MetadataAlreadySet => Status::internal("Trailing metadata already set"),
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
        }
    }
}
