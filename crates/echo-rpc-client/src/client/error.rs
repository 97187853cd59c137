//! Errors raised by the client facade.

use std::path::PathBuf;
use tonic::Status;

pub type Result<T> = core::result::Result<T, ClientError>;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    /// A call was made before a target URL was set.
    #[error("Client has no channel; call `initialize_from_url` first")]
    NotInitialized,

    /// The target could not be turned into an endpoint.
    #[error("Invalid target {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// A CA certificate could not be read.
    #[error("Failed to read {path:?}: {source}")]
    Credentials {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Channel construction failed.
    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),

    /// The call ended with a non-OK status.
    #[error(transparent)]
    Status(#[from] Status),
}

impl ClientError {
    /// The gRPC status of a failed call, if the error came from one.
    pub fn status(&self) -> Option<&Status> {
        match self {
            Self::Status(status) => Some(status),
            _ => None,
        }
    }
}
