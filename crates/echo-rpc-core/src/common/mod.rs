//! Shared protocol definitions and call plumbing.
//!
//! - [`proto`] - generated `echo.Echo` service and `Message`.
//! - [`echo`] - stateless echo computations.
//! - [`error`] - service error type and its `tonic::Status` mapping.
//! - [`metadata`] - initial/trailing metadata helpers.
//! - [`options`] - channel configuration builder.
//! - [`shape`] - call shape dispatch table.
//! - [`timing`] - call timing layer.

pub mod echo;
pub mod error;
pub mod metadata;
pub mod options;
pub mod shape;
pub mod timing;

pub use error::{Error, Result};

/// gRPC service and message definitions generated from `proto/echo.proto`.
///
/// ## Service
///
/// - `Square` - unary request, unary response.
/// - `RangeSquare` - unary request, streamed response.
/// - `SumSquare` - streamed request, unary response.
/// - `StreamrangeSquare` - streamed request, streamed response.
///
/// Every call carries [`proto::Message`], a single `double` value.
pub mod proto {
    tonic::include_proto!("echo");

    /// Encoded descriptor set for `echo.proto`, registered with reflection.
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("echo_descriptor");
}
