//! Client-side components of the echo service.
//!
//! - [`facade`] - the [`Client`] facade and its stub type.
//! - [`transport`] - endpoint and channel construction from settings.
//! - [`capture`] - per-call initial/trailing metadata capture.
//! - [`error`] - [`ClientError`].

pub mod capture;
pub mod error;
pub mod facade;
pub mod transport;

pub use capture::CallMetadata;
pub use error::ClientError;
pub use facade::Client;
pub use transport::ClientSettings;
