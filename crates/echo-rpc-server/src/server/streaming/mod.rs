//! Request and response stream plumbing for the echo handler.
//!
//! Response streams are fed by a spawned producer task writing into a bounded
//! `mpsc` channel; the handler returns the receiving end to the transport.
//! A full channel suspends the producer, and a dropped receiver (client
//! cancellation) stops it at the next unit.
//!
//! - [`consumer`] - reads a request stream to its end.
//! - [`producer`] - drives an iterator of squares into a response channel.

pub mod consumer;
pub mod producer;
