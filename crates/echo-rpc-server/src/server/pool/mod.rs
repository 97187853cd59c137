//! Multi-process serving over one shared port.
//!
//! The supervisor reserves the listen address with `SO_REUSEPORT`, then
//! re-executes the current binary once per worker. Each worker binds the same
//! address with `SO_REUSEPORT` and runs its own server and runtime; the kernel
//! spreads incoming connections across them. No in-memory state is shared
//! between workers.
//!
//! ## Structure
//!
//! - [`manager`] - worker count resolution, port reservation, the
//!   [`manager::ProcessGroup`] and the single-process fallback.
//! - [`worker`] - one spawned worker process.

pub mod manager;
pub mod worker;
