//! Core primitives shared by the sluice crates
//!
//! This crate carries the pieces every other sluice crate depends on: the
//! raw OS handle alias, the error taxonomy, and the reactor contract that
//! endpoints register with to suspend and resume asynchronous operations.

pub mod error;
pub mod handle;
pub mod reactor;
pub mod testing;

// Re-export commonly used types
pub use error::{Error, Result};
pub use handle::OsHandle;
pub use reactor::Reactor;

#[cfg(unix)]
pub use reactor::PollReactor;
#[cfg(windows)]
pub use reactor::WaitReactor;
