//! Raw OS handle representation

/// Raw identifier for an OS I/O resource.
///
/// Endpoints own their handles exclusively (as `OwnedFd`/`OwnedHandle`);
/// this alias is only the identity used to key reactor registrations and
/// readiness interest, never an ownership claim.
#[cfg(unix)]
pub type OsHandle = std::os::fd::RawFd;

/// Raw identifier for an OS I/O resource.
///
/// Kernel object handles are passed around as their integer value so they
/// can be hashed and sent across the reactor dispatch thread.
#[cfg(windows)]
pub type OsHandle = isize;

/// The value a handle takes once closed. Never valid for I/O.
#[cfg(unix)]
pub const INVALID_HANDLE: OsHandle = -1;

/// The value a handle takes once closed. Never valid for I/O.
#[cfg(windows)]
pub const INVALID_HANDLE: OsHandle = -1;
