//! PTY-backed process hosting.
//!
//! Two layers:
//!
//! - [`spawn`] — the POSIX plumbing: allocate a master/slave pair, spawn the
//!   child as a session leader with the slave as its controlling terminal,
//!   resize via ioctl.
//! - [`host`] — the async wrapper: one reader task draining the master, one
//!   writer task serializing input and resizes, one reaper task waiting on
//!   the child.

pub mod host;
pub mod spawn;

pub use host::{ExitInfo, PtyCommand, PtyHost};
pub use spawn::{allocate_pty, resize_pty, spawn_in_pty, PtyPair};
