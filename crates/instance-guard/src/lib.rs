//! Keeps at most one instance of a process alive.
//!
//! Two independent mechanisms:
//!
//! - [`InstanceLock`]: an exclusive `flock`-style lock on a file, used by the
//!   supervisor to refuse starting twice.
//! - [`clear_stale_instances`]: inspects who listens on a TCP port and
//!   force-terminates leftover processes with an exact name match. Other
//!   owners are reported, never killed.

pub mod error;
pub mod lock;
pub mod port;

pub use error::GuardError;
pub use lock::InstanceLock;
pub use port::{clear_stale_instances, is_listening, listeners_on, ClearReport, PortGuardConfig, PortOwner};
