use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while enforcing a single running instance.
#[derive(Debug, Error)]
pub enum GuardError {
    /// Another process holds the instance lock.
    #[error("another instance is already running (lock held on {})", path.display())]
    AlreadyRunning { path: PathBuf },

    /// The lock file could not be created or locked.
    #[error("failed to lock {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to execute the system command used to inspect listeners.
    #[error("failed to execute listener inspection command: {0}")]
    CommandFailed(#[from] std::io::Error),

    /// The command produced output we could not interpret.
    #[error("failed to parse listener inspection output: {reason}")]
    ParseError { reason: String },

    /// Sending the termination signal failed.
    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::Error,
    },
}
