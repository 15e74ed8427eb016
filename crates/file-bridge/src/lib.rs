//! WebSocket file-operation bridge for the remote-gateway project.
//!
//! Browsers open one long-lived WebSocket per tab and send small JSON
//! requests to list directories and read files inside a fixed workspace
//! root. Each request gets exactly one JSON response on the same
//! connection:
//!
//! ```text
//! -> { "op": "read", "path": "src/main.rs" }
//! <- { "ok": true, "data": "fn main() {}", "language": "rust", ... }
//! -> { "op": "read", "path": "../../etc/passwd" }
//! <- { "ok": false, "error": "Forbidden", "message": "..." }
//! ```
//!
//! Every path is resolved by [`Workspace`], which rejects any attempt to
//! leave the root before touching the filesystem.

pub mod listener;
pub mod protocol;
pub mod workspace;

pub use listener::{BoundBridge, Bridge, BridgeConfig};
pub use protocol::{FileOp, FileRequest, FileResponse};
pub use workspace::{
    DirEntry, ErrorKind, FileContent, FileOpError, Workspace, DEFAULT_MAX_READ_BYTES,
};
