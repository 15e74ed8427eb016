use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncReadExt;

/// Default cap on the size of a file loaded by `read`.
pub const DEFAULT_MAX_READ_BYTES: u64 = 4 * 1024 * 1024;

/// How many rounds of percent-decoding are applied to a requested path
/// before giving up on it.
const MAX_DECODE_ROUNDS: usize = 4;

/// Machine-readable error kinds sent back to the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    TooLarge,
    MalformedRequest,
    NotADirectory,
    IsADirectory,
    Internal,
}

/// Errors produced by workspace file operations.
#[derive(Debug, Error)]
pub enum FileOpError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("path escapes the workspace root: {0}")]
    Forbidden(String),

    #[error("file is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FileOpError {
    /// The wire-level kind for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FileOpError::NotFound(_) => ErrorKind::NotFound,
            FileOpError::Forbidden(_) => ErrorKind::Forbidden,
            FileOpError::TooLarge { .. } => ErrorKind::TooLarge,
            FileOpError::MalformedRequest(_) => ErrorKind::MalformedRequest,
            FileOpError::NotADirectory(_) => ErrorKind::NotADirectory,
            FileOpError::IsADirectory(_) => ErrorKind::IsADirectory,
            FileOpError::Io(_) => ErrorKind::Internal,
        }
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub is_directory: bool,
}

/// The result of a successful `read`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    /// File contents decoded as UTF-8, with invalid sequences replaced.
    pub content: String,
    /// Language hint for client-side highlighting.
    pub language: &'static str,
    /// Size of the file in bytes.
    pub size: u64,
}

/// The directory all file operations are confined to.
///
/// The root is canonicalized once at construction. It is never modified
/// afterwards and can be shared freely between sessions.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: Arc<PathBuf>,
    max_read_bytes: u64,
}

impl Workspace {
    /// Open a workspace rooted at `root`. Fails if the root does not exist or
    /// is not a directory.
    pub fn new(root: impl AsRef<Path>, max_read_bytes: u64) -> io::Result<Self> {
        let root = std::fs::canonicalize(root.as_ref())?;
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("workspace root is not a directory: {}", root.display()),
            ));
        }
        Ok(Self {
            root: Arc::new(root),
            max_read_bytes,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_read_bytes(&self) -> u64 {
        self.max_read_bytes
    }

    /// Resolve a client-supplied relative path to an absolute path inside the
    /// root.
    ///
    /// Traversal is rejected lexically first, so `../missing` is `Forbidden`
    /// rather than `NotFound`. The existing target is then canonicalized and
    /// checked again to catch symlinks pointing outside the root.
    pub async fn resolve(&self, requested: &str) -> Result<PathBuf, FileOpError> {
        let relative = normalize_relative(requested)?;
        let candidate = self.root.join(&relative);

        let canonical = match tokio::fs::canonicalize(&candidate).await {
            Ok(path) => path,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(FileOpError::NotFound(requested.to_string()));
            }
            Err(err) => return Err(FileOpError::Io(err)),
        };

        if !canonical.starts_with(self.root.as_path()) {
            return Err(FileOpError::Forbidden(requested.to_string()));
        }

        Ok(canonical)
    }

    /// List a directory. Directories come first, then files, each group
    /// ordered by name.
    pub async fn list(&self, requested: &str) -> Result<Vec<DirEntry>, FileOpError> {
        let dir = self.resolve(requested).await?;
        let metadata = tokio::fs::metadata(&dir).await?;
        if !metadata.is_dir() {
            return Err(FileOpError::NotADirectory(requested.to_string()));
        }

        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            // Follow symlinks for the directory flag; dangling links count as files.
            let is_directory = tokio::fs::metadata(entry.path())
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false);
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_directory,
            });
        }

        entries.sort_by(|a, b| {
            b.is_directory
                .cmp(&a.is_directory)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(entries)
    }

    /// Read a whole file as text, refusing anything above the size cap.
    pub async fn read(&self, requested: &str) -> Result<FileContent, FileOpError> {
        let path = self.resolve(requested).await?;
        let metadata = tokio::fs::metadata(&path).await?;
        if metadata.is_dir() {
            return Err(FileOpError::IsADirectory(requested.to_string()));
        }
        if metadata.len() > self.max_read_bytes {
            return Err(FileOpError::TooLarge {
                size: metadata.len(),
                limit: self.max_read_bytes,
            });
        }

        // The file may grow between the metadata call and the read; never
        // buffer more than the cap plus one byte.
        let file = tokio::fs::File::open(&path).await?;
        let mut bytes = Vec::with_capacity(metadata.len() as usize);
        file.take(self.max_read_bytes + 1)
            .read_to_end(&mut bytes)
            .await?;
        if bytes.len() as u64 > self.max_read_bytes {
            return Err(FileOpError::TooLarge {
                size: bytes.len() as u64,
                limit: self.max_read_bytes,
            });
        }

        Ok(FileContent {
            size: bytes.len() as u64,
            content: String::from_utf8_lossy(&bytes).into_owned(),
            language: language_hint(&path),
        })
    }
}

/// Decode and lexically normalize a requested path into a relative path
/// that cannot climb above the root.
fn normalize_relative(requested: &str) -> Result<PathBuf, FileOpError> {
    let forbidden = || FileOpError::Forbidden(requested.to_string());

    let mut decoded = requested.to_string();
    let mut stable = false;
    for _ in 0..MAX_DECODE_ROUNDS {
        // Overlong or stray escapes (`%c0%ae`, `%ff`) never name a real
        // file inside the root.
        let next = urlencoding::decode(&decoded)
            .map_err(|_| forbidden())?
            .into_owned();
        if next == decoded {
            stable = true;
            break;
        }
        decoded = next;
    }
    // Still changing after every round: refuse rather than guess.
    if !stable || decoded.contains('\0') {
        return Err(forbidden());
    }

    let decoded = decoded.replace('\\', "/");
    let mut normalized = PathBuf::new();
    for component in Path::new(&decoded).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(forbidden());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(forbidden()),
        }
    }
    Ok(normalized)
}

/// Map a file extension to a highlighting language name.
pub fn language_hint(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("rs") => "rust",
        Some("py") => "python",
        Some("js" | "mjs" | "cjs") => "javascript",
        Some("ts") => "typescript",
        Some("tsx") => "tsx",
        Some("jsx") => "jsx",
        Some("json") => "json",
        Some("html" | "htm") => "html",
        Some("css") => "css",
        Some("md" | "markdown") => "markdown",
        Some("toml") => "toml",
        Some("yaml" | "yml") => "yaml",
        Some("sh" | "bash") => "bash",
        Some("go") => "go",
        Some("c" | "h") => "c",
        Some("cpp" | "cc" | "hpp") => "cpp",
        Some("java") => "java",
        Some("rb") => "ruby",
        Some("sql") => "sql",
        Some("xml") => "xml",
        _ => "plaintext",
    }
}
