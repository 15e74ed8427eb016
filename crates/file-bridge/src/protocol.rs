use serde::{Deserialize, Serialize};

use crate::workspace::{ErrorKind, FileOpError, Workspace};

/// A file-operation request sent by the browser.
///
/// ```json
/// { "op": "list", "path": "src" }
/// { "op": "read", "path": "src/main.rs", "id": 7 }
/// ```
///
/// `id` is optional and opaque; when present it is echoed on the response so
/// the client can correlate answers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FileRequest {
    #[serde(flatten)]
    pub op: FileOp,
    #[serde(default)]
    pub id: Option<serde_json::Value>,
}

/// The operation part of a [`FileRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum FileOp {
    /// List a directory; the path defaults to the workspace root.
    List {
        #[serde(default = "root_path")]
        path: String,
    },
    /// Read a file as text.
    Read { path: String },
}

fn root_path() -> String {
    ".".to_string()
}

/// The single response produced for each request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Only set for `read`: the path that was read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Only set for `read`: language hint for highlighting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<&'static str>,
    /// Only set for `read`: file size in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl FileResponse {
    fn success(id: Option<serde_json::Value>, data: serde_json::Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            path: None,
            language: None,
            size: None,
            error: None,
            message: None,
        }
    }

    /// Build an error response from a [`FileOpError`].
    pub fn failure(id: Option<serde_json::Value>, err: &FileOpError) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            path: None,
            language: None,
            size: None,
            error: Some(err.kind()),
            message: Some(err.to_string()),
        }
    }

    /// Error response for a message that could not be parsed as a request.
    pub fn malformed(id: Option<serde_json::Value>, reason: impl Into<String>) -> Self {
        Self::failure(id, &FileOpError::MalformedRequest(reason.into()))
    }
}

/// The `id` of a message that failed to parse as a request, if the message
/// is at least a JSON object carrying one.
pub fn request_id(text: &str) -> Option<serde_json::Value> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    value.get("id").filter(|id| !id.is_null()).cloned()
}

/// Parse a raw text frame into a request.
pub fn parse_request(text: &str) -> Result<FileRequest, FileOpError> {
    serde_json::from_str(text).map_err(|err| FileOpError::MalformedRequest(err.to_string()))
}

/// Execute one request against the workspace and build its response.
pub async fn handle_request(workspace: &Workspace, request: FileRequest) -> FileResponse {
    let FileRequest { op, id } = request;
    match op {
        FileOp::List { path } => match workspace.list(&path).await {
            Ok(entries) => match serde_json::to_value(entries) {
                Ok(data) => FileResponse::success(id, data),
                Err(err) => FileResponse::failure(id, &FileOpError::Io(err.into())),
            },
            Err(err) => FileResponse::failure(id, &err),
        },
        FileOp::Read { path } => match workspace.read(&path).await {
            Ok(file) => {
                let mut response =
                    FileResponse::success(id, serde_json::Value::String(file.content));
                response.path = Some(path);
                response.language = Some(file.language);
                response.size = Some(file.size);
                response
            }
            Err(err) => FileResponse::failure(id, &err),
        },
    }
}
