use axum::response::{IntoResponse, Response};
use http::{header, HeaderValue, StatusCode};
use thiserror::Error;

/// Errors produced while handling a single gateway request.
///
/// None of these ever end the server; each one becomes a short plain-text
/// response to the client that triggered it.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The upstream could not be reached or the exchange failed midway.
    #[error("upstream {url} unreachable: {source}")]
    Upstream {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The request body exceeded the configured limit.
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    /// The request body could not be read from the client.
    #[error("failed to read request body: {0}")]
    RequestBody(String),

    /// The outbound HTTP client could not be constructed.
    #[error("failed to build upstream client: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::RequestBody(_) => StatusCode::BAD_REQUEST,
            GatewayError::ClientBuild(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, format!("remote-gateway: {self}\n")).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}
