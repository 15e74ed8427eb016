use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures_util::StreamExt;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use http_body_util::LengthLimitError;
use tokio::net::TcpListener;

use crate::error::GatewayError;
use crate::rewrite::{run_rules, RewriteRule};

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// A request path answered from a local file instead of the upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticRoute {
    /// Exact request path, e.g. `/mobile`.
    pub path: String,
    /// File name relative to the static directory.
    pub file: PathBuf,
}

/// Configuration for the HTTP gateway.
pub struct GatewayConfig {
    /// Address to bind the public listener to.
    pub listen_addr: SocketAddr,
    /// Upstream origin, e.g. `http://127.0.0.1:9090`.
    pub upstream_origin: String,
    /// Upper bound on establishing the upstream connection.
    pub connect_timeout: Duration,
    /// Largest request body that is buffered and forwarded.
    pub max_body_bytes: usize,
    /// Largest response body buffered for rewriting. Bigger responses are
    /// streamed through unchanged.
    pub max_rewrite_bytes: usize,
    /// Directory holding locally served assets. Static routes are disabled
    /// when unset.
    pub static_dir: Option<PathBuf>,
    pub static_routes: Vec<StaticRoute>,
    /// Ordered response rewrite rules.
    pub rules: Vec<Arc<dyn RewriteRule>>,
}

struct GatewayState {
    config: GatewayConfig,
    client: reqwest::Client,
}

/// The HTTP reverse proxy.
///
/// Forwards every request to the upstream origin, runs matching responses
/// through the rewrite rules and marks every response as readable from any
/// origin.
pub struct Gateway {
    state: Arc<GatewayState>,
}

/// A gateway whose listening socket is already bound.
pub struct BoundGateway {
    listener: TcpListener,
    router: Router,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(GatewayError::ClientBuild)?;

        Ok(Self {
            state: Arc::new(GatewayState { config, client }),
        })
    }

    /// Build the axum router serving this gateway.
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(handle)
            .with_state(Arc::clone(&self.state))
    }

    pub async fn bind(&self) -> std::io::Result<BoundGateway> {
        let listener = TcpListener::bind(self.state.config.listen_addr).await?;
        tracing::info!(
            addr = %self.state.config.listen_addr,
            upstream = %self.state.config.upstream_origin,
            rules = self.state.config.rules.len(),
            "http-gateway listening"
        );
        Ok(BoundGateway {
            listener,
            router: self.router(),
        })
    }

    /// Bind and serve until the server fails.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.bind().await?.run().await
    }
}

impl BoundGateway {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        axum::serve(self.listener, self.router).await?;
        Ok(())
    }
}

/// Entry point for every request.
async fn handle(State(state): State<Arc<GatewayState>>, req: Request) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let local = if is_preflight(&req) {
        Some(preflight())
    } else {
        serve_static(&state, &method, &path).await
    };

    let mut response = match local {
        Some(response) => response,
        None => match forward(&state, req).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(%method, %path, %err, "proxy request failed");
                err.into_response()
            }
        },
    };

    allow_any_origin(response.headers_mut());
    tracing::debug!(%method, %path, status = response.status().as_u16(), "request handled");
    response
}

fn is_preflight(req: &Request) -> bool {
    req.method() == Method::OPTIONS
        && req
            .headers()
            .contains_key(header::ACCESS_CONTROL_REQUEST_METHOD)
}

fn preflight() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, PATCH, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("600"),
    );
    response
}

fn allow_any_origin(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
}

/// Answer the request from the static directory if a route matches and the
/// file exists.
async fn serve_static(state: &GatewayState, method: &Method, path: &str) -> Option<Response> {
    if method != Method::GET && method != Method::HEAD {
        return None;
    }
    let dir = state.config.static_dir.as_ref()?;
    let route = state
        .config
        .static_routes
        .iter()
        .find(|route| route.path == path)?;

    let file = dir.join(&route.file);
    let bytes = match tokio::fs::read(&file).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::debug!(file = %file.display(), %err, "static file unavailable; proxying instead");
            return None;
        }
    };

    let content_type = content_type_for(&file);
    let body = rewrite_body(state, content_type, Bytes::from(bytes));

    let mut response = Response::new(Body::from(body));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type),
    );
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store"),
    );
    Some(response)
}

/// Proxy the request to the upstream origin.
async fn forward(state: &GatewayState, req: Request) -> Result<Response, GatewayError> {
    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!(
        "{}{}",
        state.config.upstream_origin.trim_end_matches('/'),
        path_and_query
    );

    let limit = state.config.max_body_bytes;
    let body = axum::body::to_bytes(body, limit).await.map_err(|err| {
        if is_length_limit(&err) {
            GatewayError::BodyTooLarge { limit }
        } else {
            GatewayError::RequestBody(err.to_string())
        }
    })?;

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    // The client sets Host from the upstream URL; identity encoding keeps
    // bodies rewritable.
    headers.remove(header::HOST);
    headers.remove(header::ACCEPT_ENCODING);
    headers.remove(header::CONTENT_LENGTH);

    let upstream = state
        .client
        .request(parts.method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|source| GatewayError::Upstream {
            url: url.clone(),
            source,
        })?;

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let rewritable = state
        .config
        .rules
        .iter()
        .any(|rule| rule.matches(&content_type));

    // Event streams and other long-lived bodies must flow as they arrive,
    // so only bodies a rule could change are collected.
    let body = if !rewritable {
        Body::from_stream(upstream.bytes_stream())
    } else {
        match buffer_upstream(upstream, state.config.max_rewrite_bytes)
            .await
            .map_err(|source| GatewayError::Upstream { url: url.clone(), source })?
        {
            Buffered::Complete(body) => {
                headers.remove(header::CONTENT_LENGTH);
                Body::from(rewrite_body(state, &content_type, body))
            }
            Buffered::Overflow { prefix, rest } => {
                tracing::debug!(
                    %url,
                    limit = state.config.max_rewrite_bytes,
                    "response too large to rewrite; streaming it unchanged"
                );
                let head = futures_util::stream::once(async move { Ok::<_, reqwest::Error>(prefix) });
                Body::from_stream(head.chain(rest.bytes_stream()))
            }
        }
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

/// An upstream body read up to the rewrite limit.
enum Buffered {
    Complete(Bytes),
    /// The limit was crossed; `prefix` holds what was read so far.
    Overflow {
        prefix: Bytes,
        rest: reqwest::Response,
    },
}

async fn buffer_upstream(
    mut upstream: reqwest::Response,
    limit: usize,
) -> Result<Buffered, reqwest::Error> {
    let mut buf = Vec::new();
    while let Some(chunk) = upstream.chunk().await? {
        buf.extend_from_slice(&chunk);
        if buf.len() > limit {
            return Ok(Buffered::Overflow {
                prefix: Bytes::from(buf),
                rest: upstream,
            });
        }
    }
    Ok(Buffered::Complete(Bytes::from(buf)))
}

/// Whether reading a body failed because it crossed the size limit.
fn is_length_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(cause) = source {
        if cause.is::<LengthLimitError>() {
            return true;
        }
        source = cause.source();
    }
    false
}

/// Apply the rewrite rules to a UTF-8 body; anything else passes through.
fn rewrite_body(state: &GatewayState, content_type: &str, body: Bytes) -> Bytes {
    if state.config.rules.is_empty() {
        return body;
    }
    let Ok(text) = std::str::from_utf8(&body) else {
        return body;
    };
    match run_rules(&state.config.rules, content_type, text) {
        Some(rewritten) => Bytes::from(rewritten),
        None => body,
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js" | "mjs") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::MobileViewportRule;
    use axum::routing::get;

    const PAGE: &str = "<html><head></head><body>x</body></html>";
    const REWRITE_LIMIT: usize = 256;

    fn big_page() -> String {
        format!("<html><head></head><body>{}</body></html>", "x".repeat(1024))
    }

    /// A fake upstream: `/` serves HTML, `/echo` describes the request,
    /// `/json` serves JSON, `/big` serves HTML over the rewrite limit and
    /// `/events` sends one event and then never finishes.
    async fn start_upstream() -> SocketAddr {
        async fn echo(method: Method, headers: HeaderMap, body: Bytes) -> String {
            let host = headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            format!("{method} host={host} body={}", String::from_utf8_lossy(&body))
        }

        let app = Router::new()
            .route(
                "/",
                get(|| async { ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], PAGE) }),
            )
            .route(
                "/json",
                get(|| async { ([(header::CONTENT_TYPE, "application/json")], "{\"head\":1}") }),
            )
            .route("/echo", axum::routing::any(echo))
            .route(
                "/big",
                get(|| async { ([(header::CONTENT_TYPE, "text/html")], big_page()) }),
            )
            .route(
                "/events",
                get(|| async {
                    let first = futures_util::stream::once(async {
                        Ok::<_, std::convert::Infallible>(Bytes::from_static(b"data: hello\n\n"))
                    });
                    let stream = first.chain(futures_util::stream::pending());
                    (
                        [(header::CONTENT_TYPE, "text/event-stream")],
                        Body::from_stream(stream),
                    )
                }),
            );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn start_gateway(upstream_origin: String, static_dir: Option<PathBuf>) -> SocketAddr {
        let gateway = Gateway::new(GatewayConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            upstream_origin,
            connect_timeout: Duration::from_secs(2),
            max_body_bytes: 1024,
            max_rewrite_bytes: REWRITE_LIMIT,
            static_dir,
            static_routes: vec![StaticRoute {
                path: "/mobile".to_string(),
                file: PathBuf::from("mobile.html"),
            }],
            rules: vec![Arc::new(MobileViewportRule::new())],
        })
        .unwrap();
        let bound = gateway.bind().await.unwrap();
        let addr = bound.local_addr().unwrap();
        tokio::spawn(bound.run());
        addr
    }

    #[tokio::test]
    async fn html_is_rewritten_and_cors_added() {
        let upstream = start_upstream().await;
        let gateway = start_gateway(format!("http://{upstream}"), None).await;

        let resp = reqwest::get(format!("http://{gateway}/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
        let body = resp.text().await.unwrap();

        let head_start = body.find("<head>").unwrap();
        let head_end = body.find("</head>").unwrap();
        let head = &body[head_start..head_end];
        assert!(head.contains(r#"<meta name="viewport""#));
        assert!(body.contains("<body>x</body>"));
    }

    #[tokio::test]
    async fn non_html_passes_through_untouched() {
        let upstream = start_upstream().await;
        let gateway = start_gateway(format!("http://{upstream}"), None).await;

        let resp = reqwest::get(format!("http://{gateway}/json")).await.unwrap();
        assert!(resp.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
        assert_eq!(resp.text().await.unwrap(), "{\"head\":1}");
    }

    #[tokio::test]
    async fn method_body_and_host_are_forwarded() {
        let upstream = start_upstream().await;
        let gateway = start_gateway(format!("http://{upstream}"), None).await;

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("http://{gateway}/echo"))
            .body("payload")
            .send()
            .await
            .unwrap();
        let text = resp.text().await.unwrap();
        assert_eq!(text, format!("POST host={upstream} body=payload"));
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let upstream = start_upstream().await;
        let gateway = start_gateway(format!("http://{upstream}"), None).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{gateway}/echo"))
            .body(vec![b'a'; 4096])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn dead_upstream_yields_bad_gateway() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);
        let gateway = start_gateway(format!("http://{dead_addr}"), None).await;

        let resp = tokio::time::timeout(
            Duration::from_secs(10),
            reqwest::get(format!("http://{gateway}/anything")),
        )
        .await
        .expect("gateway hung on a dead upstream")
        .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert!(resp.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
        assert!(resp.text().await.unwrap().contains("unreachable"));
    }

    #[tokio::test]
    async fn preflight_is_answered_locally() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);
        let gateway = start_gateway(format!("http://{dead_addr}"), None).await;

        let resp = reqwest::Client::new()
            .request(Method::OPTIONS, format!("http://{gateway}/api"))
            .header(header::ORIGIN, "http://phone.local")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
        assert!(resp.headers().contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
    }

    #[tokio::test]
    async fn static_route_is_served_and_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mobile.html"), "<html><head></head><body>m</body></html>")
            .unwrap();
        let upstream = start_upstream().await;
        let gateway =
            start_gateway(format!("http://{upstream}"), Some(dir.path().to_path_buf())).await;

        let resp = reqwest::get(format!("http://{gateway}/mobile")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.text().await.unwrap();
        assert!(body.contains("<body>m</body>"));
        assert!(body.contains("viewport"));
    }

    #[tokio::test]
    async fn event_stream_is_relayed_before_upstream_finishes() {
        let upstream = start_upstream().await;
        let gateway = start_gateway(format!("http://{upstream}"), None).await;

        let mut resp = tokio::time::timeout(
            Duration::from_secs(3),
            reqwest::get(format!("http://{gateway}/events")),
        )
        .await
        .expect("headers of an open event stream were held back")
        .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));

        let chunk = tokio::time::timeout(Duration::from_secs(3), resp.chunk())
            .await
            .expect("first event was held back")
            .unwrap()
            .unwrap();
        assert!(String::from_utf8_lossy(&chunk).contains("data: hello"));
    }

    #[tokio::test]
    async fn html_over_rewrite_limit_streams_unchanged() {
        let upstream = start_upstream().await;
        let gateway = start_gateway(format!("http://{upstream}"), None).await;

        let resp = reqwest::get(format!("http://{gateway}/big")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.text().await.unwrap(), big_page());
    }

    #[tokio::test]
    async fn length_limit_errors_are_recognised() {
        let err = axum::body::to_bytes(Body::from(vec![0u8; 10]), 4)
            .await
            .unwrap_err();
        assert!(is_length_limit(&err));

        let other = axum::Error::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "length limit exceeded",
        ));
        assert!(!is_length_limit(&other));
    }

    #[tokio::test]
    async fn static_route_only_answers_get_and_head() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mobile.html"), PAGE).unwrap();
        let upstream = start_upstream().await;
        let gateway =
            start_gateway(format!("http://{upstream}"), Some(dir.path().to_path_buf())).await;

        // The fake upstream has no /mobile route.
        let resp = reqwest::Client::new()
            .post(format!("http://{gateway}/mobile"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn handler_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}

        let gateway = Gateway::new(GatewayConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            upstream_origin: "http://127.0.0.1:1".to_string(),
            connect_timeout: Duration::from_secs(1),
            max_body_bytes: 1024,
            max_rewrite_bytes: REWRITE_LIMIT,
            static_dir: None,
            static_routes: Vec::new(),
            rules: Vec::new(),
        })
        .unwrap();
        let fut = handle(State(Arc::clone(&gateway.state)), Request::new(Body::empty()));
        assert_send(&fut);
    }
}
