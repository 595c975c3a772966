//! HTTP reverse proxy to the backend
//!
//! Uses the pooled hyper client so keep-alive connections to the backend are
//! reused across requests from both listeners. Bodies are streamed in both
//! directions; nothing is buffered. Protocol upgrades (WebSocket) are handed
//! through by splicing the two upgraded connections together.

use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, CONNECTION, UPGRADE};
use http::{Request, Response, StatusCode, Uri, Version};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Body type of proxied responses
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Idle time before a pooled backend connection is dropped
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Headers that describe a single hop and never cross the proxy
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Upstream address (`host:port`) of the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    authority: String,
}

impl ProxyTarget {
    pub fn new(authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
        }
    }

    /// Backend on the loopback interface
    pub fn local(port: u16) -> Self {
        Self::new(format!("127.0.0.1:{}", port))
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Rewrite an inbound request URI onto this target, keeping path and query
    pub fn uri_for(&self, original: &Uri) -> Result<Uri, ProxyError> {
        let path_and_query = original
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        Uri::builder()
            .scheme("http")
            .authority(self.authority.as_str())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| ProxyError::InvalidUri(e.to_string()))
    }
}

impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}", self.authority)
    }
}

/// Proxy errors
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Invalid upstream URI: {0}")]
    InvalidUri(String),

    #[error("Backend request failed: {0}")]
    Upstream(String),

    #[error("Backend switched protocols without an upgrade request")]
    UnexpectedUpgrade,
}

/// Reverse proxy handler shared by every listener
pub struct ProxyHandler {
    target: ProxyTarget,
    client: Client<HttpConnector, Incoming>,
}

impl fmt::Debug for ProxyHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyHandler")
            .field("target", &self.target)
            .finish()
    }
}

impl ProxyHandler {
    pub fn new(target: ProxyTarget) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build(connector);

        Self { target, client }
    }

    /// Forward one request. Backend failures become `502 Bad Gateway`.
    pub async fn handle(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>, Infallible> {
        let method = req.method().clone();
        let uri = req.uri().clone();

        match self.forward(req).await {
            Ok(response) => {
                debug!("{} {} -> {}", method, uri, response.status());
                Ok(response)
            }
            Err(e) => {
                warn!("Proxy error for {} {}: {}", method, uri, e);
                Ok(error_response(StatusCode::BAD_GATEWAY, e.to_string()))
            }
        }
    }

    async fn forward(&self, mut req: Request<Incoming>) -> Result<Response<ProxyBody>, ProxyError> {
        let upgrade = upgrade_protocol(req.headers());
        let client_upgrade = upgrade.as_ref().map(|_| hyper::upgrade::on(&mut req));

        let uri = self.target.uri_for(req.uri())?;
        *req.uri_mut() = uri;
        *req.version_mut() = Version::HTTP_11;

        remove_hop_by_hop(req.headers_mut());
        if let Some(protocol) = &upgrade {
            req.headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("upgrade"));
            req.headers_mut().insert(UPGRADE, protocol.clone());
        }

        let mut response = self
            .client
            .request(req)
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let client_upgrade = client_upgrade.ok_or(ProxyError::UnexpectedUpgrade)?;
            let backend_upgrade = hyper::upgrade::on(&mut response);
            tokio::spawn(splice(client_upgrade, backend_upgrade));

            let protocol = response.headers().get(UPGRADE).cloned();
            remove_hop_by_hop(response.headers_mut());
            response
                .headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("upgrade"));
            if let Some(protocol) = protocol {
                response.headers_mut().insert(UPGRADE, protocol);
            }
            return Ok(response.map(|body| body.boxed()));
        }

        remove_hop_by_hop(response.headers_mut());
        Ok(response.map(|body| body.boxed()))
    }
}

/// Protocol named in `Upgrade` when `Connection` asks for an upgrade
fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    if wants_upgrade {
        headers.get(UPGRADE).cloned()
    } else {
        None
    }
}

/// Strip hop-by-hop headers, including any named by `Connection`
fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    for name in &named {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Pipe an upgraded client connection to the upgraded backend connection
async fn splice(client: OnUpgrade, backend: OnUpgrade) {
    let (client, backend) = match tokio::try_join!(client, backend) {
        Ok(pair) => pair,
        Err(e) => {
            debug!("Upgrade handshake failed: {}", e);
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut backend = TokioIo::new(backend);
    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((sent, received)) => {
            debug!("Upgraded connection closed ({} bytes up, {} bytes down)", sent, received)
        }
        Err(e) => debug!("Upgraded connection ended: {}", e),
    }
}

fn error_response(status: StatusCode, message: String) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(message))
        .map_err(|never| match never {})
        .boxed();

    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
