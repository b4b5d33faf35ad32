use crate::error::ProxyError;
use crate::policy::UpstreamTarget;
use crate::relay::ProxyBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{CONNECTION, HOST, HeaderValue, PROXY_AUTHORIZATION};
use hyper::{Request, Response, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use log::{debug, info};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Forwards plain (non-CONNECT) requests, either straight to the target
/// host or through a chained upstream relay.
pub struct HttpRelay {
    client: Client<HttpsConnector<HttpConnector>, Incoming>,
    connect_timeout: Duration,
}

impl HttpRelay {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new())
                .pool_max_idle_per_host(10)
                .pool_idle_timeout(Duration::from_secs(90))
                .build(HttpsConnector::new()),
            connect_timeout,
        }
    }

    /// Forward to the host the request itself declares. Hop-by-hop headers
    /// are stripped; everything else passes through untouched, body
    /// included.
    pub async fn forward_direct(&self, mut req: Request<Incoming>) -> Result<Response<ProxyBody>, ProxyError> {
        let target_uri = extract_target_uri(&req)?;
        info!("HTTP --> {} (direct)", target_uri);

        reconstruct_request(&mut req, &target_uri);

        let response = timeout(self.connect_timeout, self.client.request(req))
            .await
            .map_err(|_| ProxyError::Timeout(format!("request to {}", target_uri)))?
            .map_err(|e| {
                if e.is_connect() {
                    ProxyError::ConnectFailure(format!("{}: {}", target_uri, e))
                } else {
                    ProxyError::Http(e.to_string())
                }
            })?;

        debug!("forwarded to {} - status {}", target_uri, response.status());
        Ok(response.map(BodyExt::boxed))
    }

    /// Forward through an upstream relay: the request line keeps the
    /// absolute target URI, `Proxy-Authorization` is injected when the
    /// target carries credentials, and the relay does the rest. One hop,
    /// no retry, no fallback to direct.
    pub async fn forward_via_upstream(
        &self,
        req: Request<Incoming>,
        target: &UpstreamTarget,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let target_uri = extract_target_uri(&req)?;
        info!("HTTP --> {} via upstream {}", target_uri, target.addr());

        let (mut parts, body) = req.into_parts();
        parts.uri = target_uri.clone();
        if let Some(credentials) = &target.credentials {
            let value = HeaderValue::from_str(&credentials.to_header_value())
                .map_err(|e| ProxyError::Http(format!("invalid Proxy-Authorization value: {}", e)))?;
            parts.headers.insert(PROXY_AUTHORIZATION, value);
        }
        let req = Request::from_parts(parts, body);

        let stream = connect_with_timeout(&target.addr(), self.connect_timeout).await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ProxyError::Http(format!("upstream handshake: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("upstream connection ended with error: {}", e);
            }
        });

        let response = timeout(self.connect_timeout, sender.send_request(req))
            .await
            .map_err(|_| ProxyError::Timeout(format!("response from upstream {}", target.addr())))?
            .map_err(|e| ProxyError::Http(e.to_string()))?;

        debug!("upstream {} answered {}", target.addr(), response.status());
        Ok(response.map(BodyExt::boxed))
    }
}

pub(crate) async fn connect_with_timeout(addr: &str, d: Duration) -> Result<TcpStream, ProxyError> {
    timeout(d, TcpStream::connect(addr))
        .await
        .map_err(|_| ProxyError::Timeout(format!("connect to {}", addr)))?
        .map_err(|e| ProxyError::ConnectFailure(format!("{}: {}", addr, e)))
}

/// Resolve the absolute target URI: proxy clients send absolute-form
/// request lines; origin-form requests fall back to the `Host` header
/// (port 80 implied).
pub(crate) fn extract_target_uri<B>(req: &Request<B>) -> Result<Uri, ProxyError> {
    let original_uri = req.uri();

    if original_uri.scheme().is_some() && original_uri.authority().is_some() {
        return Ok(original_uri.clone());
    }

    if let Some(host) = req.headers().get(HOST) {
        let host_str = host
            .to_str()
            .map_err(|e| ProxyError::Http(format!("invalid Host header: {}", e)))?;
        let path = original_uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

        return format!("http://{}{}", host_str, path)
            .parse::<Uri>()
            .map_err(|e| ProxyError::Uri(e.to_string()));
    }

    Err(ProxyError::Http("cannot determine target URI".to_string()))
}

fn reconstruct_request<B>(req: &mut Request<B>, target_uri: &Uri) {
    *req.uri_mut() = target_uri.clone();

    // Hop-by-hop headers stop at this proxy
    let headers = req.headers_mut();
    headers.remove(CONNECTION);
    headers.remove("proxy-connection");
    headers.remove("keep-alive");
    headers.remove("proxy-authenticate");
    headers.remove(PROXY_AUTHORIZATION);
    headers.remove("te");
    headers.remove("trailers");
    headers.remove("transfer-encoding");
    headers.remove("upgrade");
}
