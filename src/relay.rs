use crate::config::RelayConfig;
use crate::credentials::Credentials;
use crate::error::ProxyError;
use crate::http_relay::HttpRelay;
use crate::policy::{
    AllowAll, AlwaysDirect, AuthPolicy, DomainRules, Selection, StaticCredentials, UpstreamPolicy,
    UpstreamRule, UpstreamTarget,
};
use crate::tunnel;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{CONNECTION, HeaderValue, PROXY_AUTHENTICATE};
use hyper::{Method, Request, Response, StatusCode};
use log::{info, warn};
use std::convert::Infallible;
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub(crate) fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

/// The relay facade: per request, extract credentials, run the
/// authentication policy, run the upstream selection policy, then hand off
/// to plain-HTTP forwarding or CONNECT tunneling. Exactly one terminal
/// action happens per request: a 407/429/401 rejection, a direct forward,
/// or an upstream forward.
pub struct RelayProxy {
    auth_policy: RwLock<Arc<dyn AuthPolicy>>,
    upstream_policy: RwLock<Arc<dyn UpstreamPolicy>>,
    http: HttpRelay,
    connect_timeout: Duration,
}

impl RelayProxy {
    /// Build a relay from configuration. Configured client credentials
    /// install a static-credential authentication policy, configured
    /// upstreams install a domain-rule selection policy; otherwise the
    /// defaults (allow everything, forward directly) apply.
    pub fn new(config: &RelayConfig) -> Self {
        let auth_policy: Arc<dyn AuthPolicy> = match (&config.proxy_username, &config.proxy_password)
        {
            (Some(username), Some(password)) => Arc::new(StaticCredentials::new(username, password)),
            _ => Arc::new(AllowAll),
        };

        let upstream_policy: Arc<dyn UpstreamPolicy> = if config.upstreams.is_empty() {
            Arc::new(AlwaysDirect)
        } else {
            let rules = config
                .upstreams
                .iter()
                .map(|upstream| {
                    let mut target = UpstreamTarget::new(upstream.host.clone(), upstream.port);
                    if let (Some(username), Some(password)) = (&upstream.username, &upstream.password)
                    {
                        target = target.with_credentials(username, password);
                    }
                    UpstreamRule {
                        target,
                        domains: upstream.domains.clone(),
                    }
                })
                .collect();
            Arc::new(DomainRules::new(rules))
        };

        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);

        Self {
            auth_policy: RwLock::new(auth_policy),
            upstream_policy: RwLock::new(upstream_policy),
            http: HttpRelay::new(connect_timeout),
            connect_timeout,
        }
    }

    /// Replace the authentication policy. Safe while requests are in
    /// flight; each request reads the policy once at its start.
    pub fn set_auth_policy(&self, policy: Arc<dyn AuthPolicy>) {
        *self.auth_policy.write().expect("auth policy lock") = policy;
    }

    /// Replace the upstream selection policy.
    pub fn set_upstream_policy(&self, policy: Arc<dyn UpstreamPolicy>) {
        *self.upstream_policy.write().expect("upstream policy lock") = policy;
    }

    /// Service entry point for the listener. Never fails: pipeline errors
    /// map onto their terminal client responses.
    pub async fn handle(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>, Infallible> {
        match self.process(req).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!("{}", e);
                Ok(error_response(&e))
            }
        }
    }

    async fn process(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>, ProxyError> {
        let (parts, body) = req.into_parts();

        let credentials = Credentials::from_request(&parts.headers);

        // Authorization strictly precedes selection; a denial means the
        // selector is never consulted.
        let auth_policy = self.auth_policy.read().expect("auth policy lock").clone();
        let authorized = match auth_policy.authorize(&parts, credentials.as_ref()).await {
            Ok(authorized) => authorized,
            Err(e) => {
                warn!("authentication policy failed: {}", e);
                false
            }
        };
        if !authorized {
            return Err(ProxyError::AuthDenied);
        }

        let username = credentials.as_ref().map(|c| c.username.as_str());
        let upstream_policy = self.upstream_policy.read().expect("upstream policy lock").clone();
        let selection = match upstream_policy.select(&parts, username).await {
            Ok(selection) => selection,
            Err(e) => {
                warn!("upstream selection policy failed: {}", e);
                Selection::Declined
            }
        };

        let req = Request::from_parts(parts, body);
        let is_connect = req.method() == Method::CONNECT;

        match selection {
            Selection::Declined => {
                info!("declined {} {}", req.method(), req.uri());
                Err(ProxyError::NoUpstreamAvailable)
            }
            Selection::Direct if is_connect => {
                tunnel::handle_connect(req, None, self.connect_timeout).await
            }
            Selection::ViaUpstream(target) if is_connect => {
                tunnel::handle_connect(req, Some(target), self.connect_timeout).await
            }
            Selection::Direct => self.http.forward_direct(req).await,
            Selection::ViaUpstream(target) => self.http.forward_via_upstream(req, &target).await,
        }
    }
}

fn error_response(error: &ProxyError) -> Response<ProxyBody> {
    match error {
        ProxyError::AuthDenied => Response::builder()
            .status(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
            .header(PROXY_AUTHENTICATE, HeaderValue::from_static("Basic realm=\"remotehost\""))
            .header(CONNECTION, HeaderValue::from_static("close"))
            .body(empty())
            .unwrap(),
        ProxyError::NoUpstreamAvailable => Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .header(CONNECTION, HeaderValue::from_static("close"))
            .body(full("No proxy available to service request"))
            .unwrap(),
        ProxyError::UpstreamRejected(_) => Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header(CONNECTION, HeaderValue::from_static("close"))
            .body(full("Upstream proxy rejected the request"))
            .unwrap(),
        _ => Response::builder()
            .status(StatusCode::BAD_GATEWAY)
            .body(full(format!("Proxy Error: {}", error)))
            .unwrap(),
    }
}
