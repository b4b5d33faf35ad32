use crate::credentials::Credentials;
use crate::error::ProxyError;
use async_trait::async_trait;
use http::header::HOST;
use http::request::Parts;
use log::debug;

/// A chained upstream relay chosen for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
}

impl UpstreamTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::new(username, password));
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Canonical outcome of the upstream selection policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Forward straight to the request's declared host.
    Direct,
    /// Forward through the given upstream relay.
    ViaUpstream(UpstreamTarget),
    /// Reject the request (429 sent to the client).
    Declined,
}

/// Decides whether a request may use the proxy. Invoked exactly once per
/// request, before upstream selection. `credentials` is `None` when the
/// client presented no (or malformed) `Proxy-Authorization` header.
#[async_trait]
pub trait AuthPolicy: Send + Sync {
    async fn authorize(
        &self,
        request: &Parts,
        credentials: Option<&Credentials>,
    ) -> Result<bool, ProxyError>;
}

/// Maps a request plus the authenticated username onto a forwarding
/// decision. The password is deliberately not a selection input.
#[async_trait]
pub trait UpstreamPolicy: Send + Sync {
    async fn select(
        &self,
        request: &Parts,
        username: Option<&str>,
    ) -> Result<Selection, ProxyError>;
}

/// Default authentication policy: every request is authorized.
pub struct AllowAll;

#[async_trait]
impl AuthPolicy for AllowAll {
    async fn authorize(&self, _request: &Parts, _credentials: Option<&Credentials>) -> Result<bool, ProxyError> {
        Ok(true)
    }
}

/// Default selection policy: every request is forwarded directly.
pub struct AlwaysDirect;

#[async_trait]
impl UpstreamPolicy for AlwaysDirect {
    async fn select(&self, _request: &Parts, _username: Option<&str>) -> Result<Selection, ProxyError> {
        Ok(Selection::Direct)
    }
}

/// Authentication against a single configured username/password pair.
pub struct StaticCredentials {
    expected: Credentials,
}

impl StaticCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            expected: Credentials::new(username, password),
        }
    }
}

#[async_trait]
impl AuthPolicy for StaticCredentials {
    async fn authorize(&self, _request: &Parts, credentials: Option<&Credentials>) -> Result<bool, ProxyError> {
        Ok(credentials == Some(&self.expected))
    }
}

/// One upstream relay plus the domain patterns it serves. An empty pattern
/// list matches every host.
#[derive(Debug, Clone)]
pub struct UpstreamRule {
    pub target: UpstreamTarget,
    pub domains: Vec<String>,
}

/// Selection by NO_PROXY-style domain patterns: the first rule whose
/// patterns match the request host wins; no match means direct forwarding.
pub struct DomainRules {
    rules: Vec<UpstreamRule>,
}

impl DomainRules {
    pub fn new(rules: Vec<UpstreamRule>) -> Self {
        Self { rules }
    }

    fn find(&self, host: &str) -> Option<&UpstreamTarget> {
        self.rules
            .iter()
            .find(|rule| rule.domains.is_empty() || matches_no_proxy_pattern(host, &rule.domains))
            .map(|rule| &rule.target)
    }
}

#[async_trait]
impl UpstreamPolicy for DomainRules {
    async fn select(&self, request: &Parts, _username: Option<&str>) -> Result<Selection, ProxyError> {
        let Some(host) = request_host(request) else {
            return Ok(Selection::Direct);
        };

        match self.find(&host) {
            Some(target) => {
                debug!("host {} matched upstream rule {}", host, target.addr());
                Ok(Selection::ViaUpstream(target.clone()))
            }
            None => Ok(Selection::Direct),
        }
    }
}

/// Host a request is addressed to: the URI authority (CONNECT and
/// absolute-form requests), falling back to the `Host` header.
pub fn request_host(request: &Parts) -> Option<String> {
    if let Some(authority) = request.uri.authority() {
        return Some(authority.host().to_string());
    }

    let host = request.headers.get(HOST)?.to_str().ok()?;
    let host = host.rsplit_once(':').map_or(host, |(h, _)| h);
    Some(host.to_string())
}

/// NO_PROXY pattern match:
/// - `example.com` matches example.com and *.example.com
/// - `.example.com` matches *.example.com only
/// - `*.example.com` matches *.example.com only
/// - `sub.example.com` matches sub.example.com exactly
fn matches_no_proxy_pattern(host: &str, patterns: &[String]) -> bool {
    let host_lower = host.to_lowercase();

    for pattern in patterns {
        let pattern_lower = pattern.to_lowercase();

        if let Some(suffix) = pattern_lower.strip_prefix('*') {
            // "*.example.com" leaves ".example.com": subdomains only
            if host_lower.ends_with(suffix) {
                return true;
            }
        } else if pattern_lower.starts_with('.') {
            // ".example.com": subdomains only
            if host_lower.ends_with(&pattern_lower) {
                return true;
            }
        } else if host_lower == pattern_lower
            || host_lower.ends_with(&format!(".{}", pattern_lower))
        {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    fn parts(uri: &str) -> Parts {
        Request::builder().uri(uri).body(()).unwrap().into_parts().0
    }

    fn parts_with_host(host: &str) -> Parts {
        Request::builder()
            .uri("/index.html")
            .header(HOST, host)
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    #[tokio::test]
    async fn test_allow_all_ignores_credentials() {
        let policy = AllowAll;
        let req = parts("http://example.com/");
        assert!(policy.authorize(&req, None).await.unwrap());
        let creds = Credentials::new("any", "thing");
        assert!(policy.authorize(&req, Some(&creds)).await.unwrap());
    }

    #[tokio::test]
    async fn test_always_direct() {
        let policy = AlwaysDirect;
        let req = parts("http://example.com/");
        assert_eq!(policy.select(&req, None).await.unwrap(), Selection::Direct);
    }

    #[tokio::test]
    async fn test_static_credentials() {
        let policy = StaticCredentials::new("user", "secret");
        let req = parts("http://example.com/");

        let good = Credentials::new("user", "secret");
        assert!(policy.authorize(&req, Some(&good)).await.unwrap());

        let bad = Credentials::new("user", "wrong");
        assert!(!policy.authorize(&req, Some(&bad)).await.unwrap());
        assert!(!policy.authorize(&req, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_domain_rules_match_and_fall_through() {
        let policy = DomainRules::new(vec![UpstreamRule {
            target: UpstreamTarget::new("relay.local", 9999),
            domains: vec!["example.com".to_string()],
        }]);

        let matched = policy.select(&parts("http://example.com/"), None).await.unwrap();
        assert_eq!(
            matched,
            Selection::ViaUpstream(UpstreamTarget::new("relay.local", 9999))
        );

        let sub = policy.select(&parts("http://www.example.com/"), None).await.unwrap();
        assert!(matches!(sub, Selection::ViaUpstream(_)));

        let other = policy.select(&parts("http://other.net/"), None).await.unwrap();
        assert_eq!(other, Selection::Direct);
    }

    #[tokio::test]
    async fn test_domain_rules_empty_pattern_list_matches_all() {
        let policy = DomainRules::new(vec![UpstreamRule {
            target: UpstreamTarget::new("relay.local", 9999),
            domains: Vec::new(),
        }]);

        let outcome = policy.select(&parts("http://anything.test/"), None).await.unwrap();
        assert!(matches!(outcome, Selection::ViaUpstream(_)));
    }

    #[test]
    fn test_no_proxy_pattern_forms() {
        let patterns = |p: &str| vec![p.to_string()];

        // bare domain: itself and subdomains
        assert!(matches_no_proxy_pattern("example.com", &patterns("example.com")));
        assert!(matches_no_proxy_pattern("a.example.com", &patterns("example.com")));
        assert!(!matches_no_proxy_pattern("notexample.com", &patterns("example.com")));

        // leading dot: subdomains only
        assert!(matches_no_proxy_pattern("a.example.com", &patterns(".example.com")));
        assert!(!matches_no_proxy_pattern("example.com", &patterns(".example.com")));

        // wildcard: subdomains only
        assert!(matches_no_proxy_pattern("a.example.com", &patterns("*.example.com")));
        assert!(!matches_no_proxy_pattern("example.com", &patterns("*.example.com")));

        // exact subdomain
        assert!(matches_no_proxy_pattern("sub.example.com", &patterns("sub.example.com")));

        // case-insensitive
        assert!(matches_no_proxy_pattern("EXAMPLE.COM", &patterns("example.com")));
    }

    #[test]
    fn test_request_host_sources() {
        assert_eq!(
            request_host(&parts("http://example.com:8080/x")).as_deref(),
            Some("example.com")
        );
        assert_eq!(
            request_host(&parts("example.com:443")).as_deref(),
            Some("example.com")
        );
        assert_eq!(
            request_host(&parts_with_host("example.com:8080")).as_deref(),
            Some("example.com")
        );
    }
}
