use base64::{Engine as _, engine::general_purpose};
use http::HeaderMap;
use http::header::PROXY_AUTHORIZATION;

/// Basic-auth credentials extracted from a `Proxy-Authorization` header.
/// Request-scoped; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Decode a `Basic <base64>` header value. Returns `None` when the scheme
    /// is not Basic, the base64 payload does not decode to UTF-8, or the
    /// decoded value carries no `:` separator. Username and password may both
    /// be empty; the first colon is always the split point.
    pub fn from_header_value(value: &str) -> Option<Self> {
        let encoded = strip_basic_scheme(value)?;
        let decoded = general_purpose::STANDARD.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Some(Self::new(username, password))
    }

    /// Extract credentials from a request's `Proxy-Authorization` header.
    pub fn from_request(headers: &HeaderMap) -> Option<Self> {
        let value = headers.get(PROXY_AUTHORIZATION)?.to_str().ok()?;
        Self::from_header_value(value)
    }

    /// Produce the `Basic <base64(username:password)>` header value. Exact
    /// inverse of [`from_header_value`] for NUL-free credentials; colons in
    /// the username are not escaped.
    pub fn to_header_value(&self) -> String {
        let pair = format!("{}:{}", self.username, self.password);
        format!("Basic {}", general_purpose::STANDARD.encode(pair.as_bytes()))
    }
}

fn strip_basic_scheme(value: &str) -> Option<&str> {
    let (scheme, rest) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("Basic") {
        Some(rest)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_encode_decode_round_trip() {
        let creds = Credentials::new("user", "secret");
        let decoded = Credentials::from_header_value(&creds.to_header_value()).unwrap();
        assert_eq!(decoded, creds);
    }

    #[test]
    fn test_decode_known_value() {
        // base64("u:p") == "dTpw"
        let creds = Credentials::from_header_value("Basic dTpw").unwrap();
        assert_eq!(creds.username, "u");
        assert_eq!(creds.password, "p");
    }

    #[test]
    fn test_decode_scheme_is_case_insensitive() {
        assert!(Credentials::from_header_value("basic dTpw").is_some());
        assert!(Credentials::from_header_value("BASIC dTpw").is_some());
    }

    #[test]
    fn test_decode_rejects_other_schemes() {
        assert!(Credentials::from_header_value("Bearer dTpw").is_none());
        assert!(Credentials::from_header_value("Digest dTpw").is_none());
    }

    #[test]
    fn test_decode_rejects_invalid_base64() {
        assert!(Credentials::from_header_value("Basic !!!not-base64!!!").is_none());
    }

    #[test]
    fn test_decode_rejects_missing_colon() {
        // base64("nocolon") == "bm9jb2xvbg=="
        assert!(Credentials::from_header_value("Basic bm9jb2xvbg==").is_none());
    }

    #[test]
    fn test_empty_username_and_password_are_accepted() {
        let round = |u: &str, p: &str| {
            Credentials::from_header_value(&Credentials::new(u, p).to_header_value()).unwrap()
        };
        assert_eq!(round("", "pw"), Credentials::new("", "pw"));
        assert_eq!(round("user", ""), Credentials::new("user", ""));
        assert_eq!(round("", ""), Credentials::new("", ""));
    }

    #[test]
    fn test_first_colon_wins() {
        let creds = Credentials::new("user", "pa:ss:wd");
        let decoded = Credentials::from_header_value(&creds.to_header_value()).unwrap();
        assert_eq!(decoded.username, "user");
        assert_eq!(decoded.password, "pa:ss:wd");
    }

    #[test]
    fn test_from_request() {
        let mut headers = HeaderMap::new();
        assert!(Credentials::from_request(&headers).is_none());

        headers.insert(PROXY_AUTHORIZATION, HeaderValue::from_static("Basic dTpw"));
        let creds = Credentials::from_request(&headers).unwrap();
        assert_eq!(creds, Credentials::new("u", "p"));
    }
}
