use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("proxy authorization not supplied (407 response sent)")]
    AuthDenied,

    #[error("no remote proxies available (429 response sent)")]
    NoUpstreamAvailable,

    #[error("upstream proxy rejected the request: {0}")]
    UpstreamRejected(String),

    #[error("connect failure: {0}")]
    ConnectFailure(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("URI error: {0}")]
    Uri(String),
}
