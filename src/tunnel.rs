use crate::credentials::Credentials;
use crate::error::ProxyError;
use crate::http_relay::connect_with_timeout;
use crate::policy::UpstreamTarget;
use crate::relay::{ProxyBody, empty};
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, info, warn};
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

// Upper bound on the upstream's CONNECT reply header block
const MAX_HANDSHAKE_REPLY: usize = 16 * 1024;

/// Handle a CONNECT request once authorization and selection have resolved:
/// open the outbound leg (directly, or through the upstream relay with a
/// second CONNECT handshake), answer the client with `200 OK`, then splice
/// bytes both ways until either side closes. The outbound leg is fully
/// established before the client sees any response, so a failed upstream
/// handshake still surfaces as a pre-tunnel status.
pub async fn handle_connect(
    req: Request<Incoming>,
    upstream: Option<UpstreamTarget>,
    connect_timeout: Duration,
) -> Result<Response<ProxyBody>, ProxyError> {
    let authority = connect_authority(&req)?;

    let (outbound, lookahead, label) = match upstream {
        None => {
            info!("HTTPS --> {} (direct)", authority);
            let stream = connect_with_timeout(&authority, connect_timeout).await?;
            (stream, Vec::new(), authority.clone())
        }
        Some(target) => {
            info!("HTTPS --> {} via upstream {}", authority, target.addr());
            let mut stream = connect_with_timeout(&target.addr(), connect_timeout).await?;
            let lookahead = upstream_handshake(
                &mut stream,
                &authority,
                target.credentials.as_ref(),
                connect_timeout,
            )
            .await?;
            let label = format!("{} via {}", authority, target.addr());
            (stream, lookahead, label)
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => match tunnel(upgraded, outbound, lookahead).await {
                Ok((sent, received)) => {
                    debug!("tunnel {} closed ({} bytes out, {} bytes back)", label, sent, received)
                }
                Err(e) => debug!("tunnel {} ended with error: {}", label, e),
            },
            Err(e) => warn!("connection upgrade failed for {}: {}", label, e),
        }
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(empty())
        .unwrap())
}

/// `host:port` from the CONNECT request target, port 443 implied.
pub(crate) fn connect_authority<B>(req: &Request<B>) -> Result<String, ProxyError> {
    let authority = req
        .uri()
        .authority()
        .ok_or_else(|| ProxyError::Http(format!("invalid CONNECT target: {}", req.uri())))?;

    Ok(format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(443)))
}

/// Negotiate the second CONNECT hop with the upstream relay. Writes
/// `CONNECT <authority> HTTP/1.1` with a single `Proxy-Authorization`
/// header, then buffers the reply until the end of its header block before
/// inspecting the status line; a single read may split the line, or carry
/// early tunnel bytes past it. Those surplus bytes are returned for the
/// caller to feed into the tunnel.
pub(crate) async fn upstream_handshake<S>(
    stream: &mut S,
    authority: &str,
    credentials: Option<&Credentials>,
    read_timeout: Duration,
) -> Result<Vec<u8>, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!("CONNECT {} HTTP/1.1\r\n", authority);
    if let Some(credentials) = credentials {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", credentials.to_header_value()));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut reply = Vec::with_capacity(256);
    let header_end = loop {
        let mut chunk = [0u8; 1024];
        let n = timeout(read_timeout, stream.read(&mut chunk))
            .await
            .map_err(|_| ProxyError::Timeout(format!("CONNECT reply from upstream for {}", authority)))??;
        if n == 0 {
            return Err(ProxyError::ConnectFailure(format!(
                "upstream closed during CONNECT handshake for {}",
                authority
            )));
        }
        reply.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_header_end(&reply) {
            break end;
        }
        if reply.len() > MAX_HANDSHAKE_REPLY {
            return Err(ProxyError::Http(
                "upstream CONNECT reply header block too large".to_string(),
            ));
        }
    };

    let status_line = first_line(&reply);
    if !is_connect_established(&status_line) {
        return Err(ProxyError::UpstreamRejected(status_line));
    }

    Ok(reply[header_end..].to_vec())
}

async fn tunnel(
    upgraded: Upgraded,
    mut outbound: TcpStream,
    lookahead: Vec<u8>,
) -> std::io::Result<(u64, u64)> {
    let mut client = TokioIo::new(upgraded);

    // Bytes the upstream sent past its handshake header block belong to the
    // tunnel and go to the client first
    if !lookahead.is_empty() {
        client.write_all(&lookahead).await?;
    }

    tokio::io::copy_bidirectional(&mut client, &mut outbound).await
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

fn first_line(buf: &[u8]) -> String {
    let line = buf
        .windows(2)
        .position(|w| w == b"\r\n")
        .map_or(buf, |pos| &buf[..pos]);
    String::from_utf8_lossy(line).into_owned()
}

fn is_connect_established(status_line: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?i)^HTTP/1\.[01] 200( |$)").expect("status line pattern"));
    re.is_match(status_line)
}
