use crate::error::ProxyError;
use crate::relay::RelayProxy;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{debug, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// TCP listener loop in front of the relay: one task per connection,
/// http/1.1 with CONNECT upgrades enabled.
pub struct RelayServer {
    relay: Arc<RelayProxy>,
    listener: TcpListener,
}

impl RelayServer {
    pub async fn bind(addr: SocketAddr, relay: Arc<RelayProxy>) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await.map_err(ProxyError::Io)?;
        Ok(Self { relay, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        self.listener.local_addr().map_err(ProxyError::Io)
    }

    pub async fn run(self) -> Result<(), ProxyError> {
        info!("Relay proxy listening on: {}", self.local_addr()?);

        loop {
            let (stream, remote_addr) = self.listener.accept().await.map_err(ProxyError::Io)?;
            let relay = self.relay.clone();

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let relay = relay.clone();
                    async move { relay.handle(req).await }
                });

                if let Err(e) = ServerBuilder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    debug!("connection from {} ended with error: {}", remote_addr, e);
                }
            });
        }
    }
}
