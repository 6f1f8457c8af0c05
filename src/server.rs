use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::server::Acceptor;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::LazyConfigAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::forward::{Forwarder, Scheme};
use crate::tls::{CertResolver, server_config};

/// Accept loop for plaintext HTTP. Runs until `shutdown` fires.
pub async fn serve_http(listener: TcpListener, forwarder: Arc<Forwarder>, shutdown: CancellationToken) {
    log_ready(&listener, Scheme::Http);

    while let Some((stream, peer)) = accept(&listener, &shutdown, Scheme::Http).await {
        let forwarder = Arc::clone(&forwarder);
        tokio::spawn(serve_connection(stream, forwarder, Scheme::Http, peer));
    }
}

/// Accept loop for TLS. The certificate for each connection is picked from the
/// ClientHello's SNI before the handshake proceeds.
pub async fn serve_https(
    listener: TcpListener,
    resolver: Arc<CertResolver>,
    forwarder: Arc<Forwarder>,
    shutdown: CancellationToken,
) {
    log_ready(&listener, Scheme::Https);

    while let Some((stream, peer)) = accept(&listener, &shutdown, Scheme::Https).await {
        let resolver = Arc::clone(&resolver);
        let forwarder = Arc::clone(&forwarder);
        tokio::spawn(async move {
            if let Err(err) = handle_tls(stream, peer, resolver, forwarder).await {
                warn!(%peer, "TLS connection failed: {err:#}");
            }
        });
    }
}

async fn accept(
    listener: &TcpListener,
    shutdown: &CancellationToken,
    scheme: Scheme,
) -> Option<(TcpStream, SocketAddr)> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(%scheme, "listener stopped");
                return None;
            }
            accepted = listener.accept() => match accepted {
                Ok(conn) => return Some(conn),
                Err(error) => warn!(%scheme, %error, "accept failed"),
            },
        }
    }
}

fn log_ready(listener: &TcpListener, scheme: Scheme) {
    match listener.local_addr() {
        Ok(addr) => info!(%scheme, %addr, "listening"),
        Err(error) => warn!(%scheme, %error, "listening on unknown address"),
    }
}

async fn handle_tls(
    stream: TcpStream,
    peer: SocketAddr,
    resolver: Arc<CertResolver>,
    forwarder: Arc<Forwarder>,
) -> anyhow::Result<()> {
    let local_ip = stream.local_addr()?.ip();
    let start = LazyConfigAcceptor::new(Acceptor::default(), stream)
        .await
        .context("reading ClientHello")?;

    // without SNI the client dialed an address, so impersonate that address
    let hostname = match start.client_hello().server_name() {
        Some(name) => name.to_owned(),
        None => local_ip.to_string(),
    };

    let key = resolver.resolve(&hostname).await?;
    let tls = start
        .into_stream(server_config(key))
        .await
        .with_context(|| format!("{hostname}: handshake failed"))?;
    debug!(%peer, hostname = %hostname, "TLS established");

    serve_connection(tls, forwarder, Scheme::Https, peer).await;
    Ok(())
}

async fn serve_connection<S>(stream: S, forwarder: Arc<Forwarder>, scheme: Scheme, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let svc = service_fn(move |req| {
        let forwarder = Arc::clone(&forwarder);
        async move { forwarder.handle(req, scheme, peer).await }
    });

    if let Err(err) = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), svc)
        .await
    {
        debug!(%peer, %scheme, "connection error: {err}");
    }
}
