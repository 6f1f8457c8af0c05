use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::forward::{Forwarder, load_roots};
use crate::server::{serve_http, serve_https};
use crate::tls::{
    CaIdentity, CertCache, CertResolver, CertificateFactory, Janitor, LeafPolicy, init_ca_files,
};

/// Everything needed to bring the proxy up, already validated.
#[derive(Debug, Clone)]
pub struct Settings {
    pub http_addr: SocketAddr,
    pub https_addr: SocketAddr,
    pub ca_cert: PathBuf,
    pub ca_key: PathBuf,
    pub init_ca: bool,
    pub leaf: LeafPolicy,
    pub eviction_horizon: Duration,
    pub janitor_interval: Duration,
    pub upstream_ca: Vec<PathBuf>,
    pub native_roots: bool,
}

/// The bootstrapped proxy: CA, cache, forwarder and whichever listeners bound.
pub struct ProxyApp {
    resolver: Arc<CertResolver>,
    forwarder: Arc<Forwarder>,
    janitor: Janitor,
    http: Option<TcpListener>,
    https: Option<TcpListener>,
    shutdown: CancellationToken,
}

impl ProxyApp {
    /// Loads the CA and binds both listeners.
    ///
    /// CA problems are fatal. A listener that fails to bind is logged and skipped;
    /// only losing both is an error.
    pub async fn bootstrap(settings: Settings) -> Result<Self> {
        if settings.init_ca {
            init_ca_files(&settings.ca_cert, &settings.ca_key, settings.leaf.key_bits)?;
        }
        let ca = Arc::new(CaIdentity::load(&settings.ca_cert, &settings.ca_key)?);

        let cache = Arc::new(CertCache::new());
        let factory = Arc::new(CertificateFactory::new(ca, settings.leaf.clone()));
        let resolver = Arc::new(CertResolver::new(factory, Arc::clone(&cache)));
        let janitor = Janitor::new(cache, settings.janitor_interval, settings.eviction_horizon);

        let roots = load_roots(&settings.upstream_ca)?;
        let forwarder = Arc::new(
            Forwarder::new(roots, settings.native_roots).context("building upstream client")?,
        );

        let http = bind("HTTP", settings.http_addr).await;
        let https = bind("HTTPS", settings.https_addr).await;
        if http.is_none() && https.is_none() {
            anyhow::bail!("neither listener could be bound");
        }

        Ok(Self {
            resolver,
            forwarder,
            janitor,
            http,
            https,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.https.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn resolver(&self) -> Arc<CertResolver> {
        Arc::clone(&self.resolver)
    }

    pub fn cache(&self) -> Arc<CertCache> {
        Arc::clone(self.resolver.cache())
    }

    /// Cancelling this token stops the janitor and both accept loops.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs until the shutdown token is cancelled.
    pub async fn run(self) -> Result<()> {
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(self.janitor.run(self.shutdown.clone())));

        if let Some(listener) = self.http {
            tasks.push(tokio::spawn(serve_http(
                listener,
                Arc::clone(&self.forwarder),
                self.shutdown.clone(),
            )));
        }
        if let Some(listener) = self.https {
            tasks.push(tokio::spawn(serve_https(
                listener,
                Arc::clone(&self.resolver),
                Arc::clone(&self.forwarder),
                self.shutdown.clone(),
            )));
        }

        for task in tasks {
            if let Err(err) = task.await {
                error!("proxy task ended abnormally: {err}");
            }
        }
        info!("proxy stopped");
        Ok(())
    }
}

async fn bind(label: &str, addr: SocketAddr) -> Option<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Some(listener),
        Err(err) => {
            error!(listener = label, %addr, "bind failed: {err}");
            None
        }
    }
}
