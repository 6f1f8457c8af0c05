use std::fmt;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::{debug, info, warn};

use crate::error::IssueError;
use crate::tls::cache::CertCache;
use crate::tls::factory::CertificateFactory;

/// Per-handshake certificate lookup: cache first, mint and cache on a miss.
///
/// Holds the factory (and through it the CA) together with the shared cache, so
/// tests can build one around a throwaway CA.
pub struct CertResolver {
    factory: Arc<CertificateFactory>,
    cache: Arc<CertCache>,
}

impl CertResolver {
    pub fn new(factory: Arc<CertificateFactory>, cache: Arc<CertCache>) -> Self {
        Self { factory, cache }
    }

    pub fn factory(&self) -> &Arc<CertificateFactory> {
        &self.factory
    }

    pub fn cache(&self) -> &Arc<CertCache> {
        &self.cache
    }

    pub async fn resolve(&self, server_name: &str) -> Result<Arc<CertifiedKey>, IssueError> {
        let hostname = server_name.to_ascii_lowercase();

        if let Some(entry) = self.cache.lookup(&hostname) {
            match entry.decode() {
                Ok(key) => {
                    debug!(hostname = %hostname, "certificate cache hit");
                    return Ok(key);
                }
                Err(error) => {
                    warn!(hostname = %hostname, %error, "cached certificate unusable, reissuing");
                    self.cache.remove_stale(&hostname, &entry);
                }
            }
        }

        let factory = Arc::clone(&self.factory);
        let name = hostname.clone();
        let entry = tokio::task::spawn_blocking(move || factory.issue(&name))
            .await
            .map_err(|e| IssueError::new(&hostname, e.into()))??;

        let key = entry
            .decode()
            .map_err(|e| IssueError::new(&hostname, e.into()))?;
        self.cache.store(hostname.as_str(), entry);
        info!(hostname = %hostname, "certificate issued and cached");

        Ok(key)
    }
}

/// Serves one already-resolved identity regardless of the ClientHello.
struct ResolvedIdentity(Arc<CertifiedKey>);

impl fmt::Debug for ResolvedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedIdentity").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for ResolvedIdentity {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// Server config presenting `key`, speaking HTTP/1.1 only.
pub fn server_config(key: Arc<CertifiedKey>) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(ResolvedIdentity(key)));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}
