use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustls::pki_types::PrivateKeyDer;
use rustls::sign::CertifiedKey;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::error::DecodeError;

/// One issued leaf: certificate and private key, both PEM, always minted together.
#[derive(Clone, Debug)]
pub struct CertEntry {
    cert_pem: String,
    key_pem: String,
}

impl CertEntry {
    pub fn new(cert_pem: String, key_pem: String) -> Self {
        Self { cert_pem, key_pem }
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Parses the PEM pair into an identity rustls can serve.
    pub fn decode(&self) -> Result<Arc<CertifiedKey>, DecodeError> {
        let certs = rustls_pemfile::certs(&mut self.cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            return Err(DecodeError::NoCertificate);
        }

        let key = rustls_pemfile::rsa_private_keys(&mut self.key_pem.as_bytes())
            .next()
            .ok_or(DecodeError::NoPrivateKey)??;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&PrivateKeyDer::Pkcs1(key))?;

        Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
    }

    pub fn not_after(&self) -> Result<OffsetDateTime, DecodeError> {
        let (_, pem) = x509_parser::pem::parse_x509_pem(self.cert_pem.as_bytes())
            .map_err(|e| DecodeError::Certificate(e.to_string()))?;
        let cert = pem
            .parse_x509()
            .map_err(|e| DecodeError::Certificate(e.to_string()))?;
        Ok(cert.validity().not_after.to_datetime())
    }
}

/// Hostname to leaf map shared by every handshake and the janitor.
#[derive(Default)]
pub struct CertCache {
    entries: Mutex<HashMap<String, CertEntry>>,
}

impl CertCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, hostname: &str) -> Option<CertEntry> {
        self.entries.lock().get(hostname).cloned()
    }

    /// Inserts or replaces; the last writer for a hostname wins.
    pub fn store(&self, hostname: impl Into<String>, entry: CertEntry) {
        self.entries.lock().insert(hostname.into(), entry);
    }

    /// Removes `hostname` only while it still maps to `stale`, so an entry another
    /// handshake stored in the meantime survives.
    pub fn remove_stale(&self, hostname: &str, stale: &CertEntry) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(hostname) {
            Some(current) if current.cert_pem == stale.cert_pem => {
                entries.remove(hostname);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Drops every entry whose `notAfter` falls before now + `horizon`, and any
    /// entry whose certificate no longer parses. Returns how many were removed.
    pub fn evict_expiring(&self, horizon: Duration) -> usize {
        let deadline = OffsetDateTime::now_utc() + horizon;
        let mut entries = self.entries.lock();
        let before = entries.len();

        entries.retain(|hostname, entry| match entry.not_after() {
            Ok(not_after) if not_after >= deadline => true,
            Ok(not_after) => {
                info!(hostname = %hostname, %not_after, "certificate nearing expiry, evicted");
                false
            }
            Err(error) => {
                warn!(hostname = %hostname, %error, "invalid cached certificate, evicted");
                false
            }
        });

        before - entries.len()
    }
}
