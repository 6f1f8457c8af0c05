use std::convert::Infallible;
use std::error::Error as StdError;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context as _;
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_TYPE, HOST};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode, Uri, request};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body as _, Incoming};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use thiserror::Error;
use tracing::{debug, info, warn};

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const KEEP_ALIVE: &str = "keep-alive";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relays decoded requests to their real destination and streams the answer back.
pub struct Forwarder {
    client: Client<HttpsConnector<HttpConnector>, Incoming>,
}

impl Forwarder {
    /// Builds the outbound client. Upstream TLS is verified against `extra_roots`
    /// plus, when `native_roots` is set, the platform trust store.
    pub fn new(extra_roots: Vec<CertificateDer<'static>>, native_roots: bool) -> anyhow::Result<Self> {
        let mut roots = RootCertStore::empty();

        if native_roots {
            let native = rustls_native_certs::load_native_certs();
            for error in &native.errors {
                warn!(%error, "failed to load a platform root certificate");
            }
            let (added, ignored) = roots.add_parsable_certificates(native.certs);
            debug!(added, ignored, "platform roots loaded");
        }
        for cert in extra_roots {
            roots.add(cert).context("invalid upstream CA certificate")?;
        }

        let tls = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .build();

        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build(https),
        })
    }

    pub async fn handle(
        &self,
        req: Request<Incoming>,
        scheme: Scheme,
        peer: SocketAddr,
    ) -> Result<Response<ProxyBody>, Infallible> {
        let (parts, body) = req.into_parts();

        let uri = match upstream_uri(scheme, &parts) {
            Ok(uri) => uri,
            Err(error) => {
                warn!(%peer, method = %parts.method, uri = %parts.uri, %error, "no usable upstream target");
                return Ok(simple_response(StatusCode::BAD_REQUEST, &error.to_string()));
            }
        };
        info!(%peer, method = %parts.method, %uri, "=>");

        let mut forwarded = Request::new(body);
        *forwarded.method_mut() = parts.method;
        *forwarded.uri_mut() = uri;
        *forwarded.version_mut() = parts.version;
        copy_headers(&parts.headers, forwarded.headers_mut());

        let resp = match self.client.request(forwarded).await {
            Ok(resp) => resp,
            Err(e) => {
                let message = error_chain(&e);
                warn!(%peer, error = %message, "upstream request failed");
                return Ok(simple_response(StatusCode::SERVICE_UNAVAILABLE, &message));
            }
        };

        let (parts, body) = resp.into_parts();
        info!(%peer, status = %parts.status, content_length = ?body.size_hint().exact(), "<=");

        let mut out = Response::new(body.boxed());
        *out.status_mut() = parts.status;
        copy_headers(&parts.headers, out.headers_mut());
        Ok(out)
    }
}

/// Why a request could not be mapped to an upstream URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub(crate) enum TargetError {
    #[error("missing Host header")]
    MissingHost,
    #[error("invalid Host header")]
    InvalidHost,
}

/// Reads every certificate from the given PEM bundles.
pub fn load_roots(paths: &[PathBuf]) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut roots = Vec::new();
    for path in paths {
        let mut reader = BufReader::new(
            File::open(path).with_context(|| format!("open upstream CA {}", path.display()))?,
        );
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("parse upstream CA {}", path.display()))?;
        if certs.is_empty() {
            anyhow::bail!("no certificates found in {}", path.display());
        }
        roots.extend(certs);
    }
    Ok(roots)
}

/// `scheme://<Host>` plus the original path and query. Falls back to the
/// request-target authority when the Host header is absent.
pub(crate) fn upstream_uri(scheme: Scheme, parts: &request::Parts) -> Result<Uri, TargetError> {
    let authority = match parts.headers.get(HOST) {
        Some(host) if !host.is_empty() => host
            .to_str()
            .map_err(|_| TargetError::InvalidHost)?
            .to_owned(),
        _ => parts
            .uri
            .authority()
            .map(|a| a.to_string())
            .ok_or(TargetError::MissingHost)?,
    };
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    format!("{scheme}://{authority}{path_and_query}")
        .parse()
        .map_err(|_| TargetError::InvalidHost)
}

/// Copies headers in either direction: `Connection` becomes `close`,
/// `Keep-Alive` is dropped, everything else keeps all of its values.
pub fn copy_headers(src: &HeaderMap, dst: &mut HeaderMap) {
    for name in src.keys() {
        if name == CONNECTION {
            dst.append(CONNECTION, HeaderValue::from_static("close"));
        } else if name.as_str() == KEEP_ALIVE {
            continue;
        } else {
            for value in src.get_all(name) {
                dst.append(name.clone(), value.clone());
            }
        }
    }
}

fn simple_response(status: StatusCode, msg: &str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(msg.to_owned()))
        .map_err(|never| match never {})
        .boxed();
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}
