use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures while loading (or minting) the CA. Any of these aborts startup.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{}: failed to parse certificate PEM", path.display())]
    CertificatePem { path: PathBuf },

    #[error("{}: invalid X.509 certificate: {reason}", path.display())]
    Certificate { path: PathBuf, reason: String },

    #[error("{}: RSA private key is of the wrong type", path.display())]
    WrongKeyType { path: PathBuf },

    #[error("{}: invalid PKCS#1 private key: {reason}", path.display())]
    PrivateKey { path: PathBuf, reason: String },

    #[error("CA rejected by signer: {0}")]
    Signer(#[from] rcgen::Error),

    #[error("only one of {} and {} exists", cert.display(), key.display())]
    PartialCa { cert: PathBuf, key: PathBuf },

    #[error("CA key generation failed: {0}")]
    KeyGeneration(String),
}

/// Leaf issuance failure for a single hostname.
#[derive(Debug, Error)]
#[error("{hostname}: {kind}")]
pub struct IssueError {
    pub hostname: String,
    #[source]
    pub kind: IssueErrorKind,
}

impl IssueError {
    pub fn new(hostname: impl Into<String>, kind: IssueErrorKind) -> Self {
        Self {
            hostname: hostname.into(),
            kind,
        }
    }
}

#[derive(Debug, Error)]
pub enum IssueErrorKind {
    #[error("key generation failed: {0}")]
    KeyGeneration(#[from] rsa::Error),

    #[error("key encoding failed: {0}")]
    KeyEncoding(String),

    #[error("signing failed: {0}")]
    Signing(#[from] rcgen::Error),

    #[error("issued pair is unusable: {0}")]
    Decode(#[from] DecodeError),

    #[error("issuance task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A stored PEM pair that cannot be turned back into a TLS identity.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no certificate in PEM")]
    NoCertificate,

    #[error("no RSA private key in PEM")]
    NoPrivateKey,

    #[error("malformed PEM: {0}")]
    Pem(#[from] io::Error),

    #[error("unusable private key: {0}")]
    Key(#[from] rustls::Error),

    #[error("invalid certificate: {0}")]
    Certificate(String),
}
