use std::fs;
use std::path::Path;

use rand::rngs::OsRng;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, PKCS_RSA_SHA256,
};
use rsa::RsaPrivateKey;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, LineEnding};
use rsa::pkcs8::EncodePrivateKey;
use rsa::traits::PublicKeyParts;
use rustls::pki_types::CertificateDer;
use rustls_pemfile::Item;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};
use x509_parser::public_key::PublicKey;

use crate::error::BootstrapError;

const CA_COMMON_NAME: &str = "SNI Proxy Root CA";
const CA_VALIDITY_DAYS: i64 = 3650;

/// Root certificate and key used to sign every leaf. Immutable once loaded.
pub struct CaIdentity {
    cert_der: CertificateDer<'static>,
    signer: Certificate,
}

impl CaIdentity {
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, BootstrapError> {
        let cert_pem = read_file(cert_path)?;
        let key_pem = read_file(key_path)?;

        let cert_der = parse_certificate(cert_path, &cert_pem)?;
        let key = parse_private_key(key_path, &key_pem)?;

        let modulus = certificate_modulus(cert_path, &cert_der)?;
        if trim_leading_zeros(&modulus) != trim_leading_zeros(&key.n().to_bytes_be()) {
            return Err(BootstrapError::PrivateKey {
                path: key_path.to_path_buf(),
                reason: format!("does not match certificate {}", cert_path.display()),
            });
        }

        let key_pair = rcgen_key_pair(&key).map_err(|reason| BootstrapError::PrivateKey {
            path: key_path.to_path_buf(),
            reason,
        })?;
        let params = CertificateParams::from_ca_cert_der(cert_der.as_ref(), key_pair)?;
        let signer = Certificate::from_params(params)?;

        info!(cert = %cert_path.display(), key = %key_path.display(), "CA loaded");
        Ok(Self { cert_der, signer })
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub(crate) fn signer(&self) -> &Certificate {
        &self.signer
    }
}

/// Mints a fresh CA into `cert_path`/`key_path` when neither exists.
///
/// Returns `true` if files were written. Having just one of the two is an error,
/// since overwriting it would orphan whatever the operator already trusts.
pub fn init_ca_files(cert_path: &Path, key_path: &Path, bits: usize) -> Result<bool, BootstrapError> {
    match (cert_path.exists(), key_path.exists()) {
        (true, true) => Ok(false),
        (false, false) => {
            let (cert_pem, key_pem) = generate_ca(CA_COMMON_NAME, bits)?;
            write_file(cert_path, cert_pem.as_bytes(), false)?;
            write_file(key_path, key_pem.as_bytes(), true)?;
            warn!(
                cert = %cert_path.display(),
                "generated a new root CA; clients must trust it before HTTPS interception works"
            );
            Ok(true)
        }
        _ => Err(BootstrapError::PartialCa {
            cert: cert_path.to_path_buf(),
            key: key_path.to_path_buf(),
        }),
    }
}

/// Self-signed RSA root as (certificate PEM, PKCS#1 key PEM).
pub fn generate_ca(common_name: &str, bits: usize) -> Result<(String, String), BootstrapError> {
    let key = RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| BootstrapError::KeyGeneration(e.to_string()))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "SNI Proxy");

    let now = OffsetDateTime::now_utc();
    let mut params = CertificateParams::default();
    params.alg = &PKCS_RSA_SHA256;
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(CA_VALIDITY_DAYS);
    params.key_pair = Some(rcgen_key_pair(&key).map_err(BootstrapError::KeyGeneration)?);

    let cert_pem = Certificate::from_params(params)?.serialize_pem()?;
    let key_pem = key
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| BootstrapError::KeyGeneration(e.to_string()))?;

    Ok((cert_pem, key_pem.as_str().to_owned()))
}

/// Converts an RSA key into the PKCS#8 form rcgen signs with.
pub(crate) fn rcgen_key_pair(key: &RsaPrivateKey) -> Result<KeyPair, String> {
    let der = key.to_pkcs8_der().map_err(|e| e.to_string())?;
    KeyPair::try_from(der.as_bytes()).map_err(|e| e.to_string())
}

fn read_file(path: &Path) -> Result<Vec<u8>, BootstrapError> {
    fs::read(path).map_err(|source| BootstrapError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn write_file(path: &Path, contents: &[u8], private: bool) -> Result<(), BootstrapError> {
    let to_err = |source| BootstrapError::Write {
        path: path.to_path_buf(),
        source,
    };
    fs::write(path, contents).map_err(to_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if private {
            fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(to_err)?;
        }
    }
    #[cfg(not(unix))]
    let _ = private;

    Ok(())
}

fn parse_certificate(path: &Path, pem: &[u8]) -> Result<CertificateDer<'static>, BootstrapError> {
    let der = rustls_pemfile::certs(&mut &pem[..])
        .next()
        .transpose()
        .ok()
        .flatten()
        .ok_or_else(|| BootstrapError::CertificatePem {
            path: path.to_path_buf(),
        })?;

    x509_parser::parse_x509_certificate(der.as_ref()).map_err(|e| BootstrapError::Certificate {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    Ok(der)
}

/// The first PEM block must be tagged `RSA PRIVATE KEY`; anything else is refused.
fn parse_private_key(path: &Path, pem: &[u8]) -> Result<RsaPrivateKey, BootstrapError> {
    let invalid = |reason: String| BootstrapError::PrivateKey {
        path: path.to_path_buf(),
        reason,
    };

    match rustls_pemfile::read_one(&mut &pem[..]) {
        Ok(Some(Item::Pkcs1Key(key))) => {
            RsaPrivateKey::from_pkcs1_der(key.secret_pkcs1_der()).map_err(|e| invalid(e.to_string()))
        }
        Ok(Some(_)) => Err(BootstrapError::WrongKeyType {
            path: path.to_path_buf(),
        }),
        Ok(None) => Err(invalid("no PEM block found".into())),
        Err(e) => Err(invalid(e.to_string())),
    }
}

fn certificate_modulus(path: &Path, der: &CertificateDer<'_>) -> Result<Vec<u8>, BootstrapError> {
    let not_rsa = |reason: String| BootstrapError::Certificate {
        path: path.to_path_buf(),
        reason,
    };

    let (_, cert) =
        x509_parser::parse_x509_certificate(der.as_ref()).map_err(|e| not_rsa(e.to_string()))?;
    match cert.public_key().parsed() {
        Ok(PublicKey::RSA(rsa)) => Ok(rsa.modulus.to_vec()),
        Ok(_) => Err(not_rsa("public key is not RSA".into())),
        Err(e) => Err(not_rsa(e.to_string())),
    }
}

fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn loads_generated_ca() {
        let dir = TempDir::new().unwrap();
        let (cert_pem, key_pem) = generate_ca("Test Root", 2048).unwrap();
        assert!(cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(key_pem.contains("BEGIN RSA PRIVATE KEY"));

        let cert = write(&dir, "ca.pem", &cert_pem);
        let key = write(&dir, "ca.key", &key_pem);
        let ca = CaIdentity::load(&cert, &key).unwrap();
        assert!(!ca.cert_der().is_empty());
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = TempDir::new().unwrap();
        let err = CaIdentity::load(&dir.path().join("nope.pem"), &dir.path().join("nope.key"))
            .err()
            .unwrap();
        assert!(matches!(err, BootstrapError::Read { .. }));
    }

    #[test]
    fn pkcs8_key_is_the_wrong_type() {
        let dir = TempDir::new().unwrap();
        let (cert_pem, key_pem) = generate_ca("Test Root", 2048).unwrap();
        let rsa = RsaPrivateKey::from_pkcs1_pem(&key_pem).unwrap();
        let pkcs8 = rsa.to_pkcs8_pem(LineEnding::LF).unwrap();

        let cert = write(&dir, "ca.pem", &cert_pem);
        let key = write(&dir, "ca.key", pkcs8.as_str());
        let err = CaIdentity::load(&cert, &key).err().unwrap();
        assert!(matches!(err, BootstrapError::WrongKeyType { .. }));
        assert!(err.to_string().contains("wrong type"));
    }

    #[test]
    fn certificate_in_key_file_is_the_wrong_type() {
        let dir = TempDir::new().unwrap();
        let (cert_pem, _) = generate_ca("Test Root", 2048).unwrap();
        let cert = write(&dir, "ca.pem", &cert_pem);
        let key = write(&dir, "ca.key", &cert_pem);
        let err = CaIdentity::load(&cert, &key).err().unwrap();
        assert!(matches!(err, BootstrapError::WrongKeyType { .. }));
    }

    #[test]
    fn garbage_certificate_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (_, key_pem) = generate_ca("Test Root", 2048).unwrap();
        let cert = write(&dir, "ca.pem", "not a certificate\n");
        let key = write(&dir, "ca.key", &key_pem);
        let err = CaIdentity::load(&cert, &key).err().unwrap();
        assert!(matches!(err, BootstrapError::CertificatePem { .. }));
    }

    #[test]
    fn mismatched_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (cert_pem, _) = generate_ca("Test Root", 2048).unwrap();
        let (_, other_key) = generate_ca("Other Root", 2048).unwrap();
        let cert = write(&dir, "ca.pem", &cert_pem);
        let key = write(&dir, "ca.key", &other_key);
        let err = CaIdentity::load(&cert, &key).err().unwrap();
        assert!(matches!(err, BootstrapError::PrivateKey { .. }));
    }

    #[test]
    fn init_ca_writes_once_and_refuses_partial_state() {
        let dir = TempDir::new().unwrap();
        let cert = dir.path().join("ca.pem");
        let key = dir.path().join("ca.key");

        assert!(init_ca_files(&cert, &key, 2048).unwrap());
        assert!(!init_ca_files(&cert, &key, 2048).unwrap());
        CaIdentity::load(&cert, &key).unwrap();

        fs::remove_file(&key).unwrap();
        let err = init_ca_files(&cert, &key, 2048).err().unwrap();
        assert!(matches!(err, BootstrapError::PartialCa { .. }));
    }
}
