use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueHint};

use crate::app::Settings;
use crate::tls::LeafPolicy;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "sni-proxy",
    about = "Forward proxy that terminates TLS with certificates minted per SNI by a local CA.",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Port for the plaintext HTTP listener
    #[arg(long, env = "HTTP_PORT")]
    pub http_port: u16,

    /// Port for the TLS listener
    #[arg(long, env = "HTTPS_PORT")]
    pub https_port: u16,

    /// CA certificate (PEM) used to sign minted leaves
    #[arg(long, env = "SSLCERT_FILE", value_hint = ValueHint::FilePath)]
    pub ca_cert: PathBuf,

    /// CA private key (PEM, "RSA PRIVATE KEY")
    #[arg(long, env = "SSLKEY_FILE", value_hint = ValueHint::FilePath)]
    pub ca_key: PathBuf,

    /// Address both listeners bind to
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Validity of each minted leaf certificate
    #[arg(long, env = "CERT_LIFETIME", default_value = "24h", value_parser = humantime::parse_duration)]
    pub cert_lifetime: Duration,

    /// Cached leaves expiring within this window are evicted
    #[arg(long, env = "EVICTION_HORIZON", default_value = "5m", value_parser = humantime::parse_duration)]
    pub eviction_horizon: Duration,

    /// How often the cache is swept for expiring leaves
    #[arg(long, env = "JANITOR_INTERVAL", default_value = "10s", value_parser = humantime::parse_duration)]
    pub janitor_interval: Duration,

    /// RSA modulus size for minted leaf keys
    #[arg(long, env = "LEAF_KEY_BITS", default_value_t = 4096, value_parser = clap::value_parser!(u32).range(2048..=8192))]
    pub key_bits: u32,

    /// Extra CA bundle(s) trusted for upstream HTTPS (PEM). Comma-separated or repeatable.
    #[arg(long, env = "UPSTREAM_CA", value_hint = ValueHint::FilePath, value_delimiter = ',', num_args = 0..)]
    pub upstream_ca: Vec<PathBuf>,

    /// Generate a new CA at --ca-cert/--ca-key if neither file exists
    #[arg(long, default_value_t = false)]
    pub init_ca: bool,

    /// Emit JSON logs instead of compact text
    #[arg(long, default_value_t = false)]
    pub json_logs: bool,
}

impl Cli {
    pub fn settings(&self) -> anyhow::Result<Settings> {
        anyhow::ensure!(
            self.cert_lifetime > self.eviction_horizon,
            "--cert-lifetime ({}) must exceed --eviction-horizon ({})",
            humantime::format_duration(self.cert_lifetime),
            humantime::format_duration(self.eviction_horizon),
        );
        anyhow::ensure!(
            !self.janitor_interval.is_zero(),
            "--janitor-interval must be greater than zero"
        );

        Ok(Settings {
            http_addr: SocketAddr::new(self.bind, self.http_port),
            https_addr: SocketAddr::new(self.bind, self.https_port),
            ca_cert: self.ca_cert.clone(),
            ca_key: self.ca_key.clone(),
            init_ca: self.init_ca,
            leaf: LeafPolicy {
                lifetime: self.cert_lifetime,
                key_bits: self.key_bits as usize,
            },
            eviction_horizon: self.eviction_horizon,
            janitor_interval: self.janitor_interval,
            upstream_ca: self.upstream_ca.clone(),
            native_roots: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [&str; 9] = [
        "sni-proxy",
        "--http-port",
        "8080",
        "--https-port",
        "8443",
        "--ca-cert",
        "ca.pem",
        "--ca-key",
        "ca.key",
    ];

    fn parse(extra: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(REQUIRED.iter().chain(extra).copied())
    }

    #[test]
    fn defaults_match_documented_values() {
        let settings = parse(&[]).unwrap().settings().unwrap();
        assert_eq!(settings.http_addr, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(settings.https_addr, "0.0.0.0:8443".parse::<SocketAddr>().unwrap());
        assert_eq!(settings.leaf.lifetime, Duration::from_secs(24 * 3600));
        assert_eq!(settings.leaf.key_bits, 4096);
        assert_eq!(settings.eviction_horizon, Duration::from_secs(300));
        assert_eq!(settings.janitor_interval, Duration::from_secs(10));
        assert!(!settings.init_ca);
    }

    #[test]
    fn durations_accept_humantime() {
        let cli = parse(&["--cert-lifetime", "2h", "--janitor-interval", "500ms"]).unwrap();
        let settings = cli.settings().unwrap();
        assert_eq!(settings.leaf.lifetime, Duration::from_secs(7200));
        assert_eq!(settings.janitor_interval, Duration::from_millis(500));
    }

    #[test]
    fn lifetime_must_outlive_horizon() {
        let cli = parse(&["--cert-lifetime", "5m", "--eviction-horizon", "5m"]).unwrap();
        assert!(cli.settings().is_err());
    }

    #[test]
    fn small_keys_are_rejected() {
        assert!(parse(&["--key-bits", "1024"]).is_err());
    }
}
