use crate::config::CertConfig;
use lru::LruCache;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, PKCS_ECDSA_P256_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fs;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum CertError {
    #[error("Failed to generate certificate: {0}")]
    GenerationError(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Certificate error: {0}")]
    RcgenError(#[from] rcgen::Error),
    #[error("Failed to parse certificate: {0}")]
    ParseError(String),
}

/// Certificate authority for TLS interception.
///
/// Loads a persisted root from disk or generates and persists a fresh one,
/// then mints per-host leaf certificates on demand. Leafs are cached in a
/// bounded LRU; eviction never invalidates an in-flight TLS session because
/// each handshake holds its own `Arc`.
pub struct CertificateAuthority {
    /// Root certificate (for signing leafs)
    ca_cert: Certificate,
    /// Root certificate in DER format
    ca_cert_der: CertificateDer<'static>,
    /// Root certificate in PEM format
    ca_cert_pem: String,
    /// Minted leaf cache, keyed by host name
    cache: Mutex<LruCache<String, Arc<CertifiedKey>>>,
    /// Leaf certificate validity in days
    cert_validity_days: u32,
}

/// A minted leaf, ready to feed a TLS server.
pub struct CertifiedKey {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

impl CertificateAuthority {
    /// Load the root CA from the configured paths, generating and persisting
    /// a fresh one when allowed. Failure here is fatal to MITM serving.
    pub fn new(config: &CertConfig) -> Result<Self, CertError> {
        let cert_path = Path::new(&config.ca_cert);
        let key_path = Path::new(&config.ca_key);

        if cert_path.exists() && key_path.exists() {
            info!("Loading root CA from {:?}", cert_path);
            Self::load_ca(cert_path, key_path, config)
        } else if config.auto_generate {
            info!("Generating new root CA");
            Self::generate_ca(cert_path, key_path, config)
        } else {
            Err(CertError::GenerationError(
                "root CA not found and auto_generate is disabled".to_string(),
            ))
        }
    }

    fn ca_params(validity_days: u32) -> CertificateParams {
        let mut params = CertificateParams::default();

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, "rewire Root CA");
        distinguished_name.push(DnType::OrganizationName, "rewire");
        params.distinguished_name = distinguished_name;

        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::hours(1);
        params.not_after = now + Duration::days(validity_days as i64);
        params.alg = &PKCS_ECDSA_P256_SHA256;
        params
    }

    fn generate_ca(
        cert_path: &Path,
        key_path: &Path,
        config: &CertConfig,
    ) -> Result<Self, CertError> {
        let params = Self::ca_params(config.ca_validity_days);
        let ca_cert = Certificate::from_params(params)?;

        if let Some(parent) = cert_path.parent() {
            fs::create_dir_all(parent)?;
            restrict_dir_permissions(parent)?;
        }

        let cert_pem = ca_cert.serialize_pem()?;
        fs::write(cert_path, &cert_pem)?;
        restrict_file_permissions(cert_path)?;
        info!("Root CA certificate saved to {:?}", cert_path);

        let key_pem = ca_cert.serialize_private_key_pem();
        fs::write(key_path, &key_pem)?;
        restrict_file_permissions(key_path)?;
        info!("Root CA private key saved to {:?}", key_path);

        println!(
            "Import the root CA into your system/browser trust store:\n  {}",
            cert_path.display()
        );

        let ca_cert_der = CertificateDer::from(ca_cert.serialize_der()?);

        Ok(Self {
            ca_cert,
            ca_cert_der,
            ca_cert_pem: cert_pem,
            cache: Mutex::new(new_cache(config.cache_capacity)),
            cert_validity_days: config.cert_validity_days,
        })
    }

    fn load_ca(cert_path: &Path, key_path: &Path, config: &CertConfig) -> Result<Self, CertError> {
        let cert_pem = fs::read_to_string(cert_path)?;
        let key_pem = fs::read_to_string(key_path)?;

        let key_pair = KeyPair::from_pem(&key_pem)?;

        // Rebuild signing parameters around the persisted key; the
        // distinguished name must match the certificate on disk.
        let mut params = Self::ca_params(config.ca_validity_days);
        params.key_pair = Some(key_pair);
        let ca_cert = Certificate::from_params(params)?;

        let pem = pem::parse(&cert_pem).map_err(|e| CertError::ParseError(e.to_string()))?;
        let ca_cert_der = CertificateDer::from(pem.contents().to_vec());

        Ok(Self {
            ca_cert,
            ca_cert_der,
            ca_cert_pem: cert_pem,
            cache: Mutex::new(new_cache(config.cache_capacity)),
            cert_validity_days: config.cert_validity_days,
        })
    }

    /// Root certificate in DER format
    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        &self.ca_cert_der
    }

    /// Root certificate in PEM format
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Return the cached leaf for `host`, minting and caching one if absent.
    pub fn leaf_for_host(&self, host: &str) -> Result<Arc<CertifiedKey>, CertError> {
        {
            let mut cache = self.lock_cache();
            if let Some(leaf) = cache.get(host) {
                debug!("Using cached certificate for {}", host);
                return Ok(Arc::clone(leaf));
            }
        }

        debug!("Minting certificate for {}", host);
        let leaf = Arc::new(self.mint_leaf(host)?);
        self.lock_cache().put(host.to_string(), Arc::clone(&leaf));
        Ok(leaf)
    }

    fn mint_leaf(&self, host: &str) -> Result<CertifiedKey, CertError> {
        let mut params = CertificateParams::default();

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, host);
        params.distinguished_name = distinguished_name;

        params.subject_alt_names = vec![match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(host.try_into().map_err(|e| {
                CertError::GenerationError(format!("invalid host name {:?}: {}", host, e))
            })?),
        }];

        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        // back-dated to tolerate client clock skew
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::minutes(30);
        params.not_after = now + Duration::days(self.cert_validity_days as i64);
        params.alg = &PKCS_ECDSA_P256_SHA256;

        let cert = Certificate::from_params(params)?;

        let cert_der = CertificateDer::from(cert.serialize_der_with_signer(&self.ca_cert)?);
        let private_key =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));

        Ok(CertifiedKey {
            cert_chain: vec![cert_der, self.ca_cert_der.clone()],
            private_key,
        })
    }

    /// Number of cached leafs
    pub fn cache_len(&self) -> usize {
        self.lock_cache().len()
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, LruCache<String, Arc<CertifiedKey>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn new_cache(capacity: usize) -> LruCache<String, Arc<CertifiedKey>> {
    let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one");
    LruCache::new(capacity)
}

#[cfg(unix)]
fn restrict_file_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(unix)]
fn restrict_dir_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_file_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn restrict_dir_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::client::danger::ServerCertVerifier;
    use rustls::client::WebPkiServerVerifier;
    use rustls::pki_types::{ServerName, UnixTime};
    use rustls::RootCertStore;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir, capacity: usize) -> CertConfig {
        CertConfig {
            ca_cert: dir.path().join("rootCA.pem").to_string_lossy().into_owned(),
            ca_key: dir.path().join("rootCA.key").to_string_lossy().into_owned(),
            auto_generate: true,
            ca_validity_days: 1825,
            cert_validity_days: 365,
            cache_capacity: capacity,
        }
    }

    #[test]
    fn test_ca_generation_persists_files() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir, 16);
        let _ca = CertificateAuthority::new(&config).unwrap();

        assert!(dir.path().join("rootCA.pem").exists());
        assert!(dir.path().join("rootCA.key").exists());
    }

    #[test]
    fn test_ca_reload_keeps_identity() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir, 16);
        let first = CertificateAuthority::new(&config).unwrap();
        let second = CertificateAuthority::new(&config).unwrap();
        assert_eq!(first.ca_cert_pem(), second.ca_cert_pem());
    }

    #[test]
    fn test_leaf_verifies_against_root() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::new(&test_config(&dir, 16)).unwrap();
        let leaf = ca.leaf_for_host("example.com").unwrap();
        assert_eq!(leaf.cert_chain.len(), 2);

        let mut roots = RootCertStore::empty();
        roots.add(ca.ca_cert_der().clone()).unwrap();
        let verifier = WebPkiServerVerifier::builder(Arc::new(roots)).build().unwrap();

        let server_name = ServerName::try_from("example.com").unwrap();
        verifier
            .verify_server_cert(
                &leaf.cert_chain[0],
                &leaf.cert_chain[1..],
                &server_name,
                &[],
                UnixTime::now(),
            )
            .expect("leaf must chain to the generated root");

        // the SAN is host-specific
        let other = ServerName::try_from("other.com").unwrap();
        assert!(verifier
            .verify_server_cert(
                &leaf.cert_chain[0],
                &leaf.cert_chain[1..],
                &other,
                &[],
                UnixTime::now(),
            )
            .is_err());
    }

    #[test]
    fn test_leaf_for_ip_host() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::new(&test_config(&dir, 16)).unwrap();
        let leaf = ca.leaf_for_host("127.0.0.1").unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(ca.ca_cert_der().clone()).unwrap();
        let verifier = WebPkiServerVerifier::builder(Arc::new(roots)).build().unwrap();
        let server_name = ServerName::try_from("127.0.0.1").unwrap();
        verifier
            .verify_server_cert(
                &leaf.cert_chain[0],
                &leaf.cert_chain[1..],
                &server_name,
                &[],
                UnixTime::now(),
            )
            .expect("IP leaf must carry an IP SAN");
    }

    #[test]
    fn test_cache_hit_returns_same_leaf() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::new(&test_config(&dir, 16)).unwrap();
        let first = ca.leaf_for_host("example.com").unwrap();
        let second = ca.leaf_for_host("example.com").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(ca.cache_len(), 1);
    }

    #[test]
    fn test_cache_is_bounded_and_keeps_mru() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::new(&test_config(&dir, 4)).unwrap();

        let hosts: Vec<String> = (0..6).map(|i| format!("host{}.test", i)).collect();
        let mut leafs = Vec::new();
        for host in &hosts {
            leafs.push(ca.leaf_for_host(host).unwrap());
        }
        assert_eq!(ca.cache_len(), 4);

        // the most recently minted host is still cached
        let again = ca.leaf_for_host("host5.test").unwrap();
        assert!(Arc::ptr_eq(&leafs[5], &again));

        // the oldest host was evicted and gets a fresh leaf
        let reminted = ca.leaf_for_host("host0.test").unwrap();
        assert!(!Arc::ptr_eq(&leafs[0], &reminted));
    }
}
