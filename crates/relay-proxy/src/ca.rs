//! Certificate Authority management for the capture proxy.
//!
//! Generates the root CA once, then issues one leaf certificate per
//! intercepted hostname. Leaves are written to `certs/<host>.crt|.key` and
//! cached; [`CaManager::delete`] wipes both so the next use regenerates
//! everything, root included.

use std::collections::HashMap;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use http::uri::Authority;
use hudsucker::certificate_authority::{CertificateAuthority, RcgenAuthority};
use hudsucker::rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer,
    KeyPair, KeyUsagePurpose,
};
use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use hudsucker::rustls::ServerConfig;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

pub use crate::error::CaManagerError;

const CA_DIR: &str = "ca";
const CERTS_DIR: &str = "certs";
const CA_CERT_FILENAME: &str = "relay-ca.crt";
const CA_KEY_FILENAME: &str = "relay-ca.key";
const CA_COMMON_NAME: &str = "Relay Capture Root CA";

/// Cache size of the in-memory fallback authority.
const FALLBACK_CACHE_SIZE: u64 = 1000;

/// Root CA file locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Leaf certificate file locations for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Manages the root CA and per-host leaf certificates.
///
/// Clones share the leaf cache and the generation counter.
#[derive(Debug, Clone)]
pub struct CaManager {
    base_dir: PathBuf,
    leaves: Arc<Mutex<HashMap<String, LeafPaths>>>,
    generation: Arc<AtomicU64>,
}

impl CaManager {
    /// Creates a manager rooted at `base_dir` (`ca/` and `certs/` live below it).
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            leaves: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Creates a manager in the default Relay data directory.
    pub fn with_default_dir() -> Result<Self, CaManagerError> {
        let project_dirs = directories::ProjectDirs::from("com", "relay", "Relay")
            .ok_or_else(|| CaManagerError::Generation("Failed to get project dirs".into()))?;

        Ok(Self::new(project_dirs.data_dir()))
    }

    fn ca_dir(&self) -> PathBuf {
        self.base_dir.join(CA_DIR)
    }

    fn certs_dir(&self) -> PathBuf {
        self.base_dir.join(CERTS_DIR)
    }

    /// Returns the path to the CA certificate file.
    pub fn cert_path(&self) -> PathBuf {
        self.ca_dir().join(CA_CERT_FILENAME)
    }

    /// Returns the path to the CA private key file.
    pub fn key_path(&self) -> PathBuf {
        self.ca_dir().join(CA_KEY_FILENAME)
    }

    /// Checks if the CA certificate exists.
    pub fn ca_exists(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Ensures the root CA exists, generating it if necessary.
    pub fn ensure_certificates(&self) -> Result<CaPaths, CaManagerError> {
        if !self.ca_exists() {
            self.generate_ca()?;
        }
        Ok(CaPaths {
            cert_path: self.cert_path(),
            key_path: self.key_path(),
        })
    }

    /// Generates a new root CA, replacing any existing one.
    ///
    /// Leaves signed by the previous root are discarded.
    pub fn generate_ca(&self) -> Result<(), CaManagerError> {
        fs::create_dir_all(self.ca_dir())?;
        self.clear_leaves()?;

        let key_pair =
            KeyPair::generate().map_err(|e| CaManagerError::Generation(e.to_string()))?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;
        params
            .distinguished_name
            .push(DnType::CommonName, CA_COMMON_NAME);
        params.distinguished_name.push(DnType::OrganizationName, "Relay");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;

        fs::write(self.cert_path(), cert.pem()).map_err(|e| CaManagerError::Write(e.to_string()))?;
        fs::write(self.key_path(), key_pair.serialize_pem())
            .map_err(|e| CaManagerError::Write(e.to_string()))?;

        info!("Generated new CA certificate at {:?}", self.cert_path());
        Ok(())
    }

    fn load_issuer(&self) -> Result<Issuer<'static, KeyPair>, CaManagerError> {
        let cert_pem = fs::read_to_string(self.cert_path())?;
        let key_pem = fs::read_to_string(self.key_path())?;

        let key_pair =
            KeyPair::from_pem(&key_pem).map_err(|e| CaManagerError::Parse(e.to_string()))?;
        Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CaManagerError::Parse(e.to_string()))
    }

    /// Builds hudsucker's in-memory authority from the root CA.
    pub fn load_authority(&self) -> Result<RcgenAuthority, CaManagerError> {
        let issuer = self.load_issuer()?;
        Ok(RcgenAuthority::new(
            issuer,
            FALLBACK_CACHE_SIZE,
            default_provider(),
        ))
    }

    /// Returns the leaf certificate for `host`, issuing it on first use.
    pub fn certificate_for(&self, host: &str) -> Result<LeafPaths, CaManagerError> {
        let host = normalize_host(host)?;

        if let Some(paths) = self.leaves.lock().get(&host).cloned() {
            return Ok(paths);
        }

        let paths = LeafPaths {
            cert_path: self.certs_dir().join(format!("{}.crt", host)),
            key_path: self.certs_dir().join(format!("{}.key", host)),
        };

        // Leaves left by an earlier run were signed by the current root:
        // `generate_ca` and `delete` both clear the directory.
        if !(paths.cert_path.exists() && paths.key_path.exists()) {
            self.ensure_certificates()?;
            self.issue_leaf(&host, &paths)?;
        }

        self.leaves.lock().insert(host, paths.clone());
        Ok(paths)
    }

    fn issue_leaf(&self, host: &str, paths: &LeafPaths) -> Result<(), CaManagerError> {
        let issuer = self.load_issuer()?;

        let mut params = CertificateParams::new(vec![host.to_string()])
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;
        params.distinguished_name.push(DnType::CommonName, host);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let key_pair =
            KeyPair::generate().map_err(|e| CaManagerError::Generation(e.to_string()))?;
        let cert = params
            .signed_by(&key_pair, &issuer)
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;

        fs::create_dir_all(self.certs_dir())?;
        fs::write(&paths.cert_path, cert.pem())
            .map_err(|e| CaManagerError::Write(e.to_string()))?;
        fs::write(&paths.key_path, key_pair.serialize_pem())
            .map_err(|e| CaManagerError::Write(e.to_string()))?;

        debug!(host = %host, "Issued leaf certificate");
        Ok(())
    }

    /// Bumped every time the leaves are discarded.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn clear_leaves(&self) -> Result<(), CaManagerError> {
        self.leaves.lock().clear();
        self.generation.fetch_add(1, Ordering::AcqRel);
        match fs::remove_dir_all(self.certs_dir()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the root CA and every leaf.
    ///
    /// Browsers that trusted the old root must be re-configured.
    pub fn delete(&self) -> Result<(), CaManagerError> {
        self.clear_leaves()?;
        match fs::remove_dir_all(self.ca_dir()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!("Deleted CA material under {:?}", self.base_dir);
        Ok(())
    }

    /// Reads the CA certificate as DER bytes (for trust-store installation).
    pub fn read_cert_der(&self) -> Result<Vec<u8>, CaManagerError> {
        let certs = read_certs(&self.cert_path())?;
        certs
            .into_iter()
            .next()
            .map(|c| c.to_vec())
            .ok_or_else(|| CaManagerError::Parse("no certificate in CA file".into()))
    }
}

/// Lowercases `host`, strips a port and rejects anything unsafe as a file name.
fn normalize_host(host: &str) -> Result<String, CaManagerError> {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    let host = match host.strip_prefix('[') {
        // IPv6 literal, possibly with a port.
        Some(rest) => rest.split(']').next().unwrap_or_default().to_string(),
        None => host.split(':').next().unwrap_or_default().to_string(),
    };

    let valid = !host.is_empty()
        && !host.starts_with('.')
        && !host.contains("..")
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '*'));
    // IPv6 addresses keep their colons out of file names.
    let ipv6 = host.parse::<std::net::Ipv6Addr>().is_ok();

    if valid {
        Ok(host)
    } else if ipv6 {
        Ok(host.replace(':', "_"))
    } else {
        Err(CaManagerError::InvalidHost(host))
    }
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CaManagerError> {
    let mut reader = BufReader::new(fs::File::open(path)?);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CaManagerError::Parse(e.to_string()))
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, CaManagerError> {
    let mut reader = BufReader::new(fs::File::open(path)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| CaManagerError::Parse(e.to_string()))?
        .ok_or_else(|| CaManagerError::Parse(format!("no private key in {:?}", path)))
}

/// TLS authority that serves the on-disk leaf for each host.
///
/// Falls back to hudsucker's in-memory [`RcgenAuthority`] when a leaf cannot
/// be issued or loaded. Cached configs are dropped once the manager's
/// generation moves, so a deleted root is never served again.
pub struct LeafAuthority {
    ca: CaManager,
    state: Mutex<AuthorityState>,
}

struct AuthorityState {
    generation: u64,
    fallback: Arc<RcgenAuthority>,
    configs: HashMap<String, Arc<ServerConfig>>,
}

impl std::fmt::Debug for LeafAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LeafAuthority")
            .field("ca", &self.ca)
            .field("generation", &state.generation)
            .field("cached", &state.configs.len())
            .finish()
    }
}

impl LeafAuthority {
    /// Builds the authority, generating the root CA if needed.
    pub fn new(ca: CaManager) -> Result<Self, CaManagerError> {
        let generation = ca.generation();
        ca.ensure_certificates()?;
        let fallback = Arc::new(ca.load_authority()?);
        Ok(Self {
            ca,
            state: Mutex::new(AuthorityState {
                generation,
                fallback,
                configs: HashMap::new(),
            }),
        })
    }

    /// Drops state issued under an older root.
    fn sync(&self, state: &mut AuthorityState) {
        let generation = self.ca.generation();
        if state.generation == generation {
            return;
        }
        debug!(
            cached = state.configs.len(),
            "Root certificate changed, dropping cached server configs"
        );
        state.configs.clear();
        state.generation = generation;

        let fallback = self
            .ca
            .ensure_certificates()
            .and_then(|_| self.ca.load_authority());
        match fallback {
            Ok(fallback) => state.fallback = Arc::new(fallback),
            Err(e) => warn!("Failed to reload in-memory authority: {}", e),
        }
    }

    fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, CaManagerError> {
        let leaf = self.ca.certificate_for(host)?;

        let mut chain = read_certs(&leaf.cert_path)?;
        chain.extend(read_certs(&self.ca.cert_path())?);
        let key = read_key(&leaf.key_path)?;

        let mut config = ServerConfig::builder_with_provider(Arc::new(default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| CaManagerError::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| CaManagerError::Tls(e.to_string()))?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(Arc::new(config))
    }
}

impl CertificateAuthority for LeafAuthority {
    async fn gen_server_config(&self, authority: &Authority) -> Arc<ServerConfig> {
        let host = authority.host().to_ascii_lowercase();

        let (generation, cached, fallback) = {
            let mut state = self.state.lock();
            self.sync(&mut state);
            (
                state.generation,
                state.configs.get(&host).cloned(),
                state.fallback.clone(),
            )
        };
        if let Some(config) = cached {
            return config;
        }

        match self.server_config(&host) {
            Ok(config) => {
                let mut state = self.state.lock();
                if state.generation == generation {
                    state.configs.insert(host, config.clone());
                }
                config
            }
            Err(e) => {
                warn!(host = %host, "Leaf issuance failed, using in-memory certificate: {}", e);
                fallback.gen_server_config(authority).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager() -> (TempDir, CaManager) {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path());
        (temp_dir, manager)
    }

    #[test]
    fn paths_live_under_base_dir() {
        let manager = CaManager::new("/tmp/relay-test");
        assert_eq!(
            manager.cert_path(),
            PathBuf::from("/tmp/relay-test/ca/relay-ca.crt")
        );
        assert_eq!(
            manager.key_path(),
            PathBuf::from("/tmp/relay-test/ca/relay-ca.key")
        );
    }

    #[test]
    fn ensure_certificates_generates_once() {
        let (_dir, manager) = manager();
        assert!(!manager.ca_exists());

        let first = manager.ensure_certificates().unwrap();
        assert!(first.cert_path.exists());
        assert!(first.key_path.exists());
        let pem = fs::read_to_string(&first.cert_path).unwrap();

        let second = manager.ensure_certificates().unwrap();
        assert_eq!(first, second);
        assert_eq!(fs::read_to_string(&second.cert_path).unwrap(), pem);
    }

    #[test]
    fn leaf_is_issued_and_cached() {
        let (_dir, manager) = manager();

        let leaf = manager.certificate_for("Chat.Example.com:443").unwrap();
        assert!(leaf.cert_path.ends_with("certs/chat.example.com.crt"));
        assert!(leaf.key_path.exists());
        let pem = fs::read_to_string(&leaf.cert_path).unwrap();

        let again = manager.certificate_for("chat.example.com").unwrap();
        assert_eq!(leaf, again);
        assert_eq!(fs::read_to_string(&again.cert_path).unwrap(), pem);

        // Root was created on demand.
        assert!(manager.ca_exists());
    }

    #[test]
    fn leaf_survives_new_manager_instance() {
        let (dir, manager) = manager();
        let leaf = manager.certificate_for("example.com").unwrap();
        let pem = fs::read_to_string(&leaf.cert_path).unwrap();

        let reopened = CaManager::new(dir.path());
        let again = reopened.certificate_for("example.com").unwrap();
        assert_eq!(fs::read_to_string(&again.cert_path).unwrap(), pem);
    }

    #[test]
    fn delete_forces_full_regeneration() {
        let (_dir, manager) = manager();
        let root_pem = {
            let paths = manager.ensure_certificates().unwrap();
            fs::read_to_string(paths.cert_path).unwrap()
        };
        let leaf = manager.certificate_for("example.com").unwrap();

        manager.delete().unwrap();
        assert!(!manager.ca_exists());
        assert!(!leaf.cert_path.exists());

        let leaf = manager.certificate_for("example.com").unwrap();
        assert!(leaf.cert_path.exists());
        let new_root = fs::read_to_string(manager.cert_path()).unwrap();
        assert_ne!(root_pem, new_root);
    }

    #[test]
    fn invalid_hosts_are_rejected() {
        let (_dir, manager) = manager();
        for host in ["", "../etc", "a/b", "bad host"] {
            assert!(
                matches!(manager.certificate_for(host), Err(CaManagerError::InvalidHost(_))),
                "{host:?}"
            );
        }
    }

    #[test]
    fn ip_hosts_are_supported() {
        assert_eq!(normalize_host("127.0.0.1:8443").unwrap(), "127.0.0.1");
        assert_eq!(normalize_host("[::1]:443").unwrap(), "__1");
    }

    #[test]
    fn read_cert_der_matches_pem() {
        let (_dir, manager) = manager();
        manager.ensure_certificates().unwrap();

        let der = manager.read_cert_der().unwrap();
        let from_pem = read_certs(&manager.cert_path()).unwrap();
        assert_eq!(der, from_pem[0].to_vec());
    }

    #[tokio::test]
    async fn leaf_authority_serves_and_caches_config() {
        let (_dir, manager) = manager();
        let authority = LeafAuthority::new(manager.clone()).unwrap();
        let target = Authority::from_static("api.example.com:443");

        let first = authority.gen_server_config(&target).await;
        let second = authority.gen_server_config(&target).await;

        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.alpn_protocols.contains(&b"h2".to_vec()));
        assert!(manager
            .certificate_for("api.example.com")
            .unwrap()
            .cert_path
            .exists());
    }

    #[tokio::test]
    async fn leaf_authority_reissues_after_delete() {
        let (_dir, manager) = manager();
        let authority = LeafAuthority::new(manager.clone()).unwrap();
        let target = Authority::from_static("api.example.com:443");

        let before = authority.gen_server_config(&target).await;
        let old_root = fs::read_to_string(manager.cert_path()).unwrap();

        manager.delete().unwrap();
        let after = authority.gen_server_config(&target).await;

        assert!(!Arc::ptr_eq(&before, &after));
        let new_root = fs::read_to_string(manager.cert_path()).unwrap();
        assert_ne!(old_root, new_root);
        assert!(manager
            .certificate_for("api.example.com")
            .unwrap()
            .cert_path
            .exists());
    }

    #[test]
    fn clearing_leaves_bumps_generation() {
        let (_dir, manager) = manager();
        let shared = manager.clone();
        let start = manager.generation();

        manager.generate_ca().unwrap();
        manager.delete().unwrap();

        assert_eq!(shared.generation(), start + 2);
    }
}
