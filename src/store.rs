//! # Certificate output store
//!
//! Issued certificates are written to `<base>/<primary-domain>/` as
//! `cert.pem`, `chain.pem`, `fullchain.pem` and `privkey.pem`. Every file is
//! written to a temporary file in the same directory and renamed into place,
//! so readers never observe a partially written certificate.

use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use pkcs8::der::zeroize::Zeroizing;
use rand::Rng;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::cert::{self, CertificateKey};
use crate::schema::orders::CertificateChain;

/// Leaf certificate file name.
pub const CERT_FILE: &str = "cert.pem";
/// Intermediate chain file name.
pub const CHAIN_FILE: &str = "chain.pem";
/// Leaf followed by intermediates.
pub const FULLCHAIN_FILE: &str = "fullchain.pem";
/// Certificate private key file name.
pub const PRIVKEY_FILE: &str = "privkey.pem";

/// Renew certificates which expire within this many days.
pub const DEFAULT_RENEWAL_DAYS: i64 = 30;

/// Errors reading or writing the certificate store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A file could not be read or written.
    #[error("{}: {source}", path.display())]
    Io {
        /// The file involved.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A stored or issued certificate could not be parsed.
    #[error("{}: invalid certificate: {detail}", path.display())]
    Certificate {
        /// The certificate source.
        path: PathBuf,
        /// What was wrong with it.
        detail: String,
    },
}

impl StoreError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
        move |source| StoreError::Io {
            path: path.to_owned(),
            source,
        }
    }

    pub(crate) fn certificate<E: fmt::Display>(path: &Path, error: E) -> StoreError {
        StoreError::Certificate {
            path: path.to_owned(),
            detail: error.to_string(),
        }
    }
}

/// Everything produced by a successful issuance.
#[derive(Clone)]
pub struct CertificateBundle {
    /// The requested names, in request order.
    pub domains: Vec<String>,
    /// The leaf certificate, PEM.
    pub leaf_pem: String,
    /// Intermediates, PEM, possibly empty.
    pub chain_pem: String,
    /// `leaf_pem` followed by `chain_pem`.
    pub fullchain_pem: String,
    /// The certificate private key, PKCS#8 PEM.
    pub private_key_pem: Zeroizing<String>,
    /// Start of the leaf's validity window.
    pub not_before: DateTime<Utc>,
    /// End of the leaf's validity window.
    pub not_after: DateTime<Utc>,
    /// The directory the bundle was saved to.
    pub path: Option<PathBuf>,
}

impl CertificateBundle {
    /// Assemble a bundle from a downloaded chain and the key that signed the CSR.
    pub fn new(
        domains: Vec<String>,
        chain: &CertificateChain,
        key: &CertificateKey,
    ) -> Result<Self, StoreError> {
        let source = Path::new("<downloaded certificate>");
        let (not_before, not_after) = cert::certificate_validity(chain.leaf())
            .map_err(|error| StoreError::certificate(source, error))?;
        let private_key_pem = key
            .to_pkcs8_pem()
            .map_err(|error| StoreError::certificate(source, error))?;

        Ok(CertificateBundle {
            domains,
            leaf_pem: chain.leaf_pem().to_owned(),
            chain_pem: chain.chain_pem().to_owned(),
            fullchain_pem: chain.fullchain_pem(),
            private_key_pem,
            not_before,
            not_after,
            path: None,
        })
    }
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("domains", &self.domains)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// A certificate already present in the store.
#[derive(Debug, Clone)]
pub struct StoredCertificate {
    /// The bundle directory.
    pub path: PathBuf,
    /// DNS names in the leaf's SubjectAltName extension.
    pub domains: BTreeSet<String>,
    /// Start of the leaf's validity window.
    pub not_before: DateTime<Utc>,
    /// End of the leaf's validity window.
    pub not_after: DateTime<Utc>,
}

impl StoredCertificate {
    /// Does this certificate expire within `within` of `now`?
    pub fn needs_renewal(&self, now: DateTime<Utc>, within: Duration) -> bool {
        self.not_after - now <= within
    }

    /// Does this certificate name exactly the requested domains?
    pub fn covers<S: AsRef<str>>(&self, domains: &[S]) -> bool {
        let requested: BTreeSet<String> = domains
            .iter()
            .map(|d| d.as_ref().to_ascii_lowercase())
            .collect();
        requested == self.domains
    }
}

/// The files of a bundle in write order, flagged when private.
///
/// The key goes first: a reader that finds the new chain also finds its key.
fn bundle_files(bundle: &CertificateBundle) -> [(&'static str, &str, bool); 4] {
    [
        (PRIVKEY_FILE, bundle.private_key_pem.as_str(), true),
        (CERT_FILE, bundle.leaf_pem.as_str(), false),
        (CHAIN_FILE, bundle.chain_pem.as_str(), false),
        (FULLCHAIN_FILE, bundle.fullchain_pem.as_str(), false),
    ]
}

/// The on-disk certificate store rooted at a base directory.
#[derive(Debug, Clone)]
pub struct CertificateStore {
    base: PathBuf,
}

impl CertificateStore {
    /// A store rooted at `base`.
    pub fn new<P: Into<PathBuf>>(base: P) -> Self {
        Self { base: base.into() }
    }

    /// The base directory.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// The bundle directory for a primary domain. `*` becomes `_`.
    pub fn directory_for(&self, domain: &str) -> PathBuf {
        self.base.join(domain.replace('*', "_"))
    }

    /// Write all four files of a bundle, returning the bundle directory.
    pub async fn save(&self, bundle: &CertificateBundle) -> Result<PathBuf, StoreError> {
        let primary = bundle.domains.first().ok_or_else(|| {
            StoreError::certificate(&self.base, "bundle has no domains")
        })?;
        let dir = self.directory_for(primary);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(StoreError::io(&dir))?;

        for (name, contents, private) in bundle_files(bundle) {
            let path = dir.join(name);
            let written = if private {
                write_private(&path, contents.as_bytes()).await
            } else {
                write_atomic(&path, contents.as_bytes(), None).await
            };
            written.map_err(StoreError::io(&path))?;
        }

        tracing::info!(path = %dir.display(), not_after = %bundle.not_after, "Saved certificate bundle");
        Ok(dir)
    }

    /// Read the stored certificate for a primary domain, if there is one.
    pub async fn load(&self, domain: &str) -> Result<Option<StoredCertificate>, StoreError> {
        let dir = self.directory_for(domain);
        let path = dir.join(FULLCHAIN_FILE);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(StoreError::io(&path)(error)),
        };

        let chain =
            CertificateChain::from_pem(&text).map_err(|error| StoreError::certificate(&path, error))?;
        let leaf = chain.leaf();
        let (not_before, not_after) =
            cert::certificate_validity(leaf).map_err(|error| StoreError::certificate(&path, error))?;
        let domains =
            cert::certificate_names(leaf).map_err(|error| StoreError::certificate(&path, error))?;

        Ok(Some(StoredCertificate {
            path: dir,
            domains,
            not_before,
            not_after,
        }))
    }

    /// Read back a full bundle saved by [`CertificateStore::save`].
    pub async fn load_bundle(
        &self,
        domains: &[String],
    ) -> Result<Option<CertificateBundle>, StoreError> {
        let Some(primary) = domains.first() else {
            return Ok(None);
        };
        let dir = self.directory_for(primary);

        let path = dir.join(FULLCHAIN_FILE);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(StoreError::io(&path)(error)),
        };
        let chain =
            CertificateChain::from_pem(&text).map_err(|error| StoreError::certificate(&path, error))?;

        let key_path = dir.join(PRIVKEY_FILE);
        let key = CertificateKey::load(&key_path)
            .await
            .map_err(|error| StoreError::certificate(&key_path, error))?
            .ok_or_else(|| StoreError::certificate(&key_path, "missing private key"))?;

        let mut bundle = CertificateBundle::new(domains.to_vec(), &chain, &key)?;
        bundle.path = Some(dir);
        Ok(Some(bundle))
    }

    /// The existing certificate key for a primary domain, if present and readable.
    pub async fn certificate_key(&self, domain: &str) -> Option<CertificateKey> {
        let path = self.directory_for(domain).join(PRIVKEY_FILE);
        match CertificateKey::load(&path).await {
            Ok(key) => key,
            Err(error) => {
                tracing::warn!(path = %path.display(), "Ignoring unusable certificate key: {error}");
                None
            }
        }
    }
}

/// Write `contents` to `path` atomically, with owner-only permissions on Unix.
pub(crate) async fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    write_atomic(path, contents, Some(0o600)).await
}

/// Write to a temporary sibling of `path`, then rename it over `path`.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8], mode: Option<u32>) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    tokio::fs::create_dir_all(dir).await?;

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let suffix: u32 = rand::thread_rng().gen();
    let temp = dir.join(format!(".{name}.{suffix:08x}.tmp"));

    let result = async {
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            if let Some(mode) = mode {
                options.mode(mode);
            }
        }
        #[cfg(not(unix))]
        let _ = mode;

        let mut file = options.open(&temp).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp, path).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&temp).await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_for(names: &[&str]) -> (CertificateChain, CertificateKey) {
        let key = rcgen::KeyPair::generate().unwrap();
        let params =
            rcgen::CertificateParams::new(names.iter().map(|s| s.to_string()).collect::<Vec<_>>())
                .unwrap();
        let leaf = params.self_signed(&key).unwrap().pem();
        let issuer = rcgen::generate_simple_self_signed(vec!["Intermediate".to_owned()])
            .unwrap()
            .cert
            .pem();
        let chain = CertificateChain::from_pem(&format!("{leaf}{issuer}")).unwrap();
        let cert_key = CertificateKey::from_pem(&key.serialize_pem()).unwrap();
        (chain, cert_key)
    }

    #[tokio::test]
    async fn save_and_load_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path());
        let (chain, key) = chain_for(&["example.com", "*.example.com"]);
        let bundle = CertificateBundle::new(
            vec!["*.example.com".into(), "example.com".into()],
            &chain,
            &key,
        )
        .unwrap();

        let path = store.save(&bundle).await.unwrap();
        assert_eq!(path, dir.path().join("_.example.com"));

        for name in [CERT_FILE, CHAIN_FILE, FULLCHAIN_FILE, PRIVKEY_FILE] {
            assert!(path.join(name).exists(), "{name} missing");
        }
        let fullchain = std::fs::read_to_string(path.join(FULLCHAIN_FILE)).unwrap();
        let leaf = std::fs::read_to_string(path.join(CERT_FILE)).unwrap();
        let intermediates = std::fs::read_to_string(path.join(CHAIN_FILE)).unwrap();
        assert_eq!(fullchain, format!("{leaf}{intermediates}"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(path.join(PRIVKEY_FILE))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let stored = store.load("*.example.com").await.unwrap().unwrap();
        assert_eq!(stored.not_after, bundle.not_after);
        assert!(stored.covers(&["example.com", "*.example.com"]));
        assert!(!stored.covers(&["example.com"]));

        let reused = store.certificate_key("*.example.com").await.unwrap();
        assert!(reused.matches(chain.leaf()));

        let loaded = store
            .load_bundle(&bundle.domains)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.fullchain_pem, bundle.fullchain_pem);
        assert_eq!(loaded.path.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn private_key_is_written_first() {
        let (chain, key) = chain_for(&["example.com"]);
        let bundle = CertificateBundle::new(vec!["example.com".into()], &chain, &key).unwrap();

        let files = bundle_files(&bundle);
        assert_eq!(files[0].0, PRIVKEY_FILE);
        assert!(files[0].2);
        assert!(files[1..].iter().all(|(_, _, private)| !private));
        assert_eq!(files[3], (FULLCHAIN_FILE, bundle.fullchain_pem.as_str(), false));
    }

    #[tokio::test]
    async fn missing_bundle_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path());
        assert!(store.load("example.com").await.unwrap().is_none());
        assert!(store.certificate_key("example.com").await.is_none());
    }

    #[test]
    fn renewal_window() {
        let now = Utc::now();
        let stored = StoredCertificate {
            path: PathBuf::new(),
            domains: BTreeSet::new(),
            not_before: now - Duration::days(60),
            not_after: now + Duration::days(20),
        };
        assert!(stored.needs_renewal(now, Duration::days(DEFAULT_RENEWAL_DAYS)));
        assert!(!stored.needs_renewal(now, Duration::days(10)));
    }

    #[tokio::test]
    async fn atomic_write_replaces_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.pem");
        write_atomic(&path, b"one", None).await.unwrap();
        write_atomic(&path, b"two", None).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
