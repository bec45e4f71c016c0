//! Certificate cache
//!
//! In-memory map of host to certificate record, persisted as passwordless
//! PKCS#12 archives under the storage directory. Records are loaded back on
//! startup; expired records stay in the map (so the renewal loop sees them)
//! but are never served.

use anyhow::Context;
use p12_keystore::{Certificate as P12Certificate, KeyStore, KeyStoreEntry, PrivateKeyChain};
use parking_lot::RwLock;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Renewal window: a record is fresh while more than this much validity
/// remains.
pub const RENEWAL_WINDOW_SECS: i64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateOrigin {
    SelfSigned,
    Acme,
    Loaded,
}

pub struct CertificateRecord {
    pub host: String,
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub certified: Arc<CertifiedKey>,
    pub issued_at: i64,
    pub not_after: i64,
    pub origin: CertificateOrigin,
}

impl CertificateRecord {
    pub fn is_expired(&self) -> bool {
        now_unix() >= self.not_after
    }

    /// Fresh while more than the renewal window remains before expiry.
    pub fn is_fresh(&self) -> bool {
        now_unix() < self.not_after - RENEWAL_WINDOW_SECS
    }
}

pub struct CertificateStore {
    records: RwLock<HashMap<String, Arc<CertificateRecord>>>,
    storage_path: Option<PathBuf>,
}

impl CertificateStore {
    /// In-memory only store.
    pub fn ephemeral() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            storage_path: None,
        }
    }

    /// Store persisting PKCS#12 archives under `storage_path`.
    pub fn with_storage(storage_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let storage_path = storage_path.into();
        std::fs::create_dir_all(&storage_path).with_context(|| {
            format!(
                "Failed to create certificate storage directory '{}'",
                storage_path.display()
            )
        })?;
        Ok(Self {
            records: RwLock::new(HashMap::new()),
            storage_path: Some(storage_path),
        })
    }

    /// Serveable record for `host`; expired records are treated as absent.
    pub fn get(&self, host: &str) -> Option<Arc<CertificateRecord>> {
        let records = self.records.read();
        records.get(host).filter(|r| !r.is_expired()).cloned()
    }

    /// Record regardless of expiry; renewal needs to see aging records.
    pub fn record(&self, host: &str) -> Option<Arc<CertificateRecord>> {
        self.records.read().get(host).cloned()
    }

    /// All hosts the store knows about.
    pub fn hosts(&self) -> Vec<String> {
        self.records.read().keys().cloned().collect()
    }

    /// Insert a record and persist it to disk.
    pub fn store(
        &self,
        host: &str,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        origin: CertificateOrigin,
    ) -> anyhow::Result<Arc<CertificateRecord>> {
        let record = Arc::new(build_record(host, chain, key, origin)?);

        let mut records = self.records.write();
        if let Some(dir) = &self.storage_path {
            let path = dir.join(format!("{}.pfx", sanitize_host(host)));
            write_pkcs12(&path, &record)
                .with_context(|| format!("Failed to persist certificate for {host}"))?;
            info!(host, path = %path.display(), "Certificate persisted");
        }
        records.insert(host.to_string(), Arc::clone(&record));

        info!(
            host,
            origin = ?record.origin,
            not_after = record.not_after,
            "Certificate stored"
        );
        Ok(record)
    }

    /// Load every PKCS#12 archive from the storage directory. Unreadable
    /// archives are skipped with a warning; expired ones are kept but
    /// flagged through [`CertificateRecord::is_expired`].
    pub fn load_persisted(&self) -> anyhow::Result<usize> {
        let Some(dir) = &self.storage_path else {
            return Ok(0);
        };

        let mut loaded = 0;
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read certificate storage '{}'", dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pfx") {
                continue;
            }

            match read_pkcs12(&path) {
                Ok((host, chain, key)) => {
                    match build_record(&host, chain, key, CertificateOrigin::Loaded) {
                        Ok(record) => {
                            if record.is_expired() {
                                warn!(host = %record.host, "Loaded certificate is expired, a fresh one will be acquired on demand");
                            } else {
                                debug!(host = %record.host, "Loaded persisted certificate");
                            }
                            self.records
                                .write()
                                .insert(record.host.clone(), Arc::new(record));
                            loaded += 1;
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "Skipping unusable certificate archive");
                        }
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable certificate archive");
                }
            }
        }

        if loaded > 0 {
            info!(count = loaded, path = %dir.display(), "Persisted certificates loaded");
        }
        Ok(loaded)
    }
}

fn build_record(
    host: &str,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    origin: CertificateOrigin,
) -> anyhow::Result<CertificateRecord> {
    let leaf = chain
        .first()
        .ok_or_else(|| anyhow::anyhow!("Empty certificate chain for {host}"))?;
    let (issued_at, not_after) = validity_window(leaf)?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| anyhow::anyhow!("Unsupported private key for {host}: {e}"))?;
    let certified = Arc::new(CertifiedKey::new(chain.clone(), signing_key));

    Ok(CertificateRecord {
        host: host.to_string(),
        chain,
        key,
        certified,
        issued_at,
        not_after,
        origin,
    })
}

/// (not_before, not_after) of a DER certificate as Unix timestamps.
fn validity_window(cert: &CertificateDer<'_>) -> anyhow::Result<(i64, i64)> {
    use x509_parser::prelude::*;

    let (_, parsed) = X509Certificate::from_der(cert.as_ref())
        .map_err(|e| anyhow::anyhow!("Failed to parse X.509 certificate: {e}"))?;
    let validity = parsed.validity();
    Ok((
        validity.not_before.timestamp(),
        validity.not_after.timestamp(),
    ))
}

/// Replace anything outside the legal DNS hostname alphabet with `_`.
/// Legal hostnames survive unchanged, so the mapping is collision-free for
/// them.
pub fn sanitize_host(host: &str) -> String {
    host.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn write_pkcs12(path: &Path, record: &CertificateRecord) -> anyhow::Result<()> {
    let mut keystore = KeyStore::new();

    let chain = record
        .chain
        .iter()
        .map(|der| P12Certificate::from_der(der.as_ref()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to encode certificate chain: {e}"))?;

    let key_chain = PrivateKeyChain::new(
        record.key.secret_der().to_vec(),
        record.host.as_bytes().to_vec(),
        chain,
    );
    keystore.add_entry(&record.host, KeyStoreEntry::PrivateKeyChain(key_chain));

    let bytes = keystore
        .writer("")
        .write()
        .map_err(|e| anyhow::anyhow!("Failed to assemble PKCS#12 archive: {e}"))?;

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(&bytes)?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, &bytes)?;
    }

    Ok(())
}

fn read_pkcs12(
    path: &Path,
) -> anyhow::Result<(String, Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let bytes = std::fs::read(path)?;
    let keystore = KeyStore::from_pkcs12(&bytes, "")
        .map_err(|e| anyhow::anyhow!("Failed to parse PKCS#12 archive: {e}"))?;

    let (_, key_chain) = keystore
        .private_key_chain()
        .ok_or_else(|| anyhow::anyhow!("Archive contains no private key chain"))?;

    let chain: Vec<CertificateDer<'static>> = key_chain
        .chain()
        .iter()
        .map(|cert| CertificateDer::from(cert.as_der().to_vec()))
        .collect();
    if chain.is_empty() {
        anyhow::bail!("Archive contains no certificates");
    }

    let key = PrivateKeyDer::try_from(key_chain.key().to_vec())
        .map_err(|e| anyhow::anyhow!("Archive private key is unusable: {e}"))?;

    // The SAN of the leaf names the host; fall back to the file name.
    let host = leaf_host(&chain[0]).unwrap_or_else(|| {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    });

    Ok((host, chain, key))
}

/// First subjectAltName DNS entry of a certificate.
fn leaf_host(cert: &CertificateDer<'_>) -> Option<String> {
    use x509_parser::extensions::GeneralName;
    use x509_parser::prelude::*;

    let (_, parsed) = X509Certificate::from_der(cert.as_ref()).ok()?;
    let san = parsed.subject_alternative_name().ok()??;
    san.value.general_names.iter().find_map(|name| match name {
        GeneralName::DNSName(dns) => Some(dns.to_string()),
        _ => None,
    })
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
    use time::{Duration as TimeDuration, OffsetDateTime};

    fn generate(host: &str, valid_for_days: i64) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        let mut params = CertificateParams::new(vec![host.to_string()]).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, host.to_string());
        params.not_before = OffsetDateTime::now_utc() - TimeDuration::days(1);
        params.not_after = OffsetDateTime::now_utc() + TimeDuration::days(valid_for_days);

        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let cert = params.self_signed(&key_pair).unwrap();

        let chain = vec![CertificateDer::from(cert.der().to_vec())];
        let key = PrivateKeyDer::try_from(key_pair.serialize_der()).unwrap();
        (chain, key)
    }

    #[test]
    fn sanitize_is_identity_for_legal_hostnames() {
        assert_eq!(sanitize_host("app1.test.local"), "app1.test.local");
        assert_eq!(sanitize_host("my-app.example.com"), "my-app.example.com");
    }

    #[test]
    fn sanitize_replaces_invalid_characters() {
        assert_eq!(sanitize_host("a/b\\c:d"), "a_b_c_d");
        assert_eq!(sanitize_host("host name"), "host_name");
    }

    #[test]
    fn store_and_get() {
        let store = CertificateStore::ephemeral();
        let (chain, key) = generate("app.test", 90);

        store
            .store("app.test", chain, key, CertificateOrigin::SelfSigned)
            .unwrap();

        let record = store.get("app.test").unwrap();
        assert_eq!(record.host, "app.test");
        assert_eq!(record.origin, CertificateOrigin::SelfSigned);
        assert!(record.is_fresh());
        assert!(store.get("other.test").is_none());
    }

    #[test]
    fn expired_records_are_absent_from_get() {
        let store = CertificateStore::ephemeral();
        let (chain, key) = generate("old.test", -1);

        store
            .store("old.test", chain, key, CertificateOrigin::SelfSigned)
            .unwrap();

        assert!(store.get("old.test").is_none());
        // The renewal loop still sees it.
        let record = store.record("old.test").unwrap();
        assert!(record.is_expired());
    }

    #[test]
    fn aging_record_is_served_but_not_fresh() {
        let store = CertificateStore::ephemeral();
        let (chain, key) = generate("aging.test", 10);

        store
            .store("aging.test", chain, key, CertificateOrigin::Acme)
            .unwrap();

        let record = store.get("aging.test").unwrap();
        assert!(!record.is_fresh());
        assert!(!record.is_expired());
    }

    #[test]
    fn persist_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (chain, key) = generate("disk.test", 90);

        {
            let store = CertificateStore::with_storage(dir.path()).unwrap();
            store
                .store("disk.test", chain, key, CertificateOrigin::Acme)
                .unwrap();
            assert!(dir.path().join("disk.test.pfx").exists());
        }

        let store = CertificateStore::with_storage(dir.path()).unwrap();
        assert_eq!(store.load_persisted().unwrap(), 1);

        let record = store.get("disk.test").unwrap();
        assert_eq!(record.host, "disk.test");
        assert_eq!(record.origin, CertificateOrigin::Loaded);
        assert!(!record.is_expired());
    }

    #[test]
    fn unreadable_archives_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("garbage.pfx"), b"not a pkcs12 archive").unwrap();

        let store = CertificateStore::with_storage(dir.path()).unwrap();
        assert_eq!(store.load_persisted().unwrap(), 0);
    }
}
