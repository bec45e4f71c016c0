//! Certificate acquisition
//!
//! Issuers produce a certificate chain and key for a host; the
//! `CertificateManager` layers caching, persistence and per-host
//! single-flight on top, and is what the TLS front-end and the renewal
//! loop talk to.

use crate::certstore::{CertificateOrigin, CertificateRecord, CertificateStore};
use async_trait::async_trait;
use dashmap::DashMap;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, PKCS_RSA_SHA256,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::sync::Arc;
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::{debug, info};

/// A freshly issued certificate chain with its private key.
pub struct IssuedCertificate {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// Something that can mint a certificate for a host.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(&self, host: &str) -> anyhow::Result<IssuedCertificate>;

    fn origin(&self) -> CertificateOrigin;
}

/// Cache-fronted, single-flight certificate acquisition.
pub struct CertificateManager {
    issuer: Arc<dyn CertificateIssuer>,
    store: Arc<CertificateStore>,
    // One guard per host; concurrent acquirers for the same host serialise
    // here and the losers pick the winner's record up from the store.
    inflight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl CertificateManager {
    pub fn new(issuer: Arc<dyn CertificateIssuer>, store: Arc<CertificateStore>) -> Self {
        Self {
            issuer,
            store,
            inflight: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<CertificateStore> {
        &self.store
    }

    /// Serveable certificate for `host`, issuing one if the store has none.
    pub async fn acquire(&self, host: &str) -> anyhow::Result<Arc<CertificateRecord>> {
        if let Some(record) = self.store.get(host) {
            return Ok(record);
        }

        let guard = self.host_guard(host);
        let _locked = guard.lock().await;

        // Another task may have finished while we waited for the guard.
        if let Some(record) = self.store.get(host) {
            debug!(host, "Certificate acquired by concurrent request");
            return Ok(record);
        }

        info!(host, origin = ?self.issuer.origin(), "Issuing certificate");
        let issued = self.issuer.issue(host).await?;
        self.store
            .store(host, issued.chain, issued.key, self.issuer.origin())
    }

    /// True when the store has no serveable, fresh record for `host`.
    pub fn needs_renewal(&self, host: &str) -> bool {
        match self.store.record(host) {
            Some(record) => !record.is_fresh(),
            None => true,
        }
    }

    /// Unconditionally reissue, replacing whatever record exists.
    pub async fn renew(&self, host: &str) -> anyhow::Result<Arc<CertificateRecord>> {
        let guard = self.host_guard(host);
        let _locked = guard.lock().await;

        info!(host, origin = ?self.issuer.origin(), "Renewing certificate");
        let issued = self.issuer.issue(host).await?;
        self.store
            .store(host, issued.chain, issued.key, self.issuer.origin())
    }

    fn host_guard(&self, host: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inflight
            .entry(host.to_string())
            .or_default()
            .clone()
    }
}

/// Development issuer: self-signed certificates, no external authority.
pub struct SelfSignedIssuer;

const SELF_SIGNED_VALIDITY_DAYS: i64 = 365;

#[async_trait]
impl CertificateIssuer for SelfSignedIssuer {
    async fn issue(&self, host: &str) -> anyhow::Result<IssuedCertificate> {
        let host = host.to_string();
        // RSA key generation is CPU-bound; keep it off the runtime threads.
        tokio::task::spawn_blocking(move || generate_self_signed(&host)).await?
    }

    fn origin(&self) -> CertificateOrigin {
        CertificateOrigin::SelfSigned
    }
}

fn generate_self_signed(host: &str) -> anyhow::Result<IssuedCertificate> {
    let rsa_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048)
        .map_err(|e| anyhow::anyhow!("RSA key generation failed: {e}"))?;
    let pkcs8 = rsa_key
        .to_pkcs8_der()
        .map_err(|e| anyhow::anyhow!("Failed to encode RSA key: {e}"))?;

    let key_der = PrivatePkcs8KeyDer::from(pkcs8.as_bytes().to_vec());
    let key_pair = KeyPair::from_pkcs8_der_and_sign_algo(&key_der, &PKCS_RSA_SHA256)
        .map_err(|e| anyhow::anyhow!("Failed to load RSA key pair: {e}"))?;

    let mut params = CertificateParams::new(vec![host.to_string()])?;
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, host.to_string());
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = OffsetDateTime::now_utc() + TimeDuration::days(SELF_SIGNED_VALIDITY_DAYS);
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let cert = params.self_signed(&key_pair)?;

    Ok(IssuedCertificate {
        chain: vec![CertificateDer::from(cert.der().to_vec())],
        key: PrivateKeyDer::from(PrivatePkcs8KeyDer::from(pkcs8.as_bytes().to_vec())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Issuer that counts invocations and mints short ECDSA certs quickly.
    struct CountingIssuer {
        calls: AtomicUsize,
        delay: std::time::Duration,
    }

    impl CountingIssuer {
        fn new(delay: std::time::Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl CertificateIssuer for CountingIssuer {
        async fn issue(&self, host: &str) -> anyhow::Result<IssuedCertificate> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;

            let mut params = CertificateParams::new(vec![host.to_string()])?;
            params.not_after = OffsetDateTime::now_utc() + TimeDuration::days(90);
            let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
            let cert = params.self_signed(&key_pair)?;
            Ok(IssuedCertificate {
                chain: vec![CertificateDer::from(cert.der().to_vec())],
                key: PrivateKeyDer::try_from(key_pair.serialize_der())
                    .map_err(|e| anyhow::anyhow!("{e}"))?,
            })
        }

        fn origin(&self) -> CertificateOrigin {
            CertificateOrigin::Acme
        }
    }

    #[tokio::test]
    async fn acquire_caches_in_store() {
        let issuer = Arc::new(CountingIssuer::new(std::time::Duration::ZERO));
        let manager = CertificateManager::new(
            Arc::clone(&issuer) as Arc<dyn CertificateIssuer>,
            Arc::new(CertificateStore::ephemeral()),
        );

        manager.acquire("app.test").await.unwrap();
        manager.acquire("app.test").await.unwrap();

        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_acquires_single_flight() {
        let issuer = Arc::new(CountingIssuer::new(std::time::Duration::from_millis(100)));
        let manager = Arc::new(CertificateManager::new(
            Arc::clone(&issuer) as Arc<dyn CertificateIssuer>,
            Arc::new(CertificateStore::ephemeral()),
        ));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.acquire("shared.test").await })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_hosts_issue_independently() {
        let issuer = Arc::new(CountingIssuer::new(std::time::Duration::ZERO));
        let manager = CertificateManager::new(
            Arc::clone(&issuer) as Arc<dyn CertificateIssuer>,
            Arc::new(CertificateStore::ephemeral()),
        );

        manager.acquire("a.test").await.unwrap();
        manager.acquire("b.test").await.unwrap();

        assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn needs_renewal_for_unknown_and_aging_hosts() {
        let issuer = Arc::new(CountingIssuer::new(std::time::Duration::ZERO));
        let manager = CertificateManager::new(
            Arc::clone(&issuer) as Arc<dyn CertificateIssuer>,
            Arc::new(CertificateStore::ephemeral()),
        );

        assert!(manager.needs_renewal("unknown.test"));

        manager.acquire("app.test").await.unwrap();
        // 90-day cert is well outside the renewal window.
        assert!(!manager.needs_renewal("app.test"));
    }

    #[tokio::test]
    async fn self_signed_certificate_shape() {
        let issued = SelfSignedIssuer.issue("dev.test").await.unwrap();
        assert_eq!(issued.chain.len(), 1);

        use x509_parser::prelude::*;
        let (_, cert) = X509Certificate::from_der(issued.chain[0].as_ref()).unwrap();

        // CN and SAN both name the host.
        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap();
        assert_eq!(cn, "dev.test");

        let san = cert.subject_alternative_name().unwrap().unwrap();
        assert!(san.value.general_names.iter().any(|name| matches!(
            name,
            x509_parser::extensions::GeneralName::DNSName(d) if *d == "dev.test"
        )));

        // Not a CA, valid for about a year.
        let basic_constraints = cert.basic_constraints().unwrap();
        assert!(!basic_constraints.map(|ext| ext.value.ca).unwrap_or(false));
        let validity = cert.validity();
        let lifetime_days =
            (validity.not_after.timestamp() - validity.not_before.timestamp()) / 86_400;
        assert!((364..=366).contains(&lifetime_days));
    }
}
