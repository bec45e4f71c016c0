//! ACME (Let's Encrypt) certificate issuance
//!
//! Orders one certificate per host using the HTTP-01 challenge. The pending
//! challenge token is deposited in the shared [`ChallengeStore`] so the
//! plaintext listener can answer the authority's validation request, and is
//! removed again whether or not the order succeeds.

use crate::challenges::ChallengeStore;
use crate::certstore::CertificateOrigin;
use crate::provider::{CertificateIssuer, IssuedCertificate};
use anyhow::Context;
use async_trait::async_trait;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, HttpClient, Identifier,
    LetsEncrypt, NewAccount, NewOrder, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const POLL_ATTEMPTS: u32 = 30;

/// ACME account and transport settings.
#[derive(Debug, Clone)]
pub struct AcmeSettings {
    pub email: String,
    pub accept_tos: bool,
    pub staging: bool,
    pub directory_url: Option<String>,
    /// Test-only: trust any directory certificate. Logged at WARN on every use.
    pub skip_tls_verify: bool,
    /// Directory holding the persisted account credentials.
    pub account_dir: PathBuf,
}

impl AcmeSettings {
    pub fn directory_url(&self) -> String {
        if let Some(url) = &self.directory_url {
            return url.clone();
        }
        if self.staging {
            LetsEncrypt::Staging.url().to_string()
        } else {
            LetsEncrypt::Production.url().to_string()
        }
    }
}

pub struct AcmeIssuer {
    settings: AcmeSettings,
    challenges: ChallengeStore,
    account: OnceCell<Account>,
}

impl AcmeIssuer {
    pub fn new(settings: AcmeSettings, challenges: ChallengeStore) -> anyhow::Result<Self> {
        if !settings.accept_tos {
            anyhow::bail!(
                "The ACME provider requires accepting the certificate authority's terms of service"
            );
        }
        if settings.email.trim().is_empty() {
            anyhow::bail!("An account email is required for ACME certificate issuance");
        }
        Ok(Self {
            settings,
            challenges,
            account: OnceCell::new(),
        })
    }

    /// Load the persisted account or register a new one.
    async fn account(&self) -> anyhow::Result<&Account> {
        self.account
            .get_or_try_init(|| async {
                let credentials_path = self.settings.account_dir.join("acme-account.json");

                if credentials_path.exists() {
                    debug!(path = %credentials_path.display(), "Loading ACME account");
                    let data = std::fs::read_to_string(&credentials_path)?;
                    let credentials: AccountCredentials = serde_json::from_str(&data)?;
                    let account = if self.settings.skip_tls_verify {
                        warn!("ACME transport certificate verification is DISABLED (test use only)");
                        Account::from_credentials_and_http(credentials, insecure_transport()?)
                            .await?
                    } else {
                        Account::from_credentials(credentials).await?
                    };
                    return Ok(account);
                }

                let directory_url = self.settings.directory_url();
                info!(directory = %directory_url, email = %self.settings.email, "Registering ACME account");

                let new_account = NewAccount {
                    contact: &[&format!("mailto:{}", self.settings.email)],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                };

                let (account, credentials) = if self.settings.skip_tls_verify {
                    warn!("ACME transport certificate verification is DISABLED (test use only)");
                    Account::create_with_http(
                        &new_account,
                        &directory_url,
                        None,
                        insecure_transport()?,
                    )
                    .await?
                } else {
                    Account::create(&new_account, &directory_url, None).await?
                };

                std::fs::create_dir_all(&self.settings.account_dir)?;
                let data = serde_json::to_string_pretty(&credentials)?;
                std::fs::write(&credentials_path, data)?;
                info!(path = %credentials_path.display(), "ACME account credentials saved");

                Ok(account)
            })
            .await
    }

    /// Serve the HTTP-01 challenge for one authorization and wait for the
    /// authority to validate it. The token is removed in every outcome.
    async fn validate_http01(
        &self,
        order: &mut instant_acme::Order,
        host: &str,
    ) -> anyhow::Result<()> {
        let authorizations = order.authorizations().await?;

        for authz in &authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| {
                    anyhow::anyhow!("Authority offered no HTTP-01 challenge for {host}")
                })?;

            let key_auth = order.key_authorization(challenge);
            let token = challenge.token.clone();
            debug!(host, token = %token, "Serving HTTP-01 challenge");
            self.challenges
                .add(token.clone(), key_auth.as_str().to_string());

            let outcome = self.await_authorization(order, host, &challenge.url).await;
            self.challenges.remove(&token);
            outcome?;
        }

        Ok(())
    }

    async fn await_authorization(
        &self,
        order: &mut instant_acme::Order,
        host: &str,
        challenge_url: &str,
    ) -> anyhow::Result<()> {
        order.set_challenge_ready(challenge_url).await?;

        let mut attempts = 0;
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            order.refresh().await?;

            let authorizations = order.authorizations().await?;
            let status = authorizations
                .iter()
                .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == host))
                .map(|a| &a.status);

            match status {
                Some(AuthorizationStatus::Valid) => {
                    info!(host, "Authorization valid");
                    return Ok(());
                }
                Some(AuthorizationStatus::Invalid) => {
                    anyhow::bail!("Authorization failed for {host}");
                }
                Some(status) => {
                    attempts += 1;
                    if attempts > POLL_ATTEMPTS {
                        anyhow::bail!("Authorization timed out for {host}");
                    }
                    debug!(host, attempt = attempts, status = ?status, "Waiting for authorization");
                }
                None => {
                    anyhow::bail!("Authorization for {host} disappeared from the order");
                }
            }
        }
    }

    async fn await_order_ready(&self, order: &mut instant_acme::Order) -> anyhow::Result<()> {
        let mut attempts = 0;
        loop {
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => anyhow::bail!("Order became invalid"),
                OrderStatus::Pending | OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > POLL_ATTEMPTS {
                        anyhow::bail!("Order timed out before becoming ready");
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                    order.refresh().await?;
                }
            }
        }
    }

    async fn download_certificate(
        &self,
        order: &mut instant_acme::Order,
    ) -> anyhow::Result<String> {
        let mut attempts = 0;
        loop {
            order.refresh().await?;
            match order.state().status {
                OrderStatus::Valid => {
                    if let Some(chain) = order.certificate().await? {
                        return Ok(chain);
                    }
                    anyhow::bail!("Order valid but the authority returned no certificate");
                }
                OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > POLL_ATTEMPTS {
                        anyhow::bail!("Certificate download timed out");
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                status => anyhow::bail!("Unexpected order status while finalizing: {status:?}"),
            }
        }
    }
}

#[async_trait]
impl CertificateIssuer for AcmeIssuer {
    async fn issue(&self, host: &str) -> anyhow::Result<IssuedCertificate> {
        if self.settings.skip_tls_verify {
            warn!(host, "ACME transport certificate verification is DISABLED (test use only)");
        }

        let account = self.account().await?;

        info!(host, "Requesting certificate order");
        let identifiers = [Identifier::Dns(host.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .with_context(|| format!("Failed to create ACME order for {host}"))?;

        self.validate_http01(&mut order, host).await?;
        self.await_order_ready(&mut order).await?;

        // Fresh key per certificate; the CSR carries the host as CN and SAN.
        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, host.to_string());

        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&key_pair)?;
        order.finalize(csr.der()).await?;

        let chain_pem = self.download_certificate(&mut order).await?;

        let chain: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(chain_pem.as_bytes()))
                .collect::<Result<Vec<_>, _>>()
                .context("Authority returned an unparseable certificate chain")?;
        if chain.is_empty() {
            anyhow::bail!("Authority returned an empty certificate chain for {host}");
        }

        let key = PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| anyhow::anyhow!("Failed to encode certificate key: {e}"))?;

        info!(host, "Certificate issued");
        Ok(IssuedCertificate { chain, key })
    }

    fn origin(&self) -> CertificateOrigin {
        CertificateOrigin::Acme
    }
}

/// Transport that accepts any directory certificate. Only reachable behind
/// the `skip_tls_verify` flag.
fn insecure_transport() -> anyhow::Result<Box<dyn HttpClient>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let tls = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {e}"))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
        .with_no_client_auth();

    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();

    let client: Client<_, http_body_util::Full<hyper::body::Bytes>> =
        Client::builder(TokioExecutor::new()).build(connector);
    Ok(Box::new(client))
}

#[derive(Debug)]
struct NoVerification(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}
