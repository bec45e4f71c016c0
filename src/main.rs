use harborgate::acme::{AcmeIssuer, AcmeSettings};
use harborgate::certstore::CertificateStore;
use harborgate::challenges::ChallengeStore;
use harborgate::config::{CertificateProviderKind, Config};
use harborgate::docker::{running_in_container, ContainerSource, DockerSource};
use harborgate::observer::ContainerObserver;
use harborgate::oidc::{OidcAuthenticator, OidcSettings, SessionCrypto};
use harborgate::provider::{CertificateIssuer, CertificateManager, SelfSignedIssuer};
use harborgate::proxy::{GatewayContext, SERVICE_NAME, VERSION};
use harborgate::renewal::{prewarm_certificates, RenewalLoop};
use harborgate::routes::RouteTable;
use harborgate::server;
use harborgate::upstream::UpstreamPool;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("harborgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("harborgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Certificate plumbing.
    let challenges = ChallengeStore::new();
    let cert_store = Arc::new(CertificateStore::with_storage(&config.tls.storage_path)?);
    cert_store.load_persisted()?;

    let issuer: Arc<dyn CertificateIssuer> = match config.tls.provider {
        CertificateProviderKind::SelfSigned => Arc::new(SelfSignedIssuer),
        CertificateProviderKind::LetsEncrypt => {
            let settings = AcmeSettings {
                email: config.acme.email.clone().unwrap_or_default(),
                accept_tos: config.acme.accept_tos,
                staging: config.acme.staging,
                directory_url: config.acme.directory_url.clone(),
                skip_tls_verify: config.acme.skip_tls_verify,
                account_dir: PathBuf::from(&config.tls.storage_path),
            };
            Arc::new(AcmeIssuer::new(settings, challenges.clone())?)
        }
    };
    let cert_manager = Arc::new(CertificateManager::new(issuer, Arc::clone(&cert_store)));

    // OIDC validation is fatal when it fails; a half-authenticated gateway
    // must not come up.
    let oidc = if config.oidc.enabled {
        let crypto = match config.server.session_key.as_deref() {
            Some(key) => SessionCrypto::from_base64(key)?,
            None => {
                warn!("No session key configured; sessions will not survive a restart");
                SessionCrypto::generate()
            }
        };

        let mut settings = OidcSettings::new(
            config.oidc.authority.clone().unwrap_or_default(),
            config.oidc.client_id.clone().unwrap_or_default(),
            config.oidc.client_secret.clone().unwrap_or_default(),
        );
        settings.callback_path = config.oidc.callback_path.clone();
        settings.scope = config.oidc.scope.clone();
        settings.role_claim = config.oidc.role_claim.clone();
        settings.require_https_metadata = config.oidc.require_https_metadata;
        settings.save_tokens = config.oidc.save_tokens;
        settings.public_origin = config.server.public_origin.clone();

        let authenticator = OidcAuthenticator::discover(settings, crypto)
            .await
            .map_err(|e| {
                error!(error = %e, "OIDC provider validation failed");
                e
            })?;
        Some(Arc::new(authenticator))
    } else {
        None
    };

    let routes = Arc::new(RouteTable::new());
    let ctx = Arc::new(GatewayContext {
        routes: Arc::clone(&routes),
        challenges,
        oidc,
        upstream: UpstreamPool::new(),
        https_enabled: config.server.https_enabled,
        redirect_http_to_https: config.server.redirect_http_to_https,
        https_port: config.server.https_port,
    });

    // Both listeners must be bound before the observer starts feeding
    // routes, so no traffic is lost during startup.
    let http_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.http_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid HTTP bind address: {e}"))?;
    let http_listener = server::bind(http_addr).await?;

    let https_listener = if config.server.https_enabled {
        let https_addr: SocketAddr =
            format!("{}:{}", config.server.bind, config.server.https_port)
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid HTTPS bind address: {e}"))?;
        Some(server::bind(https_addr).await?)
    } else {
        None
    };

    // Container engine.
    let source: Arc<dyn ContainerSource> =
        Arc::new(DockerSource::connect(config.docker.host.as_deref()).await?);
    let inside_container = running_in_container();
    if inside_container {
        info!("Running inside a container, routing to container network addresses");
    }

    let observer = ContainerObserver::new(source, Arc::clone(&routes), inside_container);
    let observer_handle = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { observer.run(shutdown).await }
    });

    let renewal_handle = tokio::spawn({
        let renewal = RenewalLoop::new(Arc::clone(&cert_manager));
        let shutdown = shutdown_rx.clone();
        async move { renewal.run(shutdown).await }
    });

    let prewarm_handle = tokio::spawn(prewarm_certificates(
        Arc::clone(&routes),
        Arc::clone(&cert_manager),
        shutdown_rx.clone(),
    ));

    let http_handle = tokio::spawn(server::serve_plain(
        http_listener,
        Arc::clone(&ctx),
        shutdown_rx.clone(),
    ));

    let https_handle = https_listener.map(|listener| {
        tokio::spawn(server::serve_tls(
            listener,
            Arc::clone(&ctx),
            Arc::clone(&cert_manager),
            shutdown_rx.clone(),
        ))
    });

    wait_for_shutdown_signal().await;

    let _ = shutdown_tx.send(true);

    // Let in-flight work drain, then leave.
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = observer_handle.await;
        let _ = renewal_handle.await;
        let _ = prewarm_handle.await;
        let _ = http_handle.await;
        if let Some(handle) = https_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = SERVICE_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        http_port = config.server.http_port,
        https_port = if config.server.https_enabled {
            Some(config.server.https_port)
        } else {
            None
        },
        redirect = config.server.redirect_http_to_https,
        "Listener configuration"
    );
    info!(
        provider = ?config.tls.provider,
        storage = %config.tls.storage_path,
        acme_staging = config.acme.staging,
        "Certificate configuration"
    );
    info!(
        oidc = config.oidc.enabled,
        authority = config.oidc.authority.as_deref().unwrap_or("-"),
        "Authentication configuration"
    );
}
