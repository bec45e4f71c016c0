//! Gateway configuration
//!
//! Settings come from an optional TOML file with environment variables
//! layered on top; the environment always wins. Configuration problems
//! that would leave the gateway half-working are fatal at startup.

use serde::Deserialize;
use std::path::Path;
use tracing::warn;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub acme: AcmeConfig,

    #[serde(default)]
    pub oidc: OidcConfig,

    #[serde(default)]
    pub docker: DockerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Plaintext port (default: 80)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// TLS port (default: 443)
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Whether the TLS listener is enabled (default: true)
    #[serde(default = "default_true")]
    pub https_enabled: bool,

    /// Redirect plaintext requests to HTTPS (default: true)
    #[serde(default = "default_true")]
    pub redirect_http_to_https: bool,

    /// External origin for OIDC redirect URIs; derived from the request
    /// when unset.
    pub public_origin: Option<String>,

    /// Base64-encoded 32-byte session encryption key. A random key is
    /// generated when unset, which invalidates sessions across restarts.
    pub session_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            https_enabled: true,
            redirect_http_to_https: true,
            public_origin: None,
            session_key: None,
        }
    }
}

/// Which authority mints certificates.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum CertificateProviderKind {
    /// Self-signed certificates for development
    #[default]
    #[serde(alias = "self-signed", alias = "selfsigned")]
    SelfSigned,
    /// ACME against Let's Encrypt (or a compatible directory)
    #[serde(alias = "lets-encrypt", alias = "letsencrypt", alias = "acme")]
    LetsEncrypt,
}

impl std::str::FromStr for CertificateProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "selfsigned" | "self-signed" => Ok(Self::SelfSigned),
            "letsencrypt" | "lets-encrypt" | "acme" => Ok(Self::LetsEncrypt),
            other => anyhow::bail!(
                "Unknown certificate provider '{other}'. Expected 'SelfSigned' or 'LetsEncrypt'"
            ),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsConfig {
    /// Certificate provider (default: SelfSigned)
    #[serde(default)]
    pub provider: CertificateProviderKind,

    /// Directory for PKCS#12 archives and ACME account state
    #[serde(default = "default_storage_path")]
    pub storage_path: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            provider: CertificateProviderKind::default(),
            storage_path: default_storage_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AcmeConfig {
    /// Contact email, required when the LetsEncrypt provider is selected
    pub email: Option<String>,

    /// The CA's terms of service must be accepted explicitly
    #[serde(default)]
    pub accept_tos: bool,

    /// Use the staging directory
    #[serde(default)]
    pub staging: bool,

    /// Explicit directory URL override
    pub directory_url: Option<String>,

    /// Test-only: skip TLS verification on the ACME transport
    #[serde(default)]
    pub skip_tls_verify: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OidcConfig {
    #[serde(default)]
    pub enabled: bool,

    pub authority: Option<String>,

    pub client_id: Option<String>,

    pub client_secret: Option<String>,

    #[serde(default = "default_callback_path")]
    pub callback_path: String,

    #[serde(default = "default_scope")]
    pub scope: String,

    /// Claim carrying the user's roles (default: "roles")
    #[serde(default = "default_role_claim")]
    pub role_claim: String,

    #[serde(default = "default_true")]
    pub require_https_metadata: bool,

    /// Keep access and ID tokens in the session cookie (default: false)
    #[serde(default)]
    pub save_tokens: bool,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            authority: None,
            client_id: None,
            client_secret: None,
            callback_path: default_callback_path(),
            scope: default_scope(),
            role_claim: default_role_claim(),
            require_https_metadata: true,
            save_tokens: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DockerConfig {
    /// Engine endpoint override ('unix:///...' or 'tcp://...')
    pub host: Option<String>,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_storage_path() -> String {
    "./certs".to_string()
}

fn default_callback_path() -> String {
    "/signin-oidc".to_string()
}

fn default_scope() -> String {
    "openid profile email".to_string()
}

fn default_role_claim() -> String {
    "roles".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load the TOML file when present, apply environment overrides, then
    /// validate.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| {
                anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
            })?;
            toml::from_str(&content).map_err(|e| {
                anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e)
            })?
        } else {
            Config::default()
        };

        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Layer environment-style overrides on top of the file values.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        set_string(&lookup("HARBORGATE_BIND"), &mut self.server.bind);
        set_u16(
            "HARBORGATE_HTTP_PORT",
            &lookup("HARBORGATE_HTTP_PORT"),
            &mut self.server.http_port,
        );
        set_u16(
            "HARBORGATE_HTTPS_PORT",
            &lookup("HARBORGATE_HTTPS_PORT"),
            &mut self.server.https_port,
        );
        set_bool(
            "HARBORGATE_HTTPS_ENABLED",
            &lookup("HARBORGATE_HTTPS_ENABLED"),
            &mut self.server.https_enabled,
        );
        set_bool(
            "HARBORGATE_REDIRECT_HTTP_TO_HTTPS",
            &lookup("HARBORGATE_REDIRECT_HTTP_TO_HTTPS"),
            &mut self.server.redirect_http_to_https,
        );
        set_opt_string(&lookup("HARBORGATE_PUBLIC_ORIGIN"), &mut self.server.public_origin);
        set_opt_string(&lookup("HARBORGATE_SESSION_KEY"), &mut self.server.session_key);

        if let Some(value) = lookup("HARBORGATE_CERT_PROVIDER") {
            match value.parse() {
                Ok(kind) => self.tls.provider = kind,
                Err(e) => warn!(value = %value, error = %e, "Ignoring invalid HARBORGATE_CERT_PROVIDER"),
            }
        }
        set_string(
            &lookup("HARBORGATE_CERT_STORAGE_PATH"),
            &mut self.tls.storage_path,
        );

        set_opt_string(&lookup("HARBORGATE_ACME_EMAIL"), &mut self.acme.email);
        set_bool(
            "HARBORGATE_ACME_ACCEPT_TOS",
            &lookup("HARBORGATE_ACME_ACCEPT_TOS"),
            &mut self.acme.accept_tos,
        );
        set_bool(
            "HARBORGATE_ACME_STAGING",
            &lookup("HARBORGATE_ACME_STAGING"),
            &mut self.acme.staging,
        );
        set_opt_string(
            &lookup("HARBORGATE_ACME_DIRECTORY_URL"),
            &mut self.acme.directory_url,
        );
        set_bool(
            "HARBORGATE_ACME_SKIP_TLS_VERIFY",
            &lookup("HARBORGATE_ACME_SKIP_TLS_VERIFY"),
            &mut self.acme.skip_tls_verify,
        );

        set_bool(
            "HARBORGATE_OIDC_ENABLED",
            &lookup("HARBORGATE_OIDC_ENABLED"),
            &mut self.oidc.enabled,
        );
        set_opt_string(&lookup("HARBORGATE_OIDC_AUTHORITY"), &mut self.oidc.authority);
        set_opt_string(&lookup("HARBORGATE_OIDC_CLIENT_ID"), &mut self.oidc.client_id);
        set_opt_string(
            &lookup("HARBORGATE_OIDC_CLIENT_SECRET"),
            &mut self.oidc.client_secret,
        );
        set_string(
            &lookup("HARBORGATE_OIDC_CALLBACK_PATH"),
            &mut self.oidc.callback_path,
        );
        set_string(&lookup("HARBORGATE_OIDC_SCOPE"), &mut self.oidc.scope);
        set_string(
            &lookup("HARBORGATE_OIDC_ROLE_CLAIM"),
            &mut self.oidc.role_claim,
        );
        set_bool(
            "HARBORGATE_OIDC_REQUIRE_HTTPS_METADATA",
            &lookup("HARBORGATE_OIDC_REQUIRE_HTTPS_METADATA"),
            &mut self.oidc.require_https_metadata,
        );
        set_bool(
            "HARBORGATE_OIDC_SAVE_TOKENS",
            &lookup("HARBORGATE_OIDC_SAVE_TOKENS"),
            &mut self.oidc.save_tokens,
        );

        set_opt_string(&lookup("HARBORGATE_DOCKER_HOST"), &mut self.docker.host);
    }

    /// Reject configurations that cannot produce a working gateway.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tls.provider == CertificateProviderKind::LetsEncrypt {
            if self
                .acme
                .email
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .is_empty()
            {
                anyhow::bail!(
                    "The LetsEncrypt provider requires an account email (acme.email / HARBORGATE_ACME_EMAIL)"
                );
            }
            if !self.acme.accept_tos {
                anyhow::bail!(
                    "The LetsEncrypt provider requires accepting the terms of service (acme.accept_tos / HARBORGATE_ACME_ACCEPT_TOS)"
                );
            }
        }

        if self.oidc.enabled {
            for (name, value) in [
                ("oidc.authority", &self.oidc.authority),
                ("oidc.client_id", &self.oidc.client_id),
                ("oidc.client_secret", &self.oidc.client_secret),
            ] {
                if value.as_deref().map(str::trim).unwrap_or_default().is_empty() {
                    anyhow::bail!("OIDC is enabled but '{name}' is not configured");
                }
            }
        }

        Ok(())
    }
}

fn set_string(value: &Option<String>, target: &mut String) {
    if let Some(value) = value {
        if !value.is_empty() {
            *target = value.clone();
        }
    }
}

fn set_opt_string(value: &Option<String>, target: &mut Option<String>) {
    if let Some(value) = value {
        if !value.is_empty() {
            *target = Some(value.clone());
        }
    }
}

fn set_bool(name: &str, value: &Option<String>, target: &mut bool) {
    if let Some(value) = value {
        match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => *target = true,
            "false" | "0" | "no" => *target = false,
            other => warn!(name, value = %other, "Ignoring invalid boolean override"),
        }
    }
}

fn set_u16(name: &str, value: &Option<String>, target: &mut u16) {
    if let Some(value) = value {
        match value.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(name, value = %value, "Ignoring invalid port override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.server.http_port, 80);
        assert_eq!(config.server.https_port, 443);
        assert!(config.server.https_enabled);
        assert!(config.server.redirect_http_to_https);
        assert_eq!(config.tls.provider, CertificateProviderKind::SelfSigned);
        assert_eq!(config.tls.storage_path, "./certs");
        assert!(!config.oidc.enabled);
        assert_eq!(config.oidc.callback_path, "/signin-oidc");
        assert_eq!(config.oidc.role_claim, "roles");
        assert!(config.oidc.require_https_metadata);
        assert!(!config.oidc.save_tokens);
    }

    #[test]
    fn toml_parsing() {
        let config: Config = toml::from_str(
            r#"
            [server]
            http_port = 8080
            https_port = 8443
            redirect_http_to_https = false

            [tls]
            provider = "LetsEncrypt"
            storage_path = "/var/lib/harborgate/certs"

            [acme]
            email = "ops@example.com"
            accept_tos = true
            staging = true

            [oidc]
            enabled = true
            authority = "https://idp.example.com"
            client_id = "gateway"
            client_secret = "s3cret"
            role_claim = "groups"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.server.https_port, 8443);
        assert!(!config.server.redirect_http_to_https);
        assert_eq!(config.tls.provider, CertificateProviderKind::LetsEncrypt);
        assert!(config.acme.staging);
        assert!(config.oidc.enabled);
        assert_eq!(config.oidc.role_claim, "groups");
        config.validate().unwrap();
    }

    #[test]
    fn environment_overrides_file() {
        let mut config = Config::default();
        let env = overrides(&[
            ("HARBORGATE_HTTP_PORT", "8080"),
            ("HARBORGATE_HTTPS_ENABLED", "false"),
            ("HARBORGATE_CERT_PROVIDER", "LetsEncrypt"),
            ("HARBORGATE_CERT_STORAGE_PATH", "/tmp/certs"),
            ("HARBORGATE_ACME_EMAIL", "ops@example.com"),
            ("HARBORGATE_ACME_ACCEPT_TOS", "yes"),
            ("HARBORGATE_OIDC_ENABLED", "1"),
            ("HARBORGATE_OIDC_AUTHORITY", "https://idp.example.com"),
            ("HARBORGATE_OIDC_CLIENT_ID", "gateway"),
            ("HARBORGATE_OIDC_CLIENT_SECRET", "s3cret"),
        ]);

        config.apply_overrides(|name| env.get(name).cloned());

        assert_eq!(config.server.http_port, 8080);
        assert!(!config.server.https_enabled);
        assert_eq!(config.tls.provider, CertificateProviderKind::LetsEncrypt);
        assert_eq!(config.tls.storage_path, "/tmp/certs");
        assert_eq!(config.acme.email.as_deref(), Some("ops@example.com"));
        assert!(config.acme.accept_tos);
        assert!(config.oidc.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn invalid_override_values_are_ignored() {
        let mut config = Config::default();
        let env = overrides(&[
            ("HARBORGATE_HTTP_PORT", "eighty"),
            ("HARBORGATE_HTTPS_ENABLED", "maybe"),
            ("HARBORGATE_CERT_PROVIDER", "Vault"),
        ]);

        config.apply_overrides(|name| env.get(name).cloned());

        assert_eq!(config.server.http_port, 80);
        assert!(config.server.https_enabled);
        assert_eq!(config.tls.provider, CertificateProviderKind::SelfSigned);
    }

    #[test]
    fn letsencrypt_requires_email_and_tos() {
        let mut config = Config::default();
        config.tls.provider = CertificateProviderKind::LetsEncrypt;
        assert!(config.validate().is_err());

        config.acme.email = Some("ops@example.com".to_string());
        assert!(config.validate().is_err());

        config.acme.accept_tos = true;
        config.validate().unwrap();
    }

    #[test]
    fn oidc_requires_credentials() {
        let mut config = Config::default();
        config.oidc.enabled = true;
        assert!(config.validate().is_err());

        config.oidc.authority = Some("https://idp.example.com".to_string());
        config.oidc.client_id = Some("gateway".to_string());
        assert!(config.validate().is_err());

        config.oidc.client_secret = Some("s3cret".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn provider_parsing_from_env_strings() {
        assert_eq!(
            "SelfSigned".parse::<CertificateProviderKind>().unwrap(),
            CertificateProviderKind::SelfSigned
        );
        assert_eq!(
            "letsencrypt".parse::<CertificateProviderKind>().unwrap(),
            CertificateProviderKind::LetsEncrypt
        );
        assert!("unknown".parse::<CertificateProviderKind>().is_err());
    }
}
