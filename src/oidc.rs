//! OpenID Connect authentication
//!
//! Implements the authorization-code flow against a single identity
//! provider: discovery validation at startup, a login challenge redirect,
//! the code-for-token exchange on the callback route, and a stateless
//! session carried in an AES-256-GCM encrypted cookie. Route authorization
//! is an any-of match between the session's roles and the route's required
//! roles, case-insensitive.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::Context;
use base64::engine::general_purpose::{URL_SAFE_NO_PAD, STANDARD};
use base64::Engine;
use chrono::Utc;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::HeaderValue;
use hyper::{HeaderMap, Response, StatusCode};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{json_error_response, GatewayErrorCode};

pub const SESSION_COOKIE: &str = "HarborGate.Auth";
pub const DEFAULT_CALLBACK_PATH: &str = "/signin-oidc";
pub const SIGNOUT_PATH: &str = "/signout-oidc";

const DEFAULT_SCOPE: &str = "openid profile email";
const DEFAULT_ROLE_CLAIM: &str = "roles";
/// Standard role claim accepted as fallback alongside the configured one.
const FALLBACK_ROLE_CLAIMS: &[&str] = &[
    "role",
    "http://schemas.microsoft.com/ws/2008/06/identity/claims/role",
];

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);
const SESSION_TTL_SECS: i64 = 8 * 60 * 60;
/// A login round-trip older than this is rejected.
const STATE_TTL_SECS: i64 = 10 * 60;

/// Identity provider settings.
#[derive(Debug, Clone)]
pub struct OidcSettings {
    pub authority: String,
    pub client_id: String,
    pub client_secret: String,
    pub callback_path: String,
    pub scope: String,
    pub role_claim: String,
    pub require_https_metadata: bool,
    pub save_tokens: bool,
    /// External origin used for the redirect URI; derived from the request
    /// when unset.
    pub public_origin: Option<String>,
}

impl OidcSettings {
    pub fn new(authority: String, client_id: String, client_secret: String) -> Self {
        Self {
            authority,
            client_id,
            client_secret,
            callback_path: DEFAULT_CALLBACK_PATH.to_string(),
            scope: DEFAULT_SCOPE.to_string(),
            role_claim: DEFAULT_ROLE_CLAIM.to_string(),
            require_https_metadata: true,
            save_tokens: false,
            public_origin: None,
        }
    }
}

/// The provider metadata fields the gateway depends on.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    pub jwks_uri: String,
}

impl DiscoveryDocument {
    fn validate(&self) -> anyhow::Result<()> {
        let fields = [
            ("issuer", &self.issuer),
            ("authorization_endpoint", &self.authorization_endpoint),
            ("token_endpoint", &self.token_endpoint),
            ("userinfo_endpoint", &self.userinfo_endpoint),
            ("jwks_uri", &self.jwks_uri),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                anyhow::bail!("OIDC discovery document is missing '{name}'");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kty: String,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
    #[serde(default)]
    x: Option<String>,
    #[serde(default)]
    y: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
}

/// An authenticated user, as carried in the encrypted session cookie.
/// The server keeps no session table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub subject: String,
    pub name: String,
    pub roles: Vec<String>,
    pub issued_at: i64,
    pub expires_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() >= self.expires_at
    }
}

/// Login round-trip state tying the callback to the original request.
#[derive(Debug, Serialize, Deserialize)]
struct LoginState {
    return_path: String,
    nonce: String,
    issued_at: i64,
}

/// AES-256-GCM codec for the session cookie and login state.
#[derive(Clone)]
pub struct SessionCrypto {
    key: [u8; 32],
}

impl SessionCrypto {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Random per-process key. Restarting the gateway invalidates every
    /// outstanding session.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    pub fn from_base64(encoded: &str) -> anyhow::Result<Self> {
        let bytes = STANDARD
            .decode(encoded)
            .context("Session key is not valid base64")?;
        if bytes.len() != 32 {
            anyhow::bail!("Session key must be 32 bytes, got {}", bytes.len());
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(Self { key })
    }

    fn seal(&self, plaintext: &[u8]) -> String {
        let cipher = Aes256Gcm::new_from_slice(&self.key).expect("32-byte key");
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut out = nonce_bytes.to_vec();
        // Encryption with a valid key and nonce cannot fail.
        let ciphertext = cipher.encrypt(nonce, plaintext).expect("AES-GCM seal");
        out.extend_from_slice(&ciphertext);
        URL_SAFE_NO_PAD.encode(out)
    }

    fn open(&self, token: &str) -> Option<Vec<u8>> {
        let data = URL_SAFE_NO_PAD.decode(token).ok()?;
        if data.len() <= 12 {
            return None;
        }
        let (nonce_bytes, ciphertext) = data.split_at(12);
        let cipher = Aes256Gcm::new_from_slice(&self.key).ok()?;
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .ok()
    }
}

pub struct OidcAuthenticator {
    settings: OidcSettings,
    discovery: DiscoveryDocument,
    jwks: Vec<Jwk>,
    crypto: SessionCrypto,
    http: reqwest::Client,
}

impl OidcAuthenticator {
    /// Fetch and validate the provider metadata. Fatal on any failure; the
    /// whole fetch is bounded by a 30 second deadline.
    pub async fn discover(
        settings: OidcSettings,
        crypto: SessionCrypto,
    ) -> anyhow::Result<Self> {
        let authority = settings.authority.trim_end_matches('/').to_string();
        if authority.is_empty() {
            anyhow::bail!("OIDC authority must be configured when authentication is enabled");
        }
        if !authority.starts_with("https://") {
            if settings.require_https_metadata {
                anyhow::bail!(
                    "OIDC authority '{}' is not https. Set requireHttpsMetadata=false to allow this (development only)",
                    authority
                );
            }
            warn!(authority = %authority, "OIDC authority is not https; metadata and tokens travel unprotected");
        }

        let http = reqwest::Client::builder()
            .timeout(DISCOVERY_TIMEOUT)
            .build()
            .context("Failed to build OIDC HTTP client")?;

        let metadata_url = format!("{authority}/.well-known/openid-configuration");
        info!(url = %metadata_url, "Fetching OIDC provider metadata");

        let discovery: DiscoveryDocument = http
            .get(&metadata_url)
            .send()
            .await
            .with_context(|| format!("OIDC discovery request to '{metadata_url}' failed"))?
            .error_for_status()
            .context("OIDC discovery endpoint returned an error status")?
            .json()
            .await
            .context("OIDC discovery document is not valid JSON")?;
        discovery.validate()?;

        let jwks: JwksDocument = http
            .get(&discovery.jwks_uri)
            .send()
            .await
            .with_context(|| format!("JWKS request to '{}' failed", discovery.jwks_uri))?
            .error_for_status()
            .context("JWKS endpoint returned an error status")?
            .json()
            .await
            .context("JWKS document is not valid JSON")?;

        info!(
            issuer = %discovery.issuer,
            keys = jwks.keys.len(),
            "OIDC provider validated"
        );

        Ok(Self {
            settings,
            discovery,
            jwks: jwks.keys,
            crypto,
            http,
        })
    }

    pub fn callback_path(&self) -> &str {
        &self.settings.callback_path
    }

    /// Redirect an unauthenticated request to the authorization endpoint.
    pub fn challenge(
        &self,
        request_origin: &str,
        return_path: &str,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let state = LoginState {
            return_path: return_path.to_string(),
            nonce: random_nonce(),
            issued_at: Utc::now().timestamp(),
        };
        let state_token = self
            .crypto
            .seal(&serde_json::to_vec(&state).expect("state serializes"));

        let mut url = match Url::parse(&self.discovery.authorization_endpoint) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "Authorization endpoint is not a valid URL");
                return json_error_response(GatewayErrorCode::Internal, "Authentication unavailable");
            }
        };
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.settings.client_id)
            .append_pair("scope", &self.settings.scope)
            .append_pair("redirect_uri", &self.redirect_uri(request_origin))
            .append_pair("state", &state_token);

        debug!(return_path, "Issuing authentication challenge");
        redirect_response(StatusCode::FOUND, url.as_str())
    }

    /// Handle the authorization-code callback: verify state, exchange the
    /// code, validate the ID token, and establish the session cookie.
    pub async fn handle_callback(
        &self,
        request_origin: &str,
        query: Option<&str>,
        secure: bool,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let params: std::collections::HashMap<String, String> = query
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();

        let Some(code) = params.get("code") else {
            warn!("OIDC callback without authorization code");
            return json_error_response(GatewayErrorCode::InvalidCallback, "Missing authorization code");
        };
        let Some(state) = params.get("state").and_then(|s| self.open_state(s)) else {
            warn!("OIDC callback with missing or tampered state");
            return json_error_response(GatewayErrorCode::InvalidCallback, "Invalid state parameter");
        };

        let session = match self.exchange_code(code, request_origin).await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Authorization code exchange failed");
                return json_error_response(GatewayErrorCode::InvalidCallback, "Code exchange failed");
            }
        };

        info!(subject = %session.subject, roles = ?session.roles, "User signed in");

        let cookie = self.session_cookie(&session, secure);
        let mut response = redirect_response(StatusCode::FOUND, &state.return_path);
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response
                .headers_mut()
                .insert(hyper::header::SET_COOKIE, value);
        }
        response
    }

    /// Clear the session cookie and send the user back to the root.
    pub fn signout(&self, secure: bool) -> Response<BoxBody<Bytes, hyper::Error>> {
        let mut cookie = format!("{SESSION_COOKIE}=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax");
        if secure {
            cookie.push_str("; Secure");
        }
        let mut response = redirect_response(StatusCode::FOUND, "/");
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response
                .headers_mut()
                .insert(hyper::header::SET_COOKIE, value);
        }
        response
    }

    /// Decode the session cookie, if present and still valid.
    pub fn session_from_headers(&self, headers: &HeaderMap) -> Option<Session> {
        let cookie_header = headers.get(hyper::header::COOKIE)?.to_str().ok()?;
        let token = extract_cookie(cookie_header, SESSION_COOKIE)?;
        let plaintext = self.crypto.open(token)?;
        let session: Session = serde_json::from_slice(&plaintext).ok()?;
        if session.is_expired() {
            debug!(subject = %session.subject, "Session expired");
            return None;
        }
        Some(session)
    }

    fn open_state(&self, token: &str) -> Option<LoginState> {
        let plaintext = self.crypto.open(token)?;
        let state: LoginState = serde_json::from_slice(&plaintext).ok()?;
        if Utc::now().timestamp() - state.issued_at > STATE_TTL_SECS {
            return None;
        }
        Some(state)
    }

    fn redirect_uri(&self, request_origin: &str) -> String {
        let origin = self
            .settings
            .public_origin
            .as_deref()
            .unwrap_or(request_origin)
            .trim_end_matches('/');
        format!("{origin}{}", self.settings.callback_path)
    }

    async fn exchange_code(&self, code: &str, request_origin: &str) -> anyhow::Result<Session> {
        let redirect_uri = self.redirect_uri(request_origin);
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &redirect_uri),
            ("client_id", &self.settings.client_id),
            ("client_secret", &self.settings.client_secret),
        ];

        let tokens: TokenResponse = self
            .http
            .post(&self.discovery.token_endpoint)
            .form(&form)
            .send()
            .await
            .context("Token endpoint request failed")?
            .error_for_status()
            .context("Token endpoint rejected the authorization code")?
            .json()
            .await
            .context("Token endpoint returned invalid JSON")?;

        let id_token = tokens
            .id_token
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Token response carried no ID token"))?;

        let mut claims = self.validate_id_token(id_token)?;

        // The provider may only publish roles through the userinfo endpoint.
        if extract_roles(&claims, &self.settings.role_claim).is_empty() {
            if let Some(access_token) = tokens.access_token.as_deref() {
                if let Ok(userinfo) = self.fetch_userinfo(access_token).await {
                    merge_missing_claims(&mut claims, userinfo);
                }
            }
        }

        let subject = claims
            .get("sub")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("ID token carried no subject"))?
            .to_string();
        let name = claims
            .get("name")
            .or_else(|| claims.get("preferred_username"))
            .and_then(|v| v.as_str())
            .unwrap_or(&subject)
            .to_string();
        let roles = extract_roles(&claims, &self.settings.role_claim);

        let now = Utc::now().timestamp();
        Ok(Session {
            subject,
            name,
            roles,
            issued_at: now,
            expires_at: now + SESSION_TTL_SECS,
            access_token: self
                .settings
                .save_tokens
                .then(|| tokens.access_token.clone())
                .flatten(),
            id_token: self
                .settings
                .save_tokens
                .then(|| tokens.id_token.clone())
                .flatten(),
        })
    }

    fn validate_id_token(
        &self,
        token: &str,
    ) -> anyhow::Result<serde_json::Map<String, serde_json::Value>> {
        let header = jsonwebtoken::decode_header(token).context("ID token header is invalid")?;

        let jwk = self
            .jwks
            .iter()
            .find(|k| header.kid.is_none() || k.kid == header.kid)
            .ok_or_else(|| anyhow::anyhow!("No JWKS key matches the ID token's key id"))?;

        let decoding_key = match jwk.kty.as_str() {
            "RSA" => {
                let (n, e) = (
                    jwk.n.as_deref().unwrap_or_default(),
                    jwk.e.as_deref().unwrap_or_default(),
                );
                DecodingKey::from_rsa_components(n, e)
                    .context("JWKS RSA key components are invalid")?
            }
            "EC" => {
                let (x, y) = (
                    jwk.x.as_deref().unwrap_or_default(),
                    jwk.y.as_deref().unwrap_or_default(),
                );
                DecodingKey::from_ec_components(x, y)
                    .context("JWKS EC key components are invalid")?
            }
            other => anyhow::bail!("Unsupported JWKS key type '{other}'"),
        };

        let mut validation = Validation::new(match jwk.kty.as_str() {
            "EC" => Algorithm::ES256,
            _ => header.alg,
        });
        validation.set_issuer(&[&self.discovery.issuer]);
        validation.set_audience(&[&self.settings.client_id]);

        let data =
            jsonwebtoken::decode::<serde_json::Map<String, serde_json::Value>>(
                token,
                &decoding_key,
                &validation,
            )
            .context("ID token validation failed")?;
        Ok(data.claims)
    }

    async fn fetch_userinfo(
        &self,
        access_token: &str,
    ) -> anyhow::Result<serde_json::Map<String, serde_json::Value>> {
        let userinfo = self
            .http
            .get(&self.discovery.userinfo_endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .context("Userinfo request failed")?
            .error_for_status()
            .context("Userinfo endpoint returned an error status")?
            .json()
            .await
            .context("Userinfo response is not valid JSON")?;
        Ok(userinfo)
    }

    fn session_cookie(&self, session: &Session, secure: bool) -> String {
        let token = self
            .crypto
            .seal(&serde_json::to_vec(session).expect("session serializes"));
        let mut cookie = format!(
            "{SESSION_COOKIE}={token}; Path=/; Max-Age={SESSION_TTL_SECS}; HttpOnly; SameSite=Lax"
        );
        if secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    #[cfg(test)]
    fn for_tests(
        settings: OidcSettings,
        discovery: DiscoveryDocument,
        jwks: Vec<Jwk>,
        crypto: SessionCrypto,
    ) -> Self {
        Self {
            settings,
            discovery,
            jwks,
            crypto,
            http: reqwest::Client::new(),
        }
    }
}

/// Any-of role matching: admitted iff no roles are required, or the user
/// holds at least one of them. Comparison is case-insensitive.
pub fn is_authorized(user_roles: &[String], required_roles: &BTreeSet<String>) -> bool {
    if required_roles.is_empty() {
        return true;
    }
    user_roles.iter().any(|user_role| {
        required_roles
            .iter()
            .any(|required| required.eq_ignore_ascii_case(user_role))
    })
}

/// Read roles from the configured claim, falling back to the standard role
/// claims. Accepts both a JSON array of strings and a single string.
fn extract_roles(
    claims: &serde_json::Map<String, serde_json::Value>,
    role_claim: &str,
) -> Vec<String> {
    let mut names = vec![role_claim];
    names.extend(FALLBACK_ROLE_CLAIMS.iter().filter(|c| **c != role_claim));

    for name in names {
        let Some(value) = claims.get(name) else {
            continue;
        };
        match value {
            serde_json::Value::Array(items) => {
                let roles: Vec<String> = items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
                if !roles.is_empty() {
                    return roles;
                }
            }
            serde_json::Value::String(role) if !role.is_empty() => {
                return vec![role.clone()];
            }
            _ => {}
        }
    }
    Vec::new()
}

fn merge_missing_claims(
    claims: &mut serde_json::Map<String, serde_json::Value>,
    extra: serde_json::Map<String, serde_json::Value>,
) {
    for (key, value) in extra {
        claims.entry(key).or_insert(value);
    }
}

fn extract_cookie<'a>(cookie_header: &'a str, name: &str) -> Option<&'a str> {
    cookie_header.split(';').find_map(|part| {
        let part = part.trim();
        part.strip_prefix(name)
            .and_then(|rest| rest.strip_prefix('='))
            .filter(|value| !value.is_empty())
    })
}

fn random_nonce() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn redirect_response(
    status: StatusCode,
    location: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut builder = Response::builder().status(status);
    if let Ok(value) = HeaderValue::from_str(location) {
        builder = builder.header(hyper::header::LOCATION, value);
    }
    builder
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

/// 403 with the fixed JSON body for a role mismatch.
pub fn forbidden_response() -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = serde_json::json!({
        "error": "Forbidden",
        "message": "You do not have the required roles to access this resource",
    })
    .to_string();

    Response::builder()
        .status(StatusCode::FORBIDDEN)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}
