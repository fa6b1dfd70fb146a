// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Credential manager: certificate bundle, TLS configuration, admission tokens.
//!
//! # Certificate Bundle
//!
//! At startup [`CredentialManager::ensure_certificates()`] loads the CA and
//! server certificate from the [`CA_SECRET`] secret. When the secret is
//! absent it generates an ECDSA P-256 CA, signs a server certificate with it,
//! and persists all four PEM blobs before anything listens. The bundle is then
//! immutable for the life of the process.
//!
//! # TLS
//!
//! Both listeners share one policy: client certificates are verified
//! against the CA, TLS 1.2 is pinned to
//! `TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256` (the suite matching the P-256
//! node keys) and TLS 1.3 to `TLS13_AES_128_GCM_SHA256`. The QUIC variant is
//! TLS 1.3 only, as QUIC requires.
//!
//! # Tokens
//!
//! ```text
//! <hex sha256(CA DER)>.<HS256 JWT {sub, iat, exp}>
//! ```
//!
//! The CA-hash prefix lets a node check it is talking to the right cluster
//! before trusting the hub. The rotation loop reissues the cluster join token
//! (subject [`JOIN_SUBJECT`]) on a fixed interval; old tokens are not revoked
//! early and simply stop validating once `exp` passes.

use crate::config::CredentialConfig;
use crate::error::{HubError, Result};
use crate::message::NodeIdentity;
use crate::metrics;
use crate::secret_store::{Secret, SecretStore, CA_SECRET, TOKEN_SECRET};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Arc, OnceLock};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn, Instrument};

/// Subject of the cluster-wide join token; any valid node name may use it.
pub const JOIN_SUBJECT: &str = "*";

/// ALPN protocol id spoken on the QUIC listener.
pub const QUIC_ALPN: &[u8] = b"cloudhub";

const CA_COMMON_NAME: &str = "cloudhub-ca";
const SERVER_COMMON_NAME: &str = "cloudhub";

const KEY_CA_CERT: &str = "ca.crt";
const KEY_CA_KEY: &str = "ca.key";
const KEY_SERVER_CERT: &str = "server.crt";
const KEY_SERVER_KEY: &str = "server.key";
const KEY_SIGNING: &str = "signing.key";
const KEY_TOKEN: &str = "token";

fn cert_err(context: &str, e: impl std::fmt::Display) -> HubError {
    HubError::Certificate(format!("{}: {}", context, e))
}

fn tls_err(e: impl std::fmt::Display) -> HubError {
    HubError::Tls(e.to_string())
}

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

// ═══════════════════════════════════════════════════════════════════════════════
// Certificate bundle
// ═══════════════════════════════════════════════════════════════════════════════

/// CA + server certificate material, held as PEM.
pub struct CertificateBundle {
    ca_cert_pem: String,
    ca_key_pem: String,
    server_cert_pem: String,
    server_key_pem: String,
}

impl std::fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("ca_hash", &self.ca_hash().unwrap_or_default())
            .finish_non_exhaustive()
    }
}

/// A client certificate issued to a node.
#[derive(Debug, Clone)]
pub struct NodeCertificate {
    pub node: NodeIdentity,
    pub cert_pem: String,
    pub key_pem: String,
    pub ca_pem: String,
}

impl CertificateBundle {
    /// Generate a fresh CA and a server certificate signed by it.
    pub fn generate(server_names: &[String]) -> Result<Self> {
        let ca_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(|e| cert_err("CA key", e))?;
        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(|e| cert_err("CA params", e))?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, CA_COMMON_NAME);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca_cert = params.self_signed(&ca_key).map_err(|e| cert_err("CA self-sign", e))?;

        let ca_cert_pem = ca_cert.pem();
        let ca_key_pem = ca_key.serialize_pem();
        let (server_cert_pem, server_key_pem) = issue_leaf(
            &ca_cert_pem,
            &ca_key_pem,
            SERVER_COMMON_NAME,
            server_names.to_vec(),
            ExtendedKeyUsagePurpose::ServerAuth,
        )?;

        Ok(Self {
            ca_cert_pem,
            ca_key_pem,
            server_cert_pem,
            server_key_pem,
        })
    }

    fn from_secret(secret: &Secret) -> Result<Self> {
        let field = |key: &str| {
            secret
                .get_str(key)
                .ok_or_else(|| HubError::Certificate(format!("{} missing from {}", key, CA_SECRET)))
        };
        Ok(Self {
            ca_cert_pem: field(KEY_CA_CERT)?,
            ca_key_pem: field(KEY_CA_KEY)?,
            server_cert_pem: field(KEY_SERVER_CERT)?,
            server_key_pem: field(KEY_SERVER_KEY)?,
        })
    }

    fn to_secret(&self) -> Secret {
        Secret::new()
            .with(KEY_CA_CERT, &self.ca_cert_pem)
            .with(KEY_CA_KEY, &self.ca_key_pem)
            .with(KEY_SERVER_CERT, &self.server_cert_pem)
            .with(KEY_SERVER_KEY, &self.server_key_pem)
    }

    pub fn ca_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    pub fn ca_der(&self) -> Result<CertificateDer<'static>> {
        parse_certs(&self.ca_cert_pem)?
            .into_iter()
            .next()
            .ok_or_else(|| HubError::Certificate("empty CA certificate".into()))
    }

    pub fn server_chain(&self) -> Result<Vec<CertificateDer<'static>>> {
        let mut chain = parse_certs(&self.server_cert_pem)?;
        if chain.is_empty() {
            return Err(HubError::Certificate("empty server certificate chain".into()));
        }
        chain.push(self.ca_der()?);
        Ok(chain)
    }

    pub fn server_key(&self) -> Result<PrivateKeyDer<'static>> {
        rustls_pemfile::private_key(&mut self.server_key_pem.as_bytes())
            .map_err(|e| cert_err("server key", e))?
            .ok_or_else(|| HubError::Certificate("server key PEM holds no key".into()))
    }

    /// Hex SHA-256 of the CA certificate DER; the token prefix.
    pub fn ca_hash(&self) -> Result<String> {
        let der = self.ca_der()?;
        Ok(hex::encode(Sha256::digest(der.as_ref())))
    }
}

fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| cert_err("certificate PEM", e))
}

/// Sign a leaf certificate with the CA. Returns (cert PEM, key PEM).
fn issue_leaf(
    ca_cert_pem: &str,
    ca_key_pem: &str,
    common_name: &str,
    subject_alt_names: Vec<String>,
    usage: ExtendedKeyUsagePurpose,
) -> Result<(String, String)> {
    let ca_key = KeyPair::from_pem(ca_key_pem).map_err(|e| cert_err("CA key PEM", e))?;
    let ca_params = CertificateParams::from_ca_cert_pem(ca_cert_pem).map_err(|e| cert_err("CA PEM", e))?;
    let ca_cert = ca_params.self_signed(&ca_key).map_err(|e| cert_err("CA reload", e))?;

    let leaf_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(|e| cert_err("leaf key", e))?;
    let mut params = CertificateParams::new(subject_alt_names).map_err(|e| cert_err("leaf params", e))?;
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, common_name);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![usage];
    let cert = params
        .signed_by(&leaf_key, &ca_cert, &ca_key)
        .map_err(|e| cert_err("leaf sign", e))?;

    Ok((cert.pem(), leaf_key.serialize_pem()))
}

// ═══════════════════════════════════════════════════════════════════════════════
// TLS configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// ring provider restricted to the pinned suites.
fn pinned_provider() -> Arc<CryptoProvider> {
    use rustls::crypto::ring::{cipher_suite, default_provider};
    Arc::new(CryptoProvider {
        cipher_suites: vec![
            cipher_suite::TLS13_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        ],
        ..default_provider()
    })
}

/// Build the listener TLS policy from the bundle.
///
/// With `allow_token_join` the handshake also admits clients that present no
/// certificate; they must then pass token admission. Presented certificates
/// are always verified.
pub fn build_server_tls_config(bundle: &CertificateBundle, allow_token_join: bool) -> Result<Arc<ServerConfig>> {
    build_tls(bundle, allow_token_join, &[&rustls::version::TLS13, &rustls::version::TLS12], None)
}

/// TLS 1.3-only variant for QUIC.
pub fn build_quic_tls_config(bundle: &CertificateBundle, allow_token_join: bool) -> Result<Arc<ServerConfig>> {
    build_tls(bundle, allow_token_join, &[&rustls::version::TLS13], Some(QUIC_ALPN))
}

fn build_tls(
    bundle: &CertificateBundle,
    allow_token_join: bool,
    versions: &[&'static rustls::SupportedProtocolVersion],
    alpn: Option<&[u8]>,
) -> Result<Arc<ServerConfig>> {
    let provider = pinned_provider();

    let mut roots = RootCertStore::empty();
    roots.add(bundle.ca_der()?).map_err(tls_err)?;

    let verifier_builder = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider));
    let verifier = if allow_token_join {
        verifier_builder.allow_unauthenticated().build()
    } else {
        verifier_builder.build()
    }
    .map_err(tls_err)?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(versions)
        .map_err(tls_err)?
        .with_client_cert_verifier(verifier)
        .with_single_cert(bundle.server_chain()?, bundle.server_key()?)
        .map_err(tls_err)?;

    if let Some(alpn) = alpn {
        config.alpn_protocols = vec![alpn.to_vec()];
    }
    Ok(Arc::new(config))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tokens
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub iat: u64,
    pub exp: u64,
}

/// A token together with its decoded validity window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub subject: String,
    pub issued_at: u64,
    pub expires_at: u64,
}

/// Owns the certificate bundle and the token signing key.
pub struct CredentialManager {
    config: CredentialConfig,
    store: Arc<dyn SecretStore>,
    bundle: OnceLock<Arc<CertificateBundle>>,
    signing_key: OnceLock<Vec<u8>>,
    current: RwLock<Option<IssuedToken>>,
}

impl CredentialManager {
    pub fn new(config: CredentialConfig, store: Arc<dyn SecretStore>) -> Self {
        Self {
            config,
            store,
            bundle: OnceLock::new(),
            signing_key: OnceLock::new(),
            current: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &CredentialConfig {
        &self.config
    }

    /// Load or generate the certificate bundle and token signing key.
    ///
    /// Errors from here are fatal to startup.
    pub async fn ensure_certificates(&self) -> Result<Arc<CertificateBundle>> {
        if let Some(bundle) = self.bundle.get() {
            return Ok(Arc::clone(bundle));
        }

        let stored = self
            .store
            .get(CA_SECRET)
            .await
            .map_err(|e| cert_err("reading CA secret", e))?;

        let bundle = match stored {
            Some(secret) => {
                let bundle = CertificateBundle::from_secret(&secret)?;
                info!(ca_hash = %bundle.ca_hash()?, "Loaded certificate bundle from secret store");
                bundle
            }
            None => {
                info!(server_names = ?self.config.server_names, "No certificate bundle found, generating");
                let bundle = CertificateBundle::generate(&self.config.server_names)?;
                self.store
                    .put(CA_SECRET, bundle.to_secret())
                    .await
                    .map_err(|e| cert_err("persisting CA secret", e))?;
                info!(ca_hash = %bundle.ca_hash()?, "Generated and persisted certificate bundle");
                bundle
            }
        };

        // Sanity check: the stored material must produce a usable TLS config.
        bundle.server_key()?;
        bundle.server_chain()?;

        self.ensure_signing_key().await?;

        let bundle = Arc::new(bundle);
        let _ = self.bundle.set(Arc::clone(&bundle));
        Ok(self.bundle.get().cloned().unwrap_or(bundle))
    }

    async fn ensure_signing_key(&self) -> Result<()> {
        if self.signing_key.get().is_some() {
            return Ok(());
        }
        let stored = self
            .store
            .get(TOKEN_SECRET)
            .await
            .map_err(|e| cert_err("reading token secret", e))?;

        let key = match stored.as_ref().and_then(|s| s.get(KEY_SIGNING)) {
            Some(key) if key.len() >= 32 => key,
            _ => {
                let mut key = vec![0u8; 32];
                rustls::crypto::ring::default_provider()
                    .secure_random
                    .fill(&mut key)
                    .map_err(|_| HubError::Certificate("system RNG unavailable".into()))?;
                let mut secret = stored.unwrap_or_default();
                secret.insert(KEY_SIGNING, &key);
                self.store
                    .put(TOKEN_SECRET, secret)
                    .await
                    .map_err(|e| cert_err("persisting token signing key", e))?;
                debug!("Generated token signing key");
                key
            }
        };
        let _ = self.signing_key.set(key);
        Ok(())
    }

    fn loaded_bundle(&self) -> Result<&Arc<CertificateBundle>> {
        self.bundle
            .get()
            .ok_or_else(|| HubError::InvalidState {
                expected: "certificates loaded".into(),
                actual: "ensure_certificates() not called".into(),
            })
    }

    fn key(&self) -> Result<&[u8]> {
        self.signing_key
            .get()
            .map(|k| k.as_slice())
            .ok_or_else(|| HubError::Token("signing key not loaded".into()))
    }

    pub fn bundle(&self) -> Result<Arc<CertificateBundle>> {
        self.loaded_bundle().map(Arc::clone)
    }

    pub fn server_tls_config(&self) -> Result<Arc<ServerConfig>> {
        build_server_tls_config(self.loaded_bundle()?, self.config.allow_token_join)
    }

    pub fn quic_tls_config(&self) -> Result<Arc<ServerConfig>> {
        build_quic_tls_config(self.loaded_bundle()?, self.config.allow_token_join)
    }

    /// Issue a token for `subject` valid from now for the configured window.
    pub fn issue_token(&self, subject: &str) -> Result<IssuedToken> {
        self.issue_token_at(subject, now_secs())
    }

    /// Issue a token as if the current time were `now` (seconds since epoch).
    pub fn issue_token_at(&self, subject: &str, now: u64) -> Result<IssuedToken> {
        if subject != JOIN_SUBJECT {
            NodeIdentity::new(subject)?;
        }
        let claims = TokenClaims {
            sub: subject.to_string(),
            iat: now,
            exp: now.saturating_add(self.config.token_validity_sec),
        };
        let jwt = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(self.key()?))
            .map_err(|e| HubError::Token(format!("signing failed: {}", e)))?;
        let ca_hash = self.loaded_bundle()?.ca_hash()?;

        Ok(IssuedToken {
            token: format!("{}.{}", ca_hash, jwt),
            subject: claims.sub,
            issued_at: claims.iat,
            expires_at: claims.exp,
        })
    }

    /// Validate a token presented by a node claiming to be `claimed`.
    pub fn validate_token(&self, token: &str, claimed: Option<&str>) -> Result<NodeIdentity> {
        self.validate_token_at(token, claimed, now_secs())
    }

    /// Validate against an explicit clock.
    ///
    /// Checks the CA-hash prefix, the HS256 signature, `now < exp` with no
    /// leeway, and that the subject admits the claimed node.
    pub fn validate_token_at(&self, token: &str, claimed: Option<&str>, now: u64) -> Result<NodeIdentity> {
        let (ca_hash, jwt) = token
            .split_once('.')
            .ok_or_else(|| HubError::Token("token has no CA-hash prefix".into()))?;
        if ca_hash != self.loaded_bundle()?.ca_hash()? {
            return Err(HubError::Token("token was issued for a different CA".into()));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.leeway = 0;
        validation.required_spec_claims = ["exp", "sub"].iter().map(|s| s.to_string()).collect();

        let claims = jsonwebtoken::decode::<TokenClaims>(jwt, &DecodingKey::from_secret(self.key()?), &validation)
            .map_err(|e| HubError::Token(format!("invalid token: {}", e)))?
            .claims;

        if now >= claims.exp {
            return Err(HubError::Token(format!(
                "token expired {}s ago",
                now - claims.exp
            )));
        }

        match (claims.sub.as_str(), claimed) {
            (JOIN_SUBJECT, Some(name)) => NodeIdentity::new(name),
            (JOIN_SUBJECT, None) => Err(HubError::Token("join token needs a node name".into())),
            (sub, Some(name)) if sub != name => Err(HubError::Token(format!(
                "token subject {:?} does not match node {:?}",
                sub, name
            ))),
            (sub, _) => NodeIdentity::new(sub),
        }
    }

    /// Issue a fresh join token, persist it, and make it current.
    pub async fn rotate(&self) -> Result<IssuedToken> {
        let issued = self.issue_token(JOIN_SUBJECT)?;

        let mut secret = self
            .store
            .get(TOKEN_SECRET)
            .await?
            .unwrap_or_default();
        secret.insert(KEY_TOKEN, &issued.token);
        if let Some(key) = self.signing_key.get() {
            secret.insert(KEY_SIGNING, key);
        }
        self.store.put(TOKEN_SECRET, secret).await?;

        *self.current.write().await = Some(issued.clone());
        info!(expires_at = issued.expires_at, "Join token rotated");
        Ok(issued)
    }

    /// The most recently rotated join token.
    pub async fn current_token(&self) -> Option<IssuedToken> {
        self.current.read().await.clone()
    }

    /// Issue a CA-signed client certificate for a node holding a valid token.
    pub fn issue_node_certificate(&self, token: &str, node: &str) -> Result<NodeCertificate> {
        let identity = self.validate_token(token, Some(node))?;
        let bundle = self.loaded_bundle()?;
        let (cert_pem, key_pem) = issue_leaf(
            &bundle.ca_cert_pem,
            &bundle.ca_key_pem,
            identity.as_str(),
            vec![identity.as_str().to_string()],
            ExtendedKeyUsagePurpose::ClientAuth,
        )?;
        info!(node = %identity, "Issued node certificate");
        Ok(NodeCertificate {
            node: identity,
            cert_pem,
            key_pem,
            ca_pem: bundle.ca_cert_pem.clone(),
        })
    }
}

/// Run the token rotation loop until shutdown.
///
/// The first rotation happens at startup (in the hub's `start()`), so this
/// loop waits one full interval before its first tick. Failures are logged
/// and retried on the next tick.
pub async fn run_token_rotation(credentials: Arc<CredentialManager>, mut shutdown_rx: watch::Receiver<bool>) {
    let span = tracing::info_span!("token_rotation");

    async move {
        let _ = shutdown_rx.borrow_and_update();
        let interval = credentials.config().rotation_interval();
        info!(interval_secs = interval.as_secs(), "Starting token rotation task");

        let start = tokio::time::Instant::now() + interval;
        let mut timer = tokio::time::interval_at(start, interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }

                _ = timer.tick() => {}
            }

            match credentials.rotate().await {
                Ok(_) => metrics::record_token_rotation(true),
                Err(e) => {
                    metrics::record_token_rotation(false);
                    warn!(error = %e, "Token rotation failed, retrying next tick");
                }
            }
        }

        info!("Token rotation task stopped");
    }
    .instrument(span)
    .await
}
