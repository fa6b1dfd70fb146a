// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Node admission: turn a raw authenticated connection into a [`NodeIdentity`].
//!
//! | Peer credential | Identity |
//! |-----------------|----------|
//! | Verified client certificate | Subject common name |
//! | Trusted (in-process attach) | As given |
//! | None | First frame must be `admit` with a valid token, within `admission_timeout` |
//!
//! On any failure the connection is closed and never reaches the registry.
//! A rejected node's existing queue is untouched.

use crate::credentials::CredentialManager;
use crate::error::{HubError, Result};
use crate::message::NodeIdentity;
use crate::metrics;
use crate::transport::{Accepted, Connection, PeerCredential};
use rustls::pki_types::CertificateDer;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

/// Extract the node identity from a client certificate's subject CN.
pub fn identity_from_certificate(der: &CertificateDer<'_>) -> Result<NodeIdentity> {
    let (_, cert) = X509Certificate::from_der(der.as_ref())
        .map_err(|e| HubError::admission(format!("unparseable client certificate: {}", e)))?;

    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .ok_or_else(|| HubError::admission("client certificate has no common name"))?;
    let name = cn
        .as_str()
        .map_err(|e| HubError::admission(format!("client certificate CN not UTF-8: {}", e)))?;

    NodeIdentity::new(name)
}

/// Resolves peer credentials using the hub's [`CredentialManager`].
pub struct Admission {
    credentials: Arc<CredentialManager>,
    timeout: Duration,
}

impl Admission {
    pub fn new(credentials: Arc<CredentialManager>, timeout: Duration) -> Self {
        Self { credentials, timeout }
    }

    /// Determine who is on the other end of `conn`.
    ///
    /// Does not close the connection; see [`admit`](Self::admit).
    pub async fn resolve(&self, conn: &dyn Connection) -> Result<NodeIdentity> {
        match conn.peer_credential() {
            PeerCredential::Certificate(der) => identity_from_certificate(der),
            PeerCredential::Trusted(identity) => Ok(identity.clone()),
            PeerCredential::Anonymous => self.resolve_token(conn).await,
        }
    }

    async fn resolve_token(&self, conn: &dyn Connection) -> Result<NodeIdentity> {
        if !self.credentials.config().allow_token_join {
            return Err(HubError::admission("no client certificate and token join is disabled"));
        }

        let first = match tokio::time::timeout(self.timeout, conn.receive()).await {
            Ok(Ok(Some(msg))) => msg,
            Ok(Ok(None)) => return Err(HubError::admission("connection closed before admission")),
            Ok(Err(e)) => return Err(HubError::admission(format!("admission frame unreadable: {}", e))),
            Err(_) => {
                return Err(HubError::admission(format!(
                    "no admission frame within {:?}",
                    self.timeout
                )))
            }
        };

        let request = first.admit_request()?;
        self.credentials
            .validate_token(&request.token, Some(&request.node))
            .map_err(|e| HubError::admission(e.to_string()))
    }

    /// Resolve the identity or close the connection.
    pub async fn admit(&self, conn: Arc<dyn Connection>) -> Option<Accepted> {
        let method = match conn.peer_credential() {
            PeerCredential::Anonymous => "token",
            PeerCredential::Certificate(_) => "certificate",
            PeerCredential::Trusted(_) => "trusted",
        };

        match self.resolve(conn.as_ref()).await {
            Ok(identity) => {
                metrics::record_admission(method, true);
                debug!(
                    node = %identity,
                    protocol = %conn.protocol(),
                    conn_id = conn.id(),
                    method,
                    "Node admitted"
                );
                Some(Accepted { identity, conn })
            }
            Err(e) => {
                metrics::record_admission(method, false);
                warn!(
                    protocol = %conn.protocol(),
                    conn_id = conn.id(),
                    remote = ?conn.remote_addr(),
                    method,
                    error = %e,
                    "Admission rejected, closing connection"
                );
                let _ = conn.close().await;
                None
            }
        }
    }
}
