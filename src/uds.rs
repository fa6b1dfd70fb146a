//! Local storage-driver pass-through over a unix domain socket.
//!
//! Not part of the node-facing protocol: no TLS, no admission, no queues.
//! Each request is one length-prefixed JSON [`StorageRequest`], answered by
//! one [`StorageResponse`] on the same stream. Requests on a stream are
//! handled one at a time; streams run concurrently.

use crate::config::UnixSocketConfig;
use crate::error::{HubError, Result};
use crate::metrics;
use crate::transport::codec;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Largest request or response accepted on the socket.
pub const MAX_UDS_FRAME_BYTES: usize = 4 * 1024 * 1024;

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = std::result::Result<serde_json::Value, String>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageRequest {
    pub id: String,
    /// e.g. `CreateVolume`, `DeleteVolume`, `ControllerPublishVolume`.
    pub operation: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageResponse {
    pub id: String,
    pub success: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// External handler for storage-driver requests.
pub trait StorageDriverHandler: Send + Sync + 'static {
    fn handle(&self, request: StorageRequest) -> HandlerFuture<'_>;
}

/// Answers every request with an error.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedStorageDriver;

impl StorageDriverHandler for UnsupportedStorageDriver {
    fn handle(&self, request: StorageRequest) -> HandlerFuture<'_> {
        Box::pin(async move { Err(format!("storage operation {:?} is not supported", request.operation)) })
    }
}

pub struct UdsServer {
    listener: UnixListener,
    path: PathBuf,
    handler: Arc<dyn StorageDriverHandler>,
}

impl UdsServer {
    /// Bind `config.path`, replacing a stale socket file from a previous run.
    pub fn bind(config: &UnixSocketConfig, handler: Arc<dyn StorageDriverHandler>) -> Result<Self> {
        let path = PathBuf::from(&config.path);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&path)
            .map_err(|e| HubError::Config(format!("unix socket {}: {}", path.display(), e)))?;
        Ok(Self { listener, path, handler })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub async fn serve(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(path = %self.path.display(), "Storage-driver socket listening");
        let _ = shutdown_rx.borrow_and_update();

        loop {
            let stream = tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!(error = %e, "Storage-driver socket accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                        continue;
                    }
                },
            };

            let handler = Arc::clone(&self.handler);
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(serve_stream(stream, handler, shutdown_rx));
        }

        let _ = std::fs::remove_file(&self.path);
        info!("Storage-driver socket stopped");
    }
}

async fn serve_stream(mut stream: UnixStream, handler: Arc<dyn StorageDriverHandler>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        let request = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            request = codec::read_value::<_, StorageRequest>(&mut stream, MAX_UDS_FRAME_BYTES) => request,
        };

        let request = match request {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Malformed storage-driver request, closing stream");
                metrics::record_uds_request(false);
                break;
            }
        };

        let id = request.id.clone();
        let operation = request.operation.clone();
        let response = match handler.handle(request).await {
            Ok(payload) => StorageResponse {
                id,
                success: true,
                payload,
                error: None,
            },
            Err(error) => StorageResponse {
                id,
                success: false,
                payload: serde_json::Value::Null,
                error: Some(error),
            },
        };
        metrics::record_uds_request(response.success);
        debug!(operation = %operation, success = response.success, "Storage-driver request handled");

        if let Err(e) = codec::write_value(&mut stream, &response, MAX_UDS_FRAME_BYTES).await {
            debug!(error = %e, "Storage-driver response write failed");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    struct Echo;

    impl StorageDriverHandler for Echo {
        fn handle(&self, request: StorageRequest) -> HandlerFuture<'_> {
            Box::pin(async move { Ok(json!({ "echo": request.payload })) })
        }
    }

    async fn roundtrip(handler: Arc<dyn StorageDriverHandler>, request: &StorageRequest) -> StorageResponse {
        let dir = tempdir().unwrap();
        let config = UnixSocketConfig {
            enabled: true,
            path: dir.path().join("csi.sock").to_string_lossy().to_string(),
        };
        let server = UdsServer::bind(&config, handler).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(server.serve(shutdown_rx));

        let mut client = UnixStream::connect(&config.path).await.unwrap();
        codec::write_value(&mut client, request, MAX_UDS_FRAME_BYTES).await.unwrap();
        let response: StorageResponse = codec::read_value(&mut client, MAX_UDS_FRAME_BYTES).await.unwrap().unwrap();

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_handler_response() {
        let request = StorageRequest {
            id: "req-1".into(),
            operation: "CreateVolume".into(),
            payload: json!({"name": "pv-1"}),
        };
        let response = roundtrip(Arc::new(Echo), &request).await;
        assert!(response.success);
        assert_eq!(response.id, "req-1");
        assert_eq!(response.payload, json!({"echo": {"name": "pv-1"}}));
    }

    #[tokio::test]
    async fn test_default_handler_refuses() {
        let request = StorageRequest {
            id: "req-2".into(),
            operation: "DeleteVolume".into(),
            payload: serde_json::Value::Null,
        };
        let response = roundtrip(Arc::new(UnsupportedStorageDriver), &request).await;
        assert!(!response.success);
        assert!(response.error.unwrap().contains("DeleteVolume"));
    }

    #[tokio::test]
    async fn test_stale_socket_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, b"").unwrap();
        let config = UnixSocketConfig {
            enabled: true,
            path: path.to_string_lossy().to_string(),
        };
        assert!(UdsServer::bind(&config, Arc::new(UnsupportedStorageDriver)).is_ok());
    }
}
