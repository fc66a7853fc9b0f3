//! QUIC server that runs on each worker node and dispatches incoming CSI
//! requests to the appropriate trait implementations.

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::crypto::rustls::QuicServerConfig;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::message::CsiMessage;
use crate::node::CsiNode;
use crate::types::NodeInfo;

/// A CSI server that accepts QUIC connections and dispatches
/// [`CsiMessage`] requests to an [`CsiIdentity`] + [`CsiController`] +
/// [`CsiNode`] implementation.
pub struct CsiServer<T> {
    endpoint: quinn::Endpoint,
    handler: Arc<T>,
}

impl<T> CsiServer<T>
where
    T: CsiIdentity + CsiController + CsiNode + 'static,
{
    /// Create a new server bound to `addr`.
    ///
    /// `tls_config` carries the certificate and key the control plane
    /// trusts for this driver.
    pub fn new(
        addr: SocketAddr,
        tls_config: rustls::ServerConfig,
        handler: Arc<T>,
    ) -> Result<Self, CsiError> {
        let quic_server_config = QuicServerConfig::try_from(tls_config)
            .map_err(|e| CsiError::TransportError(format!("invalid TLS config: {e}")))?;
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_server_config));
        let endpoint = quinn::Endpoint::server(server_config, addr).map_err(CsiError::transport)?;
        info!(%addr, "CSI QUIC server listening");
        Ok(Self { endpoint, handler })
    }

    /// Accept connections in a loop until the endpoint is closed.
    ///
    /// Each accepted connection spawns a Tokio task, and each bi-stream
    /// within a connection is handled concurrently.
    pub async fn serve(&self) -> Result<(), CsiError> {
        while let Some(incoming) = self.endpoint.accept().await {
            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => {
                        let remote = conn.remote_address();
                        debug!(%remote, "CSI connection accepted");
                        if let Err(e) = Self::handle_connection(conn, handler).await {
                            warn!(%remote, error = %e, "CSI connection error");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "CSI incoming connection failed");
                    }
                }
            });
        }
        Ok(())
    }

    /// Handle all bi-streams on a single connection.
    async fn handle_connection(conn: quinn::Connection, handler: Arc<T>) -> Result<(), CsiError> {
        loop {
            let (send, recv) = match conn.accept_bi().await {
                Ok(stream) => stream,
                Err(quinn::ConnectionError::ApplicationClosed(_)) => return Ok(()),
                Err(e) => return Err(CsiError::transport(e)),
            };

            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                if let Err(e) = Self::handle_stream(send, recv, &handler).await {
                    error!(error = %e, "CSI stream handler error");
                }
            });
        }
    }

    /// Process a single bi-stream: read request → dispatch → write response.
    #[instrument(skip_all)]
    async fn handle_stream(
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
        handler: &T,
    ) -> Result<(), CsiError> {
        // Read the full request.
        let buf = recv
            .read_to_end(16 * 1024 * 1024)
            .await
            .map_err(CsiError::transport)?;

        let request: CsiMessage = serde_json::from_slice(&buf)
            .map_err(|e| CsiError::TransportError(format!("malformed request: {e}")))?;

        debug!(%request, "CSI request received");

        let response = Self::dispatch(handler, request).await;

        // Serialize and send the response.
        let payload = serde_json::to_vec(&response).map_err(CsiError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        send.finish().map_err(CsiError::transport)?;
        Ok(())
    }

    /// Map a [`CsiMessage`] request to the correct trait method call and
    /// wrap the result in a response [`CsiMessage`].
    async fn dispatch(handler: &T, request: CsiMessage) -> CsiMessage {
        let result = match request {
            // --- Identity ---------------------------------------------------
            CsiMessage::Probe => handler.probe().await.map(CsiMessage::ProbeResult),
            CsiMessage::GetPluginInfo => handler
                .get_plugin_info()
                .await
                .map(CsiMessage::PluginInfoResponse),
            CsiMessage::GetPluginCapabilities => handler
                .get_plugin_capabilities()
                .await
                .map(CsiMessage::PluginCapabilitiesResponse),

            // --- Controller -------------------------------------------------
            CsiMessage::CreateVolume(req) => {
                handler.create_volume(req).await.map(CsiMessage::VolumeCreated)
            }
            CsiMessage::DeleteVolume(req) => handler.delete_volume(req).await.map(|()| CsiMessage::Ok),
            CsiMessage::ValidateVolumeCapabilities(req) => handler
                .validate_volume_capabilities(req)
                .await
                .map(CsiMessage::Validation),
            CsiMessage::ListVolumes(req) => {
                handler.list_volumes(req).await.map(CsiMessage::VolumeList)
            }
            CsiMessage::GetCapacity => handler.get_capacity().await.map(CsiMessage::Capacity),
            CsiMessage::ControllerGetCapabilities => handler
                .controller_get_capabilities()
                .await
                .map(CsiMessage::ControllerCapabilities),
            CsiMessage::ControllerGetVolume(id) => handler
                .controller_get_volume(&id)
                .await
                .map(CsiMessage::VolumeInfo),
            CsiMessage::ControllerPublishVolume { volume_id, node_id } => {
                let node = NodeInfo {
                    node_id,
                    max_volumes: 0,
                };
                handler
                    .controller_publish_volume(&volume_id, &node)
                    .await
                    .map(|()| CsiMessage::Ok)
            }
            CsiMessage::ControllerUnpublishVolume { volume_id, node_id } => handler
                .controller_unpublish_volume(&volume_id, &node_id)
                .await
                .map(|()| CsiMessage::Ok),
            CsiMessage::CreateSnapshot {
                source_volume_id,
                name,
            } => handler
                .create_snapshot(&source_volume_id, &name)
                .await
                .map(|()| CsiMessage::Ok),
            CsiMessage::DeleteSnapshot(id) => {
                handler.delete_snapshot(&id).await.map(|()| CsiMessage::Ok)
            }
            CsiMessage::ListSnapshots => handler.list_snapshots().await.map(|()| CsiMessage::Ok),
            CsiMessage::ControllerExpandVolume {
                volume_id,
                capacity_bytes,
            } => handler
                .controller_expand_volume(&volume_id, capacity_bytes)
                .await
                .map(CsiMessage::Expanded),
            CsiMessage::ControllerModifyVolume(id) => handler
                .controller_modify_volume(&id)
                .await
                .map(|()| CsiMessage::Ok),

            // --- Node -------------------------------------------------------
            CsiMessage::StageVolume(req) => handler.stage_volume(req).await.map(|()| CsiMessage::Ok),
            CsiMessage::UnstageVolume {
                volume_id,
                staging_target_path,
            } => handler
                .unstage_volume(&volume_id, &staging_target_path)
                .await
                .map(|()| CsiMessage::Ok),
            CsiMessage::PublishVolume(req) => {
                handler.publish_volume(req).await.map(|()| CsiMessage::Ok)
            }
            CsiMessage::UnpublishVolume {
                volume_id,
                target_path,
            } => handler
                .unpublish_volume(&volume_id, &target_path)
                .await
                .map(|()| CsiMessage::Ok),
            CsiMessage::GetVolumeStats(req) => {
                handler.get_volume_stats(req).await.map(CsiMessage::Stats)
            }
            CsiMessage::NodeExpandVolume {
                volume_id,
                volume_path,
                capacity_bytes,
            } => handler
                .node_expand_volume(&volume_id, &volume_path, capacity_bytes)
                .await
                .map(CsiMessage::Expanded),
            CsiMessage::NodeGetCapabilities => handler
                .node_get_capabilities()
                .await
                .map(CsiMessage::NodeCapabilities),
            CsiMessage::GetNodeInfo => handler.get_info().await.map(CsiMessage::NodeInfoResponse),

            // --- Response variants should never arrive as requests ----------
            other => {
                warn!(msg = %other, "unexpected message variant received as request");
                Err(CsiError::InvalidArgument(format!(
                    "unexpected message: {other}"
                )))
            }
        };
        result.unwrap_or_else(CsiMessage::Error)
    }

    /// Return a reference to the underlying QUIC endpoint, useful for
    /// obtaining the local address or shutting down.
    pub fn endpoint(&self) -> &quinn::Endpoint {
        &self.endpoint
    }
}
