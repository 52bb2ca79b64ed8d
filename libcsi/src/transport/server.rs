//! Unix-socket server that dispatches incoming CSI requests to the registered
//! Identity, Controller and Node services.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{Instrument, debug, info, warn};

use super::frame_codec;
use super::interceptor::{CallResult, Dispatch, Interceptor, Next};
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::message::CsiMessage;
use crate::node::CsiNode;

/// Calls accepted on one connection before the reader waits for responses
/// to drain.
const IN_FLIGHT_PER_CONNECTION: usize = 64;

/// The services registered on one server.  A capability group that was
/// never registered answers with [`CsiError::Unimplemented`].
#[derive(Default, Clone)]
struct Services {
    identity: Option<Arc<dyn CsiIdentity>>,
    controller: Option<Arc<dyn CsiController>>,
    node: Option<Arc<dyn CsiNode>>,
}

/// A CSI server.  Identity, Controller and Node services are registered
/// independently and share a single interceptor chain.
#[derive(Default)]
pub struct CsiServer {
    services: Services,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

struct Shared {
    services: Services,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl CsiServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor.  The first one added is the outermost.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn register_identity(mut self, service: Arc<dyn CsiIdentity>) -> Self {
        self.services.identity = Some(service);
        self
    }

    pub fn register_controller(mut self, service: Arc<dyn CsiController>) -> Self {
        self.services.controller = Some(service);
        self
    }

    pub fn register_node(mut self, service: Arc<dyn CsiNode>) -> Self {
        self.services.node = Some(service);
        self
    }

    /// Accept connections until the listener fails.
    ///
    /// Returns only with the accept error.
    pub async fn serve(self, listener: UnixListener) -> Result<(), CsiError> {
        self.serve_with_shutdown(listener, std::future::pending())
            .await
    }

    /// Accept connections until the listener fails or `signal` resolves.
    ///
    /// Each accepted connection is handled on its own Tokio task.
    pub async fn serve_with_shutdown<F>(
        self,
        listener: UnixListener,
        signal: F,
    ) -> Result<(), CsiError>
    where
        F: Future<Output = ()>,
    {
        let shared = Arc::new(Shared {
            services: self.services,
            interceptors: self.interceptors,
        });
        tokio::pin!(signal);

        if let Ok(addr) = listener.local_addr() {
            info!(addr = ?addr, "CSI server listening");
        }

        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("CSI server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, _) = accepted.map_err(CsiError::transport)?;
                    let shared = Arc::clone(&shared);
                    tokio::spawn(
                        async move {
                            debug!("CSI connection accepted");
                            if let Err(e) = Self::handle_connection(stream, shared).await {
                                warn!(error = %e, "CSI connection error");
                            }
                        }
                        .instrument(tracing::debug_span!("csi_conn")),
                    );
                }
            }
        }
    }

    /// Serve every frame on one connection.
    ///
    /// Each request runs on its own task so slow calls do not hold up the
    /// ones behind them; responses are still written in request order.
    async fn handle_connection(stream: UnixStream, shared: Arc<Shared>) -> Result<(), CsiError> {
        let (mut sink, mut frames) = Framed::new(stream, frame_codec()).split();
        let (tx, mut rx) = mpsc::channel::<JoinHandle<CsiMessage>>(IN_FLIGHT_PER_CONNECTION);

        let writer = tokio::spawn(
            async move {
                while let Some(call) = rx.recv().await {
                    let response = call
                        .await
                        .unwrap_or_else(|e| CsiMessage::Error(CsiError::internal(e)));
                    let payload = serde_json::to_vec(&response).map_err(CsiError::internal)?;
                    sink.send(Bytes::from(payload))
                        .await
                        .map_err(CsiError::transport)?;
                }
                Ok::<_, CsiError>(())
            }
            .in_current_span(),
        );

        while let Some(frame) = frames.next().await {
            let frame = frame.map_err(CsiError::transport)?;
            let shared = Arc::clone(&shared);
            let call = tokio::spawn(
                async move {
                    match serde_json::from_slice::<CsiMessage>(&frame) {
                        Ok(request) => shared.handle(request).await,
                        Err(e) => CsiMessage::Error(CsiError::TransportError(format!(
                            "malformed request: {e}"
                        ))),
                    }
                }
                .in_current_span(),
            );
            if tx.send(call).await.is_err() {
                // Writer hit an error; it is reported below.
                break;
            }
        }

        drop(tx);
        writer.await.map_err(CsiError::internal)?
    }
}

impl Shared {
    async fn handle(&self, request: CsiMessage) -> CsiMessage {
        let Some(method) = request.method() else {
            warn!(msg = %request, "unexpected message variant received as request");
            return CsiMessage::Error(CsiError::InvalidArgument(format!(
                "unexpected message: {request}"
            )));
        };

        match Next::new(&self.interceptors, &self.services)
            .run(method, request)
            .await
        {
            Ok(response) => response,
            Err(e) => CsiMessage::Error(e),
        }
    }
}

impl Services {
    fn identity(&self, method: &str) -> Result<&dyn CsiIdentity, CsiError> {
        self.identity
            .as_deref()
            .ok_or_else(|| CsiError::Unimplemented(method.to_owned()))
    }

    fn controller(&self, method: &str) -> Result<&dyn CsiController, CsiError> {
        self.controller
            .as_deref()
            .ok_or_else(|| CsiError::Unimplemented(method.to_owned()))
    }

    fn node(&self, method: &str) -> Result<&dyn CsiNode, CsiError> {
        self.node
            .as_deref()
            .ok_or_else(|| CsiError::Unimplemented(method.to_owned()))
    }

    /// Map a request to the matching service method and wrap the result in
    /// the response variant.
    async fn route(&self, request: CsiMessage) -> CallResult {
        let method = request.method().unwrap_or("unknown");
        match request {
            // --- Identity ---------------------------------------------------
            CsiMessage::Probe => self
                .identity(method)?
                .probe()
                .await
                .map(CsiMessage::ProbeResult),
            CsiMessage::GetPluginInfo => self
                .identity(method)?
                .get_plugin_info()
                .await
                .map(CsiMessage::PluginInfoResponse),
            CsiMessage::GetPluginCapabilities => self
                .identity(method)?
                .get_plugin_capabilities()
                .await
                .map(CsiMessage::PluginCapabilitiesResponse),

            // --- Controller -------------------------------------------------
            CsiMessage::CreateVolume(req) => self
                .controller(method)?
                .create_volume(req)
                .await
                .map(CsiMessage::VolumeCreated),
            CsiMessage::DeleteVolume(id) => self
                .controller(method)?
                .delete_volume(&id)
                .await
                .map(|()| CsiMessage::Ok),
            CsiMessage::ControllerPublishVolume(req) => self
                .controller(method)?
                .controller_publish_volume(req)
                .await
                .map(CsiMessage::VolumePublished),
            CsiMessage::ControllerUnpublishVolume(req) => self
                .controller(method)?
                .controller_unpublish_volume(req)
                .await
                .map(|()| CsiMessage::Ok),
            CsiMessage::ValidateVolumeCapabilities {
                volume_id,
                capabilities,
            } => self
                .controller(method)?
                .validate_volume_capabilities(&volume_id, &capabilities)
                .await
                .map(CsiMessage::CapabilitiesValid),
            CsiMessage::ListVolumes => self
                .controller(method)?
                .list_volumes()
                .await
                .map(CsiMessage::VolumeList),
            CsiMessage::GetCapacity => self
                .controller(method)?
                .get_capacity()
                .await
                .map(CsiMessage::Capacity),
            CsiMessage::ControllerGetCapabilities => self
                .controller(method)?
                .get_capabilities()
                .await
                .map(CsiMessage::ControllerCapabilitiesResponse),

            // --- Node -------------------------------------------------------
            CsiMessage::StageVolume(req) => self
                .node(method)?
                .stage_volume(req)
                .await
                .map(|()| CsiMessage::Ok),
            CsiMessage::UnstageVolume {
                volume_id,
                staging_target_path,
            } => self
                .node(method)?
                .unstage_volume(&volume_id, &staging_target_path)
                .await
                .map(|()| CsiMessage::Ok),
            CsiMessage::PublishVolume(req) => self
                .node(method)?
                .publish_volume(req)
                .await
                .map(|()| CsiMessage::Ok),
            CsiMessage::UnpublishVolume {
                volume_id,
                target_path,
            } => self
                .node(method)?
                .unpublish_volume(&volume_id, &target_path)
                .await
                .map(|()| CsiMessage::Ok),
            CsiMessage::GetNodeInfo => self
                .node(method)?
                .get_info()
                .await
                .map(CsiMessage::NodeInfoResponse),
            CsiMessage::NodeGetCapabilities => self
                .node(method)?
                .get_capabilities()
                .await
                .map(CsiMessage::NodeCapabilitiesResponse),

            // --- Response variants never reach the router -------------------
            other => Err(CsiError::InvalidArgument(format!(
                "unexpected message: {other}"
            ))),
        }
    }
}

impl Dispatch for Services {
    fn dispatch(&self, request: CsiMessage) -> BoxFuture<'_, CallResult> {
        Box::pin(self.route(request))
    }
}
