//! Unix-socket client used by orchestrator-side tooling and tests to issue
//! CSI requests.

use std::path::Path;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, instrument};

use super::frame_codec;
use crate::error::CsiError;
use crate::message::CsiMessage;

/// A lightweight CSI client that sends [`CsiMessage`] requests over a single
/// connection and returns the server's response.
///
/// Requests on one client are serialised; open several clients for
/// concurrent calls.
pub struct CsiClient {
    framed: Mutex<Framed<UnixStream, LengthDelimitedCodec>>,
}

impl CsiClient {
    /// Connect to the CSI server listening on the socket at `path`.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, CsiError> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| CsiError::TransportError(format!("connect {}: {e}", path.display())))?;
        debug!(path = %path.display(), "CSI connection established");
        Ok(Self {
            framed: Mutex::new(Framed::new(stream, frame_codec())),
        })
    }

    /// Send a request and wait for the corresponding response.
    ///
    /// A service-level failure comes back as `Ok(CsiMessage::Error(_))`;
    /// `Err` is reserved for transport problems.
    #[instrument(skip(self), fields(msg = %msg))]
    pub async fn request(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        let payload = serde_json::to_vec(msg).map_err(CsiError::internal)?;

        let mut framed = self.framed.lock().await;
        framed
            .send(Bytes::from(payload))
            .await
            .map_err(CsiError::transport)?;

        let frame = framed
            .next()
            .await
            .ok_or_else(|| CsiError::TransportError("connection closed by server".into()))?
            .map_err(CsiError::transport)?;

        let response: CsiMessage = serde_json::from_slice(&frame).map_err(CsiError::transport)?;
        debug!(%response, "CSI response received");
        Ok(response)
    }

    /// Like [`Self::request`], but lifts [`CsiMessage::Error`] into `Err`.
    pub async fn call(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        match self.request(msg).await? {
            CsiMessage::Error(e) => Err(e),
            other => Ok(other),
        }
    }
}
