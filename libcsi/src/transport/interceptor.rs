//! Unary interceptors.
//!
//! Every request the [`CsiServer`](super::CsiServer) receives is passed down
//! a chain of [`Interceptor`]s before it reaches the registered service.
//! Each interceptor gets the method name, the request and a [`Next`] handle
//! it must call exactly once to continue the chain.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{error, info};

use crate::error::CsiError;
use crate::message::CsiMessage;

/// Outcome of one unary call as seen by interceptors.
pub type CallResult = Result<CsiMessage, CsiError>;

/// The innermost step of the chain: routes a request to a service.
pub trait Dispatch: Send + Sync {
    fn dispatch(&self, request: CsiMessage) -> BoxFuture<'_, CallResult>;
}

/// A unary server interceptor.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(
        &self,
        method: &'static str,
        request: CsiMessage,
        next: Next<'_>,
    ) -> CallResult;
}

/// The remainder of an interceptor chain.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Interceptor>],
    endpoint: &'a dyn Dispatch,
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn Interceptor>], endpoint: &'a dyn Dispatch) -> Self {
        Self { chain, endpoint }
    }

    /// Hand the request to the next interceptor, or to the endpoint once the
    /// chain is exhausted.
    pub fn run(self, method: &'static str, request: CsiMessage) -> BoxFuture<'a, CallResult> {
        match self.chain.split_first() {
            Some((head, rest)) => head.intercept(
                method,
                request,
                Next {
                    chain: rest,
                    endpoint: self.endpoint,
                },
            ),
            None => self.endpoint.dispatch(request),
        }
    }
}

/// Logs every call before and after dispatch.
///
/// The wrapped call's outcome is returned exactly as produced.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestLogger;

#[async_trait]
impl Interceptor for RequestLogger {
    async fn intercept(
        &self,
        method: &'static str,
        request: CsiMessage,
        next: Next<'_>,
    ) -> CallResult {
        info!(method, request = ?request, "CSI call");
        let result = next.run(method, request).await;
        match &result {
            Ok(response) => info!(method, response = ?response, "CSI call finished"),
            Err(e) => error!(method, error = %e, "CSI call failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Endpoint that answers every request with a canned result.
    struct Canned(CallResult);

    impl Dispatch for Canned {
        fn dispatch(&self, _request: CsiMessage) -> BoxFuture<'_, CallResult> {
            let result = self.0.clone();
            Box::pin(async move { result })
        }
    }

    /// Records the order in which interceptors saw a call.
    struct Recorder {
        name: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Interceptor for Recorder {
        async fn intercept(
            &self,
            method: &'static str,
            request: CsiMessage,
            next: Next<'_>,
        ) -> CallResult {
            self.seen
                .lock()
                .unwrap()
                .push(format!("{}:before:{method}", self.name));
            let result = next.run(method, request).await;
            self.seen
                .lock()
                .unwrap()
                .push(format!("{}:after", self.name));
            result
        }
    }

    async fn call_through_logger(canned: CallResult) -> CallResult {
        let endpoint = Canned(canned);
        let chain: Vec<Arc<dyn Interceptor>> = vec![Arc::new(RequestLogger)];
        Next::new(&chain, &endpoint)
            .run("/csi.v1.Identity/Probe", CsiMessage::Probe)
            .await
    }

    #[tokio::test]
    async fn logger_returns_response_unchanged() {
        let response = CsiMessage::ProbeResult(true);
        let result = call_through_logger(Ok(response.clone())).await;
        assert_eq!(result, Ok(response));
    }

    #[tokio::test]
    async fn logger_returns_error_unchanged() {
        let err = CsiError::VolumeNotFound("disk-404".into());
        let result = call_through_logger(Err(err.clone())).await;
        assert_eq!(result, Err(err));
    }

    #[tokio::test]
    async fn chain_runs_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(Recorder {
                name: "outer",
                seen: Arc::clone(&seen),
            }),
            Arc::new(Recorder {
                name: "inner",
                seen: Arc::clone(&seen),
            }),
        ];
        let endpoint = Canned(Ok(CsiMessage::Ok));

        let result = Next::new(&chain, &endpoint)
            .run("/csi.v1.Node/NodeGetInfo", CsiMessage::GetNodeInfo)
            .await;

        assert_eq!(result, Ok(CsiMessage::Ok));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "outer:before:/csi.v1.Node/NodeGetInfo",
                "inner:before:/csi.v1.Node/NodeGetInfo",
                "inner:after",
                "outer:after",
            ]
        );
    }
}
