//! Tower middleware enforcing x402 payments on wrapped routes.
//!
//! Build one [`GateController`] per application, wrap it in a
//! [`PaymentGateLayer`] and apply the layer to the routes to protect:
//!
//! ```ignore
//! let gate = Arc::new(GateController::new(&config, stores, &verifiers)?);
//! let app = Router::new()
//!     .route("/reports/{id}", get(report))
//!     .layer(PaymentGateLayer::new(gate));
//! ```
//!
//! Handlers of admitted requests can read the payment through
//! `Extension<PaymentContext>`.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum_core::extract::Request;
use axum_core::response::Response;
use b402::{GateController, GateDecision};
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};

use crate::request::gate_request;
use crate::response::{challenge_response, error_response};

/// Layer applying a [`GateController`] to every request of a service.
#[derive(Clone, Debug)]
pub struct PaymentGateLayer {
    gate: Arc<GateController>,
}

impl PaymentGateLayer {
    /// Creates a layer around a shared gate.
    #[must_use]
    pub const fn new(gate: Arc<GateController>) -> Self {
        Self { gate }
    }

    /// Returns the wrapped gate.
    #[must_use]
    pub const fn gate(&self) -> &Arc<GateController> {
        &self.gate
    }
}

impl<S> Layer<S> for PaymentGateLayer
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    type Service = PaymentGateService;

    fn layer(&self, inner: S) -> Self::Service {
        PaymentGateService {
            gate: Arc::clone(&self.gate),
            inner: BoxCloneSyncService::new(inner),
        }
    }
}

/// Service produced by [`PaymentGateLayer`].
#[derive(Clone)]
#[allow(missing_debug_implementations)] // BoxCloneSyncService does not implement Debug
pub struct PaymentGateService {
    gate: Arc<GateController>,
    inner: BoxCloneSyncService<Request, Response, Infallible>,
}

impl Service<Request> for PaymentGateService {
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let gate = Arc::clone(&self.gate);
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let request = gate_request(&req);
            match gate.evaluate(&request).await {
                Ok(GateDecision::PassThrough) => inner.call(req).await,
                Ok(GateDecision::Admit(payment)) => {
                    req.extensions_mut().insert(*payment);
                    inner.call(req).await
                }
                Ok(GateDecision::Challenge(challenge)) => Ok(challenge_response(&challenge)),
                Err(err) => Ok(error_response(&err)),
            }
        })
    }
}
