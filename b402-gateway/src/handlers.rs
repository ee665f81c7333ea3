//! Axum route handlers for the gateway.
//!
//! - `GET /health`
//! - `GET /paywall/tenant/{tenant}/links/{slug}` (gated)
//! - `GET /paywall/tenant/{tenant}/widgets/{slug}` (gated)
//! - `GET /paywall/tenant/{tenant}/credits/{slug}` (gated)
//! - `POST /paywall/tenant/{tenant}/credits/{slug}/consume` (tenant only)
//!
//! The three resource views sit behind a [`PaymentGateLayer`]; a confirmed
//! payment reaches them as an `Extension<PaymentContext>`. The consume route
//! requires the `Extension<TenantId>` inserted by an upstream authenticator
//! and only spends credits of plans owned by that tenant.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use b402::ledger::{CreditPlan, LedgerEffect, LinkKind, PaymentLink};
use b402::receipt::Metadata;
use b402::store::LedgerStore;
use b402::{GateController, PaymentContext, TenantId};
use b402_http::PaymentGateLayer;
use b402_sqlite::SqliteStore;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::GatewayError;

/// Shared state of the gateway routes.
#[derive(Clone)]
pub struct GatewayState {
    gate: Arc<GateController>,
    store: SqliteStore,
}

impl std::fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayState")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl GatewayState {
    /// Creates the state from a gate and the store it reads.
    #[must_use]
    pub const fn new(gate: Arc<GateController>, store: SqliteStore) -> Self {
        Self { gate, store }
    }

    /// The payment gate.
    #[must_use]
    pub const fn gate(&self) -> &Arc<GateController> {
        &self.gate
    }
}

/// Builds the gateway router.
pub fn gateway_router(state: GatewayState) -> Router {
    let paywall = Router::new()
        .route("/paywall/tenant/{tenant}/links/{slug}", get(get_link))
        .route("/paywall/tenant/{tenant}/widgets/{slug}", get(get_widget))
        .route("/paywall/tenant/{tenant}/credits/{slug}", get(get_credit_plan))
        .route_layer(PaymentGateLayer::new(Arc::clone(&state.gate)));

    Router::new()
        .route("/health", get(health))
        .route(
            "/paywall/tenant/{tenant}/credits/{slug}/consume",
            post(consume_credits),
        )
        .merge(paywall)
        .with_state(state)
}

/// `GET /health`
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Serialize)]
struct LinkView<'a> {
    id: i64,
    kind: LinkKind,
    slug: &'a str,
    title: &'a str,
    description: Option<&'a str>,
    amount: Decimal,
    currency: &'a str,
    network: &'a str,
}

impl<'a> From<&'a PaymentLink> for LinkView<'a> {
    fn from(link: &'a PaymentLink) -> Self {
        Self {
            id: link.id,
            kind: link.kind,
            slug: &link.slug,
            title: &link.title,
            description: link.description.as_deref(),
            amount: link.amount,
            currency: &link.currency,
            network: &link.network,
        }
    }
}

#[derive(Debug, Serialize)]
struct PlanView<'a> {
    id: i64,
    slug: &'a str,
    title: &'a str,
    description: Option<&'a str>,
    amount: Decimal,
    currency: &'a str,
    network: &'a str,
    credits_per_payment: i64,
}

impl<'a> From<&'a CreditPlan> for PlanView<'a> {
    fn from(plan: &'a CreditPlan) -> Self {
        Self {
            id: plan.id,
            slug: &plan.slug,
            title: &plan.title,
            description: plan.description.as_deref(),
            amount: plan.amount,
            currency: &plan.currency,
            network: &plan.network,
            credits_per_payment: plan.credits_per_payment,
        }
    }
}

/// Consumer named on the query string of a credit plan view.
#[derive(Debug, Default, Deserialize)]
struct ConsumerQuery {
    consumer: Option<String>,
    customer: Option<String>,
}

/// Body of the credit consumption endpoint.
#[derive(Debug, Deserialize)]
struct ConsumeRequest {
    consumer: String,
    credits: i64,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    metadata: Metadata,
}

/// The authenticated tenant must be the owner named in the path.
fn require_owner(owner: TenantId, caller: Option<TenantId>) -> Result<(), GatewayError> {
    match caller {
        None => Err(GatewayError::Unauthorized),
        Some(caller) if caller != owner => Err(GatewayError::Forbidden),
        Some(_) => Ok(()),
    }
}

/// A priced resource needs a payment; a free one is served as is.
///
/// Only reachable without payment when the gate is disabled.
fn require_payment(amount: Decimal, payment: Option<&PaymentContext>) -> Result<(), GatewayError> {
    if payment.is_none() && amount > Decimal::ZERO {
        return Err(GatewayError::PaymentRequired);
    }
    Ok(())
}

async fn active_link(
    state: &GatewayState,
    owner: TenantId,
    kind: LinkKind,
    slug: &str,
) -> Result<PaymentLink, GatewayError> {
    state
        .store
        .payment_link_by_slug(owner, kind, slug)
        .await?
        .filter(|link| link.active)
        .ok_or_else(|| GatewayError::NotFound(format!("{kind} {slug:?}")))
}

async fn active_plan(
    state: &GatewayState,
    owner: TenantId,
    slug: &str,
) -> Result<CreditPlan, GatewayError> {
    state
        .store
        .credit_plan_by_slug(owner, slug)
        .await?
        .filter(|plan| plan.active)
        .ok_or_else(|| GatewayError::NotFound(format!("credit plan {slug:?}")))
}

async fn link_view(
    state: &GatewayState,
    owner: TenantId,
    kind: LinkKind,
    slug: &str,
    payment: Option<PaymentContext>,
) -> Result<Json<Value>, GatewayError> {
    let link = active_link(state, owner, kind, slug).await?;
    require_payment(link.amount, payment.as_ref())?;
    Ok(Json(json!({
        "link": LinkView::from(&link),
        "payment": payment,
    })))
}

/// `GET /paywall/tenant/{tenant}/links/{slug}`
async fn get_link(
    State(state): State<GatewayState>,
    Path((tenant, slug)): Path<(u64, String)>,
    payment: Option<Extension<PaymentContext>>,
) -> Result<Json<Value>, GatewayError> {
    let payment = payment.map(|Extension(p)| p);
    link_view(&state, TenantId(tenant), LinkKind::Link, &slug, payment).await
}

/// `GET /paywall/tenant/{tenant}/widgets/{slug}`
async fn get_widget(
    State(state): State<GatewayState>,
    Path((tenant, slug)): Path<(u64, String)>,
    payment: Option<Extension<PaymentContext>>,
) -> Result<Json<Value>, GatewayError> {
    let payment = payment.map(|Extension(p)| p);
    link_view(&state, TenantId(tenant), LinkKind::Widget, &slug, payment).await
}

/// `GET /paywall/tenant/{tenant}/credits/{slug}`
///
/// Reports the balance of the consumer credited by this payment, or of the
/// consumer named in the query.
async fn get_credit_plan(
    State(state): State<GatewayState>,
    Path((tenant, slug)): Path<(u64, String)>,
    Query(query): Query<ConsumerQuery>,
    payment: Option<Extension<PaymentContext>>,
) -> Result<Json<Value>, GatewayError> {
    let payment = payment.map(|Extension(p)| p);
    let plan = active_plan(&state, TenantId(tenant), &slug).await?;
    require_payment(plan.amount, payment.as_ref())?;

    let credited = payment
        .as_ref()
        .and_then(|p| match &p.ledger_effect {
            Some(LedgerEffect::CreditTopUp { consumer_ref, .. }) => Some(consumer_ref.clone()),
            _ => None,
        });
    let consumer = credited
        .or(query.consumer)
        .or(query.customer)
        .map(|c| c.trim().to_owned())
        .filter(|c| !c.is_empty());

    let credits_remaining = match &consumer {
        Some(consumer) => state
            .store
            .credit_subscription(plan.id, consumer)
            .await?
            .map_or(0, |s| s.credits_remaining),
        None => 0,
    };

    Ok(Json(json!({
        "plan": PlanView::from(&plan),
        "consumer": consumer,
        "credits_remaining": credits_remaining,
        "payment": payment,
    })))
}

/// `POST /paywall/tenant/{tenant}/credits/{slug}/consume`
async fn consume_credits(
    State(state): State<GatewayState>,
    Path((tenant, slug)): Path<(u64, String)>,
    caller: Option<Extension<TenantId>>,
    Json(body): Json<ConsumeRequest>,
) -> Result<Json<Value>, GatewayError> {
    let owner = TenantId(tenant);
    require_owner(owner, caller.map(|Extension(t)| t))?;
    if body.credits <= 0 {
        return Err(GatewayError::BadRequest("credits must be positive".into()));
    }
    if body.consumer.trim().is_empty() {
        return Err(GatewayError::BadRequest("consumer is required".into()));
    }
    let plan = active_plan(&state, owner, &slug).await?;
    let movement = state
        .gate
        .ledger()
        .consume(
            &plan,
            &body.consumer,
            body.credits,
            body.description,
            body.metadata,
        )
        .await?;

    Ok(Json(json!({
        "consumer": movement.subscription.consumer_ref,
        "credits_consumed": body.credits,
        "credits_remaining": movement.subscription.credits_remaining,
        "usage_id": movement.usage.id,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use axum::response::Response;
    use b402::GateConfig;
    use b402::error::VerificationFailure;
    use b402::verifier::{
        ReceiptPayload, ReceiptVerifier, VerificationContext, VerificationResult,
        VerifierRegistry,
    };
    use b402_http::constants::{NONCE, RECEIPT};
    use tower::ServiceExt;

    use crate::app::build_gate;
    use crate::config::GatewayConfig;

    /// Confirms every receipt for exactly the quoted price.
    struct ExactVerifier;

    #[async_trait]
    impl ReceiptVerifier for ExactVerifier {
        async fn verify(
            &self,
            token: &str,
            price: Decimal,
            _context: &VerificationContext,
        ) -> Result<VerificationResult, VerificationFailure> {
            let payload = ReceiptPayload::decode(token)?;
            Ok(VerificationResult::confirmed(
                payload.require_nonce()?,
                price,
                payload.require_transaction_id()?,
            )
            .with_payer("PAYER"))
        }
    }

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn link(slug: &str, amount: &str) -> PaymentLink {
        PaymentLink {
            id: 0,
            owner: TenantId(7),
            kind: LinkKind::Link,
            slug: slug.into(),
            title: format!("Report {slug}"),
            description: Some("Quarterly numbers".into()),
            amount: dec(amount),
            currency: "USDC".into(),
            network: "algorand".into(),
            pay_to_address: None,
            platform_fee_percent: dec("10"),
            pattern: String::new(),
            active: true,
            metadata: Metadata::new(),
        }
    }

    fn plan() -> CreditPlan {
        CreditPlan {
            id: 0,
            owner: TenantId(7),
            slug: "api".into(),
            title: "API credits".into(),
            description: None,
            amount: dec("0.5"),
            currency: "USDC".into(),
            network: "algorand".into(),
            pay_to_address: None,
            platform_fee_percent: dec("15"),
            credits_per_payment: 10,
            pattern: String::new(),
            active: true,
            metadata: Metadata::new(),
        }
    }

    async fn app() -> (Router, SqliteStore) {
        let store = SqliteStore::in_memory().unwrap();
        store.save_payment_link(link("report", "1.5")).await.unwrap();
        store.save_payment_link(link("free", "0")).await.unwrap();
        store.save_credit_plan(plan()).await.unwrap();

        let config = GatewayConfig {
            gate: GateConfig {
                enabled: true,
                pay_to: "PAYEE".into(),
                verifier: Some("exact".into()),
                ..GateConfig::default()
            },
            ..toml::from_str::<GatewayConfig>("").unwrap()
        };
        let registry = VerifierRegistry::new().with("exact", Arc::new(ExactVerifier));
        let gate = build_gate(&config, &store, &registry).unwrap();
        let router = gateway_router(GatewayState::new(Arc::new(gate), store.clone()));
        (router, store)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn consume_as(tenant: Option<u64>, uri: &str, body: &Value) -> Request<Body> {
        let mut request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        if let Some(tenant) = tenant {
            request.extensions_mut().insert(TenantId(tenant));
        }
        request
    }

    /// Consume request authenticated as the plan owner.
    fn consume(uri: &str, body: &Value) -> Request<Body> {
        consume_as(Some(7), uri, body)
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Requests `uri`, pays the challenge and returns the admitted response.
    async fn pay(router: &Router, uri: &str, txid: &str) -> Response {
        let challenge = router.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(challenge.status(), StatusCode::PAYMENT_REQUIRED);
        let nonce = challenge.headers()[NONCE].to_str().unwrap().to_owned();
        let receipt = json!({ "nonce": nonce, "txid": txid }).to_string();

        let request = Request::builder()
            .uri(uri)
            .header(RECEIPT, receipt)
            .body(Body::empty())
            .unwrap();
        router.clone().oneshot(request).await.unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (router, _) = app().await;
        let response = router.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_link_view_requires_payment() {
        let (router, store) = app().await;

        let challenge = router
            .clone()
            .oneshot(get("/paywall/tenant/7/links/report"))
            .await
            .unwrap();
        assert_eq!(challenge.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(challenge.headers()["X-402-Amount"], "1.5");
        assert_eq!(
            json_body(challenge).await,
            json!({ "detail": "Payment required" })
        );

        let paid = pay(&router, "/paywall/tenant/7/links/report", "TX-LINK").await;
        assert_eq!(paid.status(), StatusCode::OK);
        let body = json_body(paid).await;
        assert_eq!(body["link"]["slug"], "report");
        assert_eq!(body["link"]["kind"], "link");
        assert_eq!(body["payment"]["transaction_id"], "TX-LINK");
        assert_eq!(body["payment"]["ledger_effect"]["kind"], "link_event");

        let link_id = body["link"]["id"].as_i64().unwrap();
        let events = store.link_events(link_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fee_amount, dec("0.15"));
    }

    #[tokio::test]
    async fn test_free_and_unknown_links() {
        let (router, _) = app().await;

        let free = router
            .clone()
            .oneshot(get("/paywall/tenant/7/links/free"))
            .await
            .unwrap();
        assert_eq!(free.status(), StatusCode::OK);
        assert!(json_body(free).await["payment"].is_null());

        let missing = router
            .clone()
            .oneshot(get("/paywall/tenant/7/links/nope"))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let wrong_kind = router
            .oneshot(get("/paywall/tenant/7/widgets/report"))
            .await
            .unwrap();
        assert_eq!(wrong_kind.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_credit_purchase_then_consume() {
        let (router, _) = app().await;
        let uri = "/paywall/tenant/7/credits/api?consumer=alice";

        let paid = pay(&router, uri, "TX-CREDITS").await;
        assert_eq!(paid.status(), StatusCode::OK);
        let body = json_body(paid).await;
        assert_eq!(body["consumer"], "alice");
        assert_eq!(body["credits_remaining"], 10);
        assert_eq!(body["plan"]["credits_per_payment"], 10);

        let consume_uri = "/paywall/tenant/7/credits/api/consume";
        let ok = router
            .clone()
            .oneshot(consume(consume_uri, &json!({ "consumer": "alice", "credits": 4 })))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(json_body(ok).await["credits_remaining"], 6);

        let too_many = router
            .clone()
            .oneshot(consume(consume_uri, &json!({ "consumer": "alice", "credits": 7 })))
            .await
            .unwrap();
        assert_eq!(too_many.status(), StatusCode::BAD_REQUEST);

        let zero = router
            .clone()
            .oneshot(consume(consume_uri, &json!({ "consumer": "alice", "credits": 0 })))
            .await
            .unwrap();
        assert_eq!(zero.status(), StatusCode::BAD_REQUEST);

        let unknown_plan = router
            .oneshot(consume(
                "/paywall/tenant/7/credits/missing/consume",
                &json!({ "consumer": "alice", "credits": 1 }),
            ))
            .await
            .unwrap();
        assert_eq!(unknown_plan.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_consume_without_subscription_is_refused() {
        let (router, _) = app().await;
        let response = router
            .oneshot(consume(
                "/paywall/tenant/7/credits/api/consume",
                &json!({ "consumer": "bob", "credits": 1 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("insufficient credits"));
    }

    #[tokio::test]
    async fn test_consume_requires_owning_tenant() {
        let (router, store) = app().await;
        let uri = "/paywall/tenant/7/credits/api?consumer=alice";
        let paid = pay(&router, uri, "TX-AUTH").await;
        assert_eq!(paid.status(), StatusCode::OK);
        let plan_id = json_body(paid).await["plan"]["id"].as_i64().unwrap();

        let consume_uri = "/paywall/tenant/7/credits/api/consume";
        let spend = json!({ "consumer": "alice", "credits": 10 });

        let anonymous = router
            .clone()
            .oneshot(consume_as(None, consume_uri, &spend))
            .await
            .unwrap();
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

        let stranger = router
            .clone()
            .oneshot(consume_as(Some(8), consume_uri, &spend))
            .await
            .unwrap();
        assert_eq!(stranger.status(), StatusCode::FORBIDDEN);

        let subscription = store
            .credit_subscription(plan_id, "alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(subscription.credits_remaining, 10);
    }
}
