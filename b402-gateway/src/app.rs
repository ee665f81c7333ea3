//! Wiring of the durable store, the verifier registry and the gate.

use std::sync::Arc;

use b402::gate::GateStores;
use b402::store::NonceCache;
use b402::{GateController, VerifierRegistry};
use b402_algorand::AlgorandVerifier;
use b402_sqlite::SqliteStore;

use crate::config::GatewayConfig;
use crate::error::GatewayError;

/// Registers every verifier the configuration provides settings for.
///
/// # Errors
///
/// Fails when a configured verifier cannot be constructed.
pub fn verifier_registry(config: &GatewayConfig) -> Result<VerifierRegistry, GatewayError> {
    let mut registry = VerifierRegistry::new();
    if let Some(algorand) = &config.algorand {
        let verifier = AlgorandVerifier::from_config(algorand)?;
        tracing::info!(indexer = %algorand.indexer_url, "Registered Algorand verifier");
        registry.register(AlgorandVerifier::NAME, Arc::new(verifier));
    }
    Ok(registry)
}

/// Uses the SQLite store for nonces and every durable table.
#[must_use]
pub fn gate_stores(store: &SqliteStore) -> GateStores {
    let store = Arc::new(store.clone());
    let nonces: Arc<dyn NonceCache> = Arc::<SqliteStore>::clone(&store);
    GateStores::shared(nonces, store)
}

/// Builds the gate over `store` with the verifiers in `registry`.
///
/// # Errors
///
/// Returns [`GatewayError::Config`] for an enabled gate without payee or with
/// an unknown verifier.
pub fn build_gate(
    config: &GatewayConfig,
    store: &SqliteStore,
    registry: &VerifierRegistry,
) -> Result<GateController, GatewayError> {
    let gate = GateController::new(&config.gate, gate_stores(store), registry)?;
    if config.gate.enabled {
        tracing::info!(
            verifier = config.gate.verifier_name().unwrap_or_default(),
            rules = config.gate.rules.len(),
            "Payment gate enabled"
        );
    } else {
        tracing::warn!("Payment gate disabled, every request passes through");
    }
    Ok(gate)
}
