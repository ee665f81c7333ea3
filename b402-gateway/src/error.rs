//! Error types for the gateway.

use std::path::PathBuf;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use b402::error::LedgerEffectError;
use b402::{ConfigError, StoreError};
use b402_algorand::IndexerError;
use b402_sqlite::SqliteError;

/// Errors of the gateway: startup failures and request failures.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The configuration file exists but could not be read.
    #[error("failed to read config file {}: {source}", path.display())]
    ConfigRead {
        /// File that failed.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`crate::GatewayConfig`].
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Gate settings are unusable.
    #[error("invalid gate configuration: {0}")]
    Config(#[from] ConfigError),

    /// The indexer client could not be built.
    #[error("indexer client: {0}")]
    Indexer(#[from] IndexerError),

    /// The database could not be opened or migrated.
    #[error("database: {0}")]
    Database(#[from] SqliteError),

    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Applying a ledger movement failed.
    #[error(transparent)]
    Ledger(#[from] LedgerEffectError),

    /// Socket binding or serving failed.
    #[error("server I/O: {0}")]
    Io(#[from] std::io::Error),

    /// The requested resource does not exist or is inactive.
    #[error("{0} not found")]
    NotFound(String),

    /// The request was understood but refused.
    #[error("{0}")]
    BadRequest(String),

    /// The request carries no authenticated tenant.
    #[error("authentication required")]
    Unauthorized,

    /// The authenticated tenant does not own the addressed resource.
    #[error("resource belongs to another tenant")]
    Forbidden,

    /// A paid view was reached without a confirmed payment.
    #[error("Payment required")]
    PaymentRequired,
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) | Self::Ledger(LedgerEffectError::Amount(_)) => {
                StatusCode::BAD_REQUEST
            }
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::PaymentRequired => StatusCode::PAYMENT_REQUIRED,
            Self::Store(err) | Self::Ledger(LedgerEffectError::Store(err)) => store_status(err),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

const fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::InsufficientCredits { .. } | StoreError::InvalidInput(_) => {
            StatusCode::BAD_REQUEST
        }
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Gateway request failed");
        }
        let body = if matches!(self, Self::PaymentRequired) {
            serde_json::json!({ "detail": self.to_string() })
        } else {
            serde_json::json!({ "error": self.to_string() })
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let insufficient = StoreError::InsufficientCredits {
            available: 1,
            requested: 2,
        };
        assert_eq!(
            GatewayError::Ledger(insufficient.into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::Store(StoreError::backend("disk full")).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::NotFound("credit plan".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::PaymentRequired.status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            GatewayError::Unauthorized.status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(GatewayError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            GatewayError::Config(ConfigError::MissingPayTo).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
