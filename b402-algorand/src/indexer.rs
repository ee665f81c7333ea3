//! Minimal client for the Algorand indexer REST API.
//!
//! Only `GET /v2/transactions/{txid}` is needed. Responses are decoded into
//! the handful of fields the verifier checks; everything else is ignored.
//!
//! ## Error Handling
//!
//! [`IndexerError`] keeps the failure context:
//! - URL construction
//! - HTTP transport failures, including timeouts
//! - JSON deserialization errors
//! - Unexpected HTTP status responses

use std::time::Duration;

use http::StatusCode;
use reqwest::Client;
use serde::Deserialize;
use tracing::instrument;
use url::Url;

/// Header carrying the indexer API token.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Errors that can occur while querying the indexer.
#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    /// URL parse error.
    #[error("URL parse error: {context}: {source}")]
    UrlParse {
        /// Human-readable context.
        context: &'static str,
        /// The underlying parse error.
        #[source]
        source: url::ParseError,
    },
    /// The base URL cannot carry path segments.
    #[error("Indexer URL cannot be a base: {0}")]
    CannotBeABase(Url),
    /// HTTP transport error.
    #[error("HTTP error: {context}: {source}")]
    Http {
        /// Human-readable context.
        context: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
    /// JSON deserialization error.
    #[error("Failed to deserialize JSON: {context}: {source}")]
    JsonDeserialization {
        /// Human-readable context.
        context: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
    /// Unexpected HTTP status code.
    #[error("Unexpected HTTP status {status}: {context}: {body}")]
    HttpStatus {
        /// Human-readable context.
        context: &'static str,
        /// The HTTP status code.
        status: StatusCode,
        /// The response body.
        body: String,
    },
    /// Failed to read response body.
    #[error("Failed to read response body as text: {context}: {source}")]
    ResponseBodyRead {
        /// Human-readable context.
        context: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
}

impl IndexerError {
    /// Whether the indexer answered that the transaction does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::HttpStatus { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

/// Body of `GET /v2/transactions/{txid}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransactionResponse {
    /// The transaction, absent for some malformed answers.
    #[serde(default)]
    pub transaction: Option<Transaction>,
}

/// The transaction fields the verifier inspects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Transaction {
    /// Transaction id.
    #[serde(default)]
    pub id: Option<String>,
    /// `pay`, `axfer`, `appl`, …
    #[serde(default)]
    pub tx_type: Option<String>,
    /// Sending address.
    #[serde(default)]
    pub sender: Option<String>,
    /// Round the transaction was confirmed in.
    #[serde(default)]
    pub confirmed_round: Option<u64>,
    /// Base64-encoded note bytes.
    #[serde(default)]
    pub note: Option<String>,
    /// Present for asset transfers.
    #[serde(default)]
    pub asset_transfer_transaction: Option<AssetTransfer>,
}

/// Asset transfer details.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AssetTransfer {
    /// Transferred asset.
    pub asset_id: u64,
    /// Receiving address.
    #[serde(default)]
    pub receiver: Option<String>,
    /// Amount in base units.
    #[serde(default)]
    pub amount: Option<u64>,
}

/// HTTP client of one indexer.
#[derive(Clone, Debug)]
pub struct IndexerClient {
    base_url: Url,
    client: Client,
    api_token: Option<String>,
    timeout: Option<Duration>,
}

impl IndexerClient {
    /// Creates a client for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::CannotBeABase`] for URLs such as `mailto:`.
    pub fn try_new(base_url: Url) -> Result<Self, IndexerError> {
        if base_url.cannot_be_a_base() {
            return Err(IndexerError::CannotBeABase(base_url));
        }
        Ok(Self {
            base_url,
            client: Client::new(),
            api_token: None,
            timeout: None,
        })
    }

    /// Sends `token` as `X-API-Key` with every request.
    #[must_use]
    pub fn with_api_token(mut self, token: Option<String>) -> Self {
        self.api_token = token.filter(|t| !t.trim().is_empty());
        self
    }

    /// Caps every request at `timeout`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns the base URL used by this client.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Returns the configured timeout, if any.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn transaction_url(&self, txid: &str) -> Result<Url, IndexerError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| IndexerError::CannotBeABase(self.base_url.clone()))?
            .pop_if_empty()
            .extend(["v2", "transactions", txid]);
        Ok(url)
    }

    /// Fetches one transaction by id.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError`] on transport failure, timeout, a non-200 status
    /// or an undecodable body.
    #[instrument(name = "x402.algorand.transaction", skip(self), err)]
    pub async fn transaction(&self, txid: &str) -> Result<TransactionResponse, IndexerError> {
        let context = "GET /v2/transactions";
        let mut req = self.client.get(self.transaction_url(txid)?);
        if let Some(token) = &self.api_token {
            req = req.header(API_KEY_HEADER, token);
        }
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }
        let http_response = req
            .send()
            .await
            .map_err(|e| IndexerError::Http { context, source: e })?;

        if http_response.status() == StatusCode::OK {
            http_response
                .json::<TransactionResponse>()
                .await
                .map_err(|e| IndexerError::JsonDeserialization { context, source: e })
        } else {
            let status = http_response.status();
            let body = http_response
                .text()
                .await
                .map_err(|e| IndexerError::ResponseBodyRead { context, source: e })?;
            Err(IndexerError::HttpStatus {
                context,
                status,
                body,
            })
        }
    }
}

/// Parses a base URL and builds a client from it.
impl TryFrom<&str> for IndexerClient {
    type Error = IndexerError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let url = Url::parse(value.trim()).map_err(|e| IndexerError::UrlParse {
            context: "Failed to parse indexer url",
            source: e,
        })?;
        Self::try_new(url)
    }
}
