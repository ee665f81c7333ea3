//! Durable receipt records.
//!
//! A receipt is created `pending` when a challenge is issued and moves exactly
//! once to `confirmed` or `rejected`. Stores implement that transition as a
//! compare-and-swap on the pending status; [`ReceiptRecord::finalize`] is the
//! in-memory half of it.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::pricing::TenantId;
use crate::timestamp::UnixTimestamp;

/// Free-form JSON metadata attached to receipts and ledger rows.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Lifecycle status of a receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    /// Challenge issued, no accepted receipt yet.
    Pending,
    /// Payment verified and accepted.
    Confirmed,
    /// Payment presented and refused.
    Rejected,
}

impl ReceiptStatus {
    /// Returns the `snake_case` name used in storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
        }
    }

    /// `true` for `confirmed` and `rejected`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl Display for ReceiptStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReceiptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown receipt status {other:?}")),
        }
    }
}

/// Persistent lifecycle record of one nonce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptRecord {
    /// Unique challenge nonce.
    pub nonce: String,
    /// Current status.
    pub status: ReceiptStatus,
    /// Required price while pending, confirmed amount afterwards.
    pub amount: Decimal,
    /// Currency code, e.g. `USDC`.
    pub currency: String,
    /// Settlement network, e.g. `algorand`.
    pub network: String,
    /// Payer address reported by the verifier.
    pub payer: Option<String>,
    /// Raw receipt token as presented by the client.
    pub receipt_token: Option<String>,
    /// Tenant owning the matched rule, else the authenticated caller.
    pub owner: Option<TenantId>,
    /// Normalized path the challenge was issued for.
    pub request_path: String,
    /// Upper-case method the challenge was issued for.
    pub request_method: String,
    /// Audit trail: challenge snapshot, request details, verifier output.
    pub metadata: Metadata,
    /// When the challenge was issued.
    pub created_at: UnixTimestamp,
    /// When the receipt reached a terminal status.
    pub verified_at: Option<UnixTimestamp>,
    /// Whether post-confirmation bookkeeping has run successfully.
    pub ledger_applied: bool,
}

/// Fields supplied when a challenge creates its pending receipt.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiptDraft {
    /// Challenge nonce.
    pub nonce: String,
    /// Required price.
    pub amount: Decimal,
    /// Currency code.
    pub currency: String,
    /// Settlement network.
    pub network: String,
    /// Associated tenant.
    pub owner: Option<TenantId>,
    /// Normalized request path.
    pub request_path: String,
    /// Upper-case request method.
    pub request_method: String,
    /// Initial metadata (challenge snapshot and request details).
    pub metadata: Metadata,
}

impl ReceiptDraft {
    /// Materializes the draft as a fresh pending record.
    #[must_use]
    pub fn into_record(self, now: UnixTimestamp) -> ReceiptRecord {
        ReceiptRecord {
            nonce: self.nonce,
            status: ReceiptStatus::Pending,
            amount: self.amount,
            currency: self.currency,
            network: self.network,
            payer: None,
            receipt_token: None,
            owner: self.owner,
            request_path: self.request_path,
            request_method: self.request_method,
            metadata: self.metadata,
            created_at: now,
            verified_at: None,
            ledger_applied: false,
        }
    }
}

/// Terminal transition requested for a pending receipt.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiptOutcome {
    /// Payment accepted.
    Confirmed {
        /// Confirmed amount, quantized.
        amount: Decimal,
        /// Payer address if the ledger reports one.
        payer: Option<String>,
        /// Token the client presented.
        receipt_token: String,
        /// Verifier metadata merged into the receipt's metadata.
        metadata: Metadata,
    },
    /// Payment refused.
    Rejected {
        /// Machine-readable reason, stored as `rejection_reason`.
        reason: String,
        /// Token the client presented, if any.
        receipt_token: Option<String>,
        /// Extra details merged into the receipt's metadata.
        metadata: Metadata,
    },
}

impl ReceiptOutcome {
    /// Status this outcome transitions to.
    #[must_use]
    pub const fn status(&self) -> ReceiptStatus {
        match self {
            Self::Confirmed { .. } => ReceiptStatus::Confirmed,
            Self::Rejected { .. } => ReceiptStatus::Rejected,
        }
    }
}

impl ReceiptRecord {
    /// Applies `outcome` if the record is still pending.
    ///
    /// Returns `false` and leaves the record untouched when it is already
    /// terminal.
    pub fn finalize(&mut self, outcome: ReceiptOutcome, now: UnixTimestamp) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = outcome.status();
        self.verified_at = Some(now);
        match outcome {
            ReceiptOutcome::Confirmed {
                amount,
                payer,
                receipt_token,
                metadata,
            } => {
                self.amount = amount;
                if payer.is_some() {
                    self.payer = payer;
                }
                self.receipt_token = Some(receipt_token);
                self.metadata.extend(metadata);
            }
            ReceiptOutcome::Rejected {
                reason,
                receipt_token,
                metadata,
            } => {
                if receipt_token.is_some() {
                    self.receipt_token = receipt_token;
                }
                self.metadata.extend(metadata);
                self.metadata
                    .insert("rejection_reason".to_owned(), reason.into());
            }
        }
        true
    }

    /// `METHOD path` the receipt is bound to.
    #[must_use]
    pub fn binding(&self) -> String {
        format!("{} {}", self.request_method, self.request_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> ReceiptRecord {
        ReceiptDraft {
            nonce: "n1".into(),
            amount: Decimal::ONE,
            currency: "USDC".into(),
            network: "algorand".into(),
            owner: None,
            request_path: "/paid".into(),
            request_method: "GET".into(),
            metadata: Metadata::new(),
        }
        .into_record(UnixTimestamp::from_secs(10))
    }

    #[test]
    fn test_finalize_only_once() {
        let mut record = pending();
        let confirmed = ReceiptOutcome::Confirmed {
            amount: Decimal::ONE,
            payer: Some("PAYER".into()),
            receipt_token: "tok".into(),
            metadata: Metadata::new(),
        };
        assert!(record.finalize(confirmed, UnixTimestamp::from_secs(11)));
        assert_eq!(record.status, ReceiptStatus::Confirmed);

        let rejected = ReceiptOutcome::Rejected {
            reason: "late".into(),
            receipt_token: None,
            metadata: Metadata::new(),
        };
        assert!(!record.finalize(rejected, UnixTimestamp::from_secs(12)));
        assert_eq!(record.status, ReceiptStatus::Confirmed);
        assert_eq!(record.verified_at, Some(UnixTimestamp::from_secs(11)));
        assert!(!record.metadata.contains_key("rejection_reason"));
    }

    #[test]
    fn test_rejection_records_reason() {
        let mut record = pending();
        let rejected = ReceiptOutcome::Rejected {
            reason: "amount_below_required".into(),
            receipt_token: Some("tok".into()),
            metadata: Metadata::new(),
        };
        assert!(record.finalize(rejected, UnixTimestamp::from_secs(11)));
        assert_eq!(record.status, ReceiptStatus::Rejected);
        assert_eq!(
            record.metadata["rejection_reason"],
            serde_json::json!("amount_below_required")
        );
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            ReceiptStatus::Pending,
            ReceiptStatus::Confirmed,
            ReceiptStatus::Rejected,
        ] {
            assert_eq!(status.as_str().parse::<ReceiptStatus>(), Ok(status));
        }
    }
}
