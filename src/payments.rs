//! Applies completed checkouts to the ledger.
//!
//! A checkout session is credited at most once: the session id is the
//! purchase entry's external reference, checked before crediting and backed by
//! the unique index on `(kind, external_ref)`.

use metrics::counter;
use thiserror::Error;
use tracing::{info, warn};

use crate::ledger::{EntryRequest, Ledger, LedgerError};
use crate::models::LedgerEntryKind;
use crate::packages::find_package;
use crate::webhook_verification::CheckoutCompleted;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("unknown credit package '{0}'")]
    UnknownPackage(String),

    #[error("package '{package_id}' grants {expected} credits, checkout claims {claimed}")]
    CreditAmountMismatch {
        package_id: String,
        expected: i64,
        claimed: i64,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Credited { balance: i64 },
    /// The session was credited by an earlier delivery
    AlreadyApplied,
}

#[derive(Clone)]
pub struct PaymentProcessor {
    ledger: Ledger,
}

impl PaymentProcessor {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    pub async fn apply_checkout(
        &self,
        checkout: &CheckoutCompleted,
    ) -> Result<PaymentOutcome, PaymentError> {
        let package = find_package(&checkout.package_id)
            .ok_or_else(|| PaymentError::UnknownPackage(checkout.package_id.clone()))?;

        if package.credits != checkout.credit_amount {
            warn!(
                session_id = %checkout.session_id,
                package_id = %package.id,
                claimed = checkout.credit_amount,
                "Checkout credit amount does not match package"
            );
            return Err(PaymentError::CreditAmountMismatch {
                package_id: package.id.to_string(),
                expected: package.credits,
                claimed: checkout.credit_amount,
            });
        }

        if self
            .ledger
            .has_entry(LedgerEntryKind::Purchase, &checkout.session_id)
            .await?
        {
            info!(session_id = %checkout.session_id, "Checkout already credited");
            return Ok(PaymentOutcome::AlreadyApplied);
        }

        let mut request = EntryRequest::new(
            checkout.account_id,
            package.credits,
            LedgerEntryKind::Purchase,
            format!("Purchased {} package ({} credits)", package.name, package.credits),
        )
        .with_external_ref(checkout.session_id.clone());
        if let Some(amount) = checkout.amount_total {
            request = request.with_amount_cents(amount);
        }

        match self.ledger.credit(request).await {
            Ok(balance) => {
                counter!("payments_credited_total", "package" => package.id).increment(1);
                Ok(PaymentOutcome::Credited { balance })
            }
            // Concurrent delivery of the same session won the insert
            Err(LedgerError::DuplicateEntry { .. }) => Ok(PaymentOutcome::AlreadyApplied),
            Err(e) => Err(e.into()),
        }
    }
}
