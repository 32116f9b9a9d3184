//! Purchase validation against the billing oracle.
//!
//! The oracle is always consulted before a transaction opens, never inside
//! one.

use crate::models::{
    Plan, PlanCatalog, ProcessedTransaction, ProductCatalog, SubscriptionRecord,
    SubscriptionStatus,
};
use crate::services::billing::{BillingOracle, Entitlement, SubscriberInfo};
use crate::services::error::CreditError;
use crate::services::grants::apply_capped_bonus;
use crate::services::metrics::{record_credits_granted, record_purchase};
use crate::services::retry::{retry_bounded, RetryPolicy};
use crate::services::store::{run_transaction, LedgerRepository, Snapshot, TxnScope, Write};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Purchase,
    Restore,
}

impl SubscriptionEvent {
    fn as_str(&self) -> &'static str {
        match self {
            SubscriptionEvent::Purchase => "subscription_purchase",
            SubscriptionEvent::Restore => "subscription_restore",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TopUpOutcome {
    pub credits_added: i64,
    pub new_balance: i64,
}

#[derive(Debug, Clone)]
pub struct SubscriptionOutcome {
    pub plan: Plan,
    pub credits_granted: i64,
    pub expires_date: DateTime<Utc>,
}

#[derive(Clone)]
pub struct PurchaseSettings {
    pub plans: PlanCatalog,
    pub products: ProductCatalog,
    pub subscription_bonus_credits: i64,
    pub entitlement: String,
    pub verify: RetryPolicy,
}

#[derive(Clone)]
pub struct PurchaseValidator {
    repository: Arc<dyn LedgerRepository>,
    oracle: Arc<dyn BillingOracle>,
    settings: PurchaseSettings,
}

impl PurchaseValidator {
    pub fn new(
        repository: Arc<dyn LedgerRepository>,
        oracle: Arc<dyn BillingOracle>,
        settings: PurchaseSettings,
    ) -> Self {
        Self {
            repository,
            oracle,
            settings,
        }
    }

    /// Credit a one-time top-up once the oracle confirms it.
    #[instrument(skip(self))]
    pub async fn validate_and_grant(
        &self,
        uid: &str,
        product_id: &str,
        transaction_id: &str,
    ) -> Result<TopUpOutcome, CreditError> {
        let result = self.grant_topup(uid, product_id, transaction_id).await;
        record_purchase("topup", outcome_label(&result));
        result
    }

    async fn grant_topup(
        &self,
        uid: &str,
        product_id: &str,
        transaction_id: &str,
    ) -> Result<TopUpOutcome, CreditError> {
        let amount = self
            .settings
            .products
            .topup_credits(product_id)
            .ok_or_else(|| {
                CreditError::InvalidArgument(format!("unknown top-up product '{}'", product_id))
            })?;
        if transaction_id.trim().is_empty() {
            return Err(CreditError::InvalidArgument(
                "transactionId is required".to_string(),
            ));
        }

        // Cheap rejection of replays before calling the oracle. The
        // transaction below re-checks.
        if self
            .repository
            .get_processed_transaction(transaction_id)
            .await?
            .is_some()
        {
            tracing::info!(uid = %uid, transaction_id = %transaction_id, "Top-up replay rejected");
            return Err(CreditError::AlreadyProcessed);
        }

        self.verify_topup(uid, product_id, transaction_id).await?;

        let now = Utc::now();
        let record = ProcessedTransaction {
            transaction_id: transaction_id.to_string(),
            uid: uid.to_string(),
            product_id: product_id.to_string(),
            credits_granted: amount,
            processed_at: now,
        };

        let new_balance = run_transaction(
            self.repository.as_ref(),
            &TxnScope::with_transaction(uid, transaction_id),
            |snapshot: &Snapshot| {
                if snapshot.processed_transaction.is_some() {
                    return Err(CreditError::AlreadyProcessed);
                }
                let mut ledger = snapshot.ledger.ready().cloned().ok_or(CreditError::NotFound)?;
                ledger.credits += amount;
                let balance = ledger.credits;
                Ok((
                    vec![
                        Write::PutLedger(ledger),
                        Write::InsertProcessedTransaction(record.clone()),
                    ],
                    balance,
                ))
            },
        )
        .await?;

        record_credits_granted("topup", amount);
        tracing::info!(
            uid = %uid,
            product_id = %product_id,
            transaction_id = %transaction_id,
            amount,
            new_balance,
            "Top-up credited"
        );

        Ok(TopUpOutcome {
            credits_added: amount,
            new_balance,
        })
    }

    /// Poll the oracle until the purchase shows up or attempts run out.
    async fn verify_topup(
        &self,
        uid: &str,
        product_id: &str,
        transaction_id: &str,
    ) -> Result<(), CreditError> {
        retry_bounded(self.settings.verify, || async {
            match self.oracle.subscriber(uid).await {
                Ok(Some(info)) if info.has_non_subscription(product_id, transaction_id) => Ok(()),
                Ok(_) => {
                    tracing::debug!(uid = %uid, transaction_id = %transaction_id, "Purchase not visible yet");
                    Err(backoff::Error::transient(CreditError::VerificationFailed))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
        .map_err(|e| {
            tracing::warn!(uid = %uid, transaction_id = %transaction_id, error = %e, "Top-up verification failed");
            e
        })
    }

    /// Sync a subscription from the oracle. A purchase grants the bonus,
    /// a restore never grants credits.
    #[instrument(skip(self))]
    pub async fn validate_subscription(
        &self,
        uid: &str,
        product_id: &str,
        event: SubscriptionEvent,
    ) -> Result<SubscriptionOutcome, CreditError> {
        let result = self.sync_subscription(uid, product_id, event).await;
        record_purchase(event.as_str(), outcome_label(&result));
        result
    }

    async fn sync_subscription(
        &self,
        uid: &str,
        product_id: &str,
        event: SubscriptionEvent,
    ) -> Result<SubscriptionOutcome, CreditError> {
        let plan = self
            .settings
            .products
            .subscription_plan(product_id)
            .ok_or_else(|| {
                CreditError::InvalidArgument(format!(
                    "unknown subscription product '{}'",
                    product_id
                ))
            })?;

        let (info, entitlement) = self.live_entitlement(uid, event).await?;
        let now = Utc::now();
        let expires_date = match entitlement.expires_date {
            Some(expires) if expires > now => expires,
            Some(_) => return Err(CreditError::SubscriptionExpired),
            None => return Err(CreditError::NoActiveSubscription),
        };

        if let Some(entitled_product) = entitlement.product_identifier.as_deref() {
            if entitled_product != product_id {
                tracing::warn!(
                    uid = %uid,
                    requested = %product_id,
                    entitled = %entitled_product,
                    "Entitlement product differs from requested product"
                );
            }
        }

        let cfg = self.settings.plans.config_for(plan);
        let bonus = self.settings.subscription_bonus_credits;
        let original_transaction_id = info.original_transaction_id(product_id);

        let credits_granted = run_transaction(
            self.repository.as_ref(),
            &TxnScope::user(uid),
            |snapshot: &Snapshot| {
                let mut ledger = snapshot.ledger.ready().cloned().ok_or(CreditError::NotFound)?;
                let previous = snapshot.subscription.as_ref();

                let replayed =
                    is_replayed_period(previous, &entitlement, original_transaction_id.as_deref());
                let purchase_date = entitlement
                    .purchase_date
                    .or_else(|| previous.filter(|_| replayed).map(|r| r.purchase_date))
                    .unwrap_or(now);

                ledger.plan = plan;
                ledger.max_credits = cfg.max_credits;

                let before = ledger.credits;
                if event == SubscriptionEvent::Purchase && !replayed {
                    ledger.credits = apply_capped_bonus(ledger.credits, bonus, cfg.max_credits);
                }
                let granted = ledger.credits - before;

                let record = SubscriptionRecord {
                    uid: uid.to_string(),
                    plan,
                    product_id: product_id.to_string(),
                    purchase_date,
                    expires_date,
                    original_transaction_id: original_transaction_id
                        .clone()
                        .or_else(|| previous.and_then(|r| r.original_transaction_id.clone())),
                    last_credit_grant: if granted > 0 {
                        Some(now)
                    } else {
                        previous.and_then(|r| r.last_credit_grant)
                    },
                    status: SubscriptionStatus::Active,
                    updated_at: now,
                };

                Ok((
                    vec![Write::PutLedger(ledger), Write::PutSubscription(record)],
                    granted,
                ))
            },
        )
        .await?;

        record_credits_granted("subscription_bonus", credits_granted);
        tracing::info!(
            uid = %uid,
            product_id = %product_id,
            plan = %plan,
            event = event.as_str(),
            credits_granted,
            "Subscription synced"
        );

        Ok(SubscriptionOutcome {
            plan,
            credits_granted,
            expires_date,
        })
    }

    /// Look up the tracked entitlement. A fresh purchase may not be visible
    /// yet, so purchases poll; restores ask once.
    async fn live_entitlement(
        &self,
        uid: &str,
        event: SubscriptionEvent,
    ) -> Result<(SubscriberInfo, Entitlement), CreditError> {
        let entitlement_name = self.settings.entitlement.as_str();
        let policy = match event {
            SubscriptionEvent::Purchase => self.settings.verify,
            SubscriptionEvent::Restore => RetryPolicy::new(1, Duration::from_millis(1)),
        };

        retry_bounded(policy, || async {
            match self.oracle.subscriber(uid).await {
                Ok(Some(info)) => match info.entitlement(entitlement_name).cloned() {
                    Some(entitlement) => Ok((info, entitlement)),
                    None => Err(backoff::Error::transient(CreditError::NoActiveSubscription)),
                },
                Ok(None) => Err(backoff::Error::transient(CreditError::NoActiveSubscription)),
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }
}

/// Whether `entitlement` describes the billing period already recorded in
/// `previous`. Without a purchase date the period is identified by its expiry
/// or the store's original transaction id.
fn is_replayed_period(
    previous: Option<&SubscriptionRecord>,
    entitlement: &Entitlement,
    original_transaction_id: Option<&str>,
) -> bool {
    let Some(record) = previous.filter(|r| r.is_active()) else {
        return false;
    };
    match entitlement.purchase_date {
        Some(purchased) => {
            record.purchase_date.timestamp_millis() == purchased.timestamp_millis()
        }
        None => {
            let same_expiry = entitlement
                .expires_date
                .is_some_and(|e| e.timestamp_millis() == record.expires_date.timestamp_millis());
            let same_original = matches!(
                (original_transaction_id, record.original_transaction_id.as_deref()),
                (Some(live), Some(stored)) if live == stored
            );
            same_expiry || same_original
        }
    }
}

fn outcome_label<T>(result: &Result<T, CreditError>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(e) => e.code(),
    }
}
