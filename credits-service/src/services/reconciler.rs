//! Scheduled subscription reconciliation.
//!
//! Active subscriptions whose expiry has passed are checked against the
//! billing oracle and either renewed (with a recurring grant) or expired
//! (downgraded to free).

use crate::models::{LedgerState, Plan, PlanCatalog, SubscriptionRecord, SubscriptionStatus};
use crate::services::billing::BillingOracle;
use crate::services::error::CreditError;
use crate::services::grants::apply_grant;
use crate::services::metrics::record_credits_granted;
use crate::services::store::{run_transaction, LedgerRepository, Snapshot, TxnScope, Write};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;

pub const ERROR_SAMPLE_LIMIT: usize = 10;
const PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    Renewed { credits_granted: i64 },
    Expired,
    /// Someone else already moved the record on.
    Skipped,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub processed: u64,
    pub renewed: u64,
    pub expired: u64,
    pub skipped: u64,
    pub failed: u64,
    pub error_sample: Vec<String>,
}

#[derive(Clone)]
pub struct SubscriptionReconciler {
    repository: Arc<dyn LedgerRepository>,
    oracle: Arc<dyn BillingOracle>,
    plans: PlanCatalog,
    entitlement: String,
}

impl SubscriptionReconciler {
    pub fn new(
        repository: Arc<dyn LedgerRepository>,
        oracle: Arc<dyn BillingOracle>,
        plans: PlanCatalog,
        entitlement: String,
    ) -> Self {
        Self {
            repository,
            oracle,
            plans,
            entitlement,
        }
    }

    /// Reconcile every due subscription. Per-subscription failures are
    /// counted; only a failure to list subscriptions fails the run.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<ReconcileReport, CreditError> {
        let now = Utc::now();
        let mut report = ReconcileReport::default();
        let mut after: Option<String> = None;

        loop {
            let page = self
                .repository
                .due_subscriptions(now, after.as_deref(), PAGE_SIZE)
                .await?;
            if page.is_empty() {
                break;
            }
            after = page.last().map(|record| record.uid.clone());

            for record in &page {
                report.processed += 1;
                match self.reconcile_one(record).await {
                    Ok(ReconcileAction::Renewed { .. }) => report.renewed += 1,
                    Ok(ReconcileAction::Expired) => report.expired += 1,
                    Ok(ReconcileAction::Skipped) => report.skipped += 1,
                    Err(e) => {
                        report.failed += 1;
                        tracing::warn!(uid = %record.uid, error = %e, "Subscription reconciliation failed");
                        if report.error_sample.len() < ERROR_SAMPLE_LIMIT {
                            report.error_sample.push(format!("{}: {}", record.uid, e));
                        }
                    }
                }
            }

            if (page.len() as i64) < PAGE_SIZE {
                break;
            }
        }

        tracing::info!(
            processed = report.processed,
            renewed = report.renewed,
            expired = report.expired,
            skipped = report.skipped,
            failed = report.failed,
            "Subscription reconciliation finished"
        );
        Ok(report)
    }

    async fn reconcile_one(&self, record: &SubscriptionRecord) -> Result<ReconcileAction, CreditError> {
        let live = self
            .oracle
            .subscriber(&record.uid)
            .await?
            .and_then(|info| info.entitlement(&self.entitlement).cloned());

        let now = Utc::now();
        match live.as_ref().and_then(|e| e.expires_date.map(|expires| (expires, e.purchase_date))) {
            Some((expires, purchase_date)) if expires > now => {
                self.renew(&record.uid, expires, purchase_date, now).await
            }
            _ => self.expire(&record.uid, now).await,
        }
    }

    /// Extend the period to the oracle's expiry. The renewal's purchase date
    /// becomes the record's, so a later purchase call for the same period is
    /// recognised as a replay.
    async fn renew(
        &self,
        uid: &str,
        expires: DateTime<Utc>,
        purchase_date: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<ReconcileAction, CreditError> {
        let plans = &self.plans;
        let action = run_transaction(
            self.repository.as_ref(),
            &TxnScope::user(uid),
            |snapshot: &Snapshot| {
                let Some(mut subscription) = snapshot.subscription.clone() else {
                    return Ok((Vec::new(), ReconcileAction::Skipped));
                };
                if !subscription.is_active() || subscription.expires_date > now {
                    return Ok((Vec::new(), ReconcileAction::Skipped));
                }
                let mut ledger = snapshot.ledger.ready().cloned().ok_or(CreditError::NotFound)?;

                let cfg = plans.config_for(subscription.plan);
                let before = ledger.credits;
                ledger.plan = subscription.plan;
                ledger.max_credits = cfg.max_credits;
                ledger.credits = apply_grant(ledger.credits, &cfg);

                subscription.expires_date = expires;
                if let Some(purchased) = purchase_date {
                    subscription.purchase_date = purchased;
                }
                subscription.last_credit_grant = Some(now);
                subscription.updated_at = now;

                let granted = ledger.credits - before;
                Ok((
                    vec![Write::PutLedger(ledger), Write::PutSubscription(subscription)],
                    ReconcileAction::Renewed {
                        credits_granted: granted,
                    },
                ))
            },
        )
        .await?;

        if let ReconcileAction::Renewed { credits_granted } = action {
            record_credits_granted("renewal", credits_granted);
            tracing::info!(uid = %uid, %expires, credits_granted, "Subscription renewed");
        }
        Ok(action)
    }

    async fn expire(&self, uid: &str, now: DateTime<Utc>) -> Result<ReconcileAction, CreditError> {
        let free = self.plans.config_for(Plan::Free);
        let action = run_transaction(
            self.repository.as_ref(),
            &TxnScope::user(uid),
            |snapshot: &Snapshot| {
                let Some(mut subscription) = snapshot.subscription.clone() else {
                    return Ok((Vec::new(), ReconcileAction::Skipped));
                };
                if !subscription.is_active() || subscription.expires_date > now {
                    return Ok((Vec::new(), ReconcileAction::Skipped));
                }

                subscription.status = SubscriptionStatus::Expired;
                subscription.updated_at = now;
                let mut writes = vec![Write::PutSubscription(subscription)];

                // The balance is left alone; future grants cap it naturally.
                if let LedgerState::Ready(current) = &snapshot.ledger {
                    let mut ledger = current.clone();
                    ledger.plan = Plan::Free;
                    ledger.max_credits = free.max_credits;
                    writes.push(Write::PutLedger(ledger));
                }

                Ok((writes, ReconcileAction::Expired))
            },
        )
        .await?;

        if action == ReconcileAction::Expired {
            tracing::info!(uid = %uid, "Subscription expired, downgraded to free");
        }
        Ok(action)
    }
}
