//! Recurring free-tier grant job.

use crate::models::{Plan, PlanCatalog};
use crate::services::error::CreditError;
use crate::services::grants::{apply_grant, grant_cycle, has_cycle_elapsed};
use crate::services::metrics::record_credits_granted;
use crate::services::reconciler::ERROR_SAMPLE_LIMIT;
use crate::services::store::{run_transaction, LedgerRepository, Snapshot, TxnScope, Write};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;

const PAGE_SIZE: i64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantOutcome {
    /// Credits were added.
    Granted(i64),
    /// Cycle elapsed but the balance was already at or above the cap; only
    /// the cursor moved.
    CursorRefreshed,
    /// Not due, not free tier, or no ledger.
    NotDue,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantReport {
    pub processed: u64,
    pub granted: u64,
    pub unchanged: u64,
    pub failed: u64,
    pub error_sample: Vec<String>,
}

#[derive(Clone)]
pub struct MonthlyGrantJob {
    repository: Arc<dyn LedgerRepository>,
    plans: PlanCatalog,
}

impl MonthlyGrantJob {
    pub fn new(repository: Arc<dyn LedgerRepository>, plans: PlanCatalog) -> Self {
        Self { repository, plans }
    }

    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<GrantReport, CreditError> {
        let now = Utc::now();
        let cutoff = now - grant_cycle();
        let mut report = GrantReport::default();
        let mut after: Option<String> = None;

        loop {
            let page = self
                .repository
                .grant_candidates(cutoff, after.as_deref(), PAGE_SIZE)
                .await?;
            if page.is_empty() {
                break;
            }
            after = page.last().cloned();

            for uid in &page {
                report.processed += 1;
                match self.grant_user(uid, now).await {
                    Ok(GrantOutcome::Granted(_)) => report.granted += 1,
                    Ok(_) => report.unchanged += 1,
                    Err(e) => {
                        report.failed += 1;
                        tracing::warn!(uid = %uid, error = %e, "Recurring grant failed");
                        if report.error_sample.len() < ERROR_SAMPLE_LIMIT {
                            report.error_sample.push(format!("{}: {}", uid, e));
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
            granted = report.granted,
            unchanged = report.unchanged,
            failed = report.failed,
            "Recurring grant job finished"
        );
        Ok(report)
    }

    /// Apply one recurring grant if the user is still due.
    pub async fn grant_user(&self, uid: &str, now: DateTime<Utc>) -> Result<GrantOutcome, CreditError> {
        let free = self.plans.config_for(Plan::Free);
        let outcome = run_transaction(
            self.repository.as_ref(),
            &TxnScope::user(uid),
            |snapshot: &Snapshot| {
                let Some(current) = snapshot.ledger.ready() else {
                    return Ok((Vec::new(), GrantOutcome::NotDue));
                };
                if current.plan != Plan::Free || !has_cycle_elapsed(current.last_monthly_grant, now)
                {
                    return Ok((Vec::new(), GrantOutcome::NotDue));
                }

                let mut ledger = current.clone();
                ledger.credits = apply_grant(current.credits, &free);
                ledger.last_monthly_grant = now;

                let added = ledger.credits - current.credits;
                let outcome = if added > 0 {
                    GrantOutcome::Granted(added)
                } else {
                    GrantOutcome::CursorRefreshed
                };
                Ok((vec![Write::PutLedger(ledger)], outcome))
            },
        )
        .await?;

        if let GrantOutcome::Granted(added) = outcome {
            record_credits_granted("monthly", added);
            tracing::debug!(uid = %uid, added, "Recurring grant applied");
        }
        Ok(outcome)
    }
}
