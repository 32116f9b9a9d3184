//! Make sure every identity has a ledger.

use crate::models::PlanCatalog;
use crate::services::error::CreditError;
use crate::services::identity::IdentityDirectory;
use crate::services::ledger::{provision_ledger, Provisioned};
use crate::services::metrics::record_credits_granted;
use crate::services::reconciler::ERROR_SAMPLE_LIMIT;
use crate::services::store::{run_transaction, LedgerRepository, Snapshot, TxnScope};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;

const BACKFILL_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillReport {
    pub created: u64,
    pub skipped: u64,
    pub errors: u64,
    pub error_sample: Vec<String>,
}

#[derive(Clone)]
pub struct Bootstrapper {
    repository: Arc<dyn LedgerRepository>,
    identities: Arc<dyn IdentityDirectory>,
    plans: PlanCatalog,
}

impl Bootstrapper {
    pub fn new(
        repository: Arc<dyn LedgerRepository>,
        identities: Arc<dyn IdentityDirectory>,
        plans: PlanCatalog,
    ) -> Self {
        Self {
            repository,
            identities,
            plans,
        }
    }

    /// Create or complete the ledger for `uid`. Existing ledgers are not
    /// touched.
    pub async fn ensure_ledger(&self, uid: &str) -> Result<Provisioned, CreditError> {
        if uid.trim().is_empty() {
            return Err(CreditError::InvalidArgument("uid is required".to_string()));
        }
        let now = Utc::now();
        let plans = &self.plans;
        let (provisioned, ledger) = run_transaction(
            self.repository.as_ref(),
            &TxnScope::user(uid),
            |snapshot: &Snapshot| Ok(provision_ledger(snapshot, plans, now)),
        )
        .await?;

        if provisioned != Provisioned::Existing {
            record_credits_granted("initial", ledger.credits);
        }
        Ok(provisioned)
    }

    /// Hook for identity creation. Never fails: a ledger problem must not
    /// block sign-up, and the client or the backfill will create it later.
    #[instrument(skip(self))]
    pub async fn on_identity_created(&self, uid: &str) {
        match self.ensure_ledger(uid).await {
            Ok(provisioned) => {
                tracing::info!(uid = %uid, ?provisioned, "Ledger bootstrap done");
            }
            Err(e) => {
                tracing::error!(uid = %uid, error = %e, "Ledger bootstrap failed, ignoring");
            }
        }
    }

    /// Walk every identity and ensure it has a ledger. Safe to re-run.
    #[instrument(skip(self))]
    pub async fn backfill_all(&self) -> Result<BackfillReport, CreditError> {
        let mut report = BackfillReport::default();
        let mut page_token: Option<String> = None;

        loop {
            let page = self
                .identities
                .list_identities(page_token.as_deref(), BACKFILL_PAGE_SIZE)
                .await?;

            for uid in &page.uids {
                match self.ensure_ledger(uid).await {
                    Ok(Provisioned::Existing) => report.skipped += 1,
                    Ok(_) => report.created += 1,
                    Err(e) => {
                        report.errors += 1;
                        tracing::warn!(uid = %uid, error = %e, "Backfill failed for identity");
                        if report.error_sample.len() < ERROR_SAMPLE_LIMIT {
                            report.error_sample.push(format!("{}: {}", uid, e));
                        }
                    }
                }
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        tracing::info!(
            created = report.created,
            skipped = report.skipped,
            errors = report.errors,
            "Ledger backfill finished"
        );
        Ok(report)
    }
}
