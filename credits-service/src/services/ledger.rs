use crate::models::{LedgerState, Plan, PlanCatalog, UserLedger};
use crate::services::error::CreditError;
use crate::services::grants::apply_grant;
use crate::services::metrics::{record_credits_consumed, record_credits_granted};
use crate::services::store::{run_transaction, LedgerRepository, Snapshot, TxnScope, Write};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::instrument;

pub const MIN_CONSUME_AMOUNT: i64 = 1;
pub const MAX_CONSUME_AMOUNT: i64 = 10;

/// How a provisioning transaction found the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    /// No document existed; a free-tier ledger was created.
    Created,
    /// A profile-only document existed; ledger fields were merged into it.
    Merged,
    /// A complete ledger was already there. Nothing was written.
    Existing,
}

#[derive(Debug, Clone)]
pub struct InitializeOutcome {
    pub already_initialized: bool,
    pub ledger: UserLedger,
}

/// Free-tier ledger provisioning shared by client initialisation and the
/// identity bootstrap.
pub fn provision_ledger(
    snapshot: &Snapshot,
    plans: &PlanCatalog,
    now: DateTime<Utc>,
) -> (Vec<Write>, (Provisioned, UserLedger)) {
    let free = plans.config_for(Plan::Free);
    let fresh = |created_at: DateTime<Utc>| {
        let mut ledger = UserLedger::new_free(apply_grant(0, &free), free.max_credits, now);
        ledger.created_at = created_at;
        ledger
    };

    match &snapshot.ledger {
        LedgerState::Ready(existing) => (Vec::new(), (Provisioned::Existing, existing.clone())),
        LedgerState::Missing => {
            let ledger = fresh(now);
            (
                vec![Write::PutLedger(ledger.clone())],
                (Provisioned::Created, ledger),
            )
        }
        LedgerState::Incomplete {
            created_at,
            credits,
        } => {
            let mut ledger = fresh(created_at.unwrap_or(now));
            if let Some(existing) = credits {
                ledger.credits = (*existing).max(0);
            }
            (
                vec![Write::PutLedger(ledger.clone())],
                (Provisioned::Merged, ledger),
            )
        }
    }
}

/// Client-facing ledger reads and writes.
#[derive(Clone)]
pub struct LedgerService {
    repository: Arc<dyn LedgerRepository>,
    plans: PlanCatalog,
}

impl LedgerService {
    pub fn new(repository: Arc<dyn LedgerRepository>, plans: PlanCatalog) -> Self {
        Self { repository, plans }
    }

    #[instrument(skip(self))]
    pub async fn initialize_credits(&self, uid: &str) -> Result<InitializeOutcome, CreditError> {
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
            tracing::info!(uid = %uid, credits = ledger.credits, ?provisioned, "Ledger initialized");
        }

        Ok(InitializeOutcome {
            already_initialized: provisioned == Provisioned::Existing,
            ledger,
        })
    }

    #[instrument(skip(self))]
    pub async fn get_credits(&self, uid: &str) -> Result<UserLedger, CreditError> {
        match self.repository.get_ledger(uid).await? {
            LedgerState::Ready(ledger) => Ok(ledger),
            _ => Err(CreditError::NotFound),
        }
    }

    /// Deduct `amount` credits. Returns the remaining balance.
    #[instrument(skip(self))]
    pub async fn consume_credit(&self, uid: &str, amount: i64) -> Result<i64, CreditError> {
        if !(MIN_CONSUME_AMOUNT..=MAX_CONSUME_AMOUNT).contains(&amount) {
            return Err(CreditError::InvalidArgument(format!(
                "amount must be an integer between {} and {}",
                MIN_CONSUME_AMOUNT, MAX_CONSUME_AMOUNT
            )));
        }

        let remaining = run_transaction(
            self.repository.as_ref(),
            &TxnScope::user(uid),
            |snapshot: &Snapshot| {
                let mut ledger = snapshot.ledger.ready().cloned().ok_or(CreditError::NotFound)?;
                if ledger.credits < amount {
                    return Err(CreditError::InsufficientCredits {
                        current_credits: ledger.credits,
                        required: amount,
                    });
                }
                ledger.credits -= amount;
                let remaining = ledger.credits;
                Ok((vec![Write::PutLedger(ledger)], remaining))
            },
        )
        .await?;

        record_credits_consumed("consume", amount);
        tracing::info!(uid = %uid, amount, remaining, "Credits consumed");
        Ok(remaining)
    }

    /// Switch plan and apply its cap. The balance is clamped down to the new
    /// cap and never raised.
    #[instrument(skip(self))]
    pub async fn set_plan(&self, uid: &str, plan_name: &str) -> Result<UserLedger, CreditError> {
        let plan = Plan::from_string(plan_name);
        if plan.as_str() != plan_name {
            tracing::warn!(uid = %uid, requested = %plan_name, "Unknown plan, using free");
        }
        let cfg = self.plans.config_for(plan);

        run_transaction(
            self.repository.as_ref(),
            &TxnScope::user(uid),
            |snapshot: &Snapshot| {
                let mut ledger = snapshot.ledger.ready().cloned().ok_or(CreditError::NotFound)?;
                ledger.plan = plan;
                ledger.max_credits = cfg.max_credits;
                ledger.credits = ledger.credits.min(cfg.max_credits);
                Ok((vec![Write::PutLedger(ledger.clone())], ledger))
            },
        )
        .await
    }

    /// Mark the free onboarding generation as used. Fails if it already was.
    #[instrument(skip(self))]
    pub async fn claim_onboarding_generation(&self, uid: &str) -> Result<(), CreditError> {
        run_transaction(
            self.repository.as_ref(),
            &TxnScope::user(uid),
            |snapshot: &Snapshot| {
                let mut ledger = snapshot.ledger.ready().cloned().ok_or(CreditError::NotFound)?;
                if ledger.used_free_onboarding_generation {
                    return Err(CreditError::OnboardingGenerationUsed);
                }
                ledger.used_free_onboarding_generation = true;
                Ok((vec![Write::PutLedger(ledger)], ()))
            },
        )
        .await
    }
}
