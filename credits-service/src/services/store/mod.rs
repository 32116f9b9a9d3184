//! Ledger store seam.
//!
//! Every mutation goes through [`LedgerRepository::transact`]: the store reads
//! a consistent [`Snapshot`] of one user, hands it to a pure body that returns
//! the writes to apply, and commits them atomically. Bodies may run more than
//! once when the store retries on conflict, so they must not have side effects.

mod memory;
mod mongo;

pub use memory::InMemoryLedgerRepository;
pub use mongo::MongoLedgerRepository;

use crate::models::{LedgerState, ProcessedTransaction, SubscriptionRecord, UserLedger};
use crate::services::error::CreditError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Which documents a transaction reads.
#[derive(Debug, Clone)]
pub struct TxnScope {
    pub uid: String,
    /// Billing transaction id whose idempotency record should be loaded.
    pub transaction_id: Option<String>,
}

impl TxnScope {
    pub fn user(uid: &str) -> Self {
        Self {
            uid: uid.to_string(),
            transaction_id: None,
        }
    }

    pub fn with_transaction(uid: &str, transaction_id: &str) -> Self {
        Self {
            uid: uid.to_string(),
            transaction_id: Some(transaction_id.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub uid: String,
    pub ledger: LedgerState,
    pub subscription: Option<SubscriptionRecord>,
    pub processed_transaction: Option<ProcessedTransaction>,
}

#[derive(Debug, Clone)]
pub enum Write {
    PutLedger(UserLedger),
    PutSubscription(SubscriptionRecord),
    /// Fails the whole transaction with `AlreadyProcessed` if the id exists.
    InsertProcessedTransaction(ProcessedTransaction),
}

pub type TxnBody<'a> = dyn FnMut(&Snapshot) -> Result<Vec<Write>, CreditError> + Send + 'a;

#[async_trait]
pub trait LedgerRepository: Send + Sync {
    /// Run `body` against a snapshot of `scope` and apply its writes
    /// atomically. An error from `body` aborts without writing anything.
    async fn transact(&self, scope: &TxnScope, body: &mut TxnBody<'_>) -> Result<(), CreditError>;

    async fn get_ledger(&self, uid: &str) -> Result<LedgerState, CreditError>;

    async fn get_processed_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<ProcessedTransaction>, CreditError>;

    /// Active subscriptions with `expires_date <= now`, ordered by uid,
    /// starting after `after`.
    async fn due_subscriptions(
        &self,
        now: DateTime<Utc>,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SubscriptionRecord>, CreditError>;

    /// Free-plan user ids whose last recurring grant is at or before
    /// `cutoff`, ordered by uid, starting after `after`.
    async fn grant_candidates(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Vec<String>, CreditError>;

    async fn health_check(&self) -> Result<(), CreditError>;
}

/// Run a transaction whose body also produces a value.
///
/// The value returned is the one from the attempt that committed.
pub async fn run_transaction<T, F>(
    repo: &dyn LedgerRepository,
    scope: &TxnScope,
    mut body: F,
) -> Result<T, CreditError>
where
    F: FnMut(&Snapshot) -> Result<(Vec<Write>, T), CreditError> + Send,
    T: Send,
{
    let mut outcome: Option<T> = None;
    let mut adapter = |snapshot: &Snapshot| -> Result<Vec<Write>, CreditError> {
        let (writes, value) = body(snapshot)?;
        outcome = Some(value);
        Ok(writes)
    };

    repo.transact(scope, &mut adapter).await?;

    outcome.ok_or_else(|| CreditError::Internal(anyhow::anyhow!("transaction body never ran")))
}
