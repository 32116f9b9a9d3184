use super::{LedgerRepository, Snapshot, TxnBody, TxnScope, Write};
use crate::models::{
    LedgerState, Plan, ProcessedTransaction, SubscriptionRecord, SubscriptionStatus, UserLedger,
};
use crate::services::error::CreditError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;

#[derive(Default)]
struct MemoryState {
    users: BTreeMap<String, LedgerState>,
    subscriptions: BTreeMap<String, SubscriptionRecord>,
    processed: HashMap<String, ProcessedTransaction>,
    failing: HashSet<String>,
}

/// In-process ledger store. Transaction bodies run while holding a single
/// lock, which makes every transaction serializable.
#[derive(Default)]
pub struct InMemoryLedgerRepository {
    state: Mutex<MemoryState>,
}

impl InMemoryLedgerRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_ledger(&self, uid: &str, ledger: UserLedger) {
        self.state
            .lock()
            .await
            .users
            .insert(uid.to_string(), LedgerState::Ready(ledger));
    }

    /// Seed a document that only carries client profile fields.
    pub async fn insert_profile_only(&self, uid: &str) {
        self.state
            .lock()
            .await
            .users
            .insert(uid.to_string(), LedgerState::Incomplete {
                    created_at: None,
                    credits: None,
                },);
    }

    pub async fn insert_subscription(&self, record: SubscriptionRecord) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(record.uid.clone(), record);
    }

    pub async fn ledger(&self, uid: &str) -> Option<UserLedger> {
        self.state
            .lock()
            .await
            .users
            .get(uid)
            .and_then(|state| state.ready().cloned())
    }

    pub async fn subscription(&self, uid: &str) -> Option<SubscriptionRecord> {
        self.state.lock().await.subscriptions.get(uid).cloned()
    }

    pub async fn processed_transaction(&self, transaction_id: &str) -> Option<ProcessedTransaction> {
        self.state.lock().await.processed.get(transaction_id).cloned()
    }

    /// Make every transaction scoped to `uid` fail with a store error.
    pub async fn fail_transactions_for(&self, uid: &str) {
        self.state.lock().await.failing.insert(uid.to_string());
    }
}

#[async_trait]
impl LedgerRepository for InMemoryLedgerRepository {
    async fn transact(&self, scope: &TxnScope, body: &mut TxnBody<'_>) -> Result<(), CreditError> {
        let mut state = self.state.lock().await;

        if state.failing.contains(&scope.uid) {
            return Err(CreditError::Internal(anyhow::anyhow!(
                "simulated store failure for {}",
                scope.uid
            )));
        }

        let snapshot = Snapshot {
            uid: scope.uid.clone(),
            ledger: state
                .users
                .get(&scope.uid)
                .cloned()
                .unwrap_or(LedgerState::Missing),
            subscription: state.subscriptions.get(&scope.uid).cloned(),
            processed_transaction: scope
                .transaction_id
                .as_ref()
                .and_then(|id| state.processed.get(id).cloned()),
        };

        let writes = body(&snapshot)?;

        // Validate before applying so a rejected insert leaves nothing behind.
        for write in &writes {
            if let Write::InsertProcessedTransaction(record) = write {
                if state.processed.contains_key(&record.transaction_id) {
                    return Err(CreditError::AlreadyProcessed);
                }
            }
        }

        for write in writes {
            match write {
                Write::PutLedger(ledger) => {
                    state
                        .users
                        .insert(scope.uid.clone(), LedgerState::Ready(ledger));
                }
                Write::PutSubscription(record) => {
                    state.subscriptions.insert(record.uid.clone(), record);
                }
                Write::InsertProcessedTransaction(record) => {
                    state
                        .processed
                        .insert(record.transaction_id.clone(), record);
                }
            }
        }

        Ok(())
    }

    async fn get_ledger(&self, uid: &str) -> Result<LedgerState, CreditError> {
        Ok(self
            .state
            .lock()
            .await
            .users
            .get(uid)
            .cloned()
            .unwrap_or(LedgerState::Missing))
    }

    async fn get_processed_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<ProcessedTransaction>, CreditError> {
        Ok(self.processed_transaction(transaction_id).await)
    }

    async fn due_subscriptions(
        &self,
        now: DateTime<Utc>,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SubscriptionRecord>, CreditError> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .filter(|record| after.map_or(true, |cursor| record.uid.as_str() > cursor))
            .filter(|record| record.status == SubscriptionStatus::Active)
            .filter(|record| record.expires_date <= now)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn grant_candidates(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Vec<String>, CreditError> {
        let state = self.state.lock().await;
        Ok(state
            .users
            .iter()
            .filter(|(uid, _)| after.map_or(true, |cursor| uid.as_str() > cursor))
            .filter_map(|(uid, ledger)| match ledger {
                LedgerState::Ready(ledger)
                    if ledger.plan == Plan::Free && ledger.last_monthly_grant <= cutoff =>
                {
                    Some(uid.clone())
                }
                _ => None,
            })
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn health_check(&self) -> Result<(), CreditError> {
        Ok(())
    }
}
