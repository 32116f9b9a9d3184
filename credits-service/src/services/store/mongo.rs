use super::{LedgerRepository, Snapshot, TxnBody, TxnScope, Write};
use crate::models::{LedgerState, ProcessedTransaction, SubscriptionRecord, UserLedger};
use crate::services::error::CreditError;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::TryStreamExt;
use mongodb::{
    bson::{self, doc, Bson, Document},
    error::{
        ErrorKind, WriteFailure, TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT,
    },
    options::{
        Acknowledgment, FindOptions, IndexOptions, ReadConcern, ReplaceOptions,
        TransactionOptions, UpdateOptions, WriteConcern,
    },
    Client, ClientSession, Collection, Database, IndexModel,
};

const MAX_TXN_ATTEMPTS: u32 = 5;
const MAX_COMMIT_ATTEMPTS: u32 = 3;
const DUPLICATE_KEY_CODE: i32 = 11000;
/// Fields a user document needs before it counts as a ledger.
const LEDGER_FIELDS: [&str; 5] = ["plan", "credits", "maxCredits", "lastMonthlyGrant", "createdAt"];

/// Ledger store backed by MongoDB multi-document transactions.
///
/// Ledger fields live on the user's document in `users` and are written with
/// `$set`, so profile fields written by the client survive.
#[derive(Clone)]
pub struct MongoLedgerRepository {
    client: Client,
    db: Database,
}

impl MongoLedgerRepository {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, CreditError> {
        tracing::info!(database = %database, "Connecting to MongoDB");
        let client = Client::with_uri_str(uri).await.map_err(|e| {
            tracing::error!("Failed to connect to MongoDB: {}", e);
            CreditError::Store(e)
        })?;
        let db = client.database(database);
        Ok(Self { client, db })
    }

    fn users(&self) -> Collection<Document> {
        self.db.collection("users")
    }

    fn subscriptions(&self) -> Collection<SubscriptionRecord> {
        self.db.collection("subscriptions")
    }

    fn processed_transactions(&self) -> Collection<ProcessedTransaction> {
        self.db.collection("processed_transactions")
    }

    pub async fn initialize_indexes(&self) -> Result<(), CreditError> {
        tracing::info!("Creating MongoDB indexes for credits-service");

        let due_index = IndexModel::builder()
            .keys(doc! { "status": 1, "expiresDate": 1 })
            .options(
                IndexOptions::builder()
                    .name("status_expires_idx".to_string())
                    .build(),
            )
            .build();
        self.subscriptions()
            .create_index(due_index, None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create subscriptions index: {}", e);
                CreditError::Store(e)
            })?;

        let grant_index = IndexModel::builder()
            .keys(doc! { "plan": 1, "lastMonthlyGrant": 1 })
            .options(
                IndexOptions::builder()
                    .name("plan_last_grant_idx".to_string())
                    .build(),
            )
            .build();
        self.users()
            .create_index(grant_index, None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create users index: {}", e);
                CreditError::Store(e)
            })?;

        Ok(())
    }

    fn transaction_options() -> TransactionOptions {
        TransactionOptions::builder()
            .read_concern(ReadConcern::majority())
            .write_concern(WriteConcern::builder().w(Acknowledgment::Majority).build())
            .build()
    }

    async fn read_snapshot(
        &self,
        session: &mut ClientSession,
        scope: &TxnScope,
    ) -> Result<Snapshot, CreditError> {
        let user = self
            .users()
            .find_one_with_session(doc! { "_id": &scope.uid }, None, session)
            .await?;

        let subscription = self
            .subscriptions()
            .find_one_with_session(doc! { "_id": &scope.uid }, None, session)
            .await?;

        let processed_transaction = match &scope.transaction_id {
            Some(id) => {
                self.processed_transactions()
                    .find_one_with_session(doc! { "_id": id }, None, session)
                    .await?
            }
            None => None,
        };

        Ok(Snapshot {
            uid: scope.uid.clone(),
            ledger: ledger_state(user)?,
            subscription,
            processed_transaction,
        })
    }

    async fn apply_writes(
        &self,
        session: &mut ClientSession,
        uid: &str,
        writes: Vec<Write>,
    ) -> Result<(), CreditError> {
        for write in writes {
            match write {
                Write::PutLedger(ledger) => {
                    let fields = bson::to_document(&ledger)
                        .map_err(|e| CreditError::Internal(e.into()))?;
                    self.users()
                        .update_one_with_session(
                            doc! { "_id": uid },
                            doc! { "$set": fields },
                            UpdateOptions::builder().upsert(true).build(),
                            session,
                        )
                        .await?;
                }
                Write::PutSubscription(record) => {
                    self.subscriptions()
                        .replace_one_with_session(
                            doc! { "_id": &record.uid },
                            &record,
                            ReplaceOptions::builder().upsert(true).build(),
                            session,
                        )
                        .await?;
                }
                Write::InsertProcessedTransaction(record) => {
                    self.processed_transactions()
                        .insert_one_with_session(&record, None, session)
                        .await
                        .map_err(|e| {
                            if is_duplicate_key(&e) {
                                CreditError::AlreadyProcessed
                            } else {
                                CreditError::Store(e)
                            }
                        })?;
                }
            }
        }
        Ok(())
    }

    async fn attempt(
        &self,
        session: &mut ClientSession,
        scope: &TxnScope,
        body: &mut TxnBody<'_>,
    ) -> Result<(), CreditError> {
        let snapshot = self.read_snapshot(session, scope).await?;
        let writes = body(&snapshot)?;
        self.apply_writes(session, &scope.uid, writes).await
    }

    async fn commit(session: &mut ClientSession) -> mongodb::error::Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match session.commit_transaction().await {
                Ok(()) => return Ok(()),
                Err(e)
                    if e.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
                        && attempt < MAX_COMMIT_ATTEMPTS =>
                {
                    tracing::warn!(attempt, "Commit result unknown, retrying commit");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl LedgerRepository for MongoLedgerRepository {
    async fn transact(&self, scope: &TxnScope, body: &mut TxnBody<'_>) -> Result<(), CreditError> {
        let mut session = self.client.start_session(None).await?;
        let mut attempt = 0;

        loop {
            attempt += 1;
            session
                .start_transaction(Self::transaction_options())
                .await?;

            let err = match self.attempt(&mut session, scope, body).await {
                Ok(()) => match Self::commit(&mut session).await {
                    Ok(()) => return Ok(()),
                    Err(e) => CreditError::Store(e),
                },
                Err(err) => {
                    if let Err(abort_err) = session.abort_transaction().await {
                        tracing::debug!(error = %abort_err, "Abort after failed attempt");
                    }
                    err
                }
            };

            let transient = matches!(
                &err,
                CreditError::Store(e) if e.contains_label(TRANSIENT_TRANSACTION_ERROR)
            );
            if !transient || attempt >= MAX_TXN_ATTEMPTS {
                return Err(err);
            }
            tracing::warn!(uid = %scope.uid, attempt, "Transient transaction error, retrying");
        }
    }

    async fn get_ledger(&self, uid: &str) -> Result<LedgerState, CreditError> {
        let user = self.users().find_one(doc! { "_id": uid }, None).await?;
        ledger_state(user)
    }

    async fn get_processed_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<ProcessedTransaction>, CreditError> {
        Ok(self
            .processed_transactions()
            .find_one(doc! { "_id": transaction_id }, None)
            .await?)
    }

    async fn due_subscriptions(
        &self,
        now: DateTime<Utc>,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SubscriptionRecord>, CreditError> {
        let mut filter = doc! {
            "status": "active",
            "expiresDate": { "$lte": now.timestamp_millis() },
        };
        if let Some(cursor) = after {
            filter.insert("_id", doc! { "$gt": cursor });
        }

        let options = FindOptions::builder()
            .sort(doc! { "_id": 1 })
            .limit(limit)
            .build();

        let cursor = self.subscriptions().find(filter, options).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn grant_candidates(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Vec<String>, CreditError> {
        let mut filter = doc! {
            "plan": "free",
            "credits": { "$exists": true },
            "lastMonthlyGrant": { "$lte": cutoff.timestamp_millis() },
        };
        if let Some(cursor) = after {
            filter.insert("_id", doc! { "$gt": cursor });
        }

        let options = FindOptions::builder()
            .sort(doc! { "_id": 1 })
            .projection(doc! { "_id": 1 })
            .limit(limit)
            .build();

        let docs: Vec<Document> = self
            .users()
            .find(filter, options)
            .await?
            .try_collect()
            .await?;

        Ok(docs
            .iter()
            .filter_map(|d| d.get_str("_id").ok().map(str::to_string))
            .collect())
    }

    async fn health_check(&self) -> Result<(), CreditError> {
        self.db.run_command(doc! { "ping": 1 }, None).await?;
        Ok(())
    }
}

fn ledger_state(user: Option<Document>) -> Result<LedgerState, CreditError> {
    let Some(user) = user else {
        return Ok(LedgerState::Missing);
    };

    if LEDGER_FIELDS.iter().any(|field| !user.contains_key(field)) {
        let created_at = integer_field(&user, "createdAt")
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        return Ok(LedgerState::Incomplete {
            created_at,
            credits: integer_field(&user, "credits"),
        });
    }

    let ledger: UserLedger =
        bson::from_document(user).map_err(|e| CreditError::Internal(e.into()))?;
    Ok(LedgerState::Ready(ledger))
}

/// Client-written numbers may arrive as any BSON numeric type.
fn integer_field(user: &Document, key: &str) -> Option<i64> {
    match user.get(key)? {
        Bson::Int64(n) => Some(*n),
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Double(f) if f.fract() == 0.0 => Some(*f as i64),
        _ => None,
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write_error))
            if write_error.code == DUPLICATE_KEY_CODE
    )
}
