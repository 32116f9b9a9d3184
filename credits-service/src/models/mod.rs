pub mod ledger;
pub mod plan;
pub mod subscription;
pub mod transaction;

pub use ledger::{LedgerState, UserLedger};
pub use plan::{Plan, PlanCatalog, PlanConfig, ProductCatalog};
pub use subscription::{SubscriptionRecord, SubscriptionStatus};
pub use transaction::ProcessedTransaction;
