pub mod billing;
pub mod bootstrap;
pub mod error;
pub mod generation;
pub mod generator;
pub mod grants;
pub mod identity;
pub mod ledger;
pub mod metrics;
pub mod monthly_grants;
pub mod purchases;
pub mod reconciler;
pub mod retry;
pub mod slots;
pub mod store;

pub use billing::{BillingOracle, HttpBillingOracle};
pub use bootstrap::{BackfillReport, Bootstrapper};
pub use error::{CreditError, RateLimitReason};
pub use generation::GenerationService;
pub use generator::{HttpImageGenerator, ImageGenerator};
pub use identity::{HttpIdentityDirectory, IdentityDirectory, StaticIdentityDirectory};
pub use ledger::LedgerService;
pub use metrics::{get_metrics, init_metrics};
pub use monthly_grants::MonthlyGrantJob;
pub use purchases::{PurchaseSettings, PurchaseValidator, SubscriptionEvent};
pub use reconciler::SubscriptionReconciler;
pub use slots::SlotManager;
pub use store::{InMemoryLedgerRepository, LedgerRepository, MongoLedgerRepository};
