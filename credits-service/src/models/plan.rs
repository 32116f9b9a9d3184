use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Plan a ledger is on. Decides the recurring grant and its cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Plan {
    Free,
    MonthlyPro,
    AnnualPro,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::MonthlyPro => "monthly_pro",
            Plan::AnnualPro => "annual_pro",
        }
    }

    /// Parse a plan name. Unknown names fall back to `Free` so that older or
    /// newer clients sending plan names this build does not know keep working.
    pub fn from_string(s: &str) -> Self {
        match s {
            "monthly_pro" => Plan::MonthlyPro,
            "annual_pro" => Plan::AnnualPro,
            _ => Plan::Free,
        }
    }

    pub fn is_paid(&self) -> bool {
        !matches!(self, Plan::Free)
    }
}

impl From<String> for Plan {
    fn from(s: String) -> Self {
        Plan::from_string(&s)
    }
}

impl From<Plan> for String {
    fn from(plan: Plan) -> Self {
        plan.as_str().to_string()
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Grant settings for a single plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanConfig {
    pub monthly_credits: i64,
    pub max_credits: i64,
}

/// Plan -> grant settings.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    pub free: PlanConfig,
    pub monthly_pro: PlanConfig,
    pub annual_pro: PlanConfig,
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self {
            free: PlanConfig {
                monthly_credits: 2,
                max_credits: 2,
            },
            monthly_pro: PlanConfig {
                monthly_credits: 50,
                max_credits: 100,
            },
            annual_pro: PlanConfig {
                monthly_credits: 50,
                max_credits: 100,
            },
        }
    }
}

impl PlanCatalog {
    pub fn config_for(&self, plan: Plan) -> PlanConfig {
        match plan {
            Plan::Free => self.free,
            Plan::MonthlyPro => self.monthly_pro,
            Plan::AnnualPro => self.annual_pro,
        }
    }
}

/// Store product ids known to this deployment.
#[derive(Debug, Clone, Default)]
pub struct ProductCatalog {
    /// One-time top-up product -> credits granted.
    pub topups: HashMap<String, i64>,
    /// Subscription product -> plan it unlocks.
    pub subscriptions: HashMap<String, Plan>,
}

impl ProductCatalog {
    pub fn topup_credits(&self, product_id: &str) -> Option<i64> {
        self.topups.get(product_id).copied()
    }

    pub fn subscription_plan(&self, product_id: &str) -> Option<Plan> {
        self.subscriptions.get(product_id).copied()
    }
}
