use crate::models::{Plan, PlanCatalog, PlanConfig, ProductCatalog};
use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;

const DEFAULT_TOPUP_PRODUCTS: &str = "credits_15:15,credits_5:5";
const DEFAULT_SUBSCRIPTION_PRODUCTS: &str = "pro_monthly:monthly_pro,pro_annual:annual_pro";

#[derive(Debug, Clone)]
pub struct CreditsConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub store: StoreConfig,
    pub limits: RateLimitConfig,
    pub plans: PlanCatalog,
    /// Bonus granted on a new subscription purchase, capped at the plan max.
    pub subscription_bonus_credits: i64,
    pub products: ProductCatalog,
    pub billing: BillingConfig,
    pub identity: IdentityConfig,
    pub generation: GenerationConfig,
    pub jobs: JobsConfig,
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Mongo,
    Memory,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub uri: Secret<String>,
    pub database: String,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub cooldown_seconds: u64,
    pub max_concurrent_generations: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: 15,
            max_concurrent_generations: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub api_url: String,
    pub api_key: Secret<String>,
    /// Entitlement identifier that unlocks the paid plans.
    pub entitlement: String,
    /// Lookups tolerated before a fresh purchase is declared unverifiable.
    pub verify_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub api_url: Option<String>,
    pub api_key: Secret<String>,
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub api_url: String,
    pub api_key: Secret<String>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct JobsConfig {
    pub enabled: bool,
    pub interval_hours: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub api_key: Secret<String>,
}

impl CreditsConfig {
    pub fn load() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;
        let is_prod = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod";

        let backend = match get_env("STORE", Some("mongo"), false)?.as_str() {
            "memory" => StoreBackend::Memory,
            "mongo" | "mongodb" => StoreBackend::Mongo,
            other => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "STORE must be 'mongo' or 'memory', got '{}'",
                    other
                )))
            }
        };
        if is_prod && backend == StoreBackend::Memory {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "STORE=memory is not allowed in production"
            )));
        }

        let plans = PlanCatalog {
            free: PlanConfig {
                monthly_credits: get_parsed("PLAN_FREE_MONTHLY_CREDITS", 2)?,
                max_credits: get_parsed("PLAN_FREE_MAX_CREDITS", 2)?,
            },
            monthly_pro: PlanConfig {
                monthly_credits: get_parsed("PLAN_MONTHLY_PRO_MONTHLY_CREDITS", 50)?,
                max_credits: get_parsed("PLAN_MONTHLY_PRO_MAX_CREDITS", 100)?,
            },
            annual_pro: PlanConfig {
                monthly_credits: get_parsed("PLAN_ANNUAL_PRO_MONTHLY_CREDITS", 50)?,
                max_credits: get_parsed("PLAN_ANNUAL_PRO_MAX_CREDITS", 100)?,
            },
        };

        let products = ProductCatalog {
            topups: parse_topup_products(&get_env(
                "TOPUP_PRODUCTS",
                Some(DEFAULT_TOPUP_PRODUCTS),
                false,
            )?)?,
            subscriptions: parse_subscription_products(&get_env(
                "SUBSCRIPTION_PRODUCTS",
                Some(DEFAULT_SUBSCRIPTION_PRODUCTS),
                false,
            )?)?,
        };

        Ok(CreditsConfig {
            common: common_config,
            service_name: get_env("SERVICE_NAME", Some("credits-service"), false)?,
            store: StoreConfig {
                backend,
                uri: Secret::new(get_env(
                    "MONGODB_URI",
                    Some("mongodb://localhost:27017"),
                    is_prod,
                )?),
                database: get_env("MONGODB_DATABASE", Some("credits_db"), is_prod)?,
            },
            limits: RateLimitConfig {
                cooldown_seconds: get_parsed("COOLDOWN_SECONDS", 15)?,
                max_concurrent_generations: get_parsed("MAX_CONCURRENT_GENERATIONS", 3)?,
            },
            plans,
            subscription_bonus_credits: get_parsed("SUBSCRIPTION_BONUS_CREDITS", 50)?,
            products,
            billing: BillingConfig {
                api_url: get_env(
                    "BILLING_API_URL",
                    Some("https://api.revenuecat.com/v1"),
                    is_prod,
                )?,
                api_key: Secret::new(get_env("BILLING_API_KEY", Some(""), is_prod)?),
                entitlement: get_env("BILLING_ENTITLEMENT", Some("Pro"), false)?,
                verify_attempts: get_parsed("BILLING_VERIFY_ATTEMPTS", 3)?,
            },
            identity: IdentityConfig {
                api_url: env::var("IDENTITY_API_URL").ok().filter(|s| !s.is_empty()),
                api_key: Secret::new(env::var("IDENTITY_API_KEY").unwrap_or_default()),
            },
            generation: GenerationConfig {
                api_url: get_env(
                    "GENERATION_API_URL",
                    Some("http://localhost:8090"),
                    is_prod,
                )?,
                api_key: Secret::new(get_env("GENERATION_API_KEY", Some(""), is_prod)?),
                timeout_seconds: get_parsed("GENERATION_TIMEOUT_SECONDS", 120)?,
            },
            jobs: JobsConfig {
                enabled: get_parsed("JOBS_ENABLED", true)?,
                interval_hours: get_parsed("JOB_INTERVAL_HOURS", 24)?,
                max_retries: get_parsed("JOB_MAX_RETRIES", 3)?,
            },
            admin: AdminConfig {
                api_key: Secret::new(get_env("ADMIN_API_KEY", Some("dev-admin-key"), is_prod)?),
            },
        })
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

/// Tunable with a default that applies in every environment.
fn get_parsed<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val.trim().parse().map_err(|e: T::Err| {
            AppError::ConfigError(anyhow::anyhow!("{} has invalid value '{}': {}", key, val, e))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_pairs(raw: &str) -> Result<Vec<(String, String)>, AppError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .split_once(':')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .filter(|(k, v)| !k.is_empty() && !v.is_empty())
                .ok_or_else(|| {
                    AppError::ConfigError(anyhow::anyhow!(
                        "expected 'productId:value', got '{}'",
                        entry
                    ))
                })
        })
        .collect()
}

/// Parse `productId:credits,...`.
pub fn parse_topup_products(raw: &str) -> Result<HashMap<String, i64>, AppError> {
    parse_pairs(raw)?
        .into_iter()
        .map(|(product, credits)| {
            let amount: i64 = credits.parse().map_err(|_| {
                AppError::ConfigError(anyhow::anyhow!(
                    "top-up product '{}' has non-numeric credits '{}'",
                    product,
                    credits
                ))
            })?;
            if amount <= 0 {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "top-up product '{}' must grant a positive amount",
                    product
                )));
            }
            Ok((product, amount))
        })
        .collect()
}

/// Parse `productId:plan,...`. Only paid plans are accepted here.
pub fn parse_subscription_products(raw: &str) -> Result<HashMap<String, Plan>, AppError> {
    parse_pairs(raw)?
        .into_iter()
        .map(|(product, plan_name)| {
            let plan = Plan::from_string(&plan_name);
            if !plan.is_paid() {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "subscription product '{}' maps to unknown plan '{}'",
                    product,
                    plan_name
                )));
            }
            Ok((product, plan))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_default_topups() {
        let topups = parse_topup_products(DEFAULT_TOPUP_PRODUCTS).unwrap();
        assert_eq!(topups.get("credits_15"), Some(&15));
        assert_eq!(topups.get("credits_5"), Some(&5));
    }

    #[test]
    fn parses_default_subscription_products() {
        let subs = parse_subscription_products(DEFAULT_SUBSCRIPTION_PRODUCTS).unwrap();
        assert_eq!(subs.get("pro_monthly"), Some(&Plan::MonthlyPro));
        assert_eq!(subs.get("pro_annual"), Some(&Plan::AnnualPro));
    }

    #[test]
    fn rejects_malformed_entries() {
        assert!(parse_topup_products("credits_15").is_err());
        assert!(parse_topup_products("credits_15:abc").is_err());
        assert!(parse_topup_products("credits_15:0").is_err());
        assert!(parse_subscription_products("pro:gold").is_err());
    }

    #[test]
    fn tolerates_whitespace_and_trailing_commas() {
        let topups = parse_topup_products(" credits_5 : 5 , ").unwrap();
        assert_eq!(topups.len(), 1);
        assert_eq!(topups.get("credits_5"), Some(&5));
    }
}
