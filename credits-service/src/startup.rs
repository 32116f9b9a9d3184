//! Application startup and lifecycle management.

use crate::config::{CreditsConfig, StoreBackend};
use crate::handlers;
use crate::jobs::JobScheduler;
use crate::services::purchases::PurchaseSettings;
use crate::services::retry::RetryPolicy;
use crate::services::{
    BillingOracle, Bootstrapper, GenerationService, HttpBillingOracle, HttpIdentityDirectory,
    HttpImageGenerator, IdentityDirectory, ImageGenerator, InMemoryLedgerRepository,
    LedgerRepository, LedgerService, MongoLedgerRepository, MonthlyGrantJob, PurchaseValidator,
    SlotManager, StaticIdentityDirectory, SubscriptionReconciler,
};
use axum::{
    extract::Request,
    middleware::from_fn,
    routing::{get, post, put},
    Router,
};
use secrecy::{ExposeSecret, Secret};
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::{make_request_span, request_id_middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub service_name: String,
    pub repository: Arc<dyn LedgerRepository>,
    pub ledger: LedgerService,
    pub generation: GenerationService,
    pub purchases: PurchaseValidator,
    pub bootstrap: Bootstrapper,
    pub scheduler: JobScheduler,
    pub admin_api_key: Secret<String>,
}

/// External dependencies of the service. Production wiring builds these
/// from configuration; tests swap in fakes.
pub struct Collaborators {
    pub repository: Arc<dyn LedgerRepository>,
    pub oracle: Arc<dyn BillingOracle>,
    pub identities: Arc<dyn IdentityDirectory>,
    pub generator: Arc<dyn ImageGenerator>,
}

impl Collaborators {
    pub async fn from_config(config: &CreditsConfig) -> Result<Self, AppError> {
        let repository: Arc<dyn LedgerRepository> = match config.store.backend {
            StoreBackend::Mongo => {
                let repo = MongoLedgerRepository::connect(
                    config.store.uri.expose_secret(),
                    &config.store.database,
                )
                .await
                .map_err(|e| AppError::DatabaseError(e.into()))?;
                repo.initialize_indexes().await.map_err(|e| {
                    tracing::error!("Failed to initialize database indexes: {}", e);
                    AppError::DatabaseError(e.into())
                })?;
                Arc::new(repo)
            }
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory ledger store; data is lost on restart");
                Arc::new(InMemoryLedgerRepository::new())
            }
        };

        let oracle = HttpBillingOracle::new(&config.billing).map_err(AppError::InternalError)?;

        let identities: Arc<dyn IdentityDirectory> = match &config.identity.api_url {
            Some(url) => Arc::new(
                HttpIdentityDirectory::new(url, &config.identity)
                    .map_err(AppError::InternalError)?,
            ),
            None => {
                tracing::warn!("IDENTITY_API_URL not set - backfill will see no identities");
                Arc::new(StaticIdentityDirectory::default())
            }
        };

        let generator =
            HttpImageGenerator::new(&config.generation).map_err(AppError::InternalError)?;

        Ok(Self {
            repository,
            oracle: Arc::new(oracle),
            identities,
            generator: Arc::new(generator),
        })
    }
}

/// Build the HTTP router over the given state.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/v1/credits", get(handlers::credits::get_credits))
        .route("/v1/credits/initialize", post(handlers::credits::initialize_credits))
        .route("/v1/credits/consume", post(handlers::credits::consume_credit))
        .route("/v1/plan", put(handlers::credits::set_plan))
        .route("/v1/purchases/topup", post(handlers::purchases::purchase_topup))
        .route(
            "/v1/subscriptions/purchase",
            post(handlers::purchases::purchase_subscription),
        )
        .route(
            "/v1/subscriptions/restore",
            post(handlers::purchases::restore_subscription),
        )
        .route(
            "/v1/generations",
            post(handlers::generations::run_metered_generation),
        )
        .route(
            "/v1/generations/onboarding",
            post(handlers::generations::run_onboarding_generation),
        );

    let internal = Router::new()
        .route("/internal/identities", post(handlers::internal::identity_created))
        .route("/internal/backfill", post(handlers::internal::backfill))
        .route(
            "/internal/jobs/monthly-grants",
            post(handlers::internal::run_monthly_grants),
        )
        .route(
            "/internal/jobs/reconcile-subscriptions",
            post(handlers::internal::run_reconciliation),
        );

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .merge(api)
        .merge(internal)
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request| make_request_span(request)))
        .layer(from_fn(metrics_middleware))
        .layer(from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
    jobs_enabled: bool,
}

impl Application {
    /// Build the application with collaborators created from configuration.
    pub async fn build(config: CreditsConfig) -> Result<Self, AppError> {
        let collaborators = Collaborators::from_config(&config).await?;
        Self::build_with(config, collaborators).await
    }

    pub async fn build_with(
        config: CreditsConfig,
        collaborators: Collaborators,
    ) -> Result<Self, AppError> {
        let Collaborators {
            repository,
            oracle,
            identities,
            generator,
        } = collaborators;

        let ledger = LedgerService::new(repository.clone(), config.plans.clone());
        let slots = SlotManager::new(repository.clone(), config.limits.into());
        let generation = GenerationService::new(
            slots,
            ledger.clone(),
            generator,
            Duration::from_secs(config.generation.timeout_seconds),
        );

        let purchases = PurchaseValidator::new(
            repository.clone(),
            oracle.clone(),
            PurchaseSettings {
                plans: config.plans.clone(),
                products: config.products.clone(),
                subscription_bonus_credits: config.subscription_bonus_credits,
                entitlement: config.billing.entitlement.clone(),
                verify: RetryPolicy::new(
                    config.billing.verify_attempts,
                    Duration::from_millis(500),
                ),
            },
        );

        let bootstrap = Bootstrapper::new(repository.clone(), identities, config.plans.clone());

        let scheduler = JobScheduler::new(
            MonthlyGrantJob::new(repository.clone(), config.plans.clone()),
            SubscriptionReconciler::new(
                repository.clone(),
                oracle,
                config.plans.clone(),
                config.billing.entitlement.clone(),
            ),
            &config.jobs,
        );

        let state = AppState {
            service_name: config.service_name.clone(),
            repository,
            ledger,
            generation,
            purchases,
            bootstrap,
            scheduler,
            admin_api_key: config.admin.api_key.clone(),
        };

        // Port 0 binds a random port for tests.
        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port, "Credits service listening");

        Ok(Self {
            port,
            listener,
            state,
            jobs_enabled: config.jobs.enabled,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        if self.jobs_enabled {
            self.state.scheduler.clone().spawn();
        } else {
            tracing::info!("Scheduled jobs disabled");
        }

        let app = router(self.state);
        axum::serve(self.listener, app).await.map_err(|e| {
            tracing::error!("HTTP server error: {}", e);
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
