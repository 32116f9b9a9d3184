use crate::services::error::CreditError;
use crate::services::generator::{
    GeneratedImage, GenerationRequest, GeneratorError, ImageGenerator,
};
use crate::services::ledger::LedgerService;
use crate::services::slots::{Metered, SlotManager};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Metered and onboarding image generation.
#[derive(Clone)]
pub struct GenerationService {
    slots: SlotManager,
    ledger: LedgerService,
    generator: Arc<dyn ImageGenerator>,
    timeout: Duration,
}

impl GenerationService {
    pub fn new(
        slots: SlotManager,
        ledger: LedgerService,
        generator: Arc<dyn ImageGenerator>,
        timeout: Duration,
    ) -> Self {
        Self {
            slots,
            ledger,
            generator,
            timeout,
        }
    }

    async fn generate(
        generator: Arc<dyn ImageGenerator>,
        timeout: Duration,
        request: GenerationRequest,
    ) -> Result<GeneratedImage, CreditError> {
        match tokio::time::timeout(timeout, generator.generate(&request)).await {
            Ok(Ok(image)) => Ok(image),
            Ok(Err(e)) => Err(CreditError::Generation(e.to_string())),
            Err(_) => Err(CreditError::Generation(
                GeneratorError::Timeout(timeout.as_secs()).to_string(),
            )),
        }
    }

    /// Charge `credits` for one generation, holding a slot while it runs.
    #[instrument(skip(self, request))]
    pub async fn run_metered(
        &self,
        uid: &str,
        request: GenerationRequest,
        credits: i64,
    ) -> Result<Metered<GeneratedImage>, CreditError> {
        let generator = self.generator.clone();
        let timeout = self.timeout;

        self.slots
            .execute_with_rate_limiting(uid, credits, move || {
                Self::generate(generator, timeout, request)
            })
            .await
    }

    /// Run [`Self::run_metered`] on its own task so the slot is released even
    /// if the caller goes away mid-generation.
    pub async fn run_metered_detached(
        &self,
        uid: String,
        request: GenerationRequest,
        credits: i64,
    ) -> Result<Metered<GeneratedImage>, CreditError> {
        let service = self.clone();
        tokio::spawn(async move { service.run_metered(&uid, request, credits).await })
            .await
            .map_err(|e| CreditError::Internal(anyhow::anyhow!("generation task failed: {}", e)))?
    }

    /// The one free generation every user gets during onboarding.
    ///
    /// The flag is set before generating, so a failed generation still uses
    /// up the free attempt. No credits are involved.
    #[instrument(skip(self, request))]
    pub async fn run_onboarding(
        &self,
        uid: &str,
        request: GenerationRequest,
    ) -> Result<GeneratedImage, CreditError> {
        self.ledger.claim_onboarding_generation(uid).await?;

        let result = Self::generate(self.generator.clone(), self.timeout, request).await;
        if let Err(e) = &result {
            tracing::warn!(uid = %uid, error = %e, "Onboarding generation failed after claim");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::models::{PlanCatalog, UserLedger};
    use crate::services::generator::{MockBehavior, MockImageGenerator};
    use crate::services::store::InMemoryLedgerRepository;
    use chrono::Utc;

    fn setup(behavior: MockBehavior) -> (Arc<InMemoryLedgerRepository>, Arc<MockImageGenerator>, GenerationService) {
        let repo = Arc::new(InMemoryLedgerRepository::new());
        let generator = Arc::new(MockImageGenerator::new(behavior));
        let ledger = LedgerService::new(repo.clone(), PlanCatalog::default());
        let slots = SlotManager::new(repo.clone(), RateLimitConfig::default().into());
        let svc = GenerationService::new(slots, ledger, generator.clone(), Duration::from_millis(200));
        (repo, generator, svc)
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            prompt: "a cat".into(),
            input_image_base64: None,
        }
    }

    #[tokio::test]
    async fn timeout_releases_slot_without_charge() {
        let (repo, _, svc) = setup(MockBehavior::Delay(Duration::from_secs(5)));
        repo.insert_ledger("u1", UserLedger::new_free(2, 2, Utc::now())).await;

        let err = svc.run_metered("u1", request(), 1).await.unwrap_err();
        assert_eq!(err.code(), "internal");
        let l = repo.ledger("u1").await.unwrap();
        assert_eq!(l.active_generations, 0);
        assert_eq!(l.credits, 2);
    }

    #[tokio::test]
    async fn detached_panic_is_reported_and_slot_released() {
        let (repo, _, svc) = setup(MockBehavior::Panic);
        repo.insert_ledger("u1", UserLedger::new_free(2, 2, Utc::now())).await;

        let err = svc
            .run_metered_detached("u1".into(), request(), 1)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "internal");
        assert_eq!(repo.ledger("u1").await.unwrap().active_generations, 0);
    }

    #[tokio::test]
    async fn onboarding_failure_still_consumes_the_free_attempt() {
        let (repo, generator, svc) = setup(MockBehavior::Fail);
        repo.insert_ledger("u1", UserLedger::new_free(2, 2, Utc::now())).await;

        assert!(svc.run_onboarding("u1", request()).await.is_err());
        let l = repo.ledger("u1").await.unwrap();
        assert!(l.used_free_onboarding_generation);
        assert_eq!(l.credits, 2);

        generator.set_behavior(MockBehavior::Succeed);
        let err = svc.run_onboarding("u1", request()).await.unwrap_err();
        assert_eq!(err.code(), "failed_precondition");
        assert_eq!(generator.calls(), 1);
    }
}
