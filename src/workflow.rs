use std::sync::Arc;

use uuid::Uuid;

use crate::cancellations::{
    CancellationCase, CancellationStore, CaseDecision, merge_decision, validate_reason_fields,
};
use crate::config::Settings;
use crate::error::RetentionError;
use crate::policy::AccessPolicy;
use crate::storage::time::now_millis;
use crate::storage::{Database, PgStore};
use crate::subscriptions::{Subscription, SubscriptionStore};
use crate::users::UserStore;
use crate::variant::draw_variant;

/// 取消流程引擎。调用方传入已验证的用户身份；所有读写都经过
/// 所有权检查，并发冲突在这里吸收。
#[derive(Clone)]
pub struct CancellationFlow {
    users: Arc<dyn UserStore + Send + Sync>,
    subscriptions: Arc<dyn SubscriptionStore + Send + Sync>,
    cancellations: Arc<dyn CancellationStore + Send + Sync>,
    policy: AccessPolicy,
    create_retry_attempts: u32,
}

impl CancellationFlow {
    pub fn new(
        users: Arc<dyn UserStore + Send + Sync>,
        subscriptions: Arc<dyn SubscriptionStore + Send + Sync>,
        cancellations: Arc<dyn CancellationStore + Send + Sync>,
        create_retry_attempts: u32,
    ) -> Self {
        let policy = AccessPolicy::new(subscriptions.clone(), cancellations.clone());
        Self {
            users,
            subscriptions,
            cancellations,
            policy,
            create_retry_attempts,
        }
    }

    /// Choose the backend based on Postgres availability.
    pub async fn from_settings(settings: &Settings) -> Result<Self, RetentionError> {
        let attempts = settings.workflow.create_retry_attempts;
        if let Some(pg_url) = &settings.storage.pg_url {
            let pool_size = settings.storage.pg_pool_size.unwrap_or(4);
            let store =
                Arc::new(PgStore::connect(pg_url, &settings.storage.pg_schema, pool_size).await?);
            tracing::info!("Using PostgreSQL storage");
            Ok(Self::new(store.clone(), store.clone(), store, attempts))
        } else {
            let db = Arc::new(Database::new(&settings.storage.database_path).await?);
            Ok(Self::new(db.clone(), db.clone(), db, attempts))
        }
    }

    pub fn users(&self) -> Arc<dyn UserStore + Send + Sync> {
        self.users.clone()
    }

    pub fn subscriptions(&self) -> Arc<dyn SubscriptionStore + Send + Sync> {
        self.subscriptions.clone()
    }

    /// Return the subscription's open case, creating it (with a freshly drawn
    /// variant) when none exists. Losing the insert race is absorbed by
    /// re-fetching the winner's row, up to the configured bound.
    pub async fn ensure_cancellation_case(
        &self,
        subscription_id: &str,
        user_id: &str,
    ) -> Result<CancellationCase, RetentionError> {
        self.policy
            .require_subscription(subscription_id, user_id)
            .await?;

        for attempt in 0..self.create_retry_attempts.max(1) {
            if let Some(case) = self
                .cancellations
                .latest_open_case(subscription_id, user_id)
                .await?
            {
                return Ok(case);
            }

            let case = CancellationCase {
                id: Uuid::new_v4().to_string(),
                user_id: user_id.to_string(),
                subscription_id: subscription_id.to_string(),
                downsell_variant: draw_variant(),
                reason: None,
                reason_other: None,
                accepted_downsell: false,
                finalized: false,
                decided_at: None,
                created_at: now_millis(),
            };
            match self.cancellations.insert_case(&case).await {
                Ok(()) => return Ok(case),
                Err(RetentionError::ConflictRetryable) => {
                    tracing::debug!(
                        "open case insert for {} lost a race, refetching (attempt {})",
                        subscription_id,
                        attempt + 1
                    );
                }
                Err(e) => return Err(e),
            }
        }

        // 反复撞上定案后立刻重建的竞争，交给调用方重试
        Err(RetentionError::ConflictRetryable)
    }

    /// Single compare-and-swap on the subscription row; zero matched rows
    /// means the status already left `active`.
    pub async fn mark_pending_cancellation(
        &self,
        subscription_id: &str,
        user_id: &str,
    ) -> Result<Subscription, RetentionError> {
        self.policy
            .require_subscription(subscription_id, user_id)
            .await?;

        match self
            .subscriptions
            .mark_pending_cancellation(subscription_id, user_id, now_millis())
            .await?
        {
            Some(sub) => Ok(sub),
            None => Err(RetentionError::InvalidTransition),
        }
    }

    /// Merge the decision onto the current row, validate the merged state and
    /// write it through the finalization guard.
    pub async fn record_decision(
        &self,
        case_id: &str,
        user_id: &str,
        decision: CaseDecision,
    ) -> Result<CancellationCase, RetentionError> {
        let case = self.policy.require_case(case_id, user_id).await?;

        if decision.downsell_variant.is_some() {
            return Err(RetentionError::ImmutableField("downsell_variant"));
        }
        if case.finalized {
            return Err(RetentionError::CaseFinalized);
        }

        let merged = merge_decision(&case, &decision, now_millis());
        validate_reason_fields(merged.reason, merged.reason_other.as_deref())?;

        if self.cancellations.apply_decision(&merged).await? {
            return Ok(merged);
        }

        // Zero rows matched: the row moved between our read and the guarded
        // update. Re-fetch to classify.
        match self.cancellations.get_case(case_id).await? {
            Some(current) if current.finalized => Err(RetentionError::CaseFinalized),
            _ => Err(RetentionError::NotFoundOrUnauthorized),
        }
    }

    pub async fn subscription(
        &self,
        subscription_id: &str,
        user_id: &str,
    ) -> Result<Subscription, RetentionError> {
        self.policy
            .require_subscription(subscription_id, user_id)
            .await
    }

    pub async fn case(
        &self,
        case_id: &str,
        user_id: &str,
    ) -> Result<CancellationCase, RetentionError> {
        self.policy.require_case(case_id, user_id).await
    }

    pub async fn cases_for_subscription(
        &self,
        subscription_id: &str,
        user_id: &str,
    ) -> Result<Vec<CancellationCase>, RetentionError> {
        self.policy
            .cases_for_subscription(subscription_id, user_id)
            .await
    }
}
