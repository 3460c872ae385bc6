use std::sync::Arc;

use crate::cancellations::{CancellationCase, CancellationStore};
use crate::error::RetentionError;
use crate::subscriptions::{Subscription, SubscriptionStore};

/// 内部区分两种拒绝；对外只有一种错误，不泄露行是否存在
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Denial {
    NotFound,
    WrongOwner,
}

fn log_denial(denial: Denial, entity: &'static str, id: &str, caller: &str) {
    match denial {
        Denial::NotFound => {
            tracing::debug!("{} not found: {}", entity, id);
        }
        Denial::WrongOwner => {
            let detail = serde_json::json!({ "id": id, "caller": caller });
            tracing::warn!("denied {} access: {}", entity, detail);
        }
    }
}

/// Fetches rows by id alone, then compares the stored owner against the
/// caller's verified identity. Every lookup the engine performs goes through
/// here; mutating statements additionally repeat the owner in their WHERE
/// clause.
#[derive(Clone)]
pub struct AccessPolicy {
    subscriptions: Arc<dyn SubscriptionStore + Send + Sync>,
    cancellations: Arc<dyn CancellationStore + Send + Sync>,
}

impl AccessPolicy {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore + Send + Sync>,
        cancellations: Arc<dyn CancellationStore + Send + Sync>,
    ) -> Self {
        Self {
            subscriptions,
            cancellations,
        }
    }

    pub async fn require_subscription(
        &self,
        subscription_id: &str,
        user_id: &str,
    ) -> Result<Subscription, RetentionError> {
        match self.subscriptions.get_subscription(subscription_id).await? {
            None => {
                log_denial(Denial::NotFound, "subscription", subscription_id, user_id);
                Err(RetentionError::NotFoundOrUnauthorized)
            }
            Some(sub) if sub.user_id != user_id => {
                log_denial(Denial::WrongOwner, "subscription", subscription_id, user_id);
                Err(RetentionError::NotFoundOrUnauthorized)
            }
            Some(sub) => Ok(sub),
        }
    }

    pub async fn require_case(
        &self,
        case_id: &str,
        user_id: &str,
    ) -> Result<CancellationCase, RetentionError> {
        match self.cancellations.get_case(case_id).await? {
            None => {
                log_denial(Denial::NotFound, "cancellation case", case_id, user_id);
                Err(RetentionError::NotFoundOrUnauthorized)
            }
            Some(case) if case.user_id != user_id => {
                log_denial(Denial::WrongOwner, "cancellation case", case_id, user_id);
                Err(RetentionError::NotFoundOrUnauthorized)
            }
            Some(case) => Ok(case),
        }
    }

    /// Own cases for an owned subscription, newest first.
    pub async fn cases_for_subscription(
        &self,
        subscription_id: &str,
        user_id: &str,
    ) -> Result<Vec<CancellationCase>, RetentionError> {
        self.require_subscription(subscription_id, user_id).await?;
        self.cancellations
            .list_cases_for_subscription(subscription_id, user_id)
            .await
    }
}
