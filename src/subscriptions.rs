use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RetentionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PendingCancellation,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PendingCancellation => "pending_cancellation",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "pending_cancellation" => Some(SubscriptionStatus::PendingCancellation),
            "cancelled" => Some(SubscriptionStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: String,
    pub user_id: String,
    /// 月费，最小货币单位（分）
    pub monthly_price: i64,
    pub status: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSubscriptionPayload {
    pub user_id: String,
    pub monthly_price: i64,
}

pub fn validate_monthly_price(monthly_price: i64) -> Result<(), RetentionError> {
    if monthly_price < 0 {
        return Err(RetentionError::Validation(format!(
            "monthly_price must not be negative: {}",
            monthly_price
        )));
    }
    Ok(())
}

/// Status is only ever mutated through the two compare-and-swap transitions
/// below; both return `None` when the WHERE clause matched zero rows (wrong
/// owner, or the subscription already left the expected status).
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn create_subscription(
        &self,
        payload: CreateSubscriptionPayload,
    ) -> Result<Subscription, RetentionError>;

    /// Fetch by id alone; ownership comparison is the policy layer's job.
    async fn get_subscription(&self, id: &str) -> Result<Option<Subscription>, RetentionError>;

    /// active -> pending_cancellation
    async fn mark_pending_cancellation(
        &self,
        id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, RetentionError>;

    /// pending_cancellation -> cancelled
    async fn complete_cancellation(
        &self,
        id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, RetentionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_status_roundtrip() {
        for (s, expected) in [
            ("active", SubscriptionStatus::Active),
            ("pending_cancellation", SubscriptionStatus::PendingCancellation),
            ("cancelled", SubscriptionStatus::Cancelled),
        ] {
            assert_eq!(SubscriptionStatus::parse(s).unwrap(), expected);
            assert_eq!(expected.as_str(), s);
        }
        assert!(SubscriptionStatus::parse("paused").is_none());
    }

    #[test]
    fn monthly_price_must_not_be_negative() {
        assert!(validate_monthly_price(0).is_ok());
        assert!(validate_monthly_price(2500).is_ok());
        assert!(validate_monthly_price(-1).is_err());
    }
}
