use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RetentionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownsellVariant {
    A,
    B,
}

impl DownsellVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            DownsellVariant::A => "A",
            DownsellVariant::B => "B",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "A" => Some(DownsellVariant::A),
            "B" => Some(DownsellVariant::B),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationReason {
    TooExpensive,
    NotUseful,
    MissingFeatures,
    SwitchedService,
    Other,
}

impl CancellationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CancellationReason::TooExpensive => "too_expensive",
            CancellationReason::NotUseful => "not_useful",
            CancellationReason::MissingFeatures => "missing_features",
            CancellationReason::SwitchedService => "switched_service",
            CancellationReason::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "too_expensive" => Some(CancellationReason::TooExpensive),
            "not_useful" => Some(CancellationReason::NotUseful),
            "missing_features" => Some(CancellationReason::MissingFeatures),
            "switched_service" => Some(CancellationReason::SwitchedService),
            "other" => Some(CancellationReason::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancellationCase {
    pub id: String,
    pub user_id: String,
    pub subscription_id: String,
    /// 创建时随机分配，之后永不改变
    pub downsell_variant: DownsellVariant,
    pub reason: Option<CancellationReason>,
    pub reason_other: Option<String>,
    pub accepted_downsell: bool,
    pub finalized: bool,
    pub decided_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Mutable-field update from the user completing the downsell/reason flow.
/// `downsell_variant` is deliberately typed as an opaque string: its mere
/// presence in a payload is rejected before any value parsing happens.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseDecision {
    #[serde(default)]
    pub downsell_variant: Option<String>,
    #[serde(default)]
    pub reason: Option<CancellationReason>,
    #[serde(default)]
    pub reason_other: Option<String>,
    #[serde(default)]
    pub accepted_downsell: Option<bool>,
    #[serde(default)]
    pub finalize: bool,
}

/// The reason/elaboration rule, re-checked on every write against the merged
/// row, not just at insert time.
pub fn validate_reason_fields(
    reason: Option<CancellationReason>,
    reason_other: Option<&str>,
) -> Result<(), RetentionError> {
    if matches!(reason, Some(CancellationReason::Other)) {
        let present = reason_other.is_some_and(|s| !s.trim().is_empty());
        if !present {
            return Err(RetentionError::Validation(
                "reason \"other\" requires a non-blank elaboration".into(),
            ));
        }
    }
    Ok(())
}

/// Merge a decision onto the current row. Fields absent from the decision are
/// left unchanged; `finalize` stamps `decided_at` and closes the case.
pub fn merge_decision(
    case: &CancellationCase,
    decision: &CaseDecision,
    now: DateTime<Utc>,
) -> CancellationCase {
    let mut merged = case.clone();
    if let Some(reason) = decision.reason {
        merged.reason = Some(reason);
    }
    if let Some(other) = &decision.reason_other {
        merged.reason_other = Some(other.clone());
    }
    if let Some(accepted) = decision.accepted_downsell {
        merged.accepted_downsell = accepted;
    }
    if decision.finalize {
        merged.finalized = true;
        merged.decided_at = Some(now);
    }
    merged
}

#[async_trait]
pub trait CancellationStore: Send + Sync {
    /// Insert a freshly drawn case. The reason rule is checked before the
    /// statement; a unique violation on the open-case partial index surfaces
    /// as `ConflictRetryable` for the engine to absorb.
    async fn insert_case(&self, case: &CancellationCase) -> Result<(), RetentionError>;

    /// Fetch by id alone; ownership comparison is the policy layer's job.
    async fn get_case(&self, id: &str) -> Result<Option<CancellationCase>, RetentionError>;

    /// Most recent open case for the subscription, creation time descending.
    async fn latest_open_case(
        &self,
        subscription_id: &str,
        user_id: &str,
    ) -> Result<Option<CancellationCase>, RetentionError>;

    async fn list_cases_for_subscription(
        &self,
        subscription_id: &str,
        user_id: &str,
    ) -> Result<Vec<CancellationCase>, RetentionError>;

    /// Write the merged row, guarded by `WHERE id AND user_id AND NOT
    /// finalized`. The reason rule is re-checked before the statement and
    /// `downsell_variant` is never part of the SET list. Returns false when
    /// zero rows matched.
    async fn apply_decision(&self, case: &CancellationCase) -> Result<bool, RetentionError>;
}
