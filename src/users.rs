use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RetentionError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateUserPayload {
    pub email: String,
}

/// Lowercase + trim; rejects empty or obviously malformed addresses.
pub fn normalize_email(raw: &str) -> Result<String, RetentionError> {
    let email = raw.trim().to_lowercase();
    if email.is_empty() {
        return Err(RetentionError::Validation("email must not be empty".into()));
    }
    let valid = email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if !valid {
        return Err(RetentionError::Validation(format!(
            "invalid email address: {}",
            email
        )));
    }
    Ok(email)
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create_user(&self, payload: CreateUserPayload) -> Result<User, RetentionError>;
    async fn get_user(&self, id: &str) -> Result<Option<User>, RetentionError>;
}
