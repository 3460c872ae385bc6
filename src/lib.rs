pub mod cancellations;
pub mod config;
pub mod error;
pub mod policy;
pub mod storage;
pub mod subscriptions;
pub mod users;
pub mod variant;
pub mod workflow;

pub use cancellations::{
    CancellationCase, CancellationReason, CancellationStore, CaseDecision, DownsellVariant,
};
pub use config::Settings;
pub use error::{Result, RetentionError};
pub use policy::AccessPolicy;
pub use storage::{Database, PgStore};
pub use subscriptions::{
    CreateSubscriptionPayload, Subscription, SubscriptionStatus, SubscriptionStore,
};
pub use users::{CreateUserPayload, User, UserStore};
pub use workflow::CancellationFlow;

use tracing_subscriber::EnvFilter;

/// Install the default tracing subscriber. `RUST_LOG` overrides the `info`
/// default; an already-installed subscriber wins.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(storage::time::UtcTimer)
        .try_init();
}
