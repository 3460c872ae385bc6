use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio_postgres::{Client, NoTls};

use crate::error::RetentionError;

// Spawn a lightweight keepalive task for a Postgres client connection.
// Adds jitter to avoid synchronized spikes and ignores errors (best-effort).
fn spawn_keepalive(client: Arc<Client>, min_secs: u64, max_secs: u64) {
    let max_secs = max_secs.max(min_secs + 1);
    tokio::spawn(async move {
        loop {
            let jitter = {
                let mut rng = rand::rng();
                rand::Rng::random_range(&mut rng, min_secs..=max_secs)
            };
            tokio::time::sleep(std::time::Duration::from_secs(jitter)).await;
            // Best-effort ping with short timeout
            let c = Arc::clone(&client);
            let _ = tokio::time::timeout(
                std::time::Duration::from_secs(5),
                c.execute("SELECT 1", &[]),
            )
            .await;
            // Ignore errors; next loop will try again.
        }
    });
}

pub struct PgPool {
    clients: Vec<Arc<Client>>,
    next: AtomicUsize,
}

impl PgPool {
    async fn connect_many(
        pg_url: &str,
        schema: &Option<String>,
        size: usize,
    ) -> Result<Self, RetentionError> {
        let mut clients = Vec::with_capacity(size.max(1));
        for _ in 0..size.max(1) {
            let (client, connection) = tokio_postgres::connect(pg_url, NoTls)
                .await
                .map_err(|e| {
                    RetentionError::Config(format!("Failed to connect postgres: {}", e))
                })?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!("postgres connection error: {}", e);
                }
            });
            if let Some(s) = schema {
                client
                    .execute(&format!("SET search_path TO {}", s), &[])
                    .await
                    .map_err(|e| {
                        RetentionError::Config(format!("Failed to set search_path: {}", e))
                    })?;
            }
            let client = Arc::new(client);
            spawn_keepalive(Arc::clone(&client), 240, 420);
            clients.push(client);
        }
        Ok(Self {
            clients,
            next: AtomicUsize::new(0),
        })
    }

    pub fn pick(&self) -> Arc<Client> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len().max(1);
        Arc::clone(&self.clients[idx])
    }
}

/// Postgres 后端：自动提交语句轮询连接池
#[derive(Clone)]
pub struct PgStore {
    pub(crate) pool: Arc<PgPool>,
}

impl PgStore {
    pub async fn connect(
        pg_url: &str,
        schema: &Option<String>,
        pool_size: usize,
    ) -> Result<Self, RetentionError> {
        let pool = PgPool::connect_many(pg_url, schema, pool_size).await?;
        let store = Self {
            pool: Arc::new(pool),
        };

        // init tables
        let client = store.pool.pick();
        client
            .execute(
                r#"CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                created_at TIMESTAMPTZ NOT NULL
            )"#,
                &[],
            )
            .await
            .map_err(|e| RetentionError::Config(format!("Failed to init users: {}", e)))?;

        client
            .execute(
                r#"CREATE TABLE IF NOT EXISTS subscriptions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                monthly_price BIGINT NOT NULL CHECK (monthly_price >= 0),
                status TEXT NOT NULL CHECK (status IN ('active','pending_cancellation','cancelled')),
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )"#,
                &[],
            )
            .await
            .map_err(|e| RetentionError::Config(format!("Failed to init subscriptions: {}", e)))?;
        let _ = client
            .execute(
                "CREATE INDEX IF NOT EXISTS subscriptions_user_id_idx ON subscriptions (user_id)",
                &[],
            )
            .await;

        client
            .execute(
                r#"CREATE TABLE IF NOT EXISTS cancellations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                subscription_id TEXT NOT NULL REFERENCES subscriptions(id) ON DELETE CASCADE,
                downsell_variant TEXT NOT NULL CHECK (downsell_variant IN ('A','B')),
                reason TEXT,
                reason_other TEXT,
                accepted_downsell BOOLEAN NOT NULL DEFAULT FALSE,
                finalized BOOLEAN NOT NULL DEFAULT FALSE,
                decided_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL
            )"#,
                &[],
            )
            .await
            .map_err(|e| RetentionError::Config(format!("Failed to init cancellations: {}", e)))?;
        let _ = client
            .execute(
                "CREATE INDEX IF NOT EXISTS cancellations_subscription_id_idx ON cancellations (subscription_id)",
                &[],
            )
            .await;
        // Ensure there is at most one open case per subscription.
        client
            .execute(
                "CREATE UNIQUE INDEX IF NOT EXISTS cancellations_open_case_uidx ON cancellations (subscription_id) WHERE NOT finalized",
                &[],
            )
            .await
            .map_err(|e| {
                RetentionError::Config(format!("Failed to init cancellations_open_case_uidx: {}", e))
            })?;

        Ok(store)
    }
}

pub(crate) fn is_pg_unique_violation(e: &tokio_postgres::Error) -> bool {
    e.code() == Some(&tokio_postgres::error::SqlState::UNIQUE_VIOLATION)
}

pub(crate) fn is_pg_foreign_key_violation(e: &tokio_postgres::Error) -> bool {
    e.code() == Some(&tokio_postgres::error::SqlState::FOREIGN_KEY_VIOLATION)
}
