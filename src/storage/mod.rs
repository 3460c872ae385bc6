pub mod database;
pub mod time;

mod database_cancellations;
mod database_subscriptions;
mod database_users;

pub mod postgres_store;
mod postgres_cancellations;
mod postgres_subscriptions;
mod postgres_users;

pub use database::Database;
pub use postgres_store::PgStore;
