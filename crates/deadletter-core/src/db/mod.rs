//! Database layer for deadletter
//!
//! Provides connections to PostgreSQL (dead-letter storage) and Redis
//! (alarm notification channel).

mod postgres;
mod redis;

pub use postgres::PostgresPool;
pub use self::redis::RedisPool;
