pub mod alert;
pub mod database;
pub mod health;
pub mod memory;
pub mod providers;
pub mod rate_limiter;
pub mod redis;
pub mod store;
