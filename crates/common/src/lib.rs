pub mod config;
pub mod error;
pub mod history;
pub mod preferences;
pub mod redis_pool;
pub mod store;
pub mod timer;
pub mod types;
