pub mod config;
pub mod health;
pub mod logging;
pub mod normalize;
pub mod rate_limit;
pub mod record;
pub mod server;
pub mod storage;
