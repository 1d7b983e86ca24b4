pub mod config;
pub mod messaging;
pub mod metrics;
pub mod outbox;
pub mod persistence;
pub mod rpc;
pub mod saga;
pub mod utils;
