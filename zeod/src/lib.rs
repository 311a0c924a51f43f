pub mod client;
pub mod commit_lock;
pub mod conf;
pub mod error;
pub mod invalidation;
pub mod monitor;
pub mod registry;
pub mod server;
pub mod session;
pub mod stats;
pub mod timeout;
pub mod wire;
