//! Channel relay: mirrors chat messages between linked channels, translated,
//! under the original author's identity.

pub mod circuit_breaker;
pub mod config;
pub mod discord;
pub mod error;
pub mod events;
pub mod filter;
pub mod links;
pub mod metrics;
pub mod pipeline;
pub mod quota;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;
pub mod security;
pub mod server;
pub mod shaper;
pub mod translate;

pub use config::Config;
pub use error::DropReason;
pub use pipeline::{RelayDeps, RelayOutcome, RelayPipeline};
