//! trainrelay - training job launcher with progress relayed over a pub/sub broker
//!
//! A training run publishes fixed status lines to a broker channel before and
//! after its external process, reports heartbeats to a Pushgateway, and can be
//! followed later through the channel history. The crate also ships a small
//! development broker speaking the same WebSocket protocol.

pub mod auth;
pub mod channels;
pub mod config;
pub mod jobs;
pub mod plugin;
pub mod relay;
pub mod runtime;
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod transfer;

pub use auth::{IssuePolicy, TokenIssuer, TokenVerifier};
pub use channels::{Channel, ChannelPattern};
pub use config::AppConfig;
pub use jobs::{ExternalCommand, JobHandle, JobOutcome, JobRunner, JobState};
pub use plugin::{CommandRequest, CommandResponse, Plugin};
pub use relay::{fetch_logs, LogRelay};
pub use server::RelayServer;
