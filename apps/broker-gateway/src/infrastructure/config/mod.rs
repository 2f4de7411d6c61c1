//! Configuration Module
//!
//! Configuration loading for the gateway binary.

mod settings;

pub use settings::{
    BrokerSettings, CheckpointSettings, ConfigError, Environment, GatewayConfig, PipelineSettings,
    ServerSettings, SessionTimings,
};
