// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::time::Duration;

use stream_receiver::config::{
    DEFAULT_ADDRESS, DEFAULT_MAX_BUFFER_SIZE, DEFAULT_MAX_BUFFER_TIMEOUT, DEFAULT_SWEEP_INTERVAL,
};
use stream_receiver::{BufferPolicy, ListenerConfig, Protocol};

use crate::error::AgentError;

pub const DEFAULT_RECEIVER_PORT: u16 = 5140;

/// Configuration for the telemetry agent, read from `TELEMETRY_*` environment variables
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
    /// Port shared by every receiver socket
    pub port: u16,
    pub address: String,
    /// Protocol names as configured, validated against the known protocols
    pub protocols: Vec<String>,
    pub max_buffer_size: usize,
    pub max_buffer_timeout: Duration,
    pub sweep_interval: Duration,
    /// Whether raw chunks are forwarded next to parsed messages
    pub raw_data_forwarding: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            port: DEFAULT_RECEIVER_PORT,
            address: DEFAULT_ADDRESS.to_string(),
            protocols: Protocol::ALL.iter().map(ToString::to_string).collect(),
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            max_buffer_timeout: DEFAULT_MAX_BUFFER_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            raw_data_forwarding: false,
        }
    }
}

impl AgentConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, AgentError> {
        let defaults = Self::default();

        let log_level = env::var("TELEMETRY_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or(defaults.log_level);
        let port = env::var("TELEMETRY_RECEIVER_PORT")
            .ok()
            .and_then(|port| port.parse::<u16>().ok())
            .unwrap_or(defaults.port);
        let address = env::var("TELEMETRY_RECEIVER_ADDRESS").unwrap_or(defaults.address);
        let protocols = env::var("TELEMETRY_RECEIVER_PROTOCOLS")
            .map(|val| parse_protocol_list(&val))
            .unwrap_or(defaults.protocols);
        let max_buffer_size = env::var("TELEMETRY_MAX_BUFFER_SIZE")
            .ok()
            .and_then(|size| size.parse::<usize>().ok())
            .unwrap_or(defaults.max_buffer_size);
        let max_buffer_timeout = env::var("TELEMETRY_MAX_BUFFER_TIMEOUT_MS")
            .ok()
            .and_then(|ms| ms.parse::<u64>().ok())
            .map_or(defaults.max_buffer_timeout, Duration::from_millis);
        let sweep_interval = env::var("TELEMETRY_SWEEP_INTERVAL_MS")
            .ok()
            .and_then(|ms| ms.parse::<u64>().ok())
            .map_or(defaults.sweep_interval, Duration::from_millis);
        let raw_data_forwarding = env::var("TELEMETRY_RAW_DATA_FORWARDING")
            .map(|val| val.to_lowercase() == "true")
            .unwrap_or(defaults.raw_data_forwarding);

        let config = Self {
            log_level,
            port,
            address,
            protocols,
            max_buffer_size,
            max_buffer_timeout,
            sweep_interval,
            raw_data_forwarding,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.port == 0 {
            return Err(AgentError::InvalidConfig(
                "Receiver port must be greater than 0".to_string(),
            ));
        }

        if self.protocols.is_empty() {
            return Err(AgentError::InvalidConfig(
                "TELEMETRY_RECEIVER_PROTOCOLS cannot be empty".to_string(),
            ));
        }
        let listener = self.listener_config();
        let protocols = listener
            .parsed_protocols()
            .map_err(|e| AgentError::InvalidConfig(e.to_string()))?;
        for protocol in protocols {
            listener
                .bind_address(protocol)
                .map_err(|e| AgentError::InvalidConfig(e.to_string()))?;
        }

        if self.max_buffer_size == 0 {
            return Err(AgentError::InvalidConfig(
                "Max buffer size must be greater than 0".to_string(),
            ));
        }

        if self.max_buffer_timeout.is_zero() || self.sweep_interval.is_zero() {
            return Err(AgentError::InvalidConfig(
                "Buffer timeout and sweep interval must be greater than 0".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(AgentError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig::new(self.port)
            .with_address(self.address.clone())
            .with_protocols(self.protocols.iter().cloned())
    }

    #[must_use]
    pub fn buffer_policy(&self) -> BufferPolicy {
        BufferPolicy {
            max_buffer_size: self.max_buffer_size,
            max_buffer_timeout: self.max_buffer_timeout,
            sweep_interval: self.sweep_interval,
        }
    }
}

fn parse_protocol_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|protocol| !protocol.is_empty())
        .map(str::to_lowercase)
        .collect()
}
