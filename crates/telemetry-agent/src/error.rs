// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use stream_receiver::ReceiverError;

/// Errors that stop the agent from running
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to start receiver: {0}")]
    ReceiverStart(#[from] ReceiverError),
}
