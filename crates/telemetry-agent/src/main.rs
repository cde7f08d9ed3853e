// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, info_span, Instrument};
use tracing_subscriber::EnvFilter;

use stream_receiver::clock::SystemClock;
use stream_receiver::{Receiver, ReceiverEvent};

mod config;
mod error;
mod logger;

use config::AgentConfig;
use error::AgentError;

#[tokio::main]
pub async fn main() {
    let config = AgentConfig::from_env();
    let log_level = config
        .as_ref()
        .map_or("info", |config| config.log_level.as_str())
        .to_string();

    let env_filter = EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .event_format(logger::Formatter)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("{}. Shutting down telemetry agent.", e);
            return;
        }
    };

    let span = info_span!("receiver", port = config.port);
    if let Err(e) = run(config).instrument(span).await {
        error!("{}", e);
    }
}

async fn run(config: AgentConfig) -> Result<(), AgentError> {
    let (receiver, events) = Receiver::with_policy(
        config.listener_config(),
        config.buffer_policy(),
        Arc::new(SystemClock),
    );
    if config.raw_data_forwarding {
        receiver.enable_raw_data_forwarding();
    }

    let mut status = receiver.status_receiver();
    tokio::spawn(async move {
        while let Ok(state) = status.recv().await {
            debug!("Receiver is now {:?}", state);
        }
    });

    receiver.start().await?;
    info!(
        "Telemetry agent receiving on port {} ({})",
        config.port,
        config.protocols.join(", ")
    );

    let consumer = tokio::spawn(consume(events).instrument(info_span!("consumer")));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down telemetry agent");

    receiver.stop().await;
    // the event channel closes once the receiver is gone
    drop(receiver);
    match consumer.await {
        Ok(count) => info!("Received {} messages", count),
        Err(e) => error!("Message consumer failed: {}", e),
    }
    Ok(())
}

async fn consume(mut events: UnboundedReceiver<ReceiverEvent>) -> u64 {
    let mut count = 0;
    while let Some(event) = events.recv().await {
        match event {
            ReceiverEvent::Messages(batch) => {
                for message in batch.messages {
                    count += 1;
                    info!("{}: {}", batch.sender, message);
                }
            }
            ReceiverEvent::RawData(envelope) => {
                debug!(
                    "Raw chunk of {} bytes from {}",
                    envelope.data.len(),
                    envelope.sender_key
                );
            }
        }
    }
    count
}
