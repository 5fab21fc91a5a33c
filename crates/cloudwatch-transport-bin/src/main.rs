// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::sync::Arc;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use cloudwatch_transport::{
    logger::Formatter, record::parse_line, CloudWatchClient, Transport, TransportConfig,
};

#[tokio::main]
pub async fn main() {
    let config = match TransportConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cloudwatch-transport: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", config.log_level);
    let filter = match EnvFilter::try_new(env_filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("cloudwatch-transport: could not parse log level in configuration: {e}");
            std::process::exit(1);
        }
    };

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .event_format(Formatter)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("cloudwatch-transport: setting default subscriber failed: {e}");
    }

    debug!("Logging subsystem enabled");

    let client = match CloudWatchClient::from_config(&config) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Unable to create CloudWatch client: {e}");
            std::process::exit(1);
        }
    };

    let transport = match Transport::start(&config, client).await {
        Ok(transport) => transport,
        Err(e) => {
            error!("Unable to start transport: {e}");
            std::process::exit(1);
        }
    };

    info!(
        "Shipping stdin to log group {} (stream {})",
        config.log_group_name, config.log_stream_name
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut lines = BufReader::new(io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Err(e) = transport.ingest(parse_line(&line)).await {
                        error!("Unable to ingest record: {e}");
                        break;
                    }
                }
                Ok(None) => {
                    debug!("Reached end of input");
                    break;
                }
                Err(e) => {
                    error!("Failed to read from stdin: {e}");
                    break;
                }
            },
            _ = &mut shutdown => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    if let Err(e) = transport.close().await {
        error!("Final flush did not complete: {e}");
    }
}
