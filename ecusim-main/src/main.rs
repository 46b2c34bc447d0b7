/*
 * Copyright (c) 2026 The Contributors to Eclipse OpenSOVD (see CONTRIBUTORS)
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use clap::Parser;
use ecusim_core::CallableRegistry;
use ecusim_main::{config::configfile::Configuration, shutdown_signal, AppError};
use futures::future::FutureExt;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(version, about = "Multi-protocol ECU simulator", long_about = None)]
struct AppArgs {
    /// CAN device to bind (e.g. vcan0); omit to run DoIP only
    device: Option<String>,

    #[arg(short, long)]
    configs_path: Option<String>,

    #[arg(long)]
    log_filter: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let args = AppArgs::parse();
    let mut config = ecusim_main::config::load_config().unwrap_or_else(|e| {
        println!("Failed to load configuration: {e}");
        println!("Using default values");
        ecusim_main::config::default_config()
    });
    args.update_config(&mut config);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.logging.filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    tracing::info!("Starting ECU simulator...");

    let shutdown = shutdown_signal().shared();
    ecusim_main::run(config, CallableRegistry::new(), shutdown).await
}

impl AppArgs {
    fn update_config(self, config: &mut Configuration) {
        if let Some(device) = self.device {
            config.can_device = Some(device);
        }
        if let Some(configs_path) = self.configs_path {
            config.configs_path = configs_path;
        }
        if let Some(log_filter) = self.log_filter {
            config.logging.filter = log_filter;
        }
    }
}
