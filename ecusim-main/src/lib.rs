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

//! Simulator supervisor: loads the configured ECU descriptions, starts the
//! per transport responders and coordinates shutdown.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::signal;

use ecusim_comm_can::{J1939Simulation, UdsSimulation};
use ecusim_comm_doip::{DoipGateway, DoipServerConfig, RunningGateway};
use ecusim_core::script::description::EcuDescription;
use ecusim_core::{CallableRegistry, ScriptedEcu};
use ecusim_interfaces::SimulationError;

pub mod config;

use config::configfile::Configuration;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("configuration error: {0}")]
    ConfigurationError(String),
    #[error("initialization failed: {0}")]
    InitError(String),
}

impl From<SimulationError> for AppError {
    fn from(value: SimulationError) -> Self {
        match value {
            SimulationError::Configuration(msg) => AppError::ConfigurationError(msg),
            other => AppError::InitError(other.to_string()),
        }
    }
}

/// Everything the supervisor has running; joined on shutdown.
struct Running {
    active: Arc<AtomicBool>,
    uds: Vec<UdsSimulation>,
    j1939: Vec<J1939Simulation>,
    gateway: Option<RunningGateway>,
}

/// Load every description in the configured directory and run the simulator
/// until `shutdown` resolves.
///
/// Per-ECU failures (unreadable description, socket failure of one
/// responder) are logged and skipped; only an empty simulation or an
/// unusable configuration directory is fatal.
///
/// # Errors
/// `AppError` when nothing could be started.
pub async fn run<F>(
    configuration: Configuration,
    registry: CallableRegistry,
    shutdown: F,
) -> Result<(), AppError>
where
    F: Future<Output = ()> + Clone + Send + 'static,
{
    let running = start(&configuration, &registry, shutdown.clone()).await?;

    tracing::info!("simulator running");
    shutdown.await;
    tracing::info!("shutting down");

    running.active.store(false, Ordering::SeqCst);
    if let Some(gateway) = &running.gateway {
        gateway.handle().trigger_disconnection();
    }
    for sim in running.uds {
        sim.join().await;
    }
    for sim in running.j1939 {
        sim.join().await;
    }
    if let Some(gateway) = running.gateway {
        gateway.join().await;
    }
    tracing::info!("simulator stopped");
    Ok(())
}

async fn start<F>(
    configuration: &Configuration,
    registry: &CallableRegistry,
    shutdown: F,
) -> Result<Running, AppError>
where
    F: Future<Output = ()> + Clone + Send + 'static,
{
    let configs_dir = Path::new(&configuration.configs_path);
    let description_files = description_files(configs_dir, &configuration.gateway_file)
        .map_err(AppError::ConfigurationError)?;

    let mut gateway = load_gateway(configs_dir, &configuration.gateway_file);
    let gateway_handle = gateway.as_ref().map(DoipGateway::handle);

    let device = configuration
        .can_device
        .as_deref()
        .filter(|device| !device.is_empty());
    match device {
        Some(device) => tracing::info!(device, "CAN transports enabled"),
        None => tracing::info!("no CAN device configured, DoIP only"),
    }

    let active = Arc::new(AtomicBool::new(true));
    let mut uds = Vec::new();
    let mut j1939 = Vec::new();
    let mut doip_count = 0usize;

    for path in description_files {
        let description = match EcuDescription::load(&path) {
            Ok(description) => description,
            Err(e) => {
                tracing::error!(file = %path.display(), error = %e, "skipping ECU description");
                continue;
            }
        };
        tracing::info!(ecu = %description.name, file = %path.display(), "loaded ECU description");
        let ecu = Arc::new(ScriptedEcu::from_description(
            description,
            registry,
            configuration.compat.shared_hash_buffer,
        ));

        if let Some(device) = device {
            if ecu.has_uds() {
                match UdsSimulation::start(device, Arc::clone(&ecu), Arc::clone(&active)) {
                    Ok(sim) => uds.push(sim),
                    Err(e) => {
                        tracing::error!(ecu = %ecu.name(), error = %e, "UDS simulation failed to start");
                    }
                }
            }
            if ecu.j1939_source_address().is_some() {
                match J1939Simulation::start(device, Arc::clone(&ecu), Arc::clone(&active)) {
                    Ok(sim) => j1939.push(sim),
                    Err(e) => {
                        tracing::error!(ecu = %ecu.name(), error = %e, "J1939 simulation failed to start");
                    }
                }
            }
        }

        if let Some(logical_address) = ecu.doip_logical_address() {
            match (gateway.as_mut(), gateway_handle.as_ref()) {
                (Some(gateway), Some(handle)) => {
                    ecu.register_gateway(handle.clone());
                    gateway.register_ecu(logical_address, Arc::clone(&ecu));
                    doip_count += 1;
                }
                _ => tracing::warn!(
                    ecu = %ecu.name(),
                    "DoIP logical address configured but no gateway document found"
                ),
            }
        }
    }

    let gateway = match gateway {
        Some(gateway) => match gateway.start(shutdown).await {
            Ok(running) => Some(running),
            Err(e) => {
                tracing::error!(error = %e, "DoIP gateway failed to start");
                None
            }
        },
        None => None,
    };

    if uds.is_empty() && j1939.is_empty() && gateway.is_none() {
        return Err(AppError::InitError(
            "no responder could be started, check the configuration directory".to_owned(),
        ));
    }
    tracing::info!(
        uds_count = uds.len(),
        j1939_count = j1939.len(),
        doip_count,
        "simulation started"
    );

    Ok(Running {
        active,
        uds,
        j1939,
        gateway,
    })
}

/// ECU description files in the configuration directory, sorted by name.
/// The gateway document and the simulator's own configuration are not ECU
/// descriptions.
fn description_files(dir: &Path, gateway_file: &str) -> Result<Vec<PathBuf>, String> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| format!("cannot read configuration directory {}: {e}", dir.display()))?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| {
            let path = entry.ok()?.path();
            if !path.is_file() || path.extension().is_none_or(|ext| ext != "toml") {
                return None;
            }
            let file_name = path.file_name()?.to_str()?;
            if file_name == gateway_file || file_name == "ecusim.toml" {
                return None;
            }
            Some(path)
        })
        .collect();
    files.sort();
    Ok(files)
}

fn load_gateway(dir: &Path, gateway_file: &str) -> Option<DoipGateway<ScriptedEcu>> {
    let path = dir.join(gateway_file);
    if !path.exists() {
        tracing::info!(file = %path.display(), "no gateway document, DoIP disabled");
        return None;
    }
    match DoipServerConfig::load(&path) {
        Ok(config) => Some(DoipGateway::new(config)),
        Err(e) => {
            tracing::error!(file = %path.display(), error = %e, "invalid gateway document, DoIP disabled");
            None
        }
    }
}

/// Waits for a shutdown signal, such as Ctrl+C or SIGTERM (on unix).
/// # Panics
/// * If subscribing to the signals fails.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_files_skips_reserved_names() {
        let dir = std::env::temp_dir().join(format!(
            "ecusim-test-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["pcm.toml", "ecm.toml", "doipserver.toml", "ecusim.toml", "notes.txt"] {
            std::fs::write(dir.join(name), "").unwrap();
        }

        let files = description_files(&dir, "doipserver.toml").unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_owned())
            .collect();
        assert_eq!(names, vec!["ecm.toml", "pcm.toml"]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_directory_is_fatal() {
        assert!(description_files(Path::new("/nonexistent/ecusim"), "doipserver.toml").is_err());
    }
}
