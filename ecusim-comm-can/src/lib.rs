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

//! CAN transports of the simulator: UDS over ISO-TP and SAE J1939.

pub mod isotp;
pub mod j1939;
pub mod uds;

pub use isotp::IsoTpChannel;
pub use j1939::J1939Simulation;
pub use uds::{UdsResponder, UdsSimulation};
