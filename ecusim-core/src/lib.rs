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

//! Core of the ECU simulator: the request pattern index, the scripted ECU
//! abstraction with its callable bridge, and the UDS session state.

pub mod pattern;
pub mod script;
pub mod session;

pub use pattern::{PatternError, PatternTrie};
pub use script::{
    CallableRegistry, J1939PgnData, ResponseRef, ScriptApi, ScriptCallable, ScriptedEcu,
};
pub use session::{SessionController, UdsSession, SESSION_TIME};
