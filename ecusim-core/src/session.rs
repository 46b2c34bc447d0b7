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

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Time a non-default diagnostic session stays alive without a `reset()`.
pub const SESSION_TIME: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdsSession {
    Default,
    Programming,
    Extended,
}

impl UdsSession {
    #[must_use]
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0x01 => Some(UdsSession::Default),
            0x02 => Some(UdsSession::Programming),
            0x03 => Some(UdsSession::Extended),
            _ => None,
        }
    }

    #[must_use]
    pub fn id(self) -> u8 {
        match self {
            UdsSession::Default => 0x01,
            UdsSession::Programming => 0x02,
            UdsSession::Extended => 0x03,
        }
    }

    /// Name of the session specific description sub-table, `None` for the
    /// default session.
    #[must_use]
    pub fn table_name(self) -> Option<&'static str> {
        match self {
            UdsSession::Default => None,
            UdsSession::Programming => Some("Programming"),
            UdsSession::Extended => Some("Extended"),
        }
    }
}

#[derive(Debug)]
struct State {
    session: UdsSession,
    deadline: Option<Instant>,
    epoch: u64,
}

/// Current UDS diagnostic session of one simulated ECU.
///
/// Programming and Extended arm a deadline; once it passes without a
/// `reset()` the session reads as Default again. The deadline is evaluated
/// on access, so no timer task is needed. Writes happen only on the UDS
/// responder task, reads never block beyond the short state lock.
#[derive(Debug)]
pub struct SessionController {
    state: Mutex<State>,
    timeout: Duration,
}

impl Default for SessionController {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionController {
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeout(SESSION_TIME)
    }

    /// Timeout override for tests.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        SessionController {
            state: Mutex::new(State {
                session: UdsSession::Default,
                deadline: None,
                epoch: 0,
            }),
            timeout,
        }
    }

    #[must_use]
    pub fn current(&self) -> UdsSession {
        let mut state = self.state.lock();
        if let Some(deadline) = state.deadline {
            if Instant::now() >= deadline {
                state.session = UdsSession::Default;
                state.deadline = None;
                state.epoch += 1;
            }
        }
        state.session
    }

    pub fn set_current(&self, session: UdsSession) {
        let mut state = self.state.lock();
        state.session = session;
        state.deadline = match session {
            UdsSession::Default => None,
            _ => Some(Instant::now() + self.timeout),
        };
        state.epoch += 1;
    }

    /// Rearm the expiry deadline without changing the session. Called after
    /// a successful UDS exchange.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if state.deadline.is_some() {
            state.deadline = Some(Instant::now() + self.timeout);
            state.epoch += 1;
        }
    }

    /// Number of session transitions and rearms so far.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }
}
