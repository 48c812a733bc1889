// hci-transport Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Start up and shut down sequencing.

use crate::common::future::{reply_channel, ReplyFuture, Responder};
use crate::{Error, Result, StartupError};
use log::{info, warn};

/// Resolves once the controller is configured, or start up failed. It is
/// never resolved if the engine is shut down first.
pub type StartupFuture = ReplyFuture<std::result::Result<(), StartupError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Starting,
    Ready,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleInput {
    Start,
    Initialized,
    StartupFailed,
    Shutdown,
    Stopped,
}

/// The next state, or `None` when `input` means nothing in `state`.
pub fn transition(state: LifecycleState, input: LifecycleInput) -> Option<LifecycleState> {
    use LifecycleInput as I;
    use LifecycleState as S;

    match (state, input) {
        (S::Idle, I::Start) | (S::Stopped, I::Start) => Some(S::Starting),
        (S::Starting, I::Initialized) => Some(S::Ready),
        // the caller decides whether to retry; until then only shutdown applies
        (S::Starting, I::StartupFailed) => Some(S::Starting),
        (S::Starting, I::Shutdown) | (S::Ready, I::Shutdown) => Some(S::Stopping),
        (S::Stopping, I::Stopped) => Some(S::Stopped),
        _ => None,
    }
}

/// Lifecycle state plus the pending start up reply. Shared between the
/// caller facing [`Engine`](super::Engine) and its worker.
#[derive(Debug)]
pub struct Orchestrator {
    state: LifecycleState,
    startup: Option<Responder<std::result::Result<(), StartupError>>>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Orchestrator {
            state: LifecycleState::Idle,
            startup: None,
        }
    }
}

impl Orchestrator {
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    fn apply(&mut self, input: LifecycleInput) -> bool {
        match transition(self.state, input) {
            Some(next) => {
                if next != self.state {
                    info!("HCI lifecycle {:?} -> {:?}", self.state, next);
                }
                self.state = next;
                true
            }
            None => false,
        }
    }

    pub fn begin_start(&mut self) -> Result<StartupFuture> {
        if !self.apply(LifecycleInput::Start) {
            return Err(Error::AlreadyStarted);
        }
        let (responder, future) = reply_channel();
        self.startup = Some(responder);
        Ok(future)
    }

    /// Resolves the start up reply with success. Returns false when there
    /// was nothing left to resolve, e.g. after a start up timeout.
    pub fn initialization_complete(&mut self) -> bool {
        match self.startup.take() {
            Some(responder) if self.apply(LifecycleInput::Initialized) => {
                responder.resolve(Ok(()));
                true
            }
            startup => {
                self.startup = startup;
                warn!(
                    "Initialization complete while {:?}, ignoring",
                    self.state
                );
                false
            }
        }
    }

    pub fn startup_failed(&mut self, error: StartupError) -> bool {
        match self.startup.take() {
            Some(responder) if self.apply(LifecycleInput::StartupFailed) => {
                warn!("Start up failed: {}", error);
                responder.resolve(Err(error));
                true
            }
            startup => {
                self.startup = startup;
                false
            }
        }
    }

    /// Enters `Stopping`. Returns whether the controller had been brought up,
    /// or `None` if there is nothing to shut down.
    pub fn begin_shutdown(&mut self) -> Option<bool> {
        let was_ready = self.state == LifecycleState::Ready;
        if !self.apply(LifecycleInput::Shutdown) {
            return None;
        }
        // abandoned, not failed
        self.startup = None;
        Some(was_ready)
    }

    pub fn finish_shutdown(&mut self) {
        self.apply(LifecycleInput::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn transitions() {
        use LifecycleInput as I;
        use LifecycleState as S;

        assert_eq!(transition(S::Idle, I::Start), Some(S::Starting));
        assert_eq!(transition(S::Starting, I::Initialized), Some(S::Ready));
        assert_eq!(transition(S::Ready, I::Shutdown), Some(S::Stopping));
        assert_eq!(transition(S::Stopping, I::Stopped), Some(S::Stopped));
        assert_eq!(transition(S::Stopped, I::Start), Some(S::Starting));

        assert_eq!(transition(S::Ready, I::Start), None);
        assert_eq!(transition(S::Stopped, I::Shutdown), None);
        assert_eq!(transition(S::Idle, I::Shutdown), None);
        assert_eq!(transition(S::Ready, I::Initialized), None);
        assert_eq!(transition(S::Stopping, I::Initialized), None);
    }

    #[test]
    fn successful_start() {
        let mut orchestrator = Orchestrator::default();
        let mut startup = orchestrator.begin_start().unwrap();
        assert!(matches!(orchestrator.begin_start(), Err(Error::AlreadyStarted)));
        assert!(orchestrator.initialization_complete());
        assert_eq!(orchestrator.state(), LifecycleState::Ready);
        assert_eq!(startup.try_take(), Some(Ok(())));

        assert_eq!(orchestrator.begin_shutdown(), Some(true));
        orchestrator.finish_shutdown();
        assert_eq!(orchestrator.state(), LifecycleState::Stopped);
        assert_eq!(orchestrator.begin_shutdown(), None);
    }

    #[test]
    fn late_initialization_is_ignored() {
        let mut orchestrator = Orchestrator::default();
        let mut startup = orchestrator.begin_start().unwrap();
        let timeout = StartupError::Timeout(Duration::from_millis(100));
        assert!(orchestrator.startup_failed(timeout.clone()));
        assert_eq!(startup.try_take(), Some(Err(timeout)));

        assert!(!orchestrator.initialization_complete());
        assert_eq!(orchestrator.state(), LifecycleState::Starting);
        assert_eq!(orchestrator.begin_shutdown(), Some(false));
    }

    #[test]
    fn shutdown_abandons_startup() {
        let mut orchestrator = Orchestrator::default();
        let mut startup = orchestrator.begin_start().unwrap();
        assert_eq!(orchestrator.begin_shutdown(), Some(false));
        assert!(!orchestrator.initialization_complete());
        assert_eq!(startup.wait_timeout(Duration::from_millis(20)), None);
    }
}
