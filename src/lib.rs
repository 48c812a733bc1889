// hci-transport Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! hci-transport is the host side of a Bluetooth HCI link. It sits between an
//! upper stack (L2CAP, profiles) and a controller reached through a HAL or
//! vendor library.
//!
//! The [`Engine`](engine::Engine) owns a single worker thread that
//!
//! - frames the raw byte stream coming out of the HAL into command, ACL, SCO
//!   and event packets,
//! - paces outbound commands against the credits granted by the controller,
//! - pairs every command with its Command Complete / Command Status event and
//!   reports a fatal error to a [`Supervisor`](api::Supervisor) when the
//!   controller stops answering,
//! - sequences the asynchronous chip bring-up and tear-down.
//!
//! Collaborators (HAL, vendor library, snoop capture, fragmenter) are traits in
//! the [`api`] module so that they can be swapped out, e.g. for tests.
//!
//! # Usage
//!
//! ```no_run
//! use hci_transport::api::{BDAddr, NoopCallbacks, NoSnoop, PassthroughFragmenter};
//! use hci_transport::engine::Engine;
//! # use hci_transport::api::{Hal, Vendor};
//! # fn collaborators() -> (Box<dyn Hal>, std::sync::Arc<dyn Vendor>) { unimplemented!() }
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> hci_transport::Result<()> {
//! let (hal, vendor) = collaborators();
//! let mut engine = Engine::new(hal, vendor, Arc::new(NoSnoop), Box::new(PassthroughFragmenter));
//! let mut startup = engine.start(BDAddr::default(), Arc::new(NoopCallbacks))?;
//! if startup.wait_timeout(Duration::from_secs(10)) == Some(Ok(())) {
//!     // the controller is configured, start sending commands
//! }
//! engine.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod engine;
pub mod inject;
pub mod protocol;

mod common;

pub use common::future::{ReplyFuture, Responder};

use std::result;
use std::time::Duration;

/// The main error type returned by most methods in hci-transport.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Vendor library failed to open: {0}")]
    VendorOpen(String),

    #[error("HAL failed to open: {0}")]
    HalOpen(String),

    #[error("The engine is already started")]
    AlreadyStarted,

    #[error("The engine is not running")]
    NotRunning,

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("The worker thread panicked")]
    WorkerPanicked,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{}", _0)]
    Other(String),
}

/// Convenience type for a result using the hci-transport [`Error`] type.
pub type Result<T> = result::Result<T, Error>;

/// An unrecoverable transport failure. The controller link is considered
/// desynchronized and the engine must not be used any further.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FatalEngineError {
    #[error("No response to command 0x{opcode:04x} after {elapsed:?}")]
    CommandTimeout { opcode: u16, elapsed: Duration },
}

/// Why a [`StartupFuture`](engine::StartupFuture) resolved as failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartupError {
    #[error("Controller initialization did not complete within {0:?}")]
    Timeout(Duration),

    #[error("Controller reported a failed initialization")]
    InitializationFailed,

    #[error("HAL failed to open: {0}")]
    HalOpen(String),
}
