// hci-transport Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Engine tunables.

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "serde")]
use serde_cr as serde;

pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 8000;
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_EPILOG_TIMEOUT_MS: u64 = 3000;

/// Startup timeouts below this are treated as misconfiguration.
pub const MIN_STARTUP_TIMEOUT_MS: u64 = 100;

/// Port the HCI inject server conventionally listens on.
pub const DEFAULT_INJECT_PORT: u16 = 8873;

#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr", default)
)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long `start` waits for the controller to finish initialization.
    pub startup_timeout_ms: u64,
    /// How long the oldest outstanding command may go unanswered before the
    /// link is declared dead.
    pub command_timeout_ms: u64,
    /// How long shutdown waits for the vendor epilog.
    pub epilog_timeout_ms: u64,
    /// Enables the HCI inject server on this local port.
    pub inject_port: Option<u16>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            epilog_timeout_ms: DEFAULT_EPILOG_TIMEOUT_MS,
            inject_port: None,
        }
    }
}

impl EngineConfig {
    pub fn startup_timeout(&self) -> Duration {
        if self.startup_timeout_ms < MIN_STARTUP_TIMEOUT_MS {
            Duration::from_millis(DEFAULT_STARTUP_TIMEOUT_MS)
        } else {
            Duration::from_millis(self.startup_timeout_ms)
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn epilog_timeout(&self) -> Duration {
        Duration::from_millis(self.epilog_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_startup_timeout_falls_back() {
        let config = EngineConfig {
            startup_timeout_ms: 20,
            ..Default::default()
        };
        assert_eq!(config.startup_timeout(), Duration::from_secs(8));

        let config = EngineConfig {
            startup_timeout_ms: 100,
            ..Default::default()
        };
        assert_eq!(config.startup_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.command_timeout(), Duration::from_secs(2));
        assert_eq!(config.epilog_timeout(), Duration::from_secs(3));
        assert_eq!(config.inject_port, None);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn deserialize_partial() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "command_timeout_ms": 500, "inject_port": 8873 }"#).unwrap();
        assert_eq!(config.command_timeout(), Duration::from_millis(500));
        assert_eq!(config.inject_port, Some(DEFAULT_INJECT_PORT));
        assert_eq!(config.startup_timeout_ms, DEFAULT_STARTUP_TIMEOUT_MS);
    }
}
