//! Monitor configuration, loaded from a single TOML file.
//!
//! Every field has a default tuned for an ELM327-compatible adapter in
//! front of a 16-module pack, so a missing or partial file still yields a
//! working setup.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// The stored-fault clear exchange: an address-select command followed by
/// a fixed request payload, verified against response patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClearFaultConfig {
    /// Header the request is addressed to, as printed by the adapter.
    pub target_header: String,
    /// Request payload: eight space-separated hex bytes.
    pub payload: String,
    /// Pattern that marks the exchange successful: the responder's
    /// address echo followed by the positive-response code.
    pub positive_response: String,
    /// Pattern that marks the exchange rejected by the device.
    pub negative_response: String,
}

impl Default for ClearFaultConfig {
    fn default() -> Self {
        Self {
            target_header: "7E4".into(),
            payload: "03 14 FF 00 55 55 55 55".into(),
            positive_response: "7EC 03 54 FF 00".into(),
            negative_response: "7F 14".into(),
        }
    }
}

/// Top-level monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Adapter setup commands, sent in order at connection time:
    /// reset, echo off, headers on, protocol select, flow-control mode,
    /// flow-control header.
    pub init_commands: Vec<String>,
    /// Pause after the first (reset) init command, in ms, while the
    /// adapter reboots.
    pub settle_delay_ms: u64,
    /// How long a diagnostic command waits for a matching response, in ms.
    pub response_timeout_ms: u64,
    /// Terminator appended to every outgoing command.
    pub line_terminator: String,
    /// Frame address of module 0. Telemetry frames are addressed
    /// `module_base ..= module_base + 15`.
    pub module_base: u16,
    pub clear_fault: ClearFaultConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            init_commands: vec![
                "ATZ".into(),
                "ATE0".into(),
                "ATH1".into(),
                "ATSP6".into(),
                "ATCFC1".into(),
                "ATFCSH7E4".into(),
            ],
            settle_delay_ms: 1000,
            response_timeout_ms: 5000,
            line_terminator: "\r".into(),
            module_base: 0x6F2,
            clear_fault: ClearFaultConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Load from a TOML file. A missing file is not an error: defaults are
    /// returned and a warning logged, matching first-run behaviour.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => {
                toml::from_str(&text).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(Error::Config(format!("{}: {e}", path.display()))),
        }
    }

    pub fn settle_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.settle_delay_ms)
    }

    pub fn response_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.response_timeout_ms)
    }
}
