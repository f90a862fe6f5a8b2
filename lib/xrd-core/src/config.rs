// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed configuration surface. File-format parsing is out of scope; this
//! is the struct a binary fills in from argv/env and passes to the
//! orchestrator.

use std::net::SocketAddr;

use xrd_auth::Key;

/// Everything a tunable named in the data model maps to, with defaults
/// matching each component crate's own default.
#[derive(Clone)]
pub struct Config {
    /// Must equal [`xrd_ring::SLOT_COUNT`]; the ring's slot count is fixed
    /// by the hardware FIFO depth it mirrors, not runtime-configurable, so
    /// this field exists to be validated against that constant rather
    /// than to change it.
    pub ring_capacity: usize,
    /// Reassembly table eviction timeout.
    pub reassembly_timeout_ns: u64,
    /// Transport fragment payload size in bytes; `0` selects
    /// [`xrd_transport::MAX_PAYLOAD_BYTES`].
    pub fragment_payload_size: usize,
    /// Must equal [`xrd_fsm::MAX_RETRIES`]; the FSM's retry ceiling is a
    /// fixed bound per spec, validated here rather than overridden.
    pub retry_ceiling: u8,
    /// Bound on distinct command sources tracked by the replay guard.
    pub max_clients: usize,
    /// Address the detector binds its frame-transport socket to.
    pub detector_frame_bind: SocketAddr,
    /// Address the detector binds its command socket to.
    pub detector_command_bind: SocketAddr,
    /// Address the hostd binary binds to receive frame fragments.
    pub hostd_bind: SocketAddr,
    /// Pre-shared HMAC key authenticating the command protocol.
    pub hmac_key: Key,
}

/// A config value that cannot be honored because it disagrees with a
/// compile-time-fixed bound in one of the component crates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    RingCapacity { configured: usize, fixed: usize },
    RetryCeiling { configured: u8, fixed: u8 },
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConfigError::RingCapacity { configured, fixed } => write!(
                f,
                "configured ring_capacity {configured} does not match the fixed slot count {fixed}"
            ),
            ConfigError::RetryCeiling { configured, fixed } => write!(
                f,
                "configured retry_ceiling {configured} does not match the fixed retry bound {fixed}"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Builds a config with every default named in the data model, for a
    /// key the caller must still supply (there is no sane default key).
    pub fn with_key(hmac_key: Key) -> Self {
        Self {
            ring_capacity: xrd_ring::SLOT_COUNT,
            reassembly_timeout_ns: 500_000_000,
            fragment_payload_size: 0,
            retry_ceiling: xrd_fsm::MAX_RETRIES,
            max_clients: xrd_command::DEFAULT_MAX_CLIENTS,
            detector_frame_bind: "0.0.0.0:47100".parse().unwrap(),
            detector_command_bind: "0.0.0.0:47101".parse().unwrap(),
            hostd_bind: "0.0.0.0:47100".parse().unwrap(),
            hmac_key,
        }
    }

    /// Checks the fields that name a compile-time-fixed bound against that
    /// bound, catching a misconfigured deployment before any socket binds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_capacity != xrd_ring::SLOT_COUNT {
            return Err(ConfigError::RingCapacity {
                configured: self.ring_capacity,
                fixed: xrd_ring::SLOT_COUNT,
            });
        }
        if self.retry_ceiling != xrd_fsm::MAX_RETRIES {
            return Err(ConfigError::RetryCeiling {
                configured: self.retry_ceiling,
                fixed: xrd_fsm::MAX_RETRIES,
            });
        }
        Ok(())
    }
}
