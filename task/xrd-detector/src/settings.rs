// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Argv/env settings for the detector binary. Parsing a configuration
//! *file* is explicitly out of scope (§1); this is the thin layer that
//! turns `--flag value` pairs and one environment variable into the typed
//! [`xrd_core::Config`] fields this binary needs before it can bind a
//! socket.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use xrd_auth::Key;

pub struct Settings {
    pub frame_bind: SocketAddr,
    pub command_bind: SocketAddr,
    pub stream_to: Option<SocketAddr>,
    pub hmac_key: Key,
    pub virtual_channel: u8,
    pub rows: u16,
    pub cols: u16,
    pub bit_depth: u8,
    pub frame_interval: Duration,
    pub fragment_payload_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            frame_bind: "0.0.0.0:47100".parse().unwrap(),
            command_bind: "0.0.0.0:47101".parse().unwrap(),
            stream_to: None,
            hmac_key: Key::new([0u8; 32]),
            virtual_channel: 0,
            rows: 256,
            cols: 256,
            bit_depth: 16,
            frame_interval: Duration::from_millis(200),
            fragment_payload_size: 0,
        }
    }
}

impl Settings {
    /// Reads `XRD_HMAC_KEY` (64 hex characters) for the pre-shared key, then
    /// overlays `--flag value` pairs from `args`. An unset `XRD_HMAC_KEY`
    /// falls back to an all-zero demo key with a loud warning: fine for
    /// exercising the protocol locally, never for anything reachable.
    pub fn from_env_and_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        let mut settings = Self::default();

        if let Ok(hex_key) = std::env::var("XRD_HMAC_KEY") {
            settings.hmac_key = parse_hex_key(&hex_key)?;
        } else {
            log::warn!("XRD_HMAC_KEY not set; using an all-zero demo key");
        }

        while let Some(flag) = args.next() {
            let mut value = || args.next().with_context(|| format!("{flag} requires a value"));
            match flag.as_str() {
                "--frame-bind" => settings.frame_bind = value()?.parse()?,
                "--command-bind" => settings.command_bind = value()?.parse()?,
                "--stream-to" => settings.stream_to = Some(value()?.parse()?),
                "--vc" => settings.virtual_channel = value()?.parse()?,
                "--rows" => settings.rows = value()?.parse()?,
                "--cols" => settings.cols = value()?.parse()?,
                "--bit-depth" => settings.bit_depth = value()?.parse()?,
                "--frame-interval-ms" => settings.frame_interval = Duration::from_millis(value()?.parse()?),
                "--fragment-payload-size" => settings.fragment_payload_size = value()?.parse()?,
                other => bail!("unrecognized flag {other}"),
            }
        }

        Ok(settings)
    }
}

fn parse_hex_key(hex: &str) -> anyhow::Result<Key> {
    if hex.len() != 64 {
        bail!("XRD_HMAC_KEY must be exactly 64 hex characters (32 bytes), got {}", hex.len());
    }
    let mut bytes = [0u8; 32];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let pair = std::str::from_utf8(chunk)?;
        bytes[i] = u8::from_str_radix(pair, 16).with_context(|| format!("invalid hex byte {pair:?}"))?;
    }
    Ok(Key::new(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags_over_defaults() {
        let settings = Settings::from_env_and_args(
            ["--rows", "512", "--cols", "512", "--bit-depth", "14"]
                .into_iter()
                .map(String::from),
        )
        .unwrap();
        assert_eq!(settings.rows, 512);
        assert_eq!(settings.cols, 512);
        assert_eq!(settings.bit_depth, 14);
    }

    #[test]
    fn rejects_unknown_flag() {
        let result = Settings::from_env_and_args(["--bogus"].into_iter().map(String::from));
        assert!(result.is_err());
    }

    #[test]
    fn hex_key_round_trips_to_bytes() {
        let key = parse_hex_key(&"ab".repeat(32)).unwrap();
        assert!(format!("{key:?}").contains("redacted"));
    }
}
