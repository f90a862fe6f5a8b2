// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Argv settings for the host-side binary: where to listen, and how long a
//! partially-received frame is allowed to sit before it's timed out and
//! evicted. Parsing a configuration file is out of scope, same as on the
//! detector side.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};

pub struct Settings {
    pub bind: SocketAddr,
    pub reassembly_timeout: Duration,
    pub cleanup_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:47100".parse().unwrap(),
            reassembly_timeout: Duration::from_millis(500),
            cleanup_interval: Duration::from_millis(250),
        }
    }
}

impl Settings {
    pub fn from_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        let mut settings = Self::default();
        while let Some(flag) = args.next() {
            let mut value = || args.next().with_context(|| format!("{flag} requires a value"));
            match flag.as_str() {
                "--bind" => settings.bind = value()?.parse()?,
                "--reassembly-timeout-ms" => {
                    settings.reassembly_timeout = Duration::from_millis(value()?.parse()?)
                }
                "--cleanup-interval-ms" => {
                    settings.cleanup_interval = Duration::from_millis(value()?.parse()?)
                }
                other => bail!("unrecognized flag {other}"),
            }
        }
        Ok(settings)
    }
}
