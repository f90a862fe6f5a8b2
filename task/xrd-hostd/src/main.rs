// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The host-side binary: receives UDP frame fragments, reassembles them
//! through [`xrd_core::HostCore`], and logs completed frames. Writing the
//! pixel data out as TIFF/RAW is explicitly out of scope (§1); this binary
//! is the seam a real image pipeline would hang off `HostCore::ingest`'s
//! return value.

mod settings;

use std::time::Duration;

use xrd_core::traits::{Clock, SystemClock};
use xrd_core::HostCore;

use settings::Settings;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let settings = Settings::from_args(std::env::args().skip(1))?;

    let socket = std::net::UdpSocket::bind(settings.bind)?;
    socket.set_read_timeout(Some(settings.cleanup_interval))?;
    log::info!("xrd-hostd listening for frame fragments on {}", settings.bind);

    let clock = SystemClock;
    let mut core = HostCore::new(settings.reassembly_timeout.as_nanos() as u64);
    let mut last_cleanup = clock.now_ns();
    let mut buf = vec![0u8; xrd_transport::MAX_PAYLOAD_BYTES + 64];

    loop {
        match socket.recv_from(&mut buf) {
            Ok((n, source)) => {
                let now_ns = clock.now_ns();
                if let Some(frame) = core.ingest(source, &buf[..n], now_ns) {
                    log::info!(
                        "frame {} complete from {source}: {}x{} @ {} bits{}",
                        frame.frame_id,
                        frame.matrix.rows(),
                        frame.matrix.cols(),
                        frame.matrix.bit_depth(),
                        if frame.gap_filled { " (gap-filled)" } else { "" },
                    );
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock || err.kind() == std::io::ErrorKind::TimedOut => {}
            Err(err) => return Err(err.into()),
        }

        let now_ns = clock.now_ns();
        if Duration::from_nanos(now_ns.saturating_sub(last_cleanup)) >= settings.cleanup_interval {
            let evicted = core.cleanup_expired(now_ns);
            if evicted > 0 {
                log::debug!("reassembly cleanup evicted {evicted} stale slot(s)");
            }
            last_cleanup = now_ns;
        }
    }
}
