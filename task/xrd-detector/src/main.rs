// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The SoC-resident detector binary: runs the CSI-2 producer, the UDP
//! frame-transport consumer, and the command-handling loop described in
//! §5, each on its own `std::thread`, sharing one [`DetectorCore`] behind a
//! `Mutex`. Daemonization, privilege drop, syslog wiring, and config-file
//! parsing are all out of scope (§1); this binary takes its settings from
//! argv/env and logs through `env_logger`, matching `debug-net-client`.

mod settings;
mod spi;
mod synthetic;

use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use xrd_core::traits::{Clock, Csi2Source};
use xrd_core::{Config, DetectorCore, SpiControlCallback, SystemClock};
use xrd_fsm::ScanFsm;

use settings::Settings;
use spi::LoggingSpiDevice;
use synthetic::SyntheticCsi2Source;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let settings = Settings::from_env_and_args(std::env::args().skip(1))?;

    let mut config = Config::with_key(settings.hmac_key.clone());
    config.detector_frame_bind = settings.frame_bind;
    config.detector_command_bind = settings.command_bind;
    config.fragment_payload_size = settings.fragment_payload_size;
    config.validate()?;

    let fsm = ScanFsm::new(SpiControlCallback::new(LoggingSpiDevice));
    let core = Arc::new(Mutex::new(DetectorCore::new(
        &config,
        settings.virtual_channel,
        settings.bit_depth,
        fsm,
    )));

    let frame_socket = UdpSocket::bind(config.detector_frame_bind)?;
    let command_socket = UdpSocket::bind(config.detector_command_bind)?;
    log::info!(
        "xrd-detector listening: frames on {}, commands on {}",
        config.detector_frame_bind,
        config.detector_command_bind
    );

    let stream_dest: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(settings.stream_to));

    spawn_csi2_producer(
        Arc::clone(&core),
        settings.virtual_channel,
        settings.rows,
        settings.cols,
        settings.bit_depth,
        settings.frame_interval,
    );
    spawn_transport_consumer(Arc::clone(&core), frame_socket, Arc::clone(&stream_dest));
    run_command_loop(core, command_socket, stream_dest)
}

/// Producer thread: pulls framed CSI-2 bytes off the (synthetic, for this
/// build) byte source and feeds them through the frame ring.
fn spawn_csi2_producer(
    core: Arc<Mutex<DetectorCore>>,
    vc: u8,
    rows: u16,
    cols: u16,
    bit_depth: u8,
    frame_interval: Duration,
) {
    thread::spawn(move || {
        let mut source = SyntheticCsi2Source::new(vc, rows, cols, bit_depth);
        let mut buf = vec![0u8; xrd_transport::MAX_PAYLOAD_BYTES + 16];
        let packets_per_frame = 2 + rows as usize * 3;
        loop {
            for _ in 0..packets_per_frame {
                match source.read_packet(&mut buf) {
                    Ok(n) => core.lock().unwrap().ingest_csi2(&buf[..n]),
                    Err(err) => {
                        log::error!("CSI-2 source read failed: {err}");
                        return;
                    }
                }
            }
            thread::sleep(frame_interval);
        }
    });
}

/// Consumer thread: drains ready frames from the ring, fragments them, and
/// ships them to whichever host address the command thread has recorded.
fn spawn_transport_consumer(
    core: Arc<Mutex<DetectorCore>>,
    frame_socket: UdpSocket,
    stream_dest: Arc<Mutex<Option<SocketAddr>>>,
) {
    thread::spawn(move || {
        let clock = SystemClock;
        loop {
            let now_ns = clock.now_ns();
            let outgoing = core.lock().unwrap().drain_ready_frame(now_ns);
            match outgoing {
                Some(frame) => {
                    let dest = *stream_dest.lock().unwrap();
                    match dest {
                        Some(dest) => {
                            for packet in &frame.packets {
                                if let Err(err) = frame_socket.send_to(packet, dest) {
                                    log::warn!("send failed for frame {}: {err}", frame.frame_id);
                                }
                            }
                        }
                        None => log::debug!(
                            "frame {} ready ({} packets), no stream destination yet",
                            frame.frame_id,
                            frame.packets.len()
                        ),
                    }
                }
                None => thread::sleep(Duration::from_millis(5)),
            }
        }
    });
}

/// Command-handling loop, run on the main thread: every request's source
/// address is latched as the frame-stream destination on first contact,
/// mirroring how a real deployment has exactly one host talking to it.
fn run_command_loop(
    core: Arc<Mutex<DetectorCore>>,
    command_socket: UdpSocket,
    stream_dest: Arc<Mutex<Option<SocketAddr>>>,
) -> anyhow::Result<()> {
    let clock = SystemClock;
    let mut buf = [0u8; 4096];
    loop {
        let (n, source) = command_socket.recv_from(&mut buf)?;
        {
            let mut dest = stream_dest.lock().unwrap();
            if dest.is_none() {
                log::info!("latching {source} as the frame-stream destination");
                *dest = Some(source);
            }
        }
        let now_ns = clock.now_ns();
        let response = core.lock().unwrap().handle_command(source, &buf[..n], now_ns);
        if let Some(response) = response {
            if let Err(err) = command_socket.send_to(&response, source) {
                log::warn!("failed to send response to {source}: {err}");
            }
        }
    }
}
