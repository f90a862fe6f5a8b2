// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process-level collaborator traits the orchestrator is generic over.
//! `UdpSocket` and the HMAC key are concrete std/`xrd_auth` types rather
//! than trait objects: std already provides a real, substitutable
//! implementation and tests can bind to `127.0.0.1:0`.

use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

/// One fully-framed CSI-2 packet's worth of bytes per call, the shape the
/// detector's producer thread consumes. A real implementation reads this
/// off a FPGA-backed DMA ring; tests and the host-side binary are free to
/// hand it a canned byte stream.
pub trait Csi2Source {
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Write/read pair to the detector's control SPI device, the same shape
/// as `drv/spi-api`'s `SpiServer` trait, generalized from a device-index
/// parameter (this core has exactly one SPI peer: the FPGA) to a plain
/// write/read pair.
pub trait SpiDevice {
    fn write(&mut self, src: &[u8]) -> io::Result<()>;
    fn read(&mut self, dest: &mut [u8]) -> io::Result<usize>;
}

/// Nanoseconds-since-epoch wall clock, the seam that makes reassembly
/// timeout and replay-guard LRU eviction testable without real time
/// passing.
pub trait Clock {
    fn now_ns(&self) -> u64;
}

/// `Clock` backed by `SystemTime::now()`, the default for both binaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ns(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is after the epoch")
            .as_nanos() as u64
    }
}
